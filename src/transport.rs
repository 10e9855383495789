use std::fmt;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::TransportSettings;
use crate::error::TransportError;
use crate::http::{BackendHttp, FormBody, HttpFailure, HttpReply};
use crate::resolver::EndpointCandidate;

/// Statuses that mean the backend refused the body format rather than the request.
const REJECTION_STATUSES: [u16; 4] = [400, 413, 415, 422];

/// Body formats, tried in this order by the dispatcher.
pub const ENCODING_ORDER: [Encoding; 2] = [Encoding::Structured, Encoding::InlineEncoded];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Multi-part body with binary parts kept as-is.
    Structured,
    /// Binary re-encoded as base64 inside a JSON field.
    InlineEncoded,
}

impl Encoding {
    /// Structured always applies; inline only when there is media to re-encode.
    pub fn applies_to(&self, request: &LogicalRequest) -> bool {
        match self {
            Encoding::Structured => true,
            Encoding::InlineEncoded => request.media().is_some(),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Structured => write!(f, "structured"),
            Encoding::InlineEncoded => write!(f, "inline-encoded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Image => write!(f, "image"),
        }
    }
}

/// Binary content attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub mime: String,
    pub filename: String,
    pub data: Vec<u8>,
    /// Multi-part field name for the structured encoding.
    pub field: String,
    /// JSON field carrying the base64 text for the inline encoding.
    pub inline_field: String,
    /// Reported as `metadata.source`.
    pub source: String,
}

impl MediaAttachment {
    /// Short format name, e.g. `wav` for `audio/wav`.
    pub fn format(&self) -> String {
        let from_mime = self
            .mime
            .split_once('/')
            .map(|(_, subtype)| subtype.trim_start_matches("x-"))
            .filter(|subtype| !subtype.is_empty());
        let from_name = self
            .filename
            .rsplit_once('.')
            .map(|(_, extension)| extension);
        from_mime
            .or(from_name)
            .unwrap_or("bin")
            .to_ascii_lowercase()
    }

    pub fn inline_metadata(&self) -> Value {
        json!({
            "format": self.format(),
            "type": self.mime,
            "source": self.source,
        })
    }
}

/// Text fields plus optional media, encodable either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub fields: Vec<(String, String)>,
    pub media: Option<MediaAttachment>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media = Some(media);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Fields(Payload),
    Json(Value),
}

/// Everything needed to send one logical request to any candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRequest {
    /// Short label used in logs and the journal.
    pub name: &'static str,
    pub path: String,
    /// Alternate path for the inline encoding; defaults to `path`.
    pub inline_path: Option<String>,
    pub body: RequestBody,
}

impl LogicalRequest {
    pub fn fields(name: &'static str, path: impl Into<String>, payload: Payload) -> Self {
        Self {
            name,
            path: path.into(),
            inline_path: None,
            body: RequestBody::Fields(payload),
        }
    }

    pub fn json(name: &'static str, path: impl Into<String>, body: Value) -> Self {
        Self {
            name,
            path: path.into(),
            inline_path: None,
            body: RequestBody::Json(body),
        }
    }

    pub fn with_inline_path(mut self, path: impl Into<String>) -> Self {
        self.inline_path = Some(path.into());
        self
    }

    pub fn media(&self) -> Option<&MediaAttachment> {
        match &self.body {
            RequestBody::Fields(payload) => payload.media.as_ref(),
            RequestBody::Json(_) => None,
        }
    }

    pub fn path_for(&self, encoding: Encoding) -> &str {
        match encoding {
            Encoding::Structured => &self.path,
            Encoding::InlineEncoded => self.inline_path.as_deref().unwrap_or(&self.path),
        }
    }
}

/// Successful reply together with the route that produced it.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub candidate: EndpointCandidate,
    pub encoding: Encoding,
    pub status: u16,
    pub body: String,
    pub latency_ms: u64,
}

impl TransportResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|err| TransportError::Malformed {
            address: self.candidate.to_string(),
            reason: err.to_string(),
        })
    }
}

/// Performs single attempts; never retries on its own.
#[derive(Debug, Clone)]
pub struct TransportAdapter {
    request_timeout: Duration,
    inline_max_chars: usize,
}

impl TransportAdapter {
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            inline_max_chars: settings.inline_max_chars,
        }
    }

    pub fn send<H: BackendHttp>(
        &self,
        http: &H,
        candidate: &EndpointCandidate,
        request: &LogicalRequest,
        encoding: Encoding,
    ) -> Result<TransportResponse, TransportError> {
        let url = candidate.endpoint(request.path_for(encoding));
        let started = Instant::now();
        let outcome = match (&request.body, encoding) {
            (RequestBody::Fields(payload), Encoding::Structured) => {
                http.post_form(&url, &structured_form(payload), self.request_timeout)
            }
            (RequestBody::Fields(payload), Encoding::InlineEncoded) => {
                let body = inline_body(payload, self.inline_max_chars)?;
                http.post_json(&url, &body, self.request_timeout)
            }
            (RequestBody::Json(body), _) => http.post_json(&url, body, self.request_timeout),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(
            request = request.name,
            candidate = %candidate,
            %encoding,
            latency_ms,
            "transport attempt finished"
        );

        let reply = outcome.map_err(|failure| self.classify_failure(candidate, failure))?;
        classify_reply(candidate, encoding, &reply)?;
        Ok(TransportResponse {
            candidate: candidate.clone(),
            encoding,
            status: reply.status,
            body: reply.body,
            latency_ms,
        })
    }

    fn classify_failure(&self, candidate: &EndpointCandidate, failure: HttpFailure) -> TransportError {
        match failure {
            HttpFailure::Timeout => TransportError::Timeout {
                address: candidate.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            },
            HttpFailure::Connect(reason) | HttpFailure::Other(reason) => TransportError::Transport {
                address: candidate.to_string(),
                reason,
            },
        }
    }
}

fn classify_reply(
    candidate: &EndpointCandidate,
    encoding: Encoding,
    reply: &HttpReply,
) -> Result<(), TransportError> {
    if reply.is_success() {
        // Backend routes always answer JSON.
        return serde_json::from_str::<IgnoredAny>(&reply.body)
            .map(|_| ())
            .map_err(|err| TransportError::Malformed {
                address: candidate.to_string(),
                reason: err.to_string(),
            });
    }
    if REJECTION_STATUSES.contains(&reply.status) {
        return Err(TransportError::Rejected {
            address: candidate.to_string(),
            encoding,
            status: reply.status,
        });
    }
    Err(TransportError::Server {
        address: candidate.to_string(),
        status: reply.status,
    })
}

fn structured_form(payload: &Payload) -> FormBody {
    let mut form = FormBody::new();
    for (name, value) in &payload.fields {
        form = form.text(name.clone(), value.clone());
    }
    if let Some(media) = &payload.media {
        form = form.file(
            media.field.clone(),
            media.filename.clone(),
            media.mime.clone(),
            media.data.clone(),
        );
    }
    form
}

fn inline_body(payload: &Payload, cap: usize) -> Result<Value, TransportError> {
    let mut body = Map::new();
    for (name, value) in &payload.fields {
        body.insert(name.clone(), Value::String(value.clone()));
    }
    if let Some(media) = &payload.media {
        let encoded = encode_inline(&media.data, cap)?;
        body.insert(media.inline_field.clone(), Value::String(encoded));
        body.insert("metadata".into(), media.inline_metadata());
    }
    Ok(Value::Object(body))
}

/// Base64 text for `data`, refusing anything longer than `cap` characters.
pub fn encode_inline(data: &[u8], cap: usize) -> Result<String, TransportError> {
    let size = base64::encoded_len(data.len(), true).unwrap_or(usize::MAX);
    if size > cap {
        return Err(TransportError::PayloadTooLarge { size, cap });
    }
    Ok(STANDARD.encode(data))
}
