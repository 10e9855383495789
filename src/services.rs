//! Backend endpoints: request builders and reply shapes.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::capture::CapturedAudio;
use crate::resolver::EndpointCandidate;
use crate::transport::{LogicalRequest, MediaAttachment, MediaKind, Payload};

pub const CHAT_PATH: &str = "/api/assistant/chat";
pub const TEST_CONNECTION_PATH: &str = "/api/assistant/test-connection";
pub const TRANSCRIBE_PATH: &str = "/api/transcribe-audio/";
pub const TRANSCRIBE_INLINE_PATH: &str = "/api/transcribe-audio-base64/";
pub const SPEECH_PATH: &str = "/api/text-to-speech/";

const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub prompt: String,
    pub advice_type: String,
    /// `conversation_history` value, built before the prompt joins the history.
    pub history: Value,
    pub image: Option<MediaAttachment>,
}

impl ChatPrompt {
    pub fn new(prompt: impl Into<String>, advice_type: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            advice_type: advice_type.into(),
            history: Value::Array(Vec::new()),
            image: None,
        }
    }

    pub fn with_history(mut self, history: Value) -> Self {
        self.history = history;
        self
    }

    pub fn with_image(mut self, image: Option<MediaAttachment>) -> Self {
        self.image = image;
        self
    }

    pub fn to_request(&self) -> LogicalRequest {
        let mut payload = Payload::new()
            .field("prompt", self.prompt.clone())
            .field("advice_type", self.advice_type.clone())
            .field("conversation_history", self.history.to_string());
        if let Some(image) = &self.image {
            payload = payload.with_media(image.clone());
        }
        LogicalRequest::fields("chat", CHAT_PATH, payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub has_image: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

pub fn transcription_request(audio: &CapturedAudio, source: &str) -> LogicalRequest {
    let media = MediaAttachment {
        kind: MediaKind::Audio,
        mime: audio.mime.clone(),
        filename: audio.filename(),
        data: audio.data.clone(),
        field: "audio".into(),
        inline_field: "audio_data".into(),
        source: source.to_string(),
    };
    LogicalRequest::fields("transcribe", TRANSCRIBE_PATH, Payload::new().with_media(media))
        .with_inline_path(TRANSCRIBE_INLINE_PATH)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
}

impl Transcript {
    /// Empty text counts as a failed transcription.
    pub fn into_text(self) -> Option<String> {
        let text = self.text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}

pub fn speech_request(text: &str) -> LogicalRequest {
    LogicalRequest::json("speak", SPEECH_PATH, json!({ "text": text }))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeechReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SpeechOutcome {
    Audio {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    NoAudio {
        reason: String,
    },
}

impl SpeechReply {
    /// Absolute audio location, resolved against the candidate that answered.
    pub fn into_outcome(self, candidate: &EndpointCandidate) -> SpeechOutcome {
        if !self.success {
            return SpeechOutcome::NoAudio {
                reason: "backend reported no audio".into(),
            };
        }
        let Some(audio_url) = self.audio_url.filter(|url| !url.trim().is_empty()) else {
            return SpeechOutcome::NoAudio {
                reason: "reply carried no audio_url".into(),
            };
        };
        SpeechOutcome::Audio {
            url: resolve_audio_url(candidate, &audio_url),
            filename: self.audio_filename,
        }
    }
}

pub fn resolve_audio_url(candidate: &EndpointCandidate, audio_url: &str) -> String {
    if let Ok(absolute) = Url::parse(audio_url) {
        return absolute.to_string();
    }
    if audio_url.starts_with('/') {
        return candidate.endpoint(audio_url);
    }
    match candidate.address.join(audio_url) {
        Ok(joined) => joined.to_string(),
        Err(_) => candidate.endpoint(audio_url),
    }
}

pub fn test_connection_request() -> LogicalRequest {
    LogicalRequest::json("test-connection", TEST_CONNECTION_PATH, json!({}))
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads an image for the chat `file` field. Only `image/*` content is accepted.
pub fn load_image_attachment(path: &Path, source: &str) -> Result<MediaAttachment> {
    let data =
        fs::read(path).with_context(|| format!("failed to read attachment {}", path.display()))?;
    if data.is_empty() {
        bail!("attachment {} is empty", path.display());
    }
    if data.len() > MAX_ATTACHMENT_BYTES {
        bail!(
            "attachment {} exceeds {MAX_ATTACHMENT_BYTES} bytes",
            path.display()
        );
    }
    let mime = infer::get(&data)
        .map(|kind| kind.mime_type().to_string())
        .with_context(|| format!("could not detect MIME type for {}", path.display()))?;
    if !mime.starts_with("image/") {
        bail!("unsupported attachment MIME type '{mime}' (only image/* is accepted)");
    }
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_string();

    Ok(MediaAttachment {
        kind: MediaKind::Image,
        mime,
        filename,
        data,
        field: "file".into(),
        inline_field: "image_data".into(),
        source: source.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Platform;
    use crate::transport::{Encoding, RequestBody};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn candidate(address: &str) -> EndpointCandidate {
        EndpointCandidate {
            address: Url::parse(address).unwrap(),
            platform_affinity: Platform::Android,
            priority: 0,
        }
    }

    #[test]
    fn chat_request_carries_history_as_json_text() {
        let history = json!([{ "role": "user", "content": "hello" }]);
        let request = ChatPrompt::new("when to spray?", "pest")
            .with_history(history.clone())
            .to_request();
        assert_eq!(request.path, CHAT_PATH);
        assert!(!Encoding::InlineEncoded.applies_to(&request));
        let RequestBody::Fields(payload) = &request.body else {
            panic!("chat must use fields");
        };
        let lookup = |name: &str| {
            payload
                .fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(lookup("advice_type").as_deref(), Some("pest"));
        let parsed: Value = serde_json::from_str(&lookup("conversation_history").unwrap()).unwrap();
        assert_eq!(parsed, history);
    }

    #[test]
    fn transcription_request_uses_both_audio_fields() {
        let audio = CapturedAudio {
            location: PathBuf::from("/tmp/recording-1.m4a"),
            mime: "audio/m4a".into(),
            data: vec![1, 2],
        };
        let request = transcription_request(&audio, "mobile_app");
        let media = request.media().expect("audio attached");
        assert_eq!(media.field, "audio");
        assert_eq!(media.inline_field, "audio_data");
        assert_eq!(media.filename, "recording-1.m4a");
        assert_eq!(request.path_for(Encoding::Structured), TRANSCRIBE_PATH);
        assert_eq!(request.path_for(Encoding::InlineEncoded), TRANSCRIBE_INLINE_PATH);
    }

    #[test]
    fn relative_audio_url_resolves_against_candidate() {
        let host = candidate("http://127.0.0.1:8000");
        assert_eq!(
            resolve_audio_url(&host, "/static/audio/reply.mp3"),
            "http://127.0.0.1:8000/static/audio/reply.mp3"
        );
        assert_eq!(
            resolve_audio_url(&host, "static/reply.mp3"),
            "http://127.0.0.1:8000/static/reply.mp3"
        );
        assert_eq!(
            resolve_audio_url(&host, "https://cdn.example.org/a.mp3"),
            "https://cdn.example.org/a.mp3"
        );
    }

    #[test]
    fn speech_reply_without_audio_degrades() {
        let host = candidate("http://127.0.0.1:8000");
        let failed = SpeechReply {
            success: false,
            audio_url: None,
            audio_filename: None,
        };
        assert!(matches!(failed.into_outcome(&host), SpeechOutcome::NoAudio { .. }));

        let blank: SpeechReply =
            serde_json::from_value(json!({ "success": true, "audio_url": "" })).unwrap();
        assert!(matches!(blank.into_outcome(&host), SpeechOutcome::NoAudio { .. }));
    }

    #[test]
    fn chat_reply_tolerates_missing_optional_fields() {
        let reply: ChatReply = serde_json::from_value(json!({ "response": "irrigate at dawn" })).unwrap();
        assert_eq!(reply.response, "irrigate at dawn");
        assert!(!reply.has_image);
        assert_eq!(reply.conversation_id, None);
    }

    #[test]
    fn empty_transcript_text_counts_as_failure() {
        let transcript = Transcript {
            text: "  ".into(),
            confidence: Some(0.2),
            language: None,
        };
        assert_eq!(transcript.into_text(), None);
    }

    #[test]
    fn image_attachment_requires_image_content() {
        let dir = tempdir().unwrap();
        let png = dir.path().join("leaf.png");
        fs::write(&png, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]).unwrap();
        let attachment = load_image_attachment(&png, "cli").expect("png accepted");
        assert_eq!(attachment.mime, "image/png");
        assert_eq!(attachment.field, "file");
        assert_eq!(attachment.filename, "leaf.png");

        let text = dir.path().join("notes.txt");
        fs::write(&text, b"plain text").unwrap();
        assert!(load_image_attachment(&text, "cli").is_err());
    }
}
