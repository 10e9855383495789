use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use thiserror::Error;

use crate::config::TransportSettings;

/// Raw reply from the backend; status classification is left to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(body: &Value) -> Self {
        Self::new(200, body.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failure before any HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        mime: String,
        data: Vec<u8>,
    },
}

/// Multi-part body that keeps binary parts as raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormBody {
    parts: Vec<FormPart>,
}

impl FormBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        mime: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            filename: filename.into(),
            mime: mime.into(),
            data,
        });
        self
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn text_value(&self, name: &str) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            FormPart::Text { name: key, value } if key == name => Some(value.as_str()),
            _ => None,
        })
    }
}

/// HTTP seam used by the resolver and the transport adapter.
pub trait BackendHttp {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpReply, HttpFailure>;
    fn post_form(
        &self,
        url: &str,
        form: &FormBody,
        timeout: Duration,
    ) -> Result<HttpReply, HttpFailure>;
    fn post_json(&self, url: &str, body: &Value, timeout: Duration)
    -> Result<HttpReply, HttpFailure>;
}

pub struct BlockingBackendHttp {
    client: Client,
}

impl BlockingBackendHttp {
    pub fn new(settings: &TransportSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }
}

impl BackendHttp for BlockingBackendHttp {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpReply, HttpFailure> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(classify)?;
        into_reply(response)
    }

    fn post_form(
        &self,
        url: &str,
        form: &FormBody,
        timeout: Duration,
    ) -> Result<HttpReply, HttpFailure> {
        let multipart = build_form(form)?;
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .multipart(multipart)
            .send()
            .map_err(classify)?;
        into_reply(response)
    }

    fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<HttpReply, HttpFailure> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .map_err(classify)?;
        into_reply(response)
    }
}

fn build_form(form: &FormBody) -> Result<Form, HttpFailure> {
    let mut multipart = Form::new();
    for part in form.parts() {
        multipart = match part {
            FormPart::Text { name, value } => multipart.text(name.clone(), value.clone()),
            FormPart::File {
                name,
                filename,
                mime,
                data,
            } => {
                let file = Part::bytes(data.clone())
                    .file_name(filename.clone())
                    .mime_str(mime)
                    .map_err(|err| HttpFailure::Other(format!("invalid MIME type {mime}: {err}")))?;
                multipart.part(name.clone(), file)
            }
        };
    }
    Ok(multipart)
}

fn into_reply(response: Response) -> Result<HttpReply, HttpFailure> {
    let status = response.status().as_u16();
    let body = response.text().map_err(classify)?;
    Ok(HttpReply { status, body })
}

fn classify(err: reqwest::Error) -> HttpFailure {
    if err.is_timeout() {
        HttpFailure::Timeout
    } else if err.is_connect() {
        HttpFailure::Connect(err.to_string())
    } else {
        HttpFailure::Other(err.to_string())
    }
}
