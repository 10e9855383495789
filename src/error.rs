use std::fmt;

use thiserror::Error;

use crate::transport::Encoding;

/// Failure of a single attempt against one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("candidate {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("transport failure against {address}: {reason}")]
    Transport { address: String, reason: String },
    #[error("request to {address} timed out after {timeout_ms} ms")]
    Timeout { address: String, timeout_ms: u64 },
    #[error("{address} rejected the {encoding} encoding with status {status}")]
    Rejected {
        address: String,
        encoding: Encoding,
        status: u16,
    },
    #[error("{address} returned status {status}")]
    Server { address: String, status: u16 },
    #[error("{address} returned a malformed response: {reason}")]
    Malformed { address: String, reason: String },
    #[error("inline payload is {size} characters, above the {cap} character cap")]
    PayloadTooLarge { size: usize, cap: usize },
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Unreachable { .. } => ErrorKind::Unreachable,
            TransportError::Transport { .. } => ErrorKind::Transport,
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            TransportError::Rejected { .. } => ErrorKind::Rejected,
            TransportError::Server { .. } | TransportError::Malformed { .. } => ErrorKind::Server,
            TransportError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
        }
    }

    /// Whether the next encoding strategy should be tried against the same candidate.
    pub fn permits_encoding_fallback(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Rejected
        )
    }
}

/// Coarse classification shared by probe results, attempts and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Unreachable,
    Transport,
    Timeout,
    Rejected,
    Server,
    PayloadTooLarge,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Transport => "transport-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Server => "server-error",
            ErrorKind::PayloadTooLarge => "payload-too-large",
        };
        f.write_str(label)
    }
}

/// Errors that surface from a logical request to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("all {attempted} candidate(s) failed{}", describe_last(.last))]
    AggregatedFailure {
        attempted: usize,
        last: Option<TransportError>,
    },
    #[error("inline payload is {size} characters, above the {cap} character cap")]
    PayloadTooLarge { size: usize, cap: usize },
}

fn describe_last(last: &Option<TransportError>) -> String {
    match last {
        Some(error) => format!("; last error: {error}"),
        None => String::new(),
    }
}

impl DispatchError {
    /// Text safe to show to an end user; never includes transport details.
    pub fn user_message(&self) -> &'static str {
        match self {
            DispatchError::AggregatedFailure { .. } => {
                "The assistant is temporarily unavailable. Please try again in a moment."
            }
            DispatchError::PayloadTooLarge { .. } => {
                "That attachment is too large to send. Please try a smaller one."
            }
        }
    }
}
