use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PulseResult<T> = Result<T, PulseError>;

/// Errors that can stop a tracker from being constructed. Everything after
/// construction is best-effort and routed through the error channel instead.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Delivery failure taxonomy reported through the error channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Auth,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Classify a non-success HTTP status from the collection endpoint.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimit,
            401 => ErrorKind::Auth,
            400 => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn describe_status(status: u16) -> String {
        match Self::from_status(status) {
            ErrorKind::RateLimit => "Rate limit exceeded. Please slow down event tracking.".into(),
            ErrorKind::Auth => "Authentication failed. Check your public and secret keys.".into(),
            ErrorKind::Validation => "Invalid event payload rejected by the server.".into(),
            _ => format!("Failed to send event: HTTP {status}"),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured delivery error handed to the caller-supplied error callback.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct TrackerError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}
