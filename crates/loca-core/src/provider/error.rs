//! Canonical backend failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a [`ProviderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Non-success HTTP status (4xx, 5xx).
    HttpStatus,
    /// Connection failure or timeout before a response arrived.
    Network,
    /// Body or SSE frame that could not be decoded.
    Parse,
    /// Error reported by the backend itself, including mid-stream error
    /// events and abnormal finish reasons.
    Api,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HttpStatus => "http_status",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Api => "api",
        };
        f.write_str(s)
    }
}

/// A backend call that did not produce a completion.
///
/// Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{backend} {kind} error: {message}")]
pub struct ProviderError {
    /// Backend that failed (e.g. "claude").
    pub backend: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        backend: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn parse(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(backend, ProviderErrorKind::Parse, message)
    }

    pub fn api(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(backend, ProviderErrorKind::Api, message)
    }

    /// Build an HTTP status error, lifting `error.message` out of a JSON
    /// body when the backend sent one.
    pub fn http_status(backend: impl Into<String>, status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| {
                let error = json.get("error")?;
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| error.as_str())
                    .map(str::to_owned)
            })
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_owned())
            });

        let message = match detail {
            Some(detail) => format!("HTTP {status}: {detail}"),
            None => format!("HTTP {status}"),
        };
        Self::new(backend, ProviderErrorKind::HttpStatus, message)
    }

    /// Classify a transport failure from `reqwest`.
    pub fn from_reqwest(backend: impl Into<String>, err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else if err.is_decode() {
            return Self::parse(backend, format!("invalid response body: {err}"));
        } else {
            format!("network error: {err}")
        };
        Self::new(backend, ProviderErrorKind::Network, message)
    }
}
