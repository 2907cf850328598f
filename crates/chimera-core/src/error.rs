//! Error types for Chimera core

use thiserror::Error;

/// Errors that can occur in Chimera core
#[derive(Debug, Error)]
pub enum ChimeraError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected status code: {0}")]
    StatusCode(u16),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse: {0}")]
    ParsingFailed(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Could not resolve {url}: {reason}")]
    ResolutionFailed { url: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ChimeraError {
    pub fn resolution(url: impl Into<String>, reason: impl Into<String>) -> Self {
        ChimeraError::ResolutionFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Rate limiting reported by a host
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ChimeraError::StatusCode(429))
    }
}

impl From<reqwest::Error> for ChimeraError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ChimeraError::Timeout
        } else if let Some(status) = error.status() {
            ChimeraError::StatusCode(status.as_u16())
        } else if error.is_decode() || error.is_body() {
            ChimeraError::ParsingFailed(error.to_string())
        } else if error.is_request() || error.is_connect() || error.is_redirect() {
            ChimeraError::RequestFailed(error.to_string())
        } else {
            ChimeraError::HttpClient(error.to_string())
        }
    }
}
