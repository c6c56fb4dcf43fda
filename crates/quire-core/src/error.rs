//! Error taxonomy for the session engine.
//!
//! Remote failures are split into transient ones (retried on the next tick or
//! absorbed by a fallback) and cancellation, which is never reported to the
//! host.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("service returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("operation cancelled at stage={stage}")]
    Cancelled { stage: &'static str },
    #[error("invalid service url: {0}")]
    InvalidUrl(String),
}

impl ServiceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether a retry on the next poll tick may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Decode(_) | Self::Cancelled { .. } | Self::InvalidUrl(_) => false,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        match err.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode stored value: {0}")]
    Encode(#[from] toml::ser::Error),
}
