use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur while reading from a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Origin returned an error status code.
    #[error("HTTP status error: {0}")]
    Status(StatusCode),

    /// Origin is temporarily busy (should retry later).
    #[error("source temporarily busy")]
    TemporarilyBusy,

    /// Local or stream I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before the announced length.
    #[error("stream ended at byte {received}, expected {expected}")]
    Truncated { received: u64, expected: u64 },

    /// Invalid URL format.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The URL scheme has no source implementation.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

impl SourceError {
    /// Returns true if reopening the source may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(e) => !e.is_builder() && !e.is_redirect(),
            SourceError::Status(status) => status.is_server_error(),
            SourceError::TemporarilyBusy | SourceError::Io(_) | SourceError::Truncated { .. } => {
                true
            }
            SourceError::InvalidUrl(_) | SourceError::UnsupportedScheme(_) => false,
        }
    }
}
