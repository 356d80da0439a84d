//! Error types for read-aloud playback.
//!
//! A continuation that arrives for a chunk which is no longer current is
//! not an error: it is dropped where it is detected and never reaches here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("no speech engine is supported on this platform")]
    Unsupported,

    #[error("failed to load audio for page {leaf_index}: {reason}")]
    LoadFailure { leaf_index: usize, reason: String },

    #[error("failed to read text for page {index}: {reason}")]
    PageText { index: usize, reason: String },

    #[error("speech engine error: {0}")]
    Engine(String),

    #[error("playback coordinator is no longer running")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TtsError {
    pub fn load_failure(leaf_index: usize, reason: impl Into<String>) -> Self {
        Self::LoadFailure {
            leaf_index,
            reason: reason.into(),
        }
    }

    /// Load failures halt playback on the current chunk instead of ending it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LoadFailure { .. } | Self::PageText { .. } | Self::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, TtsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failure_is_retryable() {
        let err = TtsError::load_failure(4, "status 503");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "failed to load audio for page 4: status 503");
    }

    #[test]
    fn unsupported_is_not_retryable() {
        assert!(!TtsError::Unsupported.is_retryable());
        assert!(!TtsError::Closed.is_retryable());
    }
}
