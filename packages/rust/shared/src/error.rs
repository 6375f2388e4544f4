//! Error types for Licitai.
//!
//! Library crates use [`LicitaiError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Licitai operations.
#[derive(Debug, thiserror::Error)]
pub enum LicitaiError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Timeout, connection failure, HTTP 5xx/429 or an unparseable body.
    /// Retried by the remote client.
    #[error("transient error: {0}")]
    Transient(String),

    /// HTTP 4xx other than 429. Never retried.
    #[error("request rejected with HTTP {status}: {message}")]
    PermanentRequest { status: u16, message: String },

    /// The retry budget ran out.
    #[error("fetch failed after {attempts} attempts, last error: {last}")]
    FetchFailed {
        attempts: u32,
        last: Box<LicitaiError>,
    },

    /// Response payload could not be decoded into the expected shape.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A required record or task field is missing or malformed.
    #[error("data integrity error: {message}")]
    DataIntegrity { message: String },

    /// Classification or search provider failure.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input (date windows, CLI values, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LicitaiError>;

impl LicitaiError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a data integrity error from any displayable message.
    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the remote client should spend another attempt on this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether a stage worker should park the task in `insufficient-data`.
    pub fn is_data_integrity(&self) -> bool {
        matches!(self, Self::DataIntegrity { .. })
    }

    /// Short variant label, written into a task's error log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Transient(_) => "Transient",
            Self::PermanentRequest { .. } => "PermanentRequest",
            Self::FetchFailed { .. } => "FetchFailed",
            Self::Parse { .. } => "Parse",
            Self::Storage(_) => "Storage",
            Self::DataIntegrity { .. } => "DataIntegrity",
            Self::Enrichment(_) => "Enrichment",
            Self::Io { .. } => "Io",
            Self::Validation { .. } => "Validation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LicitaiError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = LicitaiError::PermanentRequest {
            status: 404,
            message: "not found".into(),
        };
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn fetch_failed_wraps_last_error() {
        let err = LicitaiError::FetchFailed {
            attempts: 3,
            last: Box::new(LicitaiError::Transient("HTTP 503".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("HTTP 503"));
        assert!(!err.is_transient());
    }

    #[test]
    fn classification_helpers() {
        assert!(LicitaiError::Transient("timeout".into()).is_transient());
        assert!(LicitaiError::data_integrity("no org").is_data_integrity());
        assert_eq!(LicitaiError::Enrichment("x".into()).kind(), "Enrichment");
    }
}
