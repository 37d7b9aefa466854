//! Error types shared across the PAF crates

use thiserror::Error;

/// Standard result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error kinds
#[derive(Debug, Error)]
pub enum Error {
    /// A family or system configuration file does not exist
    #[error("configuration file not found: {path}")]
    ConfigMissing { path: String },

    /// A configuration file exists but could not be parsed
    #[error("invalid configuration in {path}: {message}")]
    ConfigInvalid { path: String, message: String },

    /// The selector could not produce an upstream for the request
    #[error("no upstream available")]
    NoUpstreamAvailable,

    /// Connect/read/write failure against an upstream
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Writing a family state back to disk failed
    #[error("failed to persist configuration: {0}")]
    Persist(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a `ConfigMissing` error for a path
    pub fn config_missing(path: impl Into<String>) -> Self {
        Self::ConfigMissing { path: path.into() }
    }

    /// Create a `ConfigInvalid` error for a path
    pub fn config_invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}
