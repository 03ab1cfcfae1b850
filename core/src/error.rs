//! Error types for infer-bridge.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for infer-bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Generic message reported for native failures that carry no recognizable error.
pub const INTERNAL_ERROR_MESSAGE: &str = "Unknown/internal exception happened.";

/// Errors surfaced to the host caller.
///
/// The first four variants form the bridge taxonomy. Their `Display` output is
/// the bare message so that an engine failure reads exactly as the native
/// facade reported it.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Wrong argument count or kind, detected before any work is scheduled.
    #[error("{0}")]
    InvalidArgument(String),

    /// The native facade reported a recognized failure.
    #[error("{0}")]
    Engine(String),

    /// The native facade failed in an unrecognized way.
    #[error("{0}")]
    Internal(String),

    /// A named resource (buffer, device) does not exist.
    #[error("{0}")]
    OutOfRange(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Engine,
    Internal,
    OutOfRange,
    Config,
}

impl BridgeError {
    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an engine error.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create an internal error carrying the generic message.
    pub fn internal() -> Self {
        Self::Internal(INTERNAL_ERROR_MESSAGE.to_string())
    }

    /// Create an out of range error.
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Engine(_) => ErrorKind::Engine,
            Self::Internal(_) => ErrorKind::Internal,
            Self::OutOfRange(_) => ErrorKind::OutOfRange,
            Self::Config(_)
            | Self::Yaml(_)
            | Self::Io(_)
            | Self::FileNotFound(_) => ErrorKind::Config,
        }
    }
}
