//! Error types for machscope.
//!
//! Format decoding reports [`MachError`]; file access reports [`IoError`].
//! [`MachScopeError`] wraps both for callers that go from a path to a report.

use thiserror::Error;

use crate::formats::macho::MachError;
use crate::io::error::IoError;

/// Main error type for machscope operations.
#[derive(Debug, Error)]
pub enum MachScopeError {
    /// Mach-O structure could not be decoded
    #[error("Mach-O error: {0}")]
    Mach(#[from] MachError),

    /// File could not be opened within the configured limits
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("I/O error: {0}")]
    StdIo(#[from] std::io::Error),

    /// Invalid configuration document
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Report serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MachScopeError {
    fn from(err: serde_json::Error) -> Self {
        MachScopeError::Serialization(err.to_string())
    }
}

/// Result type alias for machscope operations
pub type Result<T> = std::result::Result<T, MachScopeError>;
