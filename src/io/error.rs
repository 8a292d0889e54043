//! Error types for file access.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("File size of {found} bytes exceeds the maximum allowed size of {limit} bytes.")]
    FileTooLarge { limit: u64, found: u64 },

    #[error("Read of {len} bytes at offset {offset} is outside the {size}-byte file.")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("An underlying I/O error occurred.")]
    StdIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IoError>;
