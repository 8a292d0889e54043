//! Bounded, read-only file access.
//!
//! A [`SafeReader`] memory-maps the whole file once and hands out the mapping
//! as an immutable byte slice; every decoder works over that slice.

pub mod error;

use crate::io::error::{IoError, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resource limits for opening input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IOLimits {
    /// The largest file that will be mapped (default: 4 GiB).
    pub max_file_size: u64,
}

impl Default for IOLimits {
    fn default() -> Self {
        Self {
            max_file_size: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// A memory-mapped input file.
pub struct SafeReader {
    path: PathBuf,
    // None when the file is empty; empty files cannot be mapped.
    mmap: Option<Mmap>,
    file_size: u64,
}

impl SafeReader {
    /// Open and map `path`, refusing files larger than `limits.max_file_size`.
    pub fn open<P: AsRef<Path>>(path: P, limits: &IOLimits) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let file_size = file.metadata()?.len();

        debug!(
            path = %path.display(),
            size = file_size,
            limit = limits.max_file_size,
            "opening file"
        );

        if file_size > limits.max_file_size {
            warn!(
                path = %path.display(),
                size = file_size,
                limit = limits.max_file_size,
                "file is too large"
            );
            return Err(IoError::FileTooLarge {
                limit: limits.max_file_size,
                found: file_size,
            });
        }

        let mmap = if file_size == 0 {
            None
        } else {
            // Safety: read-only mapping of a regular file; callers only see
            // shared slices of it.
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// The whole file.
    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// `len` bytes at `offset`; the range must lie inside the file.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let out_of_bounds = || IoError::OutOfBounds {
            offset,
            len,
            size: self.file_size,
        };
        let end = offset.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.file_size {
            return Err(out_of_bounds());
        }
        Ok(&self.bytes()[offset as usize..end as usize])
    }
}
