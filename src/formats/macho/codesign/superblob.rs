//! Embedded signature SuperBlob index
//!
//! All integers in a code signature are big-endian regardless of the slice
//! byte order.

use serde::Serialize;
use tracing::debug;

use super::*;
use crate::formats::macho::types::{Endian, Inconsistency, MachError, Result};
use crate::formats::macho::utils::EndianRead;

pub(crate) const BE: Endian = Endian::Big;

/// Header of a generic signature blob (`magic`, `length`)
pub const BLOB_HEADER_SIZE: usize = 8;
const SUPERBLOB_HEADER_SIZE: usize = 12;
const INDEX_ENTRY_SIZE: usize = 8;

/// One `(type, offset)` entry of the SuperBlob index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlobIndex {
    pub slot_type: u32,
    pub offset: u32,
}

impl BlobIndex {
    pub fn slot_name(&self) -> &'static str {
        slot_type_name(self.slot_type)
    }
}

/// A sub-blob located through the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob<'data> {
    pub slot_type: u32,
    pub offset: u32,
    pub magic: u32,
    /// Whole blob including its 8 byte header
    pub bytes: &'data [u8],
}

impl<'data> Blob<'data> {
    /// Bytes following the blob header
    pub fn payload(&self) -> &'data [u8] {
        &self.bytes[BLOB_HEADER_SIZE..]
    }
}

/// Parsed SuperBlob header and index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlob<'data> {
    data: &'data [u8],
    pub magic: u32,
    pub length: u32,
    pub index: Vec<BlobIndex>,
}

impl<'data> SuperBlob<'data> {
    /// Parse the header and index.
    ///
    /// `data` is the region named by `LC_CODE_SIGNATURE`; the SuperBlob may be
    /// shorter than the region (trailing padding) but never longer.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let magic = data.read_u32(0, BE)?;
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(MachError::CorruptSuperBlob(format!(
                "unexpected magic {:#010x}",
                magic
            )));
        }
        let length = data.read_u32(4, BE)?;
        let count = data.read_u32(8, BE)?;
        if length as usize > data.len() {
            return Err(MachError::CorruptSuperBlob(format!(
                "length {} exceeds signature region of {} bytes",
                length,
                data.len()
            )));
        }
        let index_end = (count as u64) * INDEX_ENTRY_SIZE as u64 + SUPERBLOB_HEADER_SIZE as u64;
        if index_end > length as u64 {
            return Err(MachError::CorruptSuperBlob(format!(
                "index of {} entries does not fit in {} bytes",
                count, length
            )));
        }

        let data = &data[..length as usize];
        let mut index = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let off = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            index.push(BlobIndex {
                slot_type: data.read_u32(off, BE)?,
                offset: data.read_u32(off + 4, BE)?,
            });
        }
        debug!(length, count, "code signature superblob");

        Ok(Self {
            data,
            magic,
            length,
            index,
        })
    }

    /// Raw SuperBlob bytes (`length` bytes)
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// Locate the sub-blob named by an index entry
    pub fn blob(&self, entry: &BlobIndex) -> Result<Blob<'data>> {
        let off = entry.offset as usize;
        let magic = self.data.read_u32(off, BE).map_err(|_| {
            MachError::CorruptSuperBlob(format!(
                "{} blob offset {:#x} is outside the superblob",
                entry.slot_name(),
                off
            ))
        })?;
        let length = self.data.read_u32(off + 4, BE)? as usize;
        if length < BLOB_HEADER_SIZE {
            return Err(MachError::CorruptSuperBlob(format!(
                "{} blob length {} is smaller than its header",
                entry.slot_name(),
                length
            )));
        }
        let bytes = self.data.read_bytes(off, length).map_err(|_| {
            MachError::CorruptSuperBlob(format!(
                "{} blob at {:#x} ({} bytes) overruns the superblob",
                entry.slot_name(),
                off,
                length
            ))
        })?;
        Ok(Blob {
            slot_type: entry.slot_type,
            offset: entry.offset,
            magic,
            bytes,
        })
    }

    /// First blob with the given slot type
    pub fn find(&self, slot_type: u32) -> Option<Result<Blob<'data>>> {
        self.index
            .iter()
            .find(|e| e.slot_type == slot_type)
            .map(|e| self.blob(e))
    }

    /// Compare `length` with the end of the furthest sub-blob.
    ///
    /// Index offsets are not assumed to be sorted.
    pub fn check_length(&self) -> Option<Inconsistency> {
        let end = self
            .index
            .iter()
            .filter_map(|e| self.blob(e).ok())
            .map(|b| b.offset as usize + b.bytes.len())
            .max()?;
        (end != self.length as usize).then(|| {
            Inconsistency::new(format!(
                "superblob length {} but last sub-blob ends at {}",
                self.length, end
            ))
        })
    }
}
