//! Utility functions for Mach-O parsing

use crate::formats::macho::types::{Endian, MachClass, MachError, Result};

/// Trait for reading values with endianness support
pub trait EndianRead {
    fn read_u8(&self, offset: usize) -> Result<u8>;
    fn read_u16(&self, offset: usize, endian: Endian) -> Result<u16>;
    fn read_u32(&self, offset: usize, endian: Endian) -> Result<u32>;
    fn read_u64(&self, offset: usize, endian: Endian) -> Result<u64>;
    fn read_i32(&self, offset: usize, endian: Endian) -> Result<i32>;
    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]>;
}

impl EndianRead for [u8] {
    fn read_u8(&self, offset: usize) -> Result<u8> {
        self.get(offset)
            .copied()
            .ok_or(MachError::TruncatedFile { offset, needed: 1 })
    }

    fn read_u16(&self, offset: usize, endian: Endian) -> Result<u16> {
        let bytes: [u8; 2] = fixed(self, offset)?;
        Ok(match endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(&self, offset: usize, endian: Endian) -> Result<u32> {
        let bytes: [u8; 4] = fixed(self, offset)?;
        Ok(match endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    fn read_u64(&self, offset: usize, endian: Endian) -> Result<u64> {
        let bytes: [u8; 8] = fixed(self, offset)?;
        Ok(match endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    fn read_i32(&self, offset: usize, endian: Endian) -> Result<i32> {
        self.read_u32(offset, endian).map(|v| v as i32)
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(MachError::TruncatedFile { offset, needed: len })?;
        self.get(offset..end)
            .ok_or(MachError::TruncatedFile { offset, needed: len })
    }
}

fn fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    let slice = data.read_bytes(offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

/// Read a pointer-sized value based on the slice class
pub fn read_pointer(data: &[u8], offset: usize, class: MachClass, endian: Endian) -> Result<u64> {
    match class {
        MachClass::MachO32 => data.read_u32(offset, endian).map(u64::from),
        MachClass::MachO64 => data.read_u64(offset, endian),
    }
}

/// Read a null-terminated string, replacing invalid UTF-8.
///
/// Reads at most `max_len` bytes; a missing terminator ends the string at the
/// bound rather than failing.
pub fn read_cstring(data: &[u8], offset: usize, max_len: usize) -> Result<String> {
    if offset >= data.len() {
        return Err(MachError::TruncatedFile { offset, needed: 1 });
    }
    let end = offset.saturating_add(max_len).min(data.len());
    let slice = &data[offset..end];
    let len = memchr::memchr(0, slice).unwrap_or(slice.len());
    Ok(String::from_utf8_lossy(&slice[..len]).into_owned())
}

/// Decode a fixed 16 byte name field (segment and section names).
pub fn fixed_name(bytes: &[u8]) -> String {
    let len = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

/// Check that `[offset, offset + size)` lies within `data_len`.
pub fn check_bounds(offset: u64, size: u64, data_len: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= data_len as u64 => Ok(()),
        _ => Err(MachError::TruncatedFile {
            offset: offset as usize,
            needed: size as usize,
        }),
    }
}

/// Slice `[offset, offset + size)` out of `data` with bounds checking.
pub fn slice_at(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    check_bounds(offset, size, data.len())?;
    Ok(&data[offset as usize..(offset + size) as usize])
}

/// Align a value up to the specified alignment
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Render a packed `xxxx.yy.zz` version (dylib and version-min encodings).
pub fn format_packed_version(version: u32) -> String {
    let major = version >> 16;
    let minor = (version >> 8) & 0xff;
    let patch = version & 0xff;
    if patch == 0 {
        format!("{}.{}", major, minor)
    } else {
        format!("{}.{}.{}", major, minor, patch)
    }
}
