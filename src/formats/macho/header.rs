//! Mach header parsing

use crate::formats::macho::types::*;
use crate::formats::macho::utils::EndianRead;

/// Parse the Mach header of a thin slice
pub fn parse_header(data: &[u8]) -> Result<MachHeader> {
    let magic_le = data.read_u32(0, Endian::Little)?;
    let (class, endian) = classify_magic(magic_le).ok_or_else(|| {
        MachError::InvalidMagic(u32::from_be_bytes(magic_le.to_le_bytes()))
    })?;

    let header_size = class.header_size();
    if data.len() < header_size {
        return Err(MachError::TruncatedFile {
            offset: 0,
            needed: header_size,
        });
    }

    let reserved = match class {
        MachClass::MachO32 => 0,
        MachClass::MachO64 => data.read_u32(28, endian)?,
    };

    Ok(MachHeader {
        magic: data.read_u32(0, endian)?,
        class,
        endian,
        cputype: data.read_u32(4, endian)?,
        cpusubtype: data.read_u32(8, endian)?,
        filetype: data.read_u32(12, endian)?,
        ncmds: data.read_u32(16, endian)?,
        sizeofcmds: data.read_u32(20, endian)?,
        flags: data.read_u32(24, endian)?,
        reserved,
    })
}
