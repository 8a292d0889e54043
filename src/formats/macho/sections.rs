//! Segments, sections and virtual address resolution

use serde::Serialize;

use crate::formats::macho::constants::*;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{fixed_name, read_pointer, EndianRead};

/// Section record (`section` / `section_64`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

impl Section {
    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    pub fn attributes(&self) -> u32 {
        self.flags & SECTION_ATTRIBUTES
    }

    /// Zero-fill sections occupy no file space
    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.section_type(),
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }

    pub fn is_executable(&self) -> bool {
        self.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0
    }

    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }

    /// `segment.section` display name
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.segment_name, self.name)
    }

    /// File bytes of the section, if it has any and they are in bounds
    pub fn data<'a>(&self, file: &'a [u8]) -> Option<&'a [u8]> {
        if self.is_zerofill() {
            return None;
        }
        let start = self.offset as usize;
        let end = start.checked_add(usize::try_from(self.size).ok()?)?;
        file.get(start..end)
    }
}

/// Segment command (`LC_SEGMENT` / `LC_SEGMENT_64`) with its sections
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl Segment {
    pub fn is_executable(&self) -> bool {
        self.initprot & VM_PROT_EXECUTE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.initprot & VM_PROT_WRITE != 0
    }

    pub fn contains_vaddr(&self, addr: u64) -> bool {
        addr >= self.vmaddr && addr - self.vmaddr < self.vmsize
    }
}

/// Parse a segment command body starting at `offset` (the command start).
pub fn parse_segment(
    data: &[u8],
    offset: usize,
    cmdsize: usize,
    class: MachClass,
    endian: Endian,
) -> Result<Segment> {
    let (fixed, sect_size) = match class {
        MachClass::MachO32 => (SEGMENT_COMMAND_SIZE, SECTION_SIZE),
        MachClass::MachO64 => (SEGMENT_COMMAND_64_SIZE, SECTION_64_SIZE),
    };
    if cmdsize < fixed {
        return Err(MachError::TruncatedFile {
            offset,
            needed: fixed,
        });
    }

    let name = fixed_name(data.read_bytes(offset + 8, 16)?);
    let (vmaddr, vmsize, fileoff, filesize, rest) = match class {
        MachClass::MachO32 => (
            data.read_u32(offset + 24, endian)? as u64,
            data.read_u32(offset + 28, endian)? as u64,
            data.read_u32(offset + 32, endian)? as u64,
            data.read_u32(offset + 36, endian)? as u64,
            offset + 40,
        ),
        MachClass::MachO64 => (
            data.read_u64(offset + 24, endian)?,
            data.read_u64(offset + 32, endian)?,
            data.read_u64(offset + 40, endian)?,
            data.read_u64(offset + 48, endian)?,
            offset + 56,
        ),
    };
    let maxprot = data.read_u32(rest, endian)?;
    let initprot = data.read_u32(rest + 4, endian)?;
    let nsects = data.read_u32(rest + 8, endian)?;
    let flags = data.read_u32(rest + 12, endian)?;

    let needed = (nsects as usize)
        .checked_mul(sect_size)
        .and_then(|n| n.checked_add(fixed))
        .ok_or(MachError::TruncatedFile {
            offset,
            needed: usize::MAX,
        })?;
    if needed > cmdsize {
        return Err(MachError::TruncatedFile { offset, needed });
    }

    let mut sections = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let so = offset + fixed + i * sect_size;
        sections.push(parse_section(data, so, class, endian)?);
    }

    Ok(Segment {
        name,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot,
        initprot,
        nsects,
        flags,
        sections,
    })
}

fn parse_section(data: &[u8], so: usize, class: MachClass, endian: Endian) -> Result<Section> {
    let name = fixed_name(data.read_bytes(so, 16)?);
    let segment_name = fixed_name(data.read_bytes(so + 16, 16)?);
    let (addr, size, rest) = match class {
        MachClass::MachO32 => (
            data.read_u32(so + 32, endian)? as u64,
            data.read_u32(so + 36, endian)? as u64,
            so + 40,
        ),
        MachClass::MachO64 => (
            data.read_u64(so + 32, endian)?,
            data.read_u64(so + 40, endian)?,
            so + 48,
        ),
    };
    Ok(Section {
        name,
        segment_name,
        addr,
        size,
        offset: data.read_u32(rest, endian)?,
        align: data.read_u32(rest + 4, endian)?,
        reloff: data.read_u32(rest + 8, endian)?,
        nreloc: data.read_u32(rest + 12, endian)?,
        flags: data.read_u32(rest + 16, endian)?,
        reserved1: data.read_u32(rest + 20, endian)?,
        reserved2: data.read_u32(rest + 24, endian)?,
        reserved3: match class {
            MachClass::MachO32 => 0,
            MachClass::MachO64 => data.read_u32(rest + 28, endian)?,
        },
    })
}

/// Ordered section table with virtual address resolution.
///
/// All pointer chasing (ObjC metadata, selector references) goes through
/// [`SectionTable::addr_to_offset`] so bounds checks live in one place.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SectionTable {
    sections: Vec<Section>,
}

impl SectionTable {
    pub fn new(sections: Vec<Section>) -> Self {
        Self { sections }
    }

    pub fn count(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn as_slice(&self) -> &[Section] {
        &self.sections
    }

    /// Section by 1-based symbol table index
    pub fn by_symbol_index(&self, n_sect: u8) -> Option<&Section> {
        (n_sect as usize)
            .checked_sub(1)
            .and_then(|i| self.sections.get(i))
    }

    /// First section with the given name in any segment
    pub fn by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section by its `(segment, section)` identity
    pub fn by_qualified_name(&self, segment: &str, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.segment_name == segment && s.name == name)
    }

    /// Section containing a virtual address
    pub fn by_addr(&self, addr: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_addr(addr))
    }

    /// Translate a virtual address to a slice-relative file offset.
    ///
    /// Returns `None` for addresses outside every section and for zero-fill
    /// sections, which have no file backing.
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        let section = self.by_addr(addr)?;
        if section.is_zerofill() {
            return None;
        }
        Some(section.offset as u64 + (addr - section.addr))
    }
}

/// Resolves virtual addresses against one slice's bytes
#[derive(Clone, Copy)]
pub struct AddressResolver<'a> {
    pub data: &'a [u8],
    pub sections: &'a SectionTable,
    pub class: MachClass,
    pub endian: Endian,
}

impl<'a> AddressResolver<'a> {
    pub fn new(
        data: &'a [u8],
        sections: &'a SectionTable,
        class: MachClass,
        endian: Endian,
    ) -> Self {
        Self {
            data,
            sections,
            class,
            endian,
        }
    }

    pub fn pointer_size(&self) -> usize {
        self.class.pointer_size()
    }

    /// File offset of a virtual address, if it is file-backed and in bounds.
    pub fn offset_of(&self, addr: u64) -> Option<usize> {
        let off = self.sections.addr_to_offset(addr)?;
        let off = usize::try_from(off).ok()?;
        (off < self.data.len()).then_some(off)
    }

    pub fn read_pointer_at(&self, addr: u64) -> Option<u64> {
        let off = self.offset_of(addr)?;
        read_pointer(self.data, off, self.class, self.endian).ok()
    }

    pub fn read_u32_at(&self, addr: u64) -> Option<u32> {
        let off = self.offset_of(addr)?;
        self.data.read_u32(off, self.endian).ok()
    }

    pub fn read_i32_at(&self, addr: u64) -> Option<i32> {
        self.read_u32_at(addr).map(|v| v as i32)
    }

    pub fn read_cstring_at(&self, addr: u64, max_len: usize) -> Option<String> {
        let off = self.offset_of(addr)?;
        crate::formats::macho::utils::read_cstring(self.data, off, max_len).ok()
    }
}
