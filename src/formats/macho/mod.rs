//! Mach-O (Mach object file format) parser
//!
//! A zero-copy parser over fat and thin Mach-O images. [`MachContainer`]
//! resolves the container and hands out per-architecture [`MachOFile`]s;
//! the code signature, Objective-C metadata and symbol table are decoded on
//! demand from a parsed file.

pub mod codesign;
pub mod constants;
pub mod fat;
pub mod header;
pub mod load_commands;
pub mod objc;
pub mod sections;
pub mod symbols;
pub mod types;
pub mod utils;

use serde::Serialize;
use tracing::warn;

use constants::*;
pub use fat::{Architecture, ContainerKind, FatArch, MachContainer};
use header::parse_header;
use load_commands::{
    decode_load_commands, DylibCommand, DysymtabCommand, LinkEditData, LoadCommand,
    LoadCommandEntry, SourceVersion, SymtabCommand,
};
pub use sections::{AddressResolver, Section, SectionTable, Segment};
pub use types::*;
use utils::check_bounds;

/// One decoded architecture slice.
///
/// Immutable after construction; every report is derived from the
/// borrowed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachOFile<'data> {
    #[serde(skip)]
    data: &'data [u8],
    header: MachHeader,
    load_commands: Vec<LoadCommandEntry<'data>>,
    segments: Vec<Segment>,
    sections: SectionTable,
    symtab: Option<SymtabCommand>,
    dysymtab: Option<DysymtabCommand>,
    code_signature: Option<LinkEditData>,
    inconsistencies: Vec<Inconsistency>,
}

impl<'data> MachOFile<'data> {
    /// Decode the header and load commands of a thin slice
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let header = parse_header(data)?;
        let decoded = decode_load_commands(data, &header)?;
        let mut inconsistencies = decoded.inconsistencies;

        let mut segments = Vec::new();
        let mut symtab = None;
        let mut dysymtab = None;
        let mut code_signature = None;

        for entry in &decoded.commands {
            match &entry.command {
                LoadCommand::Segment(seg) => segments.push(seg.clone()),
                LoadCommand::Symtab(s) if symtab.is_none() => symtab = Some(*s),
                LoadCommand::Dysymtab(d) if dysymtab.is_none() => dysymtab = Some(*d),
                LoadCommand::LinkEditData(l)
                    if l.cmd == LC_CODE_SIGNATURE && code_signature.is_none() =>
                {
                    code_signature = Some(*l)
                }
                LoadCommand::Symtab(_) | LoadCommand::Dysymtab(_) => {
                    inconsistencies.push(Inconsistency::at(
                        entry.offset as u64,
                        format!("duplicate {} ignored", entry.name()),
                    ));
                }
                _ => {}
            }
        }

        let sections =
            SectionTable::new(segments.iter().flat_map(|s| s.sections.iter().cloned()).collect());

        for section in sections.iter() {
            if !section.is_zerofill()
                && check_bounds(section.offset as u64, section.size, data.len()).is_err()
            {
                warn!(section = %section.qualified_name(), "section extends past end of file");
                inconsistencies.push(Inconsistency::at(
                    section.offset as u64,
                    format!(
                        "section {} ({:#x} bytes) extends past end of file",
                        section.qualified_name(),
                        section.size
                    ),
                ));
            }
        }
        if let Some(s) = &symtab {
            let entry = match header.class {
                MachClass::MachO32 => NLIST_SIZE,
                MachClass::MachO64 => NLIST_64_SIZE,
            } as u64;
            if check_bounds(s.symoff as u64, s.nsyms as u64 * entry, data.len()).is_err()
                || check_bounds(s.stroff as u64, s.strsize as u64, data.len()).is_err()
            {
                inconsistencies.push(Inconsistency::at(
                    s.symoff as u64,
                    "symbol table extends past end of file",
                ));
            }
        }
        if let Some(cs) = &code_signature {
            if check_bounds(cs.dataoff as u64, cs.datasize as u64, data.len()).is_err() {
                inconsistencies.push(Inconsistency::at(
                    cs.dataoff as u64,
                    "code signature extends past end of file",
                ));
            }
        }

        Ok(Self {
            data,
            header,
            load_commands: decoded.commands,
            segments,
            sections,
            symtab,
            dysymtab,
            code_signature,
            inconsistencies,
        })
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    pub fn class(&self) -> MachClass {
        self.header.class
    }

    pub fn endian(&self) -> Endian {
        self.header.endian
    }

    pub fn load_commands(&self) -> &[LoadCommandEntry<'data>] {
        &self.load_commands
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn sections(&self) -> &SectionTable {
        &self.sections
    }

    /// Symbol table location (`LC_SYMTAB`)
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.symtab.as_ref()
    }

    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.dysymtab.as_ref()
    }

    /// Code signature location (`LC_CODE_SIGNATURE`)
    pub fn code_signature_location(&self) -> Option<&LinkEditData> {
        self.code_signature.as_ref()
    }

    /// Non-fatal problems noticed while decoding
    pub fn inconsistencies(&self) -> &[Inconsistency] {
        &self.inconsistencies
    }

    /// Identity of a dynamic library (`LC_ID_DYLIB`)
    pub fn dylib_id(&self) -> Option<&DylibCommand> {
        self.load_commands.iter().find_map(|e| match &e.command {
            LoadCommand::Dylib(d) if d.cmd == LC_ID_DYLIB => Some(d),
            _ => None,
        })
    }

    /// Libraries this image links against, in load order
    pub fn linked_dylibs(&self) -> Vec<&DylibCommand> {
        self.load_commands
            .iter()
            .filter_map(|e| match &e.command {
                LoadCommand::Dylib(d) if d.cmd != LC_ID_DYLIB => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn source_version(&self) -> Option<SourceVersion> {
        self.load_commands.iter().find_map(|e| match &e.command {
            LoadCommand::SourceVersion(v) => Some(*v),
            _ => None,
        })
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.load_commands.iter().find_map(|e| match &e.command {
            LoadCommand::Uuid(u) => Some(*u),
            _ => None,
        })
    }

    /// Virtual address resolver over this slice
    pub fn resolver(&self) -> AddressResolver<'_> {
        AddressResolver::new(self.data, &self.sections, self.header.class, self.header.endian)
    }

    /// Raw bytes of the code signature, if present and in bounds
    pub fn code_signature_bytes(&self) -> Option<Result<&'data [u8]>> {
        self.code_signature
            .map(|cs| utils::slice_at(self.data, cs.dataoff as u64, cs.datasize as u64))
    }
}
