//! Symbol table parsing and symbol-to-section correlation

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use crate::formats::macho::constants::*;
use crate::formats::macho::load_commands::SymtabCommand;
use crate::formats::macho::sections::SectionTable;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{read_cstring, slice_at, EndianRead};
use crate::formats::macho::MachOFile;

const MAX_SYMBOL_NAME: usize = 4096;

/// Raw `nlist` / `nlist_64` record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist {
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    pub fn is_private_external(&self) -> bool {
        self.n_type & N_PEXT != 0
    }

    pub fn kind(&self) -> SymbolKind {
        if self.is_stab() {
            return SymbolKind::Debug(self.n_type);
        }
        match self.n_type & N_TYPE {
            N_UNDF => SymbolKind::Undefined,
            N_ABS => SymbolKind::Absolute,
            N_SECT => SymbolKind::Section,
            N_PBUD => SymbolKind::Prebound,
            N_INDR => SymbolKind::Indirect,
            other => SymbolKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolKind {
    Undefined,
    Absolute,
    Section,
    Prebound,
    Indirect,
    /// Debugger (stab) entry carrying the full `n_type`
    Debug(u8),
    Unknown(u8),
}

/// Where a symbol's section index points
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SectionRef {
    /// `n_sect == 0`
    NoSection,
    Resolved { segment: String, section: String },
    /// Index past the end of the section table
    Unresolved(u8),
}

impl SectionRef {
    pub fn is_resolved(&self) -> bool {
        matches!(self, SectionRef::Resolved { .. })
    }
}

impl fmt::Display for SectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionRef::NoSection => write!(f, "no section"),
            SectionRef::Resolved { segment, section } => write!(f, "{}.{}", segment, section),
            SectionRef::Unresolved(n) => write!(f, "unresolved section #{}", n),
        }
    }
}

/// Map a 1-based section index to its `(segment, section)` names
pub fn correlate(n_sect: u8, sections: &SectionTable) -> SectionRef {
    if n_sect == NO_SECT {
        return SectionRef::NoSection;
    }
    match sections.by_symbol_index(n_sect) {
        Some(s) => SectionRef::Resolved {
            segment: s.segment_name.clone(),
            section: s.name.clone(),
        },
        None => {
            trace!(n_sect, count = sections.count(), "symbol section index out of range");
            SectionRef::Unresolved(n_sect)
        }
    }
}

/// A symbol table entry with its resolved section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub index: u32,
    pub name: String,
    pub value: u64,
    pub kind: SymbolKind,
    pub external: bool,
    pub raw: Nlist,
    pub section: SectionRef,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Value: 0x{:016x}  Type: 0x{:02x}  Section: {:<24}  {}",
            self.value, self.raw.n_type, self.section, self.name
        )
    }
}

/// Symbols in file order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    /// Entry count declared by `LC_SYMTAB`
    declared: u32,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
}

impl SymbolTable {
    /// Decode the symbol table of `file`, keeping at most `max_symbols` entries.
    ///
    /// Returns `Ok(None)` when the image has no `LC_SYMTAB`.
    pub fn from_file(file: &MachOFile<'_>, max_symbols: usize) -> Result<Option<Self>> {
        match file.symtab() {
            Some(symtab) => Self::parse(
                file.data(),
                symtab,
                file.sections(),
                file.class(),
                file.endian(),
                max_symbols,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    pub fn parse(
        data: &[u8],
        symtab: &SymtabCommand,
        sections: &SectionTable,
        class: MachClass,
        endian: Endian,
        max_symbols: usize,
    ) -> Result<Self> {
        let entry_size = match class {
            MachClass::MachO32 => NLIST_SIZE,
            MachClass::MachO64 => NLIST_64_SIZE,
        };
        let table = slice_at(
            data,
            symtab.symoff as u64,
            symtab.nsyms as u64 * entry_size as u64,
        )?;
        let strings = slice_at(data, symtab.stroff as u64, symtab.strsize as u64)?;

        let count = (symtab.nsyms as usize).min(max_symbols);
        let mut symbols = Vec::with_capacity(count);
        let mut by_name = HashMap::new();

        for index in 0..count {
            let raw = parse_nlist(table, index * entry_size, class, endian)?;
            let name = if (raw.n_strx as usize) < strings.len() {
                read_cstring(strings, raw.n_strx as usize, MAX_SYMBOL_NAME)?
            } else {
                trace!(index, n_strx = raw.n_strx, "symbol name outside string table");
                String::new()
            };
            if !name.is_empty() {
                by_name.entry(name.clone()).or_insert(index);
            }
            symbols.push(Symbol {
                index: index as u32,
                name,
                value: raw.n_value,
                kind: raw.kind(),
                external: raw.is_external(),
                section: correlate(raw.n_sect, sections),
                raw,
            });
        }
        if count < symtab.nsyms as usize {
            debug!(kept = count, declared = symtab.nsyms, "symbol table truncated");
        }

        Ok(Self {
            symbols,
            declared: symtab.nsyms,
            by_name,
        })
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn declared_count(&self) -> u32 {
        self.declared
    }

    /// Whether fewer entries were kept than the table declares
    pub fn is_truncated(&self) -> bool {
        (self.symbols.len() as u64) < self.declared as u64
    }

    pub fn by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).and_then(|&i| self.symbols.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}

fn parse_nlist(table: &[u8], off: usize, class: MachClass, endian: Endian) -> Result<Nlist> {
    Ok(Nlist {
        n_strx: table.read_u32(off, endian)?,
        n_type: table.read_u8(off + 4)?,
        n_sect: table.read_u8(off + 5)?,
        n_desc: table.read_u16(off + 6, endian)?,
        n_value: match class {
            MachClass::MachO32 => table.read_u32(off + 8, endian)? as u64,
            MachClass::MachO64 => table.read_u64(off + 8, endian)?,
        },
    })
}
