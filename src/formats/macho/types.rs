//! Core Mach-O types and errors

use serde::Serialize;
use std::fmt;

use super::constants::*;

/// Mach-O parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachError {
    InvalidMagic(u32),
    MalformedContainer(String),
    TruncatedFile { offset: usize, needed: usize },
    MalformedLoadCommand { index: u32, message: String },
    ArchitectureOutOfRange { index: usize, count: usize },
    CorruptSuperBlob(String),
    CorruptRequirement { index: usize, message: String },
    InvalidCodeDirectory(String),
    Cms(String),
}

impl fmt::Display for MachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic(m) => write!(f, "Invalid Mach-O magic: {:#010x}", m),
            Self::MalformedContainer(msg) => write!(f, "Malformed container: {}", msg),
            Self::TruncatedFile { offset, needed } => {
                write!(f, "Truncated file at {:#x}, needed {} bytes", offset, needed)
            }
            Self::MalformedLoadCommand { index, message } => {
                write!(f, "Malformed load command #{}: {}", index, message)
            }
            Self::ArchitectureOutOfRange { index, count } => {
                write!(f, "Architecture index {} out of range ({} available)", index, count)
            }
            Self::CorruptSuperBlob(msg) => write!(f, "Corrupt code signature SuperBlob: {}", msg),
            Self::CorruptRequirement { index, message } => {
                write!(f, "Corrupt requirement #{}: {}", index, message)
            }
            Self::InvalidCodeDirectory(msg) => write!(f, "Invalid code directory: {}", msg),
            Self::Cms(msg) => write!(f, "CMS signature error: {}", msg),
        }
    }
}

impl std::error::Error for MachError {}

pub type Result<T> = std::result::Result<T, MachError>;

/// Byte order of a thin slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn is_little_endian(&self) -> bool {
        matches!(self, Endian::Little)
    }
}

/// Word size of a thin slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachClass {
    MachO32,
    MachO64,
}

impl MachClass {
    pub fn bits(&self) -> u8 {
        match self {
            MachClass::MachO32 => 32,
            MachClass::MachO64 => 64,
        }
    }

    /// Size of a pointer in bytes.
    pub fn pointer_size(&self) -> usize {
        match self {
            MachClass::MachO32 => 4,
            MachClass::MachO64 => 8,
        }
    }

    /// Size of the `mach_header` / `mach_header_64` structure.
    pub fn header_size(&self) -> usize {
        match self {
            MachClass::MachO32 => MACH_HEADER_SIZE,
            MachClass::MachO64 => MACH_HEADER_64_SIZE,
        }
    }
}

/// Classify a thin magic value read as little-endian.
pub fn classify_magic(magic_le: u32) -> Option<(MachClass, Endian)> {
    match magic_le {
        MH_MAGIC => Some((MachClass::MachO32, Endian::Little)),
        MH_CIGAM => Some((MachClass::MachO32, Endian::Big)),
        MH_MAGIC_64 => Some((MachClass::MachO64, Endian::Little)),
        MH_CIGAM_64 => Some((MachClass::MachO64, Endian::Big)),
        _ => None,
    }
}

/// CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CpuType {
    X86,
    X86_64,
    Arm,
    Arm64,
    Arm64_32,
    PowerPC,
    PowerPC64,
    Other(u32),
}

impl From<u32> for CpuType {
    fn from(val: u32) -> Self {
        match val {
            CPU_TYPE_X86 => CpuType::X86,
            CPU_TYPE_X86_64 => CpuType::X86_64,
            CPU_TYPE_ARM => CpuType::Arm,
            CPU_TYPE_ARM64 => CpuType::Arm64,
            CPU_TYPE_ARM64_32 => CpuType::Arm64_32,
            CPU_TYPE_POWERPC => CpuType::PowerPC,
            CPU_TYPE_POWERPC64 => CpuType::PowerPC64,
            other => CpuType::Other(other),
        }
    }
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuType::X86 => write!(f, "i386"),
            CpuType::X86_64 => write!(f, "x86_64"),
            CpuType::Arm => write!(f, "arm"),
            CpuType::Arm64 => write!(f, "arm64"),
            CpuType::Arm64_32 => write!(f, "arm64_32"),
            CpuType::PowerPC => write!(f, "ppc"),
            CpuType::PowerPC64 => write!(f, "ppc64"),
            CpuType::Other(v) => write!(f, "cpu({:#x})", v),
        }
    }
}

/// Human readable name for a cpu subtype, masking off capability bits.
pub fn cpu_subtype_name(cpu: CpuType, subtype: u32) -> String {
    let sub = subtype & !CPU_SUBTYPE_MASK;
    let name = match (cpu, sub) {
        (CpuType::X86 | CpuType::X86_64, CPU_SUBTYPE_X86_ALL) => "ALL",
        (CpuType::X86_64, CPU_SUBTYPE_X86_64_H) => "x86_64h",
        (CpuType::Arm64, CPU_SUBTYPE_ARM64_ALL) => "ALL",
        (CpuType::Arm64, CPU_SUBTYPE_ARM64_V8) => "v8",
        (CpuType::Arm64, CPU_SUBTYPE_ARM64E) => "arm64e",
        (CpuType::Arm, CPU_SUBTYPE_ARM_V7) => "v7",
        (CpuType::Arm, CPU_SUBTYPE_ARM_V7S) => "v7s",
        (CpuType::Arm, CPU_SUBTYPE_ARM_V7K) => "v7k",
        (CpuType::Arm, 0) => "ALL",
        _ => return format!("{}", sub),
    };
    name.to_string()
}

/// Mach-O file type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    Object,
    Execute,
    FvmLib,
    Core,
    Preload,
    Dylib,
    Dylinker,
    Bundle,
    DylibStub,
    Dsym,
    KextBundle,
    FileSet,
    Unknown(u32),
}

impl From<u32> for FileType {
    fn from(val: u32) -> Self {
        match val {
            MH_OBJECT => FileType::Object,
            MH_EXECUTE => FileType::Execute,
            MH_FVMLIB => FileType::FvmLib,
            MH_CORE => FileType::Core,
            MH_PRELOAD => FileType::Preload,
            MH_DYLIB => FileType::Dylib,
            MH_DYLINKER => FileType::Dylinker,
            MH_BUNDLE => FileType::Bundle,
            MH_DYLIB_STUB => FileType::DylibStub,
            MH_DSYM => FileType::Dsym,
            MH_KEXT_BUNDLE => FileType::KextBundle,
            MH_FILESET => FileType::FileSet,
            other => FileType::Unknown(other),
        }
    }
}

/// Mach header (32 or 64-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MachHeader {
    pub magic: u32,
    pub class: MachClass,
    pub endian: Endian,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    /// Only present on 64-bit headers.
    pub reserved: u32,
}

impl MachHeader {
    pub fn cpu(&self) -> CpuType {
        CpuType::from(self.cputype)
    }

    pub fn file_type(&self) -> FileType {
        FileType::from(self.filetype)
    }

    pub fn size(&self) -> usize {
        self.class.header_size()
    }

    pub fn is_pie(&self) -> bool {
        self.flags & MH_PIE != 0
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Names of the header flags that are set.
    pub fn flag_names(&self) -> Vec<&'static str> {
        HEADER_FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for MachHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Magic = {}-bit MachO, Type = {:?}, CPU = {}, {}, Commands = {} (Size: {}), Flags = {}",
            self.class.bits(),
            self.file_type(),
            self.cpu(),
            cpu_subtype_name(self.cpu(), self.cpusubtype),
            self.ncmds,
            self.sizeofcmds,
            self.flag_names().join(", ")
        )
    }
}

/// A non-fatal inconsistency observed while decoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inconsistency {
    pub offset: Option<u64>,
    pub message: String,
}

impl Inconsistency {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            offset: None,
            message: message.into(),
        }
    }

    pub fn at(offset: u64, message: impl Into<String>) -> Self {
        Self {
            offset: Some(offset),
            message: message.into(),
        }
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(off) => write!(f, "{} (@{:#x})", self.message, off),
            None => write!(f, "{}", self.message),
        }
    }
}
