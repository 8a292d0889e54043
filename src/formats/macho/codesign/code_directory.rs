//! Code Directory decoding, hash slots and CDHash

use std::fmt;

use bitflags::bitflags;
use serde::Serialize;
use tracing::{debug, warn};

use super::superblob::{Blob, SuperBlob, BE};
use super::*;
use crate::formats::macho::types::{Inconsistency, MachError, Result};
use crate::formats::macho::utils::{read_cstring, EndianRead};
use crate::hashing::{digest, DigestKind};

const MAX_IDENTIFIER_LEN: usize = 1024;

/// Fixed header size of the earliest Code Directory version
const CODE_DIRECTORY_MIN_SIZE: usize = 44;

/// Largest page-size shift accepted without an inconsistency
const MAX_PAGE_SIZE_LOG2: u8 = 32;

pub const CD_VERSION_SCATTER: u32 = 0x20100;
pub const CD_VERSION_TEAMID: u32 = 0x20200;
pub const CD_VERSION_CODELIMIT64: u32 = 0x20300;
pub const CD_VERSION_EXECSEG: u32 = 0x20400;
pub const CD_VERSION_RUNTIME: u32 = 0x20500;

bitflags! {
    /// `CS_*` code signing flags stored in the Code Directory
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CodeDirectoryFlags: u32 {
        const HOST = 0x0000_0001;
        const ADHOC = 0x0000_0002;
        const FORCE_HARD = 0x0000_0100;
        const FORCE_KILL = 0x0000_0200;
        const FORCE_EXPIRATION = 0x0000_0400;
        const RESTRICT = 0x0000_0800;
        const ENFORCEMENT = 0x0000_1000;
        const LIBRARY_VALIDATION = 0x0000_2000;
        const RUNTIME = 0x0001_0000;
        const LINKER_SIGNED = 0x0002_0000;
    }
}

bitflags! {
    /// `CS_EXECSEG_*` executable segment flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecSegFlags: u64 {
        const MAIN_BINARY = 0x1;
        const ALLOW_UNSIGNED = 0x10;
        const DEBUGGER = 0x20;
        const JIT = 0x40;
        const SKIP_LV = 0x80;
        const CAN_LOAD_CDHASH = 0x100;
        const CAN_EXEC_CDHASH = 0x200;
    }
}

/// Names of the set flags, for display
pub fn flag_names<F: bitflags::Flags>(flags: F) -> Vec<&'static str> {
    flags.iter_names().map(|(name, _)| name).collect()
}

/// Hash algorithm declared by `hashType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HashType {
    NoHash,
    Sha1,
    Sha256,
    /// SHA-256 truncated to 20 bytes
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl From<u8> for HashType {
    fn from(value: u8) -> Self {
        match value {
            0 => HashType::NoHash,
            1 => HashType::Sha1,
            2 => HashType::Sha256,
            3 => HashType::Sha256Truncated,
            4 => HashType::Sha384,
            5 => HashType::Sha512,
            other => HashType::Unknown(other),
        }
    }
}

impl HashType {
    pub fn digest_kind(&self) -> Option<DigestKind> {
        match self {
            HashType::Sha1 => Some(DigestKind::Sha1),
            HashType::Sha256 | HashType::Sha256Truncated => Some(DigestKind::Sha256),
            HashType::Sha384 => Some(DigestKind::Sha384),
            HashType::Sha512 => Some(DigestKind::Sha512),
            HashType::NoHash | HashType::Unknown(_) => None,
        }
    }

    /// Digest size in bytes as stored in slots
    pub fn size(&self) -> Option<usize> {
        match self {
            HashType::Sha256Truncated => Some(20),
            other => other.digest_kind().map(|k| k.output_size()),
        }
    }

    /// Digest `data`, truncated to the slot size
    pub fn hash(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = digest(self.digest_kind()?, data);
        out.truncate(self.size()?);
        Some(out)
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashType::NoHash => write!(f, "none"),
            HashType::Sha1 => write!(f, "sha1"),
            HashType::Sha256 => write!(f, "sha256"),
            HashType::Sha256Truncated => write!(f, "sha256-truncated"),
            HashType::Sha384 => write!(f, "sha384"),
            HashType::Sha512 => write!(f, "sha512"),
            HashType::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

/// Executable segment description (version 0x20400+)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecSegment {
    pub base: u64,
    pub limit: u64,
    pub flags: u64,
}

impl ExecSegment {
    pub fn flags(&self) -> ExecSegFlags {
        ExecSegFlags::from_bits_retain(self.flags)
    }
}

/// Verification outcome of one hash slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    Match,
    Mismatch,
    /// Slot is zero-filled; the referenced item is absent
    Empty,
    /// The hashed item lives outside the binary (Info.plist, resources)
    External,
    /// The referenced data is not present in the signature or slice
    Missing,
}

/// One hash slot; negative indices are special slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashSlot {
    pub index: i64,
    pub name: Option<&'static str>,
    pub digest: String,
    pub status: Option<SlotStatus>,
}

impl fmt::Display for HashSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>5}: {}", self.index, self.digest)?;
        if let Some(name) = self.name {
            write!(f, " ({})", name)?;
        }
        if let Some(status) = self.status {
            write!(f, " [{:?}]", status)?;
        }
        Ok(())
    }
}

/// CDHash of a Code Directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CdHash {
    /// Full digest, hex encoded
    pub full: String,
    /// First 20 bytes, the form used by the kernel and trust caches
    pub truncated: String,
}

/// A decoded Code Directory borrowing its blob bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeDirectory<'data> {
    #[serde(skip)]
    bytes: &'data [u8],
    pub slot_type: u32,
    pub version: u32,
    pub flags: u32,
    pub hash_offset: u32,
    pub ident_offset: u32,
    pub n_special_slots: u32,
    pub n_code_slots: u32,
    pub code_limit: u32,
    pub hash_size: u8,
    pub hash_type: HashType,
    pub platform: u8,
    /// log2 of the page size; zero means a single unbounded page
    pub page_size_log2: u8,
    pub scatter_offset: Option<u32>,
    pub team_offset: Option<u32>,
    pub code_limit64: Option<u64>,
    pub exec_segment: Option<ExecSegment>,
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    pub identifier: String,
    pub team_id: Option<String>,
    pub inconsistencies: Vec<Inconsistency>,
}

impl<'data> CodeDirectory<'data> {
    pub fn from_blob(blob: &Blob<'data>) -> Result<Self> {
        Self::parse(blob.bytes, blob.slot_type)
    }

    /// Decode a Code Directory blob (`bytes` spans exactly the blob).
    pub fn parse(bytes: &'data [u8], slot_type: u32) -> Result<Self> {
        let magic = bytes.read_u32(0, BE)?;
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(MachError::InvalidCodeDirectory(format!(
                "unexpected magic {:#010x}",
                magic
            )));
        }
        if bytes.len() < CODE_DIRECTORY_MIN_SIZE {
            return Err(MachError::InvalidCodeDirectory(format!(
                "blob of {} bytes is shorter than the fixed header",
                bytes.len()
            )));
        }
        let u32_at = |off: usize| bytes.read_u32(off, BE);

        let version = u32_at(8)?;
        let flags = u32_at(12)?;
        let hash_offset = u32_at(16)?;
        let ident_offset = u32_at(20)?;
        let n_special_slots = u32_at(24)?;
        let n_code_slots = u32_at(28)?;
        let code_limit = u32_at(32)?;
        let hash_size = bytes.read_u8(36)?;
        let hash_type = HashType::from(bytes.read_u8(37)?);
        let platform = bytes.read_u8(38)?;
        let page_size_log2 = bytes.read_u8(39)?;

        // Optional fields are gated on version; a short blob simply lacks them
        let at_version = |min: u32, off: usize| -> Result<Option<u32>> {
            if version >= min {
                u32_at(off).map(Some)
            } else {
                Ok(None)
            }
        };
        let scatter_offset = at_version(CD_VERSION_SCATTER, 44)?.filter(|&o| o != 0);
        let team_offset = at_version(CD_VERSION_TEAMID, 48)?.filter(|&o| o != 0);
        let code_limit64 = if version >= CD_VERSION_CODELIMIT64 {
            Some(bytes.read_u64(56, BE)?).filter(|&v| v != 0)
        } else {
            None
        };
        let exec_segment = if version >= CD_VERSION_EXECSEG {
            Some(ExecSegment {
                base: bytes.read_u64(64, BE)?,
                limit: bytes.read_u64(72, BE)?,
                flags: bytes.read_u64(80, BE)?,
            })
        } else {
            None
        };
        let runtime = at_version(CD_VERSION_RUNTIME, 88)?;
        let pre_encrypt_offset = at_version(CD_VERSION_RUNTIME, 92)?.filter(|&o| o != 0);

        let identifier = read_cstring(bytes, ident_offset as usize, MAX_IDENTIFIER_LEN)
            .map_err(|_| {
                MachError::InvalidCodeDirectory(format!(
                    "identifier offset {:#x} outside blob",
                    ident_offset
                ))
            })?;
        let team_id = match team_offset {
            Some(off) => Some(read_cstring(bytes, off as usize, MAX_IDENTIFIER_LEN).map_err(
                |_| {
                    MachError::InvalidCodeDirectory(format!(
                        "team id offset {:#x} outside blob",
                        off
                    ))
                },
            )?),
            None => None,
        };

        let special_span = n_special_slots as u64 * hash_size as u64;
        if special_span > hash_offset as u64 {
            return Err(MachError::InvalidCodeDirectory(format!(
                "{} special slots of {} bytes precede hashOffset {:#x}",
                n_special_slots, hash_size, hash_offset
            )));
        }
        let code_end = hash_offset as u64 + n_code_slots as u64 * hash_size as u64;
        if code_end > bytes.len() as u64 {
            return Err(MachError::InvalidCodeDirectory(format!(
                "{} code slots end at {:#x}, past blob length {:#x}",
                n_code_slots,
                code_end,
                bytes.len()
            )));
        }

        let mut cd = Self {
            bytes,
            slot_type,
            version,
            flags,
            hash_offset,
            ident_offset,
            n_special_slots,
            n_code_slots,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size_log2,
            scatter_offset,
            team_offset,
            code_limit64,
            exec_segment,
            runtime,
            pre_encrypt_offset,
            identifier,
            team_id,
            inconsistencies: Vec::new(),
        };

        if let Some(expected) = hash_type.size() {
            if expected != hash_size as usize {
                cd.inconsistencies.push(Inconsistency::new(format!(
                    "hashSize {} does not match {} ({} bytes)",
                    hash_size, hash_type, expected
                )));
            }
        }
        if page_size_log2 > MAX_PAGE_SIZE_LOG2 {
            warn!(page_size_log2, "page size shift out of range");
            cd.inconsistencies.push(Inconsistency::new(format!(
                "pageSize shift {} exceeds {}",
                page_size_log2, MAX_PAGE_SIZE_LOG2
            )));
        }
        if !cd.slot_count_consistent() {
            warn!(
                n_code_slots,
                expected = cd.expected_code_slots(),
                "code slot count does not cover codeLimit"
            );
            cd.inconsistencies.push(Inconsistency::new(format!(
                "nCodeSlots is {} but codeLimit {:#x} with {} byte pages needs {}",
                n_code_slots,
                cd.effective_code_limit(),
                cd.page_size(),
                cd.expected_code_slots()
            )));
        }
        debug!(
            identifier = %cd.identifier,
            version = format_args!("{:#x}", version),
            hash_type = %hash_type,
            n_code_slots,
            n_special_slots,
            "code directory"
        );
        Ok(cd)
    }

    /// Raw blob bytes
    pub fn bytes(&self) -> &'data [u8] {
        self.bytes
    }

    pub fn flags(&self) -> CodeDirectoryFlags {
        CodeDirectoryFlags::from_bits_retain(self.flags)
    }

    /// Page size in bytes (0 for a single unbounded page)
    pub fn page_size(&self) -> u64 {
        if self.page_size_log2 == 0 {
            0
        } else {
            1u64.checked_shl(self.page_size_log2 as u32).unwrap_or(0)
        }
    }

    /// `codeLimit64` when present, else `codeLimit`
    pub fn effective_code_limit(&self) -> u64 {
        self.code_limit64.unwrap_or(self.code_limit as u64)
    }

    /// `ceil(codeLimit / pageSize)`
    pub fn expected_code_slots(&self) -> u64 {
        let limit = self.effective_code_limit();
        match self.page_size() {
            0 => u64::from(limit > 0),
            page => limit.div_ceil(page),
        }
    }

    pub fn slot_count_consistent(&self) -> bool {
        self.expected_code_slots() == self.n_code_slots as u64
    }

    /// Digest stored for special slot `-n` (`1 <= n <= nSpecialSlots`)
    pub fn special_slot(&self, n: u32) -> Option<&'data [u8]> {
        if n == 0 || n > self.n_special_slots {
            return None;
        }
        let size = self.hash_size as usize;
        let start = (self.hash_offset as usize).checked_sub(n as usize * size)?;
        self.bytes.get(start..start + size)
    }

    /// Digest stored for code slot `i`
    pub fn code_slot(&self, i: u32) -> Option<&'data [u8]> {
        if i >= self.n_code_slots {
            return None;
        }
        let size = self.hash_size as usize;
        let start = self.hash_offset as usize + i as usize * size;
        self.bytes.get(start..start + size)
    }

    /// Special slots from `-1` down to `-nSpecialSlots`
    pub fn special_slots(&self) -> Vec<HashSlot> {
        (1..=self.n_special_slots)
            .filter_map(|n| {
                self.special_slot(n).map(|d| HashSlot {
                    index: -(n as i64),
                    name: special_slot_name(n),
                    digest: hex::encode(d),
                    status: None,
                })
            })
            .collect()
    }

    pub fn code_slots(&self) -> Vec<HashSlot> {
        (0..self.n_code_slots)
            .filter_map(|i| {
                self.code_slot(i).map(|d| HashSlot {
                    index: i as i64,
                    name: None,
                    digest: hex::encode(d),
                    status: None,
                })
            })
            .collect()
    }

    /// Digest of the directory's own bytes with its declared algorithm
    pub fn cdhash(&self) -> Option<CdHash> {
        let full = digest(self.hash_type.digest_kind()?, self.bytes);
        Some(CdHash {
            truncated: hex::encode(&full[..full.len().min(20)]),
            full: hex::encode(&full),
        })
    }

    /// Re-hash every code page of `slice` and compare with the code slots.
    ///
    /// The final page may be partial; pages extending past `slice` are
    /// reported as [`SlotStatus::Missing`].
    pub fn verify_code_slots(&self, slice: &[u8]) -> Vec<HashSlot> {
        let limit = self.effective_code_limit();
        let page = match self.page_size() {
            0 => limit.max(1),
            p => p,
        };
        self.code_slots()
            .into_iter()
            .map(|mut slot| {
                let status = match page_bounds(slot.index as u64, page, limit) {
                    Some((s, e)) if s <= e && e <= slice.len() => {
                        match self.hash_type.hash(&slice[s..e]) {
                            Some(h) if hex::encode(&h) == slot.digest => SlotStatus::Match,
                            Some(_) => SlotStatus::Mismatch,
                            None => SlotStatus::Missing,
                        }
                    }
                    _ => SlotStatus::Missing,
                };
                slot.status = Some(status);
                slot
            })
            .collect()
    }

    /// Compare special slots with the digests of sibling sub-blobs.
    pub fn verify_special_slots(&self, superblob: &SuperBlob<'_>) -> Vec<HashSlot> {
        self.special_slots()
            .into_iter()
            .map(|mut slot| {
                let zero = slot.digest.bytes().all(|c| c == b'0');
                let sibling = match slot.index {
                    -2 => Some(CSSLOT_REQUIREMENTS),
                    -5 => Some(CSSLOT_ENTITLEMENTS),
                    -7 => Some(CSSLOT_DER_ENTITLEMENTS),
                    _ => None,
                };
                let status = match sibling {
                    _ if zero => SlotStatus::Empty,
                    None => SlotStatus::External,
                    Some(slot_type) => match superblob.find(slot_type) {
                        Some(Ok(blob)) => match self.hash_type.hash(blob.bytes) {
                            Some(h) if hex::encode(&h) == slot.digest => SlotStatus::Match,
                            Some(_) => SlotStatus::Mismatch,
                            None => SlotStatus::Missing,
                        },
                        _ => SlotStatus::Missing,
                    },
                };
                slot.status = Some(status);
                slot
            })
            .collect()
    }
}

impl fmt::Display for CodeDirectory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CodeDirectory v{:x} size={} flags={:#x}({}) hashes={}+{} location=embedded\n\
             \tHash type: {} size={}\n\
             \tIdentifier: {}",
            self.version,
            self.bytes.len(),
            self.flags,
            flag_names(self.flags()).join(", ").to_lowercase(),
            self.n_code_slots,
            self.n_special_slots,
            self.hash_type,
            self.hash_size,
            self.identifier
        )?;
        if let Some(team) = &self.team_id {
            write!(f, "\n\tTeamID:      {}", team)?;
        }
        if let Some(cdhash) = self.cdhash() {
            write!(f, "\n\tCDHash:      {} (computed)", cdhash.full)?;
        }
        Ok(())
    }
}

/// Byte range of code page `index`, clipped to `limit`
fn page_bounds(index: u64, page: u64, limit: u64) -> Option<(usize, usize)> {
    let start = index.checked_mul(page)?;
    let end = start.checked_add(page)?.min(limit);
    Some((usize::try_from(start).ok()?, usize::try_from(end).ok()?))
}
