//! Embedded code signature analysis
//!
//! The SuperBlob named by `LC_CODE_SIGNATURE` is split into its sub-blobs;
//! each one is decoded independently so that a corrupt blob only costs its
//! own part of the report.

pub mod cms;
pub mod code_directory;
pub mod requirements;
pub mod superblob;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::formats::macho::types::{Inconsistency, MachError, Result};
use crate::formats::macho::MachOFile;
use cms::{parse_certificates, Certificate};
use code_directory::{flag_names, CdHash, CodeDirectory, ExecSegment, HashSlot, HashType};
use requirements::RequirementSet;
use superblob::{BlobIndex, SuperBlob};

pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

pub const CSSLOT_CODEDIRECTORY: u32 = 0;
pub const CSSLOT_INFOSLOT: u32 = 1;
pub const CSSLOT_REQUIREMENTS: u32 = 2;
pub const CSSLOT_RESOURCEDIR: u32 = 3;
pub const CSSLOT_APPLICATION: u32 = 4;
pub const CSSLOT_ENTITLEMENTS: u32 = 5;
pub const CSSLOT_REP_SPECIFIC: u32 = 6;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 7;
pub const CSSLOT_LAUNCH_CONSTRAINT_SELF: u32 = 8;
pub const CSSLOT_LAUNCH_CONSTRAINT_PARENT: u32 = 9;
pub const CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE: u32 = 10;
pub const CSSLOT_LIBRARY_CONSTRAINT: u32 = 11;
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_MAX: u32 = 5;
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;
pub const CSSLOT_TICKETSLOT: u32 = 0x10001;

/// Name of a SuperBlob index slot type
pub fn slot_type_name(slot_type: u32) -> &'static str {
    match slot_type {
        CSSLOT_CODEDIRECTORY => "CodeDirectory",
        CSSLOT_INFOSLOT => "Info.plist",
        CSSLOT_REQUIREMENTS => "Requirements",
        CSSLOT_RESOURCEDIR => "Resources",
        CSSLOT_APPLICATION => "Application",
        CSSLOT_ENTITLEMENTS => "Entitlements",
        CSSLOT_REP_SPECIFIC => "RepSpecific",
        CSSLOT_DER_ENTITLEMENTS => "DER Entitlements",
        CSSLOT_LAUNCH_CONSTRAINT_SELF => "Launch Constraint (self)",
        CSSLOT_LAUNCH_CONSTRAINT_PARENT => "Launch Constraint (parent)",
        CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE => "Launch Constraint (responsible)",
        CSSLOT_LIBRARY_CONSTRAINT => "Library Constraint",
        s if is_code_directory_slot(s) => "Alternate CodeDirectory",
        CSSLOT_SIGNATURESLOT => "CMS Signature",
        CSSLOT_TICKETSLOT => "Ticket",
        _ => "Unknown",
    }
}

/// Name of special slot `-n`
pub fn special_slot_name(n: u32) -> Option<&'static str> {
    match n {
        1..=11 => Some(slot_type_name(n)),
        _ => None,
    }
}

pub fn is_code_directory_slot(slot_type: u32) -> bool {
    slot_type == CSSLOT_CODEDIRECTORY
        || (CSSLOT_ALTERNATE_CODEDIRECTORIES
            ..CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX)
            .contains(&slot_type)
}

/// Owned summary of one Code Directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeDirectoryReport {
    pub slot_type: u32,
    pub version: u32,
    pub size: usize,
    pub flags: u32,
    pub flag_names: Vec<&'static str>,
    pub identifier: String,
    pub team_id: Option<String>,
    pub hash_type: HashType,
    pub hash_size: u8,
    pub platform: u8,
    pub page_size: u64,
    pub code_limit: u64,
    pub n_code_slots: u32,
    pub n_special_slots: u32,
    pub expected_code_slots: u64,
    pub slot_count_consistent: bool,
    pub exec_segment: Option<ExecSegment>,
    pub runtime: Option<u32>,
    pub cdhash: Option<CdHash>,
    /// Populated when verbose or verifying
    pub special_slots: Vec<HashSlot>,
    pub code_slots: Vec<HashSlot>,
    pub inconsistencies: Vec<Inconsistency>,
}

impl CodeDirectoryReport {
    fn new(
        cd: &CodeDirectory<'_>,
        slice: &[u8],
        superblob: &SuperBlob<'_>,
        config: &AnalysisConfig,
    ) -> Self {
        let (special_slots, code_slots) = if config.verify_slots {
            (cd.verify_special_slots(superblob), cd.verify_code_slots(slice))
        } else if config.verbose {
            (cd.special_slots(), cd.code_slots())
        } else {
            (Vec::new(), Vec::new())
        };
        Self {
            slot_type: cd.slot_type,
            version: cd.version,
            size: cd.bytes().len(),
            flags: cd.flags,
            flag_names: flag_names(cd.flags()),
            identifier: cd.identifier.clone(),
            team_id: cd.team_id.clone(),
            hash_type: cd.hash_type,
            hash_size: cd.hash_size,
            platform: cd.platform,
            page_size: cd.page_size(),
            code_limit: cd.effective_code_limit(),
            n_code_slots: cd.n_code_slots,
            n_special_slots: cd.n_special_slots,
            expected_code_slots: cd.expected_code_slots(),
            slot_count_consistent: cd.slot_count_consistent(),
            exec_segment: cd.exec_segment,
            runtime: cd.runtime,
            cdhash: cd.cdhash(),
            special_slots,
            code_slots,
            inconsistencies: cd.inconsistencies.clone(),
        }
    }
}

/// Everything recovered from an embedded signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeSignatureReport {
    pub offset: u32,
    pub size: u32,
    /// SuperBlob `length` field
    pub length: u32,
    pub index: Vec<BlobIndex>,
    pub code_directories: Vec<CodeDirectoryReport>,
    pub requirements: Option<RequirementSet>,
    /// XML entitlements, verbatim
    pub entitlements: Option<String>,
    /// DER entitlements, raw
    pub der_entitlements: Option<Vec<u8>>,
    /// Size of the CMS payload; zero for ad-hoc signatures
    pub cms_size: Option<usize>,
    pub certificates: Vec<Certificate>,
    pub inconsistencies: Vec<Inconsistency>,
    /// Sub-blob failures; the rest of the report is still valid
    #[serde(skip)]
    pub errors: Vec<MachError>,
}

impl CodeSignatureReport {
    /// The primary Code Directory (slot 0, else the first alternate)
    pub fn primary_code_directory(&self) -> Option<&CodeDirectoryReport> {
        self.code_directories
            .iter()
            .find(|cd| cd.slot_type == CSSLOT_CODEDIRECTORY)
            .or_else(|| self.code_directories.first())
    }

    pub fn is_adhoc(&self) -> bool {
        self.cms_size.unwrap_or(0) == 0
    }
}

/// Analyze the code signature of `file`.
///
/// Returns `Ok(None)` when the image carries no `LC_CODE_SIGNATURE`.
/// Errors are limited to a signature region that cannot be read or a
/// SuperBlob whose header is unusable; sub-blob failures are collected in
/// [`CodeSignatureReport::errors`].
pub fn analyze(file: &MachOFile<'_>, config: &AnalysisConfig) -> Result<Option<CodeSignatureReport>> {
    let location = match file.code_signature_location() {
        Some(l) => *l,
        None => return Ok(None),
    };
    let region = match file.code_signature_bytes() {
        Some(r) => r?,
        None => return Ok(None),
    };
    let superblob = SuperBlob::parse(region)?;

    let mut report = CodeSignatureReport {
        offset: location.dataoff,
        size: location.datasize,
        length: superblob.length,
        index: superblob.index.clone(),
        code_directories: Vec::new(),
        requirements: None,
        entitlements: None,
        der_entitlements: None,
        cms_size: None,
        certificates: Vec::new(),
        inconsistencies: superblob.check_length().into_iter().collect(),
        errors: Vec::new(),
    };

    for entry in &superblob.index {
        let blob = match superblob.blob(entry) {
            Ok(b) => b,
            Err(e) => {
                warn!(slot = entry.slot_name(), error = %e, "unreadable signature blob");
                report.errors.push(e);
                continue;
            }
        };
        match entry.slot_type {
            s if is_code_directory_slot(s) => match CodeDirectory::from_blob(&blob) {
                Ok(cd) => report.code_directories.push(CodeDirectoryReport::new(
                    &cd,
                    file.data(),
                    &superblob,
                    config,
                )),
                Err(e) => report.errors.push(e),
            },
            CSSLOT_REQUIREMENTS => match RequirementSet::from_blob(&blob) {
                Ok(mut set) => {
                    report.errors.append(&mut set.errors);
                    report.requirements = Some(set);
                }
                Err(e) => report.errors.push(e),
            },
            CSSLOT_ENTITLEMENTS if blob.magic == CSMAGIC_EMBEDDED_ENTITLEMENTS => {
                report.entitlements = Some(String::from_utf8_lossy(blob.payload()).into_owned());
            }
            CSSLOT_DER_ENTITLEMENTS if blob.magic == CSMAGIC_EMBEDDED_DER_ENTITLEMENTS => {
                report.der_entitlements = Some(blob.payload().to_vec());
            }
            CSSLOT_SIGNATURESLOT if blob.magic == CSMAGIC_BLOBWRAPPER => {
                let payload = blob.payload();
                report.cms_size = Some(payload.len());
                if config.resolve_cms && !payload.is_empty() {
                    match parse_certificates(payload) {
                        Ok(certs) => report.certificates = certs,
                        Err(e) => report.errors.push(e),
                    }
                }
            }
            CSSLOT_ENTITLEMENTS | CSSLOT_DER_ENTITLEMENTS | CSSLOT_SIGNATURESLOT => {
                report.errors.push(MachError::CorruptSuperBlob(format!(
                    "{} blob has unexpected magic {:#010x}",
                    entry.slot_name(),
                    blob.magic
                )));
            }
            other => debug!(slot = other, name = slot_type_name(other), "skipping blob"),
        }
    }

    Ok(Some(report))
}
