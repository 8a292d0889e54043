//! Owned report types produced by the analysis layer.
//!
//! Nothing here borrows the input buffer, so a report can outlive the mapped
//! file it was built from.

use serde::Serialize;

use crate::analysis::diagnostics::Diagnostic;
use crate::formats::macho::codesign::CodeSignatureReport;
use crate::formats::macho::load_commands::{format_uuid, DylibCommand};
use crate::formats::macho::objc::ObjCReport;
use crate::formats::macho::symbols::SymbolTable;
use crate::formats::macho::{
    cpu_subtype_name, Architecture, Endian, MachHeader, MachOFile, Segment,
};

/// Outcome of one report component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ComponentResult<T> {
    Present(T),
    /// The slice has nothing for this component (no signature, no ObjC, ...)
    Absent,
    /// Decoding failed; see the slice diagnostics for details
    Failed(Diagnostic),
}

impl<T> ComponentResult<T> {
    pub fn present(&self) -> Option<&T> {
        match self {
            ComponentResult::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ComponentResult::Present(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ComponentResult::Absent)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ComponentResult::Failed(_))
    }

    pub fn failure(&self) -> Option<&Diagnostic> {
        match self {
            ComponentResult::Failed(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderReport {
    pub bits: u8,
    pub endian: Endian,
    pub cpu: String,
    pub cpu_subtype: String,
    pub file_type: String,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub flag_names: Vec<&'static str>,
    pub is_pie: bool,
}

impl From<&MachHeader> for HeaderReport {
    fn from(h: &MachHeader) -> Self {
        Self {
            bits: h.class.bits(),
            endian: h.endian,
            cpu: h.cpu().to_string(),
            cpu_subtype: cpu_subtype_name(h.cpu(), h.cpusubtype),
            file_type: format!("{:?}", h.file_type()),
            ncmds: h.ncmds,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
            flag_names: h.flag_names(),
            is_pie: h.is_pie(),
        }
    }
}

/// One load command, rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCommandSummary {
    pub index: u32,
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
    pub name: &'static str,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCommandsReport {
    pub commands: Vec<LoadCommandSummary>,
    pub segments: Vec<Segment>,
    pub uuid: Option<String>,
    pub dylib_id: Option<DylibCommand>,
    pub linked_dylibs: Vec<DylibCommand>,
    pub source_version: Option<String>,
}

impl LoadCommandsReport {
    pub fn from_file(file: &MachOFile<'_>) -> Self {
        Self {
            commands: file
                .load_commands()
                .iter()
                .map(|e| LoadCommandSummary {
                    index: e.index,
                    offset: e.offset,
                    cmd: e.cmd,
                    cmdsize: e.cmdsize,
                    name: e.name(),
                    description: e.to_string(),
                })
                .collect(),
            segments: file.segments().to_vec(),
            uuid: file.uuid().as_ref().map(format_uuid),
            dylib_id: file.dylib_id().cloned(),
            linked_dylibs: file.linked_dylibs().into_iter().cloned().collect(),
            source_version: file.source_version().map(|v| v.to_string()),
        }
    }
}

/// Entitlements embedded in the code signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementsReport {
    /// XML property list, verbatim
    pub xml: Option<String>,
    /// DER-encoded entitlements, raw
    pub der: Option<Vec<u8>>,
}

/// Everything reported for one architecture slice.
///
/// A component is `None` when it was not selected in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceReport {
    pub arch_index: usize,
    pub architecture: Option<Architecture>,
    pub fat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<ComponentResult<HeaderReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_commands: Option<ComponentResult<LoadCommandsReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_signature: Option<ComponentResult<CodeSignatureReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<ComponentResult<EntitlementsReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objc: Option<ComponentResult<ObjCReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<ComponentResult<SymbolTable>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl SliceReport {
    pub(crate) fn empty(arch_index: usize, architecture: Option<Architecture>, fat: bool) -> Self {
        Self {
            arch_index,
            architecture,
            fat,
            header: None,
            load_commands: None,
            code_signature: None,
            entitlements: None,
            objc: None,
            symbols: None,
            diagnostics: Vec::new(),
        }
    }

    /// True when some selected component failed
    pub fn has_failures(&self) -> bool {
        fn failed<T>(c: &Option<ComponentResult<T>>) -> bool {
            c.as_ref().is_some_and(ComponentResult::is_failed)
        }
        failed(&self.header)
            || failed(&self.load_commands)
            || failed(&self.code_signature)
            || failed(&self.entitlements)
            || failed(&self.objc)
            || failed(&self.symbols)
    }
}
