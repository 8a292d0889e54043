//! Diagnostics collected while analyzing one slice.

use serde::Serialize;
use std::fmt;

use crate::formats::macho::{Inconsistency, MachError};

/// Report component a diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Container,
    Header,
    LoadCommands,
    CodeSignature,
    Entitlements,
    #[serde(rename = "objc")]
    ObjC,
    Symbols,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Container => "container",
            Component::Header => "header",
            Component::LoadCommands => "load_commands",
            Component::CodeSignature => "code_signature",
            Component::Entitlements => "entitlements",
            Component::ObjC => "objc",
            Component::Symbols => "symbols",
        };
        f.write_str(s)
    }
}

/// Standardized diagnostic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    BadMagic,
    MalformedContainer,
    Truncated,
    MalformedLoadCommand,
    ArchitectureOutOfRange,
    CorruptSuperBlob,
    CorruptRequirement,
    InvalidCodeDirectory,
    Cms,
    /// Decoded, but a field disagrees with the rest of the structure
    Inconsistency,
    /// Pointer or index that does not land in the image
    Unresolved,
}

impl From<&MachError> for DiagnosticKind {
    fn from(err: &MachError) -> Self {
        match err {
            MachError::InvalidMagic(_) => DiagnosticKind::BadMagic,
            MachError::MalformedContainer(_) => DiagnosticKind::MalformedContainer,
            MachError::TruncatedFile { .. } => DiagnosticKind::Truncated,
            MachError::MalformedLoadCommand { .. } => DiagnosticKind::MalformedLoadCommand,
            MachError::ArchitectureOutOfRange { .. } => DiagnosticKind::ArchitectureOutOfRange,
            MachError::CorruptSuperBlob(_) => DiagnosticKind::CorruptSuperBlob,
            MachError::CorruptRequirement { .. } => DiagnosticKind::CorruptRequirement,
            MachError::InvalidCodeDirectory(_) => DiagnosticKind::InvalidCodeDirectory,
            MachError::Cms(_) => DiagnosticKind::Cms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub component: Component,
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl Diagnostic {
    pub fn new(component: Component, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            component,
            kind,
            message: message.into(),
            offset: None,
        }
    }

    pub fn from_error(component: Component, err: &MachError) -> Self {
        let offset = match err {
            MachError::TruncatedFile { offset, .. } => Some(*offset as u64),
            _ => None,
        };
        Self {
            component,
            kind: DiagnosticKind::from(err),
            message: err.to_string(),
            offset,
        }
    }

    pub fn from_inconsistency(component: Component, inc: &Inconsistency) -> Self {
        Self {
            component,
            kind: DiagnosticKind::Inconsistency,
            message: inc.message.clone(),
            offset: inc.offset,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.component, self.kind, self.message)?;
        if let Some(off) = self.offset {
            write!(f, " (at {:#x})", off)?;
        }
        Ok(())
    }
}
