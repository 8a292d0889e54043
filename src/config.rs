//! Configuration for Mach-O analysis.
//!
//! A single [`AnalysisConfig`] is passed explicitly into every component;
//! nothing reads ambient or global state.

use serde::{Deserialize, Serialize};

use crate::error::{MachScopeError, Result};

/// Master configuration for an analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Include per-slot hash listings in code directory reports.
    pub verbose: bool,
    /// Recompute code page and special slot digests.
    pub verify_slots: bool,
    /// Decode the certificate chain from the CMS blob.
    pub resolve_cms: bool,
    /// Objective-C extraction limits.
    pub objc: ObjCConfig,
    /// Maximum number of symbol table entries reported (default: 1_000_000).
    pub max_symbols: usize,
    /// Components to run.
    pub components: ComponentSelection,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            verify_slots: false,
            resolve_cms: true,
            objc: ObjCConfig::default(),
            max_symbols: 1_000_000,
            components: ComponentSelection::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MachScopeError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MachScopeError::Serialization(e.to_string()))
    }

    /// Configuration with every component enabled
    pub fn all_components() -> Self {
        Self {
            components: ComponentSelection::all(),
            ..Self::default()
        }
    }
}

/// Objective-C metadata extraction limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjCConfig {
    /// Maximum superclass chain length followed (default: 64).
    pub max_superclass_depth: usize,
    /// Maximum entries read from any single list (default: 65536).
    pub max_list_entries: usize,
    /// Maximum length of a name or type string (default: 4096).
    pub max_string_len: usize,
}

impl Default for ObjCConfig {
    fn default() -> Self {
        Self {
            max_superclass_depth: 64,
            max_list_entries: 65536,
            max_string_len: 4096,
        }
    }
}

/// Which report sections to produce.
///
/// The default selects only load commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentSelection {
    pub header: bool,
    pub load_commands: bool,
    pub code_signature: bool,
    pub entitlements: bool,
    pub objc: bool,
    pub symbols: bool,
}

impl Default for ComponentSelection {
    fn default() -> Self {
        Self {
            header: false,
            load_commands: true,
            code_signature: false,
            entitlements: false,
            objc: false,
            symbols: false,
        }
    }
}

impl ComponentSelection {
    pub fn all() -> Self {
        Self {
            header: true,
            load_commands: true,
            code_signature: true,
            entitlements: true,
            objc: true,
            symbols: true,
        }
    }

    pub fn none() -> Self {
        Self {
            header: false,
            load_commands: false,
            code_signature: false,
            entitlements: false,
            objc: false,
            symbols: false,
        }
    }

    /// The signature blob is needed for either signature or entitlements
    pub fn needs_signature(&self) -> bool {
        self.code_signature || self.entitlements
    }
}
