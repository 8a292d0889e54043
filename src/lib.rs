//! Read-only inspection of Mach-O binaries.
//!
//! `machscope` resolves fat and thin containers, decodes load commands,
//! analyzes embedded code signatures (Code Directory hash slots, requirements,
//! entitlements, CMS certificates), reconstructs Objective-C runtime metadata
//! and correlates symbols with their sections.
//!
//! ```no_run
//! use machscope::{analyze_path, AnalysisConfig, IOLimits};
//!
//! let config = AnalysisConfig::all_components();
//! let report = analyze_path("/usr/bin/true", 0, &config, &IOLimits::default())?;
//! println!("{}", machscope::analysis::to_json(&report)?);
//! # Ok::<(), machscope::MachScopeError>(())
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod formats;
pub mod hashing;
pub mod io;
pub mod logging;

pub use analysis::{
    analyze_all_architectures, analyze_bytes, analyze_path, ComponentResult, Diagnostic,
    SliceReport,
};
pub use config::{AnalysisConfig, ComponentSelection, ObjCConfig};
pub use error::{MachScopeError, Result};
pub use formats::macho::{MachContainer, MachError, MachOFile};
pub use io::IOLimits;
