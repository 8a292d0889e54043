//! Per-slice analysis orchestration.
//!
//! Each selected component runs in isolation over the decoded slice: a
//! failure in one (a corrupt signature, say) becomes a
//! [`ComponentResult::Failed`] plus a diagnostic, and the remaining
//! components still report. Only failures that leave no slice to look at
//! (bad magic, malformed fat header, architecture index out of range) are
//! returned as errors.

pub mod diagnostics;
pub mod report;

use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info_span, warn};

use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::formats::macho::codesign::{self, CodeSignatureReport};
use crate::formats::macho::header::parse_header;
use crate::formats::macho::objc;
use crate::formats::macho::symbols::{SectionRef, SymbolTable};
use crate::formats::macho::{Architecture, MachContainer, MachError, MachOFile};
use crate::io::{IOLimits, SafeReader};
pub use diagnostics::{Component, Diagnostic, DiagnosticKind};
pub use report::{
    ComponentResult, EntitlementsReport, HeaderReport, LoadCommandSummary, LoadCommandsReport,
    SliceReport,
};

/// Analyze the architecture at `arch_index` (0 for thin files).
pub fn analyze_bytes(data: &[u8], arch_index: usize, config: &AnalysisConfig) -> Result<SliceReport> {
    let container = MachContainer::parse(data)?;
    let slice = container.slice_for(arch_index)?;
    let architecture = container
        .list_architectures()
        .ok()
        .and_then(|archs| archs.into_iter().nth(arch_index));
    Ok(analyze_slice(
        slice,
        arch_index,
        architecture,
        container.is_fat(),
        config,
    ))
}

/// Map `path` and analyze one architecture of it.
pub fn analyze_path<P: AsRef<Path>>(
    path: P,
    arch_index: usize,
    config: &AnalysisConfig,
    limits: &IOLimits,
) -> Result<SliceReport> {
    let reader = SafeReader::open(path, limits)?;
    analyze_bytes(reader.bytes(), arch_index, config)
}

/// Analyze every architecture of a fat file (or the single slice of a thin
/// one). Slices are independent and run in parallel; results keep file order.
pub fn analyze_all_architectures(data: &[u8], config: &AnalysisConfig) -> Result<Vec<SliceReport>> {
    let container = MachContainer::parse(data)?;
    let fat = container.is_fat();
    let archs = container.list_architectures().unwrap_or_default();
    let slices = (0..container.arch_count())
        .map(|i| Ok((i, container.slice_for(i)?, archs.get(i).cloned())))
        .collect::<std::result::Result<Vec<_>, MachError>>()?;

    Ok(slices
        .into_par_iter()
        .map(|(index, slice, arch)| analyze_slice(slice, index, arch, fat, config))
        .collect())
}

/// Serialize a report (or a list of them) as pretty JSON.
pub fn to_json<T: serde::Serialize + ?Sized>(report: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Run the selected components over one thin slice.
pub fn analyze_slice(
    slice: &[u8],
    arch_index: usize,
    architecture: Option<Architecture>,
    fat: bool,
    config: &AnalysisConfig,
) -> SliceReport {
    let span = info_span!(
        "slice",
        index = arch_index,
        arch = architecture.as_ref().map(|a| a.name.as_str()).unwrap_or("?")
    );
    let _guard = span.enter();

    let mut report = SliceReport::empty(arch_index, architecture, fat);
    let selection = config.components;

    let file = match MachOFile::parse(slice) {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "slice could not be decoded");
            fail_all(&mut report, slice, config, &e);
            return report;
        }
    };

    report.diagnostics.extend(
        file.inconsistencies()
            .iter()
            .map(|inc| Diagnostic::from_inconsistency(Component::LoadCommands, inc)),
    );

    if selection.header {
        report.header = Some(ComponentResult::Present(HeaderReport::from(file.header())));
    }
    if selection.load_commands {
        report.load_commands = Some(ComponentResult::Present(LoadCommandsReport::from_file(&file)));
    }

    if selection.needs_signature() {
        let signature = run_component(&mut report, Component::CodeSignature, || {
            codesign::analyze(&file, config)
        });
        if let ComponentResult::Present(sig) = &signature {
            collect_signature_diagnostics(&mut report, sig);
        }
        if selection.entitlements {
            report.entitlements = Some(match &signature {
                ComponentResult::Present(sig) => entitlements_of(sig),
                ComponentResult::Absent => ComponentResult::Absent,
                ComponentResult::Failed(d) => ComponentResult::Failed(Diagnostic {
                    component: Component::Entitlements,
                    ..d.clone()
                }),
            });
        }
        if selection.code_signature {
            report.code_signature = Some(signature);
        }
    }

    if selection.objc {
        let objc = run_component(&mut report, Component::ObjC, || {
            objc::extract(&file, &config.objc)
        });
        if let ComponentResult::Present(r) = &objc {
            if !r.unresolved.is_empty() {
                report.diagnostics.push(Diagnostic::new(
                    Component::ObjC,
                    DiagnosticKind::Unresolved,
                    format!("{} pointers did not resolve to a section", r.unresolved.len()),
                ));
            }
        }
        report.objc = Some(objc);
    }

    if selection.symbols {
        let symbols = run_component(&mut report, Component::Symbols, || {
            SymbolTable::from_file(&file, config.max_symbols)
        });
        if let ComponentResult::Present(table) = &symbols {
            let unresolved = table
                .iter()
                .filter(|s| matches!(s.section, SectionRef::Unresolved(_)))
                .count();
            if unresolved > 0 {
                report.diagnostics.push(Diagnostic::new(
                    Component::Symbols,
                    DiagnosticKind::Unresolved,
                    format!("{} symbols reference a section index past the last section", unresolved),
                ));
            }
            if table.is_truncated() {
                report.diagnostics.push(Diagnostic::new(
                    Component::Symbols,
                    DiagnosticKind::Inconsistency,
                    format!(
                        "symbol listing capped at {} of {} entries",
                        table.len(),
                        table.declared_count()
                    ),
                ));
            }
        }
        report.symbols = Some(symbols);
    }

    debug!(
        diagnostics = report.diagnostics.len(),
        failed = report.has_failures(),
        "slice analyzed"
    );
    report
}

/// Run one component, turning an error into a failed result plus diagnostic.
fn run_component<T, F>(report: &mut SliceReport, component: Component, f: F) -> ComponentResult<T>
where
    F: FnOnce() -> std::result::Result<Option<T>, MachError>,
{
    match f() {
        Ok(Some(value)) => ComponentResult::Present(value),
        Ok(None) => ComponentResult::Absent,
        Err(e) => {
            warn!(component = %component, error = %e, "component failed");
            let diagnostic = Diagnostic::from_error(component, &e);
            report.diagnostics.push(diagnostic.clone());
            ComponentResult::Failed(diagnostic)
        }
    }
}

/// The slice itself failed to decode: every selected component fails with
/// the same cause, except the header when it still parses on its own.
fn fail_all(report: &mut SliceReport, slice: &[u8], config: &AnalysisConfig, err: &MachError) {
    let selection = config.components;
    fn failed<T>(component: Component, err: &MachError) -> Option<ComponentResult<T>> {
        Some(ComponentResult::Failed(Diagnostic::from_error(component, err)))
    }

    if selection.header {
        report.header = Some(match parse_header(slice) {
            Ok(h) => ComponentResult::Present(HeaderReport::from(&h)),
            Err(e) => ComponentResult::Failed(Diagnostic::from_error(Component::Header, &e)),
        });
    }
    if selection.load_commands {
        report.load_commands = failed(Component::LoadCommands, err);
    }
    if selection.code_signature {
        report.code_signature = failed(Component::CodeSignature, err);
    }
    if selection.entitlements {
        report.entitlements = failed(Component::Entitlements, err);
    }
    if selection.objc {
        report.objc = failed(Component::ObjC, err);
    }
    if selection.symbols {
        report.symbols = failed(Component::Symbols, err);
    }
    report
        .diagnostics
        .push(Diagnostic::from_error(Component::LoadCommands, err));
}

fn collect_signature_diagnostics(report: &mut SliceReport, sig: &CodeSignatureReport) {
    let inconsistencies = sig
        .inconsistencies
        .iter()
        .chain(sig.code_directories.iter().flat_map(|cd| cd.inconsistencies.iter()));
    for inc in inconsistencies {
        report
            .diagnostics
            .push(Diagnostic::from_inconsistency(Component::CodeSignature, inc));
    }
    for err in &sig.errors {
        report
            .diagnostics
            .push(Diagnostic::from_error(Component::CodeSignature, err));
    }
}

fn entitlements_of(sig: &CodeSignatureReport) -> ComponentResult<EntitlementsReport> {
    if sig.entitlements.is_none() && sig.der_entitlements.is_none() {
        return ComponentResult::Absent;
    }
    ComponentResult::Present(EntitlementsReport {
        xml: sig.entitlements.clone(),
        der: sig.der_entitlements.clone(),
    })
}
