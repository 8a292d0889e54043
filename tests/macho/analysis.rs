use crate::common::*;
use machscope::analysis::{
    analyze_all_architectures, analyze_bytes, analyze_path, to_json, ComponentResult,
    DiagnosticKind,
};
use machscope::config::{AnalysisConfig, ComponentSelection};
use machscope::formats::macho::CpuType;
use machscope::io::error::IoError;
use machscope::{IOLimits, MachError, MachScopeError};

fn two_arch_fat() -> Vec<u8> {
    let x86 = ImageBuilder::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)
        .segment("__TEXT", 0x1_0000_0000)
        .section("__text", 0x1_0000_0400, vec![0x90; 16])
        .symbol("_start", N_SECT | N_EXT, 1, 0x1_0000_0400)
        .build();
    let arm = image_with_symbols(&[
        ("_main", N_SECT | N_EXT, 1, 0x1_0000_0400),
        ("_helper", N_SECT, 1, 0x1_0000_0410),
    ]);
    fat_binary(&[
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, &x86),
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, &arm),
    ])
}

#[test]
fn default_config_reports_load_commands_only() {
    let image = image_with_symbols(&[("_main", N_SECT | N_EXT, 1, 0x1_0000_0400)]);
    let slice = analyze_bytes(&image, 0, &AnalysisConfig::default()).unwrap();

    assert_eq!(slice.arch_index, 0);
    assert!(!slice.fat);
    assert!(slice.load_commands.as_ref().is_some_and(ComponentResult::is_present));
    assert!(slice.header.is_none());
    assert!(slice.code_signature.is_none());
    assert!(slice.entitlements.is_none());
    assert!(slice.objc.is_none());
    assert!(slice.symbols.is_none());
    assert!(slice.diagnostics.is_empty());

    let commands = slice.load_commands.as_ref().and_then(ComponentResult::present).unwrap();
    assert_eq!(commands.commands.len(), 2);
    assert_eq!(commands.segments.len(), 1);
}

#[test]
fn all_architectures_keep_file_order() {
    let fat = two_arch_fat();
    let config = AnalysisConfig::all_components();
    let slices = analyze_all_architectures(&fat, &config).unwrap();

    assert_eq!(slices.len(), 2);
    assert!(slices.iter().all(|s| s.fat));
    assert_eq!(slices[0].arch_index, 0);
    assert_eq!(slices[1].arch_index, 1);
    assert_eq!(slices[0].architecture.as_ref().unwrap().cpu, CpuType::X86_64);
    assert_eq!(slices[1].architecture.as_ref().unwrap().cpu, CpuType::Arm64);

    let symbol_counts: Vec<usize> = slices
        .iter()
        .map(|s| s.symbols.as_ref().and_then(ComponentResult::present).unwrap().len())
        .collect();
    assert_eq!(symbol_counts, [1, 2]);
    assert!(slices.iter().all(|s| s.objc == Some(ComponentResult::Absent)));
}

#[test]
fn single_slice_of_fat_matches_parallel_result() {
    let fat = two_arch_fat();
    let config = AnalysisConfig::all_components();
    let all = analyze_all_architectures(&fat, &config).unwrap();
    let second = analyze_bytes(&fat, 1, &config).unwrap();
    assert_eq!(second, all[1]);
}

#[test]
fn arch_index_out_of_range_is_an_error() {
    let fat = two_arch_fat();
    let err = analyze_bytes(&fat, 2, &AnalysisConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        MachScopeError::Mach(MachError::ArchitectureOutOfRange { index: 2, count: 2 })
    ));
}

#[test]
fn undecodable_slice_fails_selected_components_only() {
    let mut image = image_with_symbols(&[("_main", N_SECT | N_EXT, 1, 0x1_0000_0400)]);
    // sizeofcmds far past the end of the file
    image[20..24].copy_from_slice(&0x00ff_ffffu32.to_le_bytes());

    let config = AnalysisConfig {
        components: ComponentSelection {
            header: true,
            load_commands: true,
            symbols: true,
            ..ComponentSelection::none()
        },
        ..AnalysisConfig::default()
    };
    let slice = analyze_bytes(&image, 0, &config).unwrap();

    assert!(slice.header.as_ref().is_some_and(ComponentResult::is_present));
    assert!(slice.load_commands.as_ref().is_some_and(ComponentResult::is_failed));
    assert!(slice.symbols.as_ref().is_some_and(ComponentResult::is_failed));
    assert!(slice.code_signature.is_none());
    assert!(slice.has_failures());
    assert!(slice
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::Truncated));
}

#[test]
fn path_analysis_goes_through_the_mapped_file() {
    let image = image_with_symbols(&[("_main", N_SECT | N_EXT, 1, 0x1_0000_0400)]);
    let file = create_temp_file(&image);
    let config = AnalysisConfig {
        components: ComponentSelection {
            symbols: true,
            ..ComponentSelection::none()
        },
        ..AnalysisConfig::default()
    };

    let from_path = analyze_path(file.path(), 0, &config, &IOLimits::default()).unwrap();
    let from_bytes = analyze_bytes(&image, 0, &config).unwrap();
    assert_eq!(from_path, from_bytes);
}

#[test]
fn file_over_the_size_limit_is_refused() {
    let image = image_with_symbols(&[]);
    let file = create_temp_file(&image);
    let limits = IOLimits { max_file_size: 64 };

    let err = analyze_path(file.path(), 0, &AnalysisConfig::default(), &limits).unwrap_err();
    assert!(matches!(
        err,
        MachScopeError::Io(IoError::FileTooLarge { limit: 64, .. })
    ));
}

#[test]
fn json_report_tags_component_status() {
    let image = image_with_symbols(&[("_main", N_SECT | N_EXT, 1, 0x1_0000_0400)]);
    let slice = analyze_bytes(&image, 0, &AnalysisConfig::all_components()).unwrap();
    let json = to_json(&slice).unwrap();

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["code_signature"]["status"], "absent");
    assert_eq!(value["objc"]["status"], "absent");
    assert_eq!(value["symbols"]["status"], "present");
    assert_eq!(value["header"]["status"], "present");

    let all = analyze_all_architectures(&image, &AnalysisConfig::default()).unwrap();
    let list: serde_json::Value = serde_json::from_str(&to_json(&all[..]).unwrap()).unwrap();
    assert_eq!(list.as_array().map(Vec::len), Some(1));
    assert!(list[0].get("symbols").is_none());
}
