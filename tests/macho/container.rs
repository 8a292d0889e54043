use crate::common::*;
use machscope::formats::macho::{CpuType, MachContainer, MachError, MachOFile};

fn thin_image() -> Vec<u8> {
    image_with_symbols(&[("_main", N_SECT | N_EXT, 1, 0x1_0000_0400)])
}

#[test]
fn fat_slice_decodes_like_the_thin_file() {
    let thin = thin_image();
    let other = ImageBuilder::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)
        .segment("__TEXT", 0x1_0000_0000)
        .section("__text", 0x1_0000_0400, vec![0x90; 16])
        .build();
    let fat = fat_binary(&[
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, &other),
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, &thin),
    ]);

    let direct = MachOFile::parse(&thin).unwrap();
    let container = MachContainer::parse(&fat).unwrap();
    assert!(container.is_fat());
    let wrapped = container.file(1).unwrap();

    assert_eq!(wrapped, &direct);
    assert_eq!(wrapped.data(), &thin[..]);
    assert_eq!(container.slice_for(1).unwrap(), &thin[..]);
}

#[test]
fn two_arch_fat_lists_architectures_in_file_order() {
    let a = ImageBuilder::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL).build();
    let b = ImageBuilder::arm64().build();
    let fat = fat_binary(&[
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, &a),
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, &b),
    ]);

    let container = MachContainer::parse(&fat).unwrap();
    let archs = container.list_architectures().unwrap();
    assert_eq!(archs.len(), 2);
    assert_eq!(archs[0].cpu, CpuType::X86_64);
    assert_eq!(archs[1].cpu, CpuType::Arm64);
    assert_eq!(container.arch_count(), 2);
}

#[test]
fn thin_file_has_one_architecture() {
    let thin = thin_image();
    let container = MachContainer::parse(&thin).unwrap();
    assert!(!container.is_fat());
    assert_eq!(container.list_architectures().unwrap().len(), 1);
    assert_eq!(container.slice_for(0).unwrap().len(), thin.len());
    assert!(matches!(
        container.slice_for(1),
        Err(MachError::ArchitectureOutOfRange { index: 1, count: 1 })
    ));
}

#[test]
fn fat_arch_past_end_is_malformed() {
    let thin = thin_image();
    let mut fat = fat_binary(&[(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, &thin)]);
    let len = fat.len();
    fat.truncate(len - 16);
    assert!(matches!(
        MachContainer::parse(&fat),
        Err(MachError::MalformedContainer(_))
    ));
}

#[test]
fn fat_arch_table_past_end_is_malformed() {
    let mut data = 0xcafe_babeu32.to_be_bytes().to_vec();
    data.extend_from_slice(&3u32.to_be_bytes());
    data.extend_from_slice(&[0u8; 20]);
    assert!(matches!(
        MachContainer::parse(&data),
        Err(MachError::MalformedContainer(_))
    ));
}

#[test]
fn unknown_magic_is_rejected() {
    assert!(matches!(
        MachContainer::parse(b"\x7fELF\x02\x01\x01\x00"),
        Err(MachError::InvalidMagic(_))
    ));
}

#[test]
fn load_commands_expose_segments_and_sections() {
    let thin = thin_image();
    let file = MachOFile::parse(&thin).unwrap();
    assert!(file.header().is_pie());
    assert_eq!(file.header().ncmds, 2);
    assert_eq!(file.segments().len(), 1);
    assert_eq!(file.segments()[0].name, "__TEXT");
    let text = file.sections().by_name("__text").unwrap();
    assert_eq!(text.segment_name, "__TEXT");
    assert_eq!(text.addr, 0x1_0000_0400);
    assert!(file.symtab().is_some());
    assert!(file.code_signature_location().is_none());
    assert!(file.inconsistencies().is_empty());
}
