use crate::common::*;
use machscope::config::ObjCConfig;
use machscope::formats::macho::objc::{self, ClassRef};
use machscope::formats::macho::MachOFile;

const TEXT: u64 = 0x1_0000_0000;
const CLASSNAME: u64 = TEXT + 0x1000;
const METHNAME: u64 = TEXT + 0x1100;
const METHTYPE: u64 = TEXT + 0x1200;
const CSTRING: u64 = TEXT + 0x1300;

const DATA: u64 = TEXT + 0x4000;
const CLASSLIST: u64 = DATA;
const SELREFS: u64 = DATA + 0x100;
const IMAGEINFO: u64 = DATA + 0x200;
const CONST: u64 = DATA + 0x300;
const OBJC_DATA: u64 = DATA + 0x800;
const CLASSREFS: u64 = DATA + 0xa00;
const PROTOLIST: u64 = DATA + 0xb00;
const CATLIST: u64 = DATA + 0xb40;

const CPU_SUBTYPE_ARM64E: u32 = 2;

// __objc_classname: "Widget\0Base\0Loop\0Drawable\0Extras\0"
const NAME_WIDGET: u64 = CLASSNAME;
const NAME_BASE: u64 = CLASSNAME + 7;
const NAME_LOOP: u64 = CLASSNAME + 12;
const NAME_DRAWABLE: u64 = CLASSNAME + 17;
const NAME_EXTRAS: u64 = CLASSNAME + 26;

// __cstring: "title\0T@\"NSString\",C\0"
const PROP_TITLE: u64 = CSTRING;
const PROP_TITLE_ATTRS: u64 = CSTRING + 6;

// __objc_methname: "run\0shared\0run\0"
const SEL_RUN: u64 = METHNAME;
const SEL_SHARED: u64 = METHNAME + 4;
const SEL_RUN_AGAIN: u64 = METHNAME + 11;

/// `class_t` with the given isa, superclass and `class_ro_t`
fn class_t(isa: u64, superclass: u64, ro: u64) -> Vec<u8> {
    pointers(&[isa, superclass, 0, 0, ro])
}

/// 64-bit `class_ro_t`
fn class_ro(flags: u32, name: u64, methods: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend(pointers(&[0, name, methods, 0, 0, 0, 0]));
    out
}

/// Absolute method list of `(name, types, imp)`
fn method_list(methods: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut out = 24u32.to_le_bytes().to_vec();
    out.extend_from_slice(&(methods.len() as u32).to_le_bytes());
    for (name, types, imp) in methods {
        out.extend(pointers(&[*name, *types, *imp]));
    }
    out
}

/// Relative method list entry at `entry` whose name goes through `selref`
fn relative_method_list(entry: u64, selref: u64, types: u64) -> Vec<u8> {
    let mut out = (0x8000_0000u32 | 12).to_le_bytes().to_vec();
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&((selref as i64 - entry as i64) as i32).to_le_bytes());
    out.extend_from_slice(&((types as i64 - (entry + 4) as i64) as i32).to_le_bytes());
    out.extend_from_slice(&0x40i32.to_le_bytes());
    out
}

/// Property list of `(name, attributes)`
fn property_list(props: &[(u64, u64)]) -> Vec<u8> {
    let mut out = 16u32.to_le_bytes().to_vec();
    out.extend_from_slice(&(props.len() as u32).to_le_bytes());
    for (name, attrs) in props {
        out.extend(pointers(&[*name, *attrs]));
    }
    out
}

/// Layout of `__objc_data`
struct Layout {
    widget: u64,
    widget_meta: u64,
    base: u64,
    looped: u64,
    drawable: u64,
    extras: u64,
}

const LAYOUT: Layout = Layout {
    widget: OBJC_DATA,
    widget_meta: OBJC_DATA + 0x28,
    base: OBJC_DATA + 0x50,
    looped: OBJC_DATA + 0x78,
    drawable: OBJC_DATA + 0xa0,
    extras: OBJC_DATA + 0xf0,
};

// __objc_const offsets
const RO_WIDGET: u64 = CONST;
const RO_WIDGET_META: u64 = CONST + 0x48;
const RO_BASE: u64 = CONST + 0x90;
const RO_LOOP: u64 = CONST + 0xd8;
const ML_WIDGET: u64 = CONST + 0x120;
const ML_WIDGET_META: u64 = CONST + 0x140;
const ML_BASE: u64 = CONST + 0x160;
const ML_DRAWABLE: u64 = CONST + 0x180;
const ML_EXTRAS: u64 = CONST + 0x1a0;
const PL_EXTRAS: u64 = CONST + 0x1c0;
const PROTOCOLS_EXTRAS: u64 = CONST + 0x1e0;

fn objc_image(classlist: &[u64]) -> Vec<u8> {
    objc_image_for(ImageBuilder::arm64(), classlist)
}

fn objc_image_for(builder: ImageBuilder, classlist: &[u64]) -> Vec<u8> {
    let mut consts = Vec::new();
    consts.extend(class_ro(0, NAME_WIDGET, ML_WIDGET));
    consts.extend(class_ro(1, NAME_WIDGET, ML_WIDGET_META));
    consts.extend(class_ro(0, NAME_BASE, ML_BASE));
    consts.extend(class_ro(0, NAME_LOOP, 0));
    assert_eq!(consts.len() as u64, ML_WIDGET - CONST);
    consts.extend(method_list(&[(SEL_RUN, METHTYPE, TEXT + 0x500)]));
    consts.resize((ML_WIDGET_META - CONST) as usize, 0);
    consts.extend(method_list(&[(SEL_SHARED, METHTYPE, TEXT + 0x540)]));
    consts.resize((ML_BASE - CONST) as usize, 0);
    consts.extend(relative_method_list(ML_BASE + 8, SELREFS, METHTYPE));
    consts.resize((ML_DRAWABLE - CONST) as usize, 0);
    consts.extend(method_list(&[(SEL_RUN, METHTYPE, 0)]));
    consts.resize((ML_EXTRAS - CONST) as usize, 0);
    consts.extend(method_list(&[(SEL_SHARED, METHTYPE, TEXT + 0x560)]));
    consts.resize((PL_EXTRAS - CONST) as usize, 0);
    consts.extend(property_list(&[(PROP_TITLE, PROP_TITLE_ATTRS)]));
    consts.resize((PROTOCOLS_EXTRAS - CONST) as usize, 0);
    consts.extend(pointers(&[1, LAYOUT.drawable]));

    let mut data = Vec::new();
    data.extend(class_t(LAYOUT.widget_meta, LAYOUT.base, RO_WIDGET));
    data.extend(class_t(0, 0, RO_WIDGET_META));
    data.extend(class_t(0, 0, RO_BASE));
    // superclass points at itself
    data.extend(class_t(0, LAYOUT.looped, RO_LOOP));
    // protocol_t: isa, name, protocols, four method lists, properties, size, flags
    data.extend(pointers(&[0, NAME_DRAWABLE, 0, ML_DRAWABLE, 0, 0, 0, 0]));
    data.extend_from_slice(&72u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.resize((LAYOUT.extras - OBJC_DATA) as usize, 0);
    // category_t: name, cls, instance/class methods, protocols, properties
    data.extend(pointers(&[
        NAME_EXTRAS,
        LAYOUT.widget,
        ML_EXTRAS,
        0,
        PROTOCOLS_EXTRAS,
        PL_EXTRAS,
    ]));

    builder
        .segment("__TEXT", TEXT)
        .section("__text", TEXT + 0x500, vec![0; 0x80])
        .section(
            "__objc_classname",
            CLASSNAME,
            b"Widget\0Base\0Loop\0Drawable\0Extras\0".to_vec(),
        )
        .section("__objc_methname", METHNAME, b"run\0shared\0run\0".to_vec())
        .section("__objc_methtype", METHTYPE, b"v16@0:8\0".to_vec())
        .section("__cstring", CSTRING, b"title\0T@\"NSString\",C\0".to_vec())
        .segment("__DATA", DATA)
        .section("__objc_classlist", CLASSLIST, pointers(classlist))
        .section("__objc_selrefs", SELREFS, pointers(&[SEL_RUN, SEL_SHARED, SEL_RUN_AGAIN]))
        .section("__objc_imageinfo", IMAGEINFO, {
            let mut info = 0u32.to_le_bytes().to_vec();
            info.extend_from_slice(&0x0000_0540u32.to_le_bytes());
            info
        })
        .section("__objc_const", CONST, consts)
        .section("__objc_data", OBJC_DATA, data)
        .section("__objc_classrefs", CLASSREFS, pointers(&[LAYOUT.base, 1 << 63]))
        .section("__objc_protolist", PROTOLIST, pointers(&[LAYOUT.drawable]))
        .section("__objc_catlist", CATLIST, pointers(&[LAYOUT.extras]))
        .build()
}

#[test]
fn classes_methods_and_hierarchy() {
    let image = objc_image(&[LAYOUT.widget, LAYOUT.base]);
    let file = MachOFile::parse(&image).unwrap();
    assert!(objc::has_objc(&file));
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    assert_eq!(report.classes.len(), 2);
    let widget = report.class_by_name("Widget").unwrap();
    assert_eq!(widget.addr, LAYOUT.widget);
    assert_eq!(widget.instance_size, 16);
    assert!(!widget.is_swift);
    assert_eq!(widget.superclass_chain, ["Base"]);
    assert!(!widget.chain_truncated);
    assert_eq!(
        widget.superclass,
        Some(ClassRef::Local {
            addr: LAYOUT.base,
            name: Some("Base".to_string()),
        })
    );

    assert_eq!(widget.instance_methods.len(), 1);
    assert_eq!(widget.instance_methods[0].name, "run");
    assert_eq!(widget.instance_methods[0].types, "v16@0:8");
    assert_eq!(widget.instance_methods[0].imp, TEXT + 0x500);
    assert_eq!(widget.class_methods.len(), 1);
    assert_eq!(widget.class_methods[0].name, "shared");

    let base = report.class_by_name("Base").unwrap();
    assert!(base.superclass.is_none());
    assert!(base.superclass_chain.is_empty());
    // relative list: name resolved through __objc_selrefs
    assert_eq!(base.instance_methods.len(), 1);
    assert_eq!(base.instance_methods[0].name, "run");
    assert_eq!(base.instance_methods[0].types, "v16@0:8");
}

#[test]
fn self_referential_superclass_terminates() {
    let image = objc_image(&[LAYOUT.looped]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    let looped = &report.classes[0];
    assert_eq!(looped.name, "Loop");
    assert!(looped.chain_truncated);
    assert!(looped.superclass_chain.is_empty());
    assert_eq!(
        looped.superclass,
        Some(ClassRef::Local {
            addr: LAYOUT.looped,
            name: Some("Loop".to_string()),
        })
    );
}

#[test]
fn depth_cap_bounds_the_chain() {
    let image = objc_image(&[LAYOUT.widget]);
    let file = MachOFile::parse(&image).unwrap();
    let config = ObjCConfig {
        max_superclass_depth: 0,
        ..ObjCConfig::default()
    };
    let report = objc::extract(&file, &config).unwrap().unwrap();
    assert!(report.classes[0].chain_truncated);
    assert!(report.classes[0].superclass_chain.is_empty());
}

#[test]
fn selector_refs_keep_file_order_and_method_names_first_wins() {
    let image = objc_image(&[LAYOUT.widget]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    let refs: Vec<(u64, Option<&str>)> = report
        .selector_refs
        .iter()
        .map(|s| (s.ref_addr, s.name.as_deref()))
        .collect();
    assert_eq!(
        refs,
        [
            (SELREFS, Some("run")),
            (SELREFS + 8, Some("shared")),
            (SELREFS + 16, Some("run")),
        ]
    );
    assert_eq!(report.selector(SELREFS + 8), Some("shared"));

    assert_eq!(report.method_names.len(), 2);
    assert_eq!(report.method_names["run"], SEL_RUN);
    assert_eq!(report.method_names["shared"], SEL_SHARED);
}

#[test]
fn image_info_and_class_refs() {
    let image = objc_image(&[LAYOUT.widget]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    let info = report.image_info.unwrap();
    assert_eq!(info.swift_version(), 5);
    assert!(info.has_category_class_properties());

    assert_eq!(report.class_refs.len(), 2);
    assert_eq!(report.class_refs[0].name(), Some("Base"));
    assert!(matches!(report.class_refs[1], ClassRef::External { .. }));
}

#[test]
fn unresolved_class_pointer_is_reported_not_fatal() {
    let image = objc_image(&[0x7_0000_0000, LAYOUT.base]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    assert_eq!(report.classes.len(), 1);
    assert_eq!(report.classes[0].name, "Base");
    assert!(report
        .unresolved
        .iter()
        .any(|u| u.addr == 0x7_0000_0000 && u.context == "class"));
}

#[test]
fn protocols_are_decoded_from_the_protocol_list() {
    let image = objc_image(&[LAYOUT.widget]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    assert_eq!(report.protocols.len(), 1);
    let drawable = &report.protocols[0];
    assert_eq!(drawable.addr, LAYOUT.drawable);
    assert_eq!(drawable.name, "Drawable");
    assert!(drawable.protocols.is_empty());
    assert_eq!(drawable.instance_methods.len(), 1);
    assert_eq!(drawable.instance_methods[0].name, "run");
    assert_eq!(drawable.instance_methods[0].types, "v16@0:8");
    assert_eq!(drawable.instance_methods[0].imp, 0);
    assert!(drawable.class_methods.is_empty());
    assert!(drawable.optional_instance_methods.is_empty());
}

#[test]
fn categories_carry_class_methods_protocols_and_properties() {
    let image = objc_image(&[LAYOUT.widget]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    assert_eq!(report.categories.len(), 1);
    let extras = &report.categories[0];
    assert_eq!(extras.addr, LAYOUT.extras);
    assert_eq!(extras.name, "Extras");
    assert_eq!(
        extras.class,
        Some(ClassRef::Local {
            addr: LAYOUT.widget,
            name: Some("Widget".to_string()),
        })
    );
    assert_eq!(extras.instance_methods.len(), 1);
    assert_eq!(extras.instance_methods[0].name, "shared");
    assert_eq!(extras.instance_methods[0].imp, TEXT + 0x560);
    assert!(extras.class_methods.is_empty());
    assert_eq!(extras.protocols, ["Drawable"]);
    assert_eq!(extras.properties.len(), 1);
    assert_eq!(extras.properties[0].name, "title");
    assert_eq!(extras.properties[0].attributes, "T@\"NSString\",C");
}

#[test]
fn arm64e_auth_rebase_resolves_against_the_image_base() {
    let auth_rebase = (1 << 63) | (LAYOUT.widget - TEXT);
    let auth_bind = (1 << 63) | (1 << 62) | 3;
    let image = objc_image_for(
        ImageBuilder::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E),
        &[auth_rebase, auth_bind],
    );
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();

    assert_eq!(report.classes.len(), 1);
    let widget = &report.classes[0];
    assert_eq!(widget.addr, LAYOUT.widget);
    assert_eq!(widget.name, "Widget");
    assert_eq!(widget.superclass_chain, ["Base"]);
    assert_eq!(widget.instance_methods[0].name, "run");
    assert_eq!(widget.class_methods[0].name, "shared");
    assert!(!report.unresolved.iter().any(|u| u.context == "class"));
}

#[test]
fn plain_arm64_treats_bit_63_as_a_bind() {
    let image = objc_image(&[(1 << 63) | (LAYOUT.widget - TEXT)]);
    let file = MachOFile::parse(&image).unwrap();
    let report = objc::extract(&file, &ObjCConfig::default()).unwrap().unwrap();
    assert!(report.classes.is_empty());
}

#[test]
fn image_without_objc_sections_is_absent() {
    let image = image_with_symbols(&[("_main", N_SECT | N_EXT, 1, 0x1_0000_0400)]);
    let file = MachOFile::parse(&image).unwrap();
    assert!(!objc::has_objc(&file));
    assert!(objc::extract(&file, &ObjCConfig::default()).unwrap().is_none());
}
