//! Objective-C runtime metadata extraction
//!
//! Classes, protocols, categories and selector tables are rebuilt from the
//! `__objc_*` sections. Every pointer goes through the slice's
//! [`AddressResolver`]; pointers that land outside file-backed sections are
//! recorded as unresolved instead of failing the extraction.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::ObjCConfig;
use crate::formats::macho::constants::{CPU_SUBTYPE_ARM64E, CPU_SUBTYPE_MASK};
use crate::formats::macho::sections::{AddressResolver, Section};
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{read_pointer, EndianRead};
use crate::formats::macho::MachOFile;

pub const SECT_CLASSLIST: &str = "__objc_classlist";
pub const SECT_NLCLSLIST: &str = "__objc_nlclslist";
pub const SECT_CATLIST: &str = "__objc_catlist";
pub const SECT_PROTOLIST: &str = "__objc_protolist";
pub const SECT_SELREFS: &str = "__objc_selrefs";
pub const SECT_METHNAME: &str = "__objc_methname";
pub const SECT_IMAGEINFO: &str = "__objc_imageinfo";
pub const SECT_CLASSREFS: &str = "__objc_classrefs";
pub const SECT_SUPERREFS: &str = "__objc_superrefs";

const OBJC_SECTIONS: &[&str] = &[
    SECT_CLASSLIST,
    SECT_NLCLSLIST,
    SECT_CATLIST,
    SECT_PROTOLIST,
    SECT_SELREFS,
    SECT_METHNAME,
    SECT_IMAGEINFO,
    SECT_CLASSREFS,
    SECT_SUPERREFS,
];

/// `class_t.data` bits that are not part of the pointer
const FAST_DATA_MASK: u64 = 0x0000_7fff_ffff_fff8;
const FAST_IS_SWIFT_LEGACY: u64 = 1 << 0;
const FAST_IS_SWIFT_STABLE: u64 = 1 << 1;

const METHOD_LIST_RELATIVE_FLAG: u32 = 0x8000_0000;
const METHOD_LIST_SELECTORS_DIRECT_FLAG: u32 = 0x4000_0000;
const LIST_ENTSIZE_MASK: u32 = 0x0000_fffc;
const RELATIVE_METHOD_SIZE: u64 = 12;

/// Chained fixup pointer fields (`dyld_chained_ptr_64_rebase`)
const CHAINED_TARGET_MASK: u64 = 0x0000_000f_ffff_ffff;
const CHAINED_BIND_BIT: u64 = 1 << 63;

/// `dyld_chained_ptr_arm64e_*`: bit 63 selects the auth form, bit 62 a bind
const ARM64E_AUTH_BIT: u64 = 1 << 63;
const ARM64E_BIND_BIT: u64 = 1 << 62;
const ARM64E_TARGET_MASK: u64 = 0x0000_07ff_ffff_ffff;
const ARM64E_AUTH_TARGET_MASK: u64 = 0xffff_ffff;

const RO_META: u32 = 1 << 0;

const UNRESOLVED: &str = "<unresolved>";

/// `__objc_imageinfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjCImageInfo {
    pub version: u32,
    pub flags: u32,
}

impl ObjCImageInfo {
    /// Swift ABI version stored in bits 8..16 of the flags
    pub fn swift_version(&self) -> u8 {
        ((self.flags >> 8) & 0xff) as u8
    }

    pub fn is_simulated(&self) -> bool {
        self.flags & (1 << 5) != 0
    }

    pub fn has_category_class_properties(&self) -> bool {
        self.flags & (1 << 6) != 0
    }
}

/// A class pointer that may or may not resolve within this image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClassRef {
    Local { addr: u64, name: Option<String> },
    /// Bound at load time to a class in another image
    External { raw: u64 },
    Unresolved { addr: u64 },
}

impl ClassRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            ClassRef::Local { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCMethod {
    pub name: String,
    pub types: String,
    pub imp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCIvar {
    pub name: String,
    pub type_encoding: String,
    /// Value read through the ivar offset pointer
    pub offset: Option<u32>,
    pub alignment: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCProperty {
    pub name: String,
    pub attributes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCClass {
    pub addr: u64,
    pub name: String,
    pub superclass: Option<ClassRef>,
    /// Superclass names walked from this class, nearest first
    pub superclass_chain: Vec<String>,
    /// Chain walk stopped at a cycle or the depth limit
    pub chain_truncated: bool,
    pub is_swift: bool,
    pub ro_flags: u32,
    pub instance_start: u32,
    pub instance_size: u32,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub ivars: Vec<ObjCIvar>,
    pub properties: Vec<ObjCProperty>,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCProtocol {
    pub addr: u64,
    pub name: String,
    pub protocols: Vec<String>,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub optional_instance_methods: Vec<ObjCMethod>,
    pub optional_class_methods: Vec<ObjCMethod>,
    pub properties: Vec<ObjCProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjCCategory {
    pub addr: u64,
    pub name: String,
    pub class: Option<ClassRef>,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub protocols: Vec<String>,
    pub properties: Vec<ObjCProperty>,
}

/// One `__objc_selrefs` slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorRef {
    pub ref_addr: u64,
    pub target_addr: u64,
    pub name: Option<String>,
}

/// A pointer that did not land in any file-backed section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedRef {
    pub context: String,
    pub addr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ObjCReport {
    pub image_info: Option<ObjCImageInfo>,
    pub classes: Vec<ObjCClass>,
    pub nonlazy_classes: Vec<ObjCClass>,
    pub protocols: Vec<ObjCProtocol>,
    pub categories: Vec<ObjCCategory>,
    /// File order of `__objc_selrefs`
    pub selector_refs: Vec<SelectorRef>,
    pub class_refs: Vec<ClassRef>,
    pub super_refs: Vec<ClassRef>,
    /// Method name to the address of its first occurrence
    pub method_names: BTreeMap<String, u64>,
    pub unresolved: Vec<UnresolvedRef>,
}

impl ObjCReport {
    pub fn selector(&self, ref_addr: u64) -> Option<&str> {
        self.selector_refs
            .iter()
            .find(|s| s.ref_addr == ref_addr)
            .and_then(|s| s.name.as_deref())
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ObjCClass> {
        self.classes.iter().find(|c| c.name == name)
    }
}

/// Whether any Objective-C metadata section is present
pub fn has_objc(file: &MachOFile<'_>) -> bool {
    OBJC_SECTIONS
        .iter()
        .any(|name| file.sections().by_name(name).is_some())
}

/// Extract Objective-C metadata; `Ok(None)` when the image has none.
pub fn extract(file: &MachOFile<'_>, config: &ObjCConfig) -> Result<Option<ObjCReport>> {
    if !has_objc(file) {
        return Ok(None);
    }
    let mut extractor = Extractor::new(file, config);
    let mut report = ObjCReport {
        image_info: extractor.image_info()?,
        ..ObjCReport::default()
    };

    for addr in extractor.pointer_list(SECT_CLASSLIST)? {
        if let Some(class) = extractor.class_at(addr) {
            report.classes.push(class);
        }
    }
    for addr in extractor.pointer_list(SECT_NLCLSLIST)? {
        if let Some(class) = extractor.class_at(addr) {
            report.nonlazy_classes.push(class);
        }
    }
    for addr in extractor.pointer_list(SECT_PROTOLIST)? {
        if let Some(proto) = extractor.protocol_at(addr) {
            report.protocols.push(proto);
        }
    }
    for addr in extractor.pointer_list(SECT_CATLIST)? {
        if let Some(cat) = extractor.category_at(addr) {
            report.categories.push(cat);
        }
    }
    report.selector_refs = extractor.selector_refs()?;
    report.class_refs = extractor
        .raw_pointer_list(SECT_CLASSREFS)?
        .into_iter()
        .filter_map(|raw| extractor.class_ref(raw, "classref"))
        .collect();
    report.super_refs = extractor
        .raw_pointer_list(SECT_SUPERREFS)?
        .into_iter()
        .filter_map(|raw| extractor.class_ref(raw, "superref"))
        .collect();
    report.method_names = extractor.method_names()?;
    report.unresolved = extractor.unresolved;

    debug!(
        classes = report.classes.len(),
        protocols = report.protocols.len(),
        categories = report.categories.len(),
        selrefs = report.selector_refs.len(),
        unresolved = report.unresolved.len(),
        "objc metadata"
    );
    Ok(Some(report))
}

/// How a raw pointer value decodes
enum Pointer {
    Null,
    Bind(u64),
    Target(u64),
}

struct Extractor<'a> {
    file: &'a MachOFile<'a>,
    resolver: AddressResolver<'a>,
    config: &'a ObjCConfig,
    /// Preferred load address, base for offset-style chained pointers
    base: u64,
    arm64e: bool,
    unresolved: Vec<UnresolvedRef>,
}

impl<'a> Extractor<'a> {
    fn new(file: &'a MachOFile<'a>, config: &'a ObjCConfig) -> Self {
        let base = file.segment("__TEXT").map(|s| s.vmaddr).unwrap_or(0);
        let header = file.header();
        let arm64e = CpuType::from(header.cputype) == CpuType::Arm64
            && (header.cpusubtype & !CPU_SUBTYPE_MASK) == CPU_SUBTYPE_ARM64E;
        Self {
            file,
            resolver: file.resolver(),
            config,
            base,
            arm64e,
            unresolved: Vec::new(),
        }
    }

    fn ptr_size(&self) -> u64 {
        self.resolver.pointer_size() as u64
    }

    /// Strip chained-fixup metadata from a stored pointer.
    fn decode_pointer(&self, raw: u64) -> Pointer {
        if raw == 0 {
            return Pointer::Null;
        }
        if self.file.class() == MachClass::MachO32 {
            return Pointer::Target(raw);
        }
        if self.arm64e {
            if raw & ARM64E_BIND_BIT != 0 {
                return Pointer::Bind(raw);
            }
            if raw & ARM64E_AUTH_BIT != 0 {
                // authenticated rebase: image-relative 32-bit target
                let target = raw & ARM64E_AUTH_TARGET_MASK;
                return Pointer::Target(self.base.checked_add(target).unwrap_or(target));
            }
            let target = raw & ARM64E_TARGET_MASK;
            let high8 = (raw >> 43) & 0xff;
            return self.rebase(target, target | (high8 << 56));
        }
        if raw & CHAINED_BIND_BIT != 0 {
            return Pointer::Bind(raw);
        }
        let target = raw & CHAINED_TARGET_MASK;
        let high8 = (raw >> 36) & 0xff;
        self.rebase(target, target | (high8 << 56))
    }

    /// Plain rebase: `addr` is a vmaddr, or `target` is relative to the image base
    fn rebase(&self, target: u64, addr: u64) -> Pointer {
        if self.resolver.offset_of(addr).is_none() {
            if let Some(based) = self.base.checked_add(target) {
                if self.resolver.offset_of(based).is_some() {
                    return Pointer::Target(based);
                }
            }
        }
        Pointer::Target(addr)
    }

    fn note_unresolved(&mut self, context: &str, addr: u64) {
        trace!(context, addr = format_args!("{:#x}", addr), "unresolved objc pointer");
        self.unresolved.push(UnresolvedRef {
            context: context.to_string(),
            addr,
        });
    }

    /// Read and decode the pointer stored at `addr`
    fn pointer_at(&mut self, addr: u64, context: &str) -> Option<u64> {
        let raw = match self.resolver.read_pointer_at(addr) {
            Some(raw) => raw,
            None => {
                self.note_unresolved(context, addr);
                return None;
            }
        };
        match self.decode_pointer(raw) {
            Pointer::Target(t) => Some(t),
            Pointer::Null | Pointer::Bind(_) => None,
        }
    }

    fn string_at(&mut self, addr: u64, context: &str) -> Option<String> {
        if addr == 0 {
            return None;
        }
        let s = self
            .resolver
            .read_cstring_at(addr, self.config.max_string_len);
        if s.is_none() {
            self.note_unresolved(context, addr);
        }
        s
    }

    /// String referenced by the pointer stored at `field`
    fn string_via(&mut self, field: u64, context: &str) -> Option<String> {
        let target = self.pointer_at(field, context)?;
        self.string_at(target, context)
    }

    fn section(&self, name: &str) -> Option<&'a Section> {
        self.file.sections().by_name(name)
    }

    fn section_bytes(&self, name: &str) -> Result<Option<(&'a Section, &'a [u8])>> {
        let section = match self.section(name) {
            Some(s) => s,
            None => return Ok(None),
        };
        match section.data(self.file.data()) {
            Some(bytes) => Ok(Some((section, bytes))),
            None if section.is_zerofill() => Ok(None),
            None => Err(MachError::TruncatedFile {
                offset: section.offset as usize,
                needed: section.size as usize,
            }),
        }
    }

    /// Raw pointer values of a pointer-array section
    fn raw_pointer_list(&self, name: &str) -> Result<Vec<u64>> {
        let (_, bytes) = match self.section_bytes(name)? {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let ps = self.ptr_size() as usize;
        let count = (bytes.len() / ps).min(self.config.max_list_entries);
        (0..count)
            .map(|i| read_pointer(bytes, i * ps, self.file.class(), self.file.endian()))
            .collect()
    }

    /// Decoded targets of a pointer-array section, skipping null and bound slots
    fn pointer_list(&self, name: &str) -> Result<Vec<u64>> {
        Ok(self
            .raw_pointer_list(name)?
            .into_iter()
            .filter_map(|raw| match self.decode_pointer(raw) {
                Pointer::Target(t) => Some(t),
                _ => None,
            })
            .collect())
    }

    fn image_info(&self) -> Result<Option<ObjCImageInfo>> {
        let (_, bytes) = match self.section_bytes(SECT_IMAGEINFO)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let e = self.file.endian();
        Ok(Some(ObjCImageInfo {
            version: bytes.read_u32(0, e)?,
            flags: bytes.read_u32(4, e)?,
        }))
    }

    /// `None` for a null pointer (a root class has no superclass)
    fn class_ref(&mut self, raw: u64, context: &str) -> Option<ClassRef> {
        let class = match self.decode_pointer(raw) {
            Pointer::Null => return None,
            Pointer::Bind(raw) => ClassRef::External { raw },
            Pointer::Target(addr) if self.resolver.offset_of(addr).is_none() => {
                self.note_unresolved(context, addr);
                ClassRef::Unresolved { addr }
            }
            Pointer::Target(addr) => ClassRef::Local {
                addr,
                name: self.class_name(addr),
            },
        };
        Some(class)
    }

    /// `class_ro_t` address and swift bit of the class at `addr`
    fn class_data(&mut self, addr: u64) -> Option<(u64, bool)> {
        let raw = self.resolver.read_pointer_at(addr + 4 * self.ptr_size());
        let raw = match raw {
            Some(r) => r,
            None => {
                self.note_unresolved("class data", addr);
                return None;
            }
        };
        let is_swift = raw & (FAST_IS_SWIFT_LEGACY | FAST_IS_SWIFT_STABLE) != 0;
        let data = match self.decode_pointer(raw) {
            Pointer::Target(t) => t & FAST_DATA_MASK,
            _ => return None,
        };
        let data = if self.ptr_size() == 4 { data & !3 } else { data };
        Some((data, is_swift))
    }

    /// Address of `class_ro_t` field `index` (counting from `ivarLayout`)
    fn ro_field(&self, ro: u64, index: u64) -> u64 {
        let header = if self.ptr_size() == 8 { 16 } else { 12 };
        ro + header + index * self.ptr_size()
    }

    fn class_name(&mut self, addr: u64) -> Option<String> {
        let (ro, _) = self.class_data(addr)?;
        self.string_via(self.ro_field(ro, 1), "class name")
    }

    fn class_at(&mut self, addr: u64) -> Option<ObjCClass> {
        if self.resolver.offset_of(addr).is_none() {
            self.note_unresolved("class", addr);
            return None;
        }
        let ps = self.ptr_size();
        let (ro, is_swift) = self.class_data(addr)?;
        let ro_flags = self.resolver.read_u32_at(ro);
        let ro_flags = match ro_flags {
            Some(f) => f,
            None => {
                self.note_unresolved("class_ro", ro);
                return None;
            }
        };
        let instance_start = self.resolver.read_u32_at(ro + 4).unwrap_or(0);
        let instance_size = self.resolver.read_u32_at(ro + 8).unwrap_or(0);

        let name = self
            .string_via(self.ro_field(ro, 1), "class name")
            .unwrap_or_else(|| UNRESOLVED.to_string());
        let instance_methods = self.method_list_via(self.ro_field(ro, 2));
        let protocols = self.protocol_names_via(self.ro_field(ro, 3));
        let ivars = self.ivar_list_via(self.ro_field(ro, 4));
        let properties = self.property_list_via(self.ro_field(ro, 6));

        // Class methods live on the metaclass
        let class_methods = match self.pointer_at(addr, "isa") {
            Some(meta) if meta != addr => match self.class_data(meta) {
                Some((meta_ro, _)) => {
                    let flags = self.resolver.read_u32_at(meta_ro).unwrap_or(0);
                    if flags & RO_META != 0 {
                        self.method_list_via(self.ro_field(meta_ro, 2))
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        };

        let superclass = self
            .resolver
            .read_pointer_at(addr + ps)
            .and_then(|raw| self.class_ref(raw, "superclass"));
        let (superclass_chain, chain_truncated) = self.superclass_chain(addr);

        Some(ObjCClass {
            addr,
            name,
            superclass,
            superclass_chain,
            chain_truncated,
            is_swift,
            ro_flags,
            instance_start,
            instance_size,
            instance_methods,
            class_methods,
            ivars,
            properties,
            protocols,
        })
    }

    /// Walk superclass pointers with a visited set and a depth cap
    fn superclass_chain(&mut self, start: u64) -> (Vec<String>, bool) {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(start);
        let mut current = start;
        loop {
            if chain.len() >= self.config.max_superclass_depth {
                return (chain, true);
            }
            let raw = match self.resolver.read_pointer_at(current + self.ptr_size()) {
                Some(raw) => raw,
                None => return (chain, false),
            };
            let next = match self.decode_pointer(raw) {
                Pointer::Target(t) if self.resolver.offset_of(t).is_some() => t,
                _ => return (chain, false),
            };
            if !visited.insert(next) {
                trace!(class = format_args!("{:#x}", start), "superclass cycle");
                return (chain, true);
            }
            chain.push(
                self.class_name(next)
                    .unwrap_or_else(|| UNRESOLVED.to_string()),
            );
            current = next;
        }
    }

    fn method_list_via(&mut self, field: u64) -> Vec<ObjCMethod> {
        match self.pointer_at(field, "method list") {
            Some(list) => self.method_list(list),
            None => Vec::new(),
        }
    }

    /// `{entsizeAndFlags, count}` header of a list
    fn list_header(&mut self, list: u64, context: &str) -> Option<(u32, u32)> {
        let header = self.resolver.read_u32_at(list);
        let count = self.resolver.read_u32_at(list + 4);
        match (header, count) {
            (Some(h), Some(c)) => Some((h, (c as usize).min(self.config.max_list_entries) as u32)),
            _ => {
                self.note_unresolved(context, list);
                None
            }
        }
    }

    fn method_list(&mut self, list: u64) -> Vec<ObjCMethod> {
        let (flags, count) = match self.list_header(list, "method list") {
            Some(h) => h,
            None => return Vec::new(),
        };
        let relative = flags & METHOD_LIST_RELATIVE_FLAG != 0;
        let direct = flags & METHOD_LIST_SELECTORS_DIRECT_FLAG != 0;
        let entsize = match (flags & LIST_ENTSIZE_MASK) as u64 {
            0 if relative => RELATIVE_METHOD_SIZE,
            0 => 3 * self.ptr_size(),
            n => n,
        };

        let mut methods = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let entry = list + 8 + i * entsize;
            let method = if relative {
                self.relative_method(entry, direct)
            } else {
                self.absolute_method(entry)
            };
            match method {
                Some(m) => methods.push(m),
                None => break,
            }
        }
        methods
    }

    fn absolute_method(&mut self, entry: u64) -> Option<ObjCMethod> {
        let ps = self.ptr_size();
        self.resolver.offset_of(entry + 3 * ps - 1)?;
        let name = self
            .string_via(entry, "method name")
            .unwrap_or_else(|| UNRESOLVED.to_string());
        let types = self.string_via(entry + ps, "method types").unwrap_or_default();
        let imp = self.pointer_at(entry + 2 * ps, "method imp").unwrap_or(0);
        Some(ObjCMethod { name, types, imp })
    }

    /// Entry of a relative method list: three `i32` offsets from each field
    fn relative_method(&mut self, entry: u64, direct: bool) -> Option<ObjCMethod> {
        let name_off = self.resolver.read_i32_at(entry)?;
        let types_off = self.resolver.read_i32_at(entry + 4)?;
        let imp_off = self.resolver.read_i32_at(entry + 8)?;

        let name_ref = entry.wrapping_add_signed(name_off as i64);
        let name = if direct {
            self.string_at(name_ref, "method name")
        } else {
            self.string_via(name_ref, "method selref")
        }
        .unwrap_or_else(|| UNRESOLVED.to_string());
        let types = self
            .string_at((entry + 4).wrapping_add_signed(types_off as i64), "method types")
            .unwrap_or_default();
        let imp = if imp_off == 0 {
            0
        } else {
            (entry + 8).wrapping_add_signed(imp_off as i64)
        };
        Some(ObjCMethod { name, types, imp })
    }

    fn ivar_list_via(&mut self, field: u64) -> Vec<ObjCIvar> {
        let list = match self.pointer_at(field, "ivar list") {
            Some(l) => l,
            None => return Vec::new(),
        };
        let (flags, count) = match self.list_header(list, "ivar list") {
            Some(h) => h,
            None => return Vec::new(),
        };
        let ps = self.ptr_size();
        let entsize = match (flags & LIST_ENTSIZE_MASK) as u64 {
            0 => 3 * ps + 8,
            n => n,
        };
        let mut ivars = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let entry = list + 8 + i * entsize;
            if self.resolver.offset_of(entry + 3 * ps + 7).is_none() {
                self.note_unresolved("ivar", entry);
                break;
            }
            let offset = self
                .pointer_at(entry, "ivar offset")
                .and_then(|p| self.resolver.read_u32_at(p));
            let name = self
                .string_via(entry + ps, "ivar name")
                .unwrap_or_else(|| UNRESOLVED.to_string());
            let type_encoding = self.string_via(entry + 2 * ps, "ivar type").unwrap_or_default();
            let alignment_raw = self.resolver.read_u32_at(entry + 3 * ps).unwrap_or(0);
            let size = self.resolver.read_u32_at(entry + 3 * ps + 4).unwrap_or(0);
            ivars.push(ObjCIvar {
                name,
                type_encoding,
                offset,
                alignment: if alignment_raw == u32::MAX {
                    ps as u32
                } else {
                    1u32.checked_shl(alignment_raw).unwrap_or(0)
                },
                size,
            });
        }
        ivars
    }

    fn property_list_via(&mut self, field: u64) -> Vec<ObjCProperty> {
        let list = match self.pointer_at(field, "property list") {
            Some(l) => l,
            None => return Vec::new(),
        };
        let (flags, count) = match self.list_header(list, "property list") {
            Some(h) => h,
            None => return Vec::new(),
        };
        let ps = self.ptr_size();
        let entsize = match (flags & LIST_ENTSIZE_MASK) as u64 {
            0 => 2 * ps,
            n => n,
        };
        let mut props = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let entry = list + 8 + i * entsize;
            if self.resolver.offset_of(entry + 2 * ps - 1).is_none() {
                self.note_unresolved("property", entry);
                break;
            }
            props.push(ObjCProperty {
                name: self
                    .string_via(entry, "property name")
                    .unwrap_or_else(|| UNRESOLVED.to_string()),
                attributes: self
                    .string_via(entry + ps, "property attributes")
                    .unwrap_or_default(),
            });
        }
        props
    }

    /// Names of the protocols in a `protocol_list_t` (pointer-sized count)
    fn protocol_names_via(&mut self, field: u64) -> Vec<String> {
        let list = match self.pointer_at(field, "protocol list") {
            Some(l) => l,
            None => return Vec::new(),
        };
        let ps = self.ptr_size();
        let count = match self.resolver.read_pointer_at(list) {
            Some(c) => (c as usize).min(self.config.max_list_entries) as u64,
            None => {
                self.note_unresolved("protocol list", list);
                return Vec::new();
            }
        };
        let mut names = Vec::with_capacity(count as usize);
        for i in 0..count {
            let proto = match self.pointer_at(list + ps + i * ps, "protocol") {
                Some(p) => p,
                None => continue,
            };
            names.push(
                self.string_via(proto + ps, "protocol name")
                    .unwrap_or_else(|| UNRESOLVED.to_string()),
            );
        }
        names
    }

    fn protocol_at(&mut self, addr: u64) -> Option<ObjCProtocol> {
        if self.resolver.offset_of(addr).is_none() {
            self.note_unresolved("protocol", addr);
            return None;
        }
        let ps = self.ptr_size();
        let field = |i: u64| addr + i * ps;
        Some(ObjCProtocol {
            addr,
            name: self
                .string_via(field(1), "protocol name")
                .unwrap_or_else(|| UNRESOLVED.to_string()),
            protocols: self.protocol_names_via(field(2)),
            instance_methods: self.method_list_via(field(3)),
            class_methods: self.method_list_via(field(4)),
            optional_instance_methods: self.method_list_via(field(5)),
            optional_class_methods: self.method_list_via(field(6)),
            properties: self.property_list_via(field(7)),
        })
    }

    fn category_at(&mut self, addr: u64) -> Option<ObjCCategory> {
        if self.resolver.offset_of(addr).is_none() {
            self.note_unresolved("category", addr);
            return None;
        }
        let ps = self.ptr_size();
        let field = |i: u64| addr + i * ps;
        let class = self
            .resolver
            .read_pointer_at(field(1))
            .and_then(|raw| self.class_ref(raw, "category class"));
        Some(ObjCCategory {
            addr,
            name: self
                .string_via(field(0), "category name")
                .unwrap_or_else(|| UNRESOLVED.to_string()),
            class,
            instance_methods: self.method_list_via(field(2)),
            class_methods: self.method_list_via(field(3)),
            protocols: self.protocol_names_via(field(4)),
            properties: self.property_list_via(field(5)),
        })
    }

    fn selector_refs(&mut self) -> Result<Vec<SelectorRef>> {
        let section_addr = match self.section(SECT_SELREFS) {
            Some(s) => s.addr,
            None => return Ok(Vec::new()),
        };
        let raws = self.raw_pointer_list(SECT_SELREFS)?;
        let ps = self.ptr_size();
        let mut refs = Vec::with_capacity(raws.len());
        for (i, raw) in raws.into_iter().enumerate() {
            let ref_addr = section_addr + i as u64 * ps;
            let target_addr = match self.decode_pointer(raw) {
                Pointer::Target(t) => t,
                _ => raw,
            };
            let name = self.string_at(target_addr, "selector");
            refs.push(SelectorRef {
                ref_addr,
                target_addr,
                name,
            });
        }
        Ok(refs)
    }

    /// Each string of `__objc_methname` keyed to its first address
    fn method_names(&self) -> Result<BTreeMap<String, u64>> {
        let (section, bytes) = match self.section_bytes(SECT_METHNAME)? {
            Some(s) => s,
            None => return Ok(BTreeMap::new()),
        };
        let mut names = BTreeMap::new();
        let mut start = 0usize;
        for end in memchr::memchr_iter(0, bytes) {
            if names.len() >= self.config.max_list_entries {
                break;
            }
            if end > start {
                let name = String::from_utf8_lossy(&bytes[start..end]).into_owned();
                names.entry(name).or_insert(section.addr + start as u64);
            }
            start = end + 1;
        }
        Ok(names)
    }
}
