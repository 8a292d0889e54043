//! Common test utilities and helpers.
//!
//! Integration tests build their inputs byte by byte: thin 64-bit images with
//! arbitrary sections, a symbol table and an optional code signature, fat
//! wrappers around such images, and the signature blobs themselves.

#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::io::Write;
use tempfile::NamedTempFile;

pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_EXECUTE: u32 = 2;
const MH_PIE: u32 = 0x0020_0000;
const LC_SYMTAB: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_CODE_SIGNATURE: u32 = 0x1d;
const SEGMENT_64_SIZE: usize = 72;
const SECTION_64_SIZE: usize = 80;

pub const N_SECT: u8 = 0x0e;
pub const N_UNDF: u8 = 0x00;
pub const N_EXT: u8 = 0x01;

/// Creates a temporary file with the given content.
pub fn create_temp_file(content: &[u8]) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content).unwrap();
    temp_file
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Little-endian pointer array, the layout of `__objc_classlist` and friends
pub fn pointers(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

struct SectionSpec {
    name: String,
    addr: u64,
    data: Vec<u8>,
}

struct SegmentSpec {
    name: String,
    vmaddr: u64,
    sections: Vec<SectionSpec>,
}

pub struct SymbolSpec {
    pub name: String,
    pub n_type: u8,
    pub n_sect: u8,
    pub value: u64,
}

type SignatureFn = Box<dyn Fn(&[u8]) -> Vec<u8>>;

/// Thin 64-bit little-endian Mach-O image builder.
pub struct ImageBuilder {
    cputype: u32,
    cpusubtype: u32,
    segments: Vec<SegmentSpec>,
    symbols: Option<Vec<SymbolSpec>>,
    signature: Option<(usize, SignatureFn)>,
}

impl ImageBuilder {
    pub fn new(cputype: u32, cpusubtype: u32) -> Self {
        Self {
            cputype,
            cpusubtype,
            segments: Vec::new(),
            symbols: None,
            signature: None,
        }
    }

    pub fn arm64() -> Self {
        Self::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)
    }

    pub fn segment(mut self, name: &str, vmaddr: u64) -> Self {
        self.segments.push(SegmentSpec {
            name: name.to_string(),
            vmaddr,
            sections: Vec::new(),
        });
        self
    }

    /// Add a section at `addr` to the most recent segment.
    pub fn section(mut self, name: &str, addr: u64, data: Vec<u8>) -> Self {
        let segment = self
            .segments
            .last_mut()
            .expect("section() needs a segment() first");
        segment.sections.push(SectionSpec {
            name: name.to_string(),
            addr,
            data,
        });
        self
    }

    pub fn symbol(mut self, name: &str, n_type: u8, n_sect: u8, value: u64) -> Self {
        self.symbols.get_or_insert_with(Vec::new).push(SymbolSpec {
            name: name.to_string(),
            n_type,
            n_sect,
            value,
        });
        self
    }

    /// Reserve `size` bytes for a signature produced from the bytes that
    /// precede it.
    pub fn code_signature<F>(mut self, size: usize, make: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + 'static,
    {
        self.signature = Some((size, Box::new(make)));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut ncmds = self.segments.len() as u32;
        let mut sizeofcmds: usize = self
            .segments
            .iter()
            .map(|s| SEGMENT_64_SIZE + s.sections.len() * SECTION_64_SIZE)
            .sum();
        if self.symbols.is_some() {
            ncmds += 1;
            sizeofcmds += 24;
        }
        if self.signature.is_some() {
            ncmds += 1;
            sizeofcmds += 16;
        }

        // Lay out section contents after the load commands
        let mut cursor = align(32 + sizeofcmds, 16);
        let mut placements: Vec<Vec<usize>> = Vec::new();
        let mut extents = Vec::new();
        for seg in &self.segments {
            let start = cursor;
            let mut offsets = Vec::new();
            for sect in &seg.sections {
                offsets.push(cursor);
                cursor = align(cursor + sect.data.len(), 8);
            }
            extents.push((start, cursor - start));
            placements.push(offsets);
        }

        let symtab = self.symbols.as_ref().map(|symbols| {
            let symoff = align(cursor, 8);
            let mut strtab = vec![0u8];
            let mut entries = Vec::new();
            for sym in symbols {
                let strx = strtab.len() as u32;
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
                entries.extend_from_slice(&strx.to_le_bytes());
                entries.push(sym.n_type);
                entries.push(sym.n_sect);
                entries.extend_from_slice(&0u16.to_le_bytes());
                entries.extend_from_slice(&sym.value.to_le_bytes());
            }
            let stroff = symoff + entries.len();
            cursor = stroff + strtab.len();
            (symoff, symbols.len(), entries, stroff, strtab)
        });

        let sig_off = align(cursor, 16);
        let total = match &self.signature {
            Some((size, _)) => sig_off + size,
            None => cursor,
        };

        let mut out = Vec::with_capacity(total);
        let le32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
        let le64 = |out: &mut Vec<u8>, v: u64| out.extend_from_slice(&v.to_le_bytes());

        le32(&mut out, MH_MAGIC_64);
        le32(&mut out, self.cputype);
        le32(&mut out, self.cpusubtype);
        le32(&mut out, MH_EXECUTE);
        le32(&mut out, ncmds);
        le32(&mut out, sizeofcmds as u32);
        le32(&mut out, MH_PIE);
        le32(&mut out, 0);

        for ((seg, offsets), (fileoff, filesize)) in
            self.segments.iter().zip(&placements).zip(&extents)
        {
            let vmsize = seg
                .sections
                .iter()
                .map(|s| s.addr + s.data.len() as u64)
                .max()
                .unwrap_or(seg.vmaddr)
                .saturating_sub(seg.vmaddr);
            le32(&mut out, LC_SEGMENT_64);
            le32(
                &mut out,
                (SEGMENT_64_SIZE + seg.sections.len() * SECTION_64_SIZE) as u32,
            );
            out.extend_from_slice(&name16(&seg.name));
            le64(&mut out, seg.vmaddr);
            le64(&mut out, vmsize);
            le64(&mut out, *fileoff as u64);
            le64(&mut out, *filesize as u64);
            le32(&mut out, 7);
            le32(&mut out, 5);
            le32(&mut out, seg.sections.len() as u32);
            le32(&mut out, 0);
            for (sect, offset) in seg.sections.iter().zip(offsets) {
                out.extend_from_slice(&name16(&sect.name));
                out.extend_from_slice(&name16(&seg.name));
                le64(&mut out, sect.addr);
                le64(&mut out, sect.data.len() as u64);
                le32(&mut out, *offset as u32);
                le32(&mut out, 3);
                le32(&mut out, 0);
                le32(&mut out, 0);
                le32(&mut out, 0);
                le32(&mut out, 0);
                le32(&mut out, 0);
                le32(&mut out, 0);
            }
        }
        if let Some((symoff, nsyms, _, stroff, strtab)) = &symtab {
            le32(&mut out, LC_SYMTAB);
            le32(&mut out, 24);
            le32(&mut out, *symoff as u32);
            le32(&mut out, *nsyms as u32);
            le32(&mut out, *stroff as u32);
            le32(&mut out, strtab.len() as u32);
        }
        if let Some((size, _)) = &self.signature {
            le32(&mut out, LC_CODE_SIGNATURE);
            le32(&mut out, 16);
            le32(&mut out, sig_off as u32);
            le32(&mut out, *size as u32);
        }

        for (seg, offsets) in self.segments.iter().zip(&placements) {
            for (sect, offset) in seg.sections.iter().zip(offsets) {
                out.resize(*offset, 0);
                out.extend_from_slice(&sect.data);
            }
        }
        if let Some((symoff, _, entries, _, strtab)) = &symtab {
            out.resize(*symoff, 0);
            out.extend_from_slice(entries);
            out.extend_from_slice(strtab);
        }
        if let Some((size, make)) = &self.signature {
            out.resize(sig_off, 0);
            let blob = make(&out);
            assert!(blob.len() <= *size, "signature larger than its reservation");
            out.extend_from_slice(&blob);
        }
        out.resize(total, 0);
        out
    }
}

/// Wrap thin images in a 32-bit fat header with 4 KiB aligned slices.
pub fn fat_binary(slices: &[(u32, u32, &[u8])]) -> Vec<u8> {
    let header = 8 + slices.len() * 20;
    let mut offsets = Vec::new();
    let mut cursor = align(header, 0x1000);
    for (_, _, data) in slices {
        offsets.push(cursor);
        cursor = align(cursor + data.len(), 0x1000);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
    for ((cputype, cpusubtype, data), offset) in slices.iter().zip(&offsets) {
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&cpusubtype.to_be_bytes());
        out.extend_from_slice(&(*offset as u32).to_be_bytes());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
    }
    for ((_, _, data), offset) in slices.iter().zip(&offsets) {
        out.resize(*offset, 0);
        out.extend_from_slice(data);
    }
    out
}

/// Code-signature blob builders (all fields big-endian).
pub mod signature {
    use super::*;

    pub const CSMAGIC_REQUIREMENT: u32 = 0xfade_0c00;
    pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade_0c01;
    pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
    pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
    pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;
    pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade_0b01;

    pub const CSSLOT_CODEDIRECTORY: u32 = 0;
    pub const CSSLOT_REQUIREMENTS: u32 = 2;
    pub const CSSLOT_ENTITLEMENTS: u32 = 5;
    pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

    pub fn raw_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = magic.to_be_bytes().to_vec();
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Indexed container: `magic, length, count, (type, offset)*, blobs`
    fn indexed(magic: u32, entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let header = 12 + entries.len() * 8;
        let total = header + entries.iter().map(|(_, b)| b.len()).sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&magic.to_be_bytes());
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        let mut off = header;
        for (kind, blob) in entries {
            out.extend_from_slice(&kind.to_be_bytes());
            out.extend_from_slice(&(off as u32).to_be_bytes());
            off += blob.len();
        }
        for (_, blob) in entries {
            out.extend_from_slice(blob);
        }
        out
    }

    pub fn superblob(blobs: &[(u32, Vec<u8>)]) -> Vec<u8> {
        indexed(CSMAGIC_EMBEDDED_SIGNATURE, blobs)
    }

    pub fn requirement_set(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
        indexed(CSMAGIC_REQUIREMENTS, entries)
    }

    /// Expression-form requirement blob
    pub fn requirement(expression: &[u8]) -> Vec<u8> {
        let mut payload = 1u32.to_be_bytes().to_vec();
        payload.extend_from_slice(expression);
        raw_blob(CSMAGIC_REQUIREMENT, &payload)
    }

    /// `identifier "<id>" and anchor apple`
    pub fn designated_requirement(identifier: &str) -> Vec<u8> {
        let mut e = Vec::new();
        e.extend_from_slice(&6u32.to_be_bytes());
        e.extend_from_slice(&2u32.to_be_bytes());
        e.extend_from_slice(&(identifier.len() as u32).to_be_bytes());
        e.extend_from_slice(identifier.as_bytes());
        while e.len() % 4 != 0 {
            e.push(0);
        }
        e.extend_from_slice(&3u32.to_be_bytes());
        requirement(&e)
    }

    pub fn entitlements(xml: &str) -> Vec<u8> {
        raw_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, xml.as_bytes())
    }

    /// Empty CMS wrapper, as found in ad-hoc signatures
    pub fn empty_cms() -> Vec<u8> {
        raw_blob(CSMAGIC_BLOBWRAPPER, &[])
    }

    pub struct CodeDirectoryParams<'a> {
        pub identifier: &'a str,
        pub page_size_log2: u8,
        pub special: Vec<[u8; 32]>,
        pub n_code_slots_override: Option<u32>,
    }

    impl Default for CodeDirectoryParams<'_> {
        fn default() -> Self {
            Self {
                identifier: "com.example.fixture",
                page_size_log2: 12,
                special: Vec::new(),
                n_code_slots_override: None,
            }
        }
    }

    /// Version 0x20400 SHA-256 Code Directory over `code`
    pub fn code_directory(code: &[u8], params: &CodeDirectoryParams<'_>) -> Vec<u8> {
        let page = 1usize << params.page_size_log2;
        let pages: Vec<&[u8]> = code.chunks(page).collect();

        let header = 88usize;
        let mut ident = params.identifier.as_bytes().to_vec();
        ident.push(0);
        let n_special = params.special.len();
        let hash_offset = header + ident.len() + n_special * 32;
        let total = hash_offset + pages.len() * 32;

        let mut out = Vec::with_capacity(total);
        let be32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_be_bytes());
        be32(&mut out, CSMAGIC_CODEDIRECTORY);
        be32(&mut out, total as u32);
        be32(&mut out, 0x20400);
        be32(&mut out, 0x2); // adhoc
        be32(&mut out, hash_offset as u32);
        be32(&mut out, header as u32);
        be32(&mut out, n_special as u32);
        be32(
            &mut out,
            params.n_code_slots_override.unwrap_or(pages.len() as u32),
        );
        be32(&mut out, code.len() as u32);
        out.push(32);
        out.push(2); // SHA-256
        out.push(0);
        out.push(params.page_size_log2);
        be32(&mut out, 0); // spare2
        be32(&mut out, 0); // scatter
        be32(&mut out, 0); // team id
        be32(&mut out, 0); // spare3
        out.extend_from_slice(&0u64.to_be_bytes()); // codeLimit64
        out.extend_from_slice(&0u64.to_be_bytes()); // execSegBase
        out.extend_from_slice(&(code.len() as u64).to_be_bytes());
        out.extend_from_slice(&1u64.to_be_bytes()); // main binary
        out.extend_from_slice(&ident);
        for digest in params.special.iter().rev() {
            out.extend_from_slice(digest);
        }
        for chunk in pages {
            out.extend_from_slice(&Sha256::digest(chunk));
        }
        out
    }

    pub fn sha256(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }
}

/// Symbol table image: `__TEXT,__text` plus `entries` symbols.
pub fn image_with_symbols(entries: &[(&str, u8, u8, u64)]) -> Vec<u8> {
    let mut builder = ImageBuilder::arm64()
        .segment("__TEXT", 0x1_0000_0000)
        .section("__text", 0x1_0000_0400, vec![0x1f, 0x20, 0x03, 0xd5].repeat(8));
    for (name, n_type, n_sect, value) in entries {
        builder = builder.symbol(name, *n_type, *n_sect, *value);
    }
    builder.build()
}
