//! Fat/thin container resolution

use std::cell::OnceCell;

use serde::Serialize;
use tracing::debug;

use crate::formats::macho::constants::*;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::EndianRead;
use crate::formats::macho::MachOFile;

/// One architecture entry of a fat header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    pub fn cpu(&self) -> CpuType {
        CpuType::from(self.cputype)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Byte range of this slice within the container
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.end() as usize
    }
}

/// Architecture description used for selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Architecture {
    pub cpu: CpuType,
    pub cpusubtype: u32,
    pub name: String,
}

impl Architecture {
    fn new(cputype: u32, cpusubtype: u32) -> Self {
        let cpu = CpuType::from(cputype);
        Self {
            cpu,
            cpusubtype,
            name: format!("{}, {}", cpu, cpu_subtype_name(cpu, cpusubtype)),
        }
    }
}

/// Container kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    Fat { is_64: bool, arches: Vec<FatArch> },
    Thin { class: MachClass, endian: Endian },
}

/// A fat or thin Mach-O container over an immutable buffer.
///
/// Slices are decoded lazily and cached on first access.
pub struct MachContainer<'data> {
    data: &'data [u8],
    kind: ContainerKind,
    slices: Vec<OnceCell<Result<MachOFile<'data>>>>,
}

impl<'data> MachContainer<'data> {
    /// Detect the container kind and validate the fat header if present.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let magic_be = data.read_u32(0, Endian::Big)?;

        let kind = match magic_be {
            FAT_MAGIC | FAT_MAGIC_64 => parse_fat_header(data, magic_be == FAT_MAGIC_64)?,
            _ => {
                let magic_le = data.read_u32(0, Endian::Little)?;
                let (class, endian) =
                    classify_magic(magic_le).ok_or(MachError::InvalidMagic(magic_be))?;
                ContainerKind::Thin { class, endian }
            }
        };

        let count = match &kind {
            ContainerKind::Fat { arches, .. } => arches.len(),
            ContainerKind::Thin { .. } => 1,
        };
        let slices = (0..count).map(|_| OnceCell::new()).collect();

        Ok(Self { data, kind, slices })
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    pub fn kind(&self) -> &ContainerKind {
        &self.kind
    }

    pub fn is_fat(&self) -> bool {
        matches!(self.kind, ContainerKind::Fat { .. })
    }

    /// Fat architecture entries (empty for thin files)
    pub fn fat_arches(&self) -> &[FatArch] {
        match &self.kind {
            ContainerKind::Fat { arches, .. } => arches,
            ContainerKind::Thin { .. } => &[],
        }
    }

    pub fn arch_count(&self) -> usize {
        self.slices.len()
    }

    /// List `(cpu, subtype)` pairs in file order
    pub fn list_architectures(&self) -> Result<Vec<Architecture>> {
        match &self.kind {
            ContainerKind::Fat { arches, .. } => Ok(arches
                .iter()
                .map(|a| Architecture::new(a.cputype, a.cpusubtype))
                .collect()),
            ContainerKind::Thin { endian, .. } => {
                let cputype = self.data.read_u32(4, *endian)?;
                let cpusubtype = self.data.read_u32(8, *endian)?;
                Ok(vec![Architecture::new(cputype, cpusubtype)])
            }
        }
    }

    /// Raw bytes of the architecture at `index`
    pub fn slice_for(&self, index: usize) -> Result<&'data [u8]> {
        match &self.kind {
            ContainerKind::Fat { arches, .. } => {
                let arch = arches.get(index).ok_or(MachError::ArchitectureOutOfRange {
                    index,
                    count: arches.len(),
                })?;
                Ok(&self.data[arch.range()])
            }
            ContainerKind::Thin { .. } if index == 0 => Ok(self.data),
            ContainerKind::Thin { .. } => {
                Err(MachError::ArchitectureOutOfRange { index, count: 1 })
            }
        }
    }

    /// Decoded Mach-O for the architecture at `index`
    pub fn file(&self, index: usize) -> Result<&MachOFile<'data>> {
        let cell = self.slices.get(index).ok_or(MachError::ArchitectureOutOfRange {
            index,
            count: self.slices.len(),
        })?;
        cell.get_or_init(|| self.slice_for(index).and_then(MachOFile::parse))
            .as_ref()
            .map_err(Clone::clone)
    }
}

fn parse_fat_header(data: &[u8], is_64: bool) -> Result<ContainerKind> {
    let nfat_arch = data.read_u32(4, Endian::Big)?;
    if nfat_arch == 0 {
        return Err(MachError::MalformedContainer(
            "fat header declares no architectures".to_string(),
        ));
    }
    if nfat_arch > MAX_FAT_ARCHES {
        return Err(MachError::MalformedContainer(format!(
            "fat header declares {} architectures (likely a Java class file)",
            nfat_arch
        )));
    }

    let entry_size = if is_64 { FAT_ARCH_64_SIZE } else { FAT_ARCH_SIZE };
    let table_end = FAT_HEADER_SIZE + nfat_arch as usize * entry_size;
    if table_end > data.len() {
        return Err(MachError::MalformedContainer(format!(
            "{} fat arch entries need {} bytes, file has {}",
            nfat_arch,
            table_end,
            data.len()
        )));
    }

    let mut arches = Vec::with_capacity(nfat_arch as usize);
    for i in 0..nfat_arch as usize {
        let off = FAT_HEADER_SIZE + i * entry_size;
        let arch = if is_64 {
            FatArch {
                cputype: data.read_u32(off, Endian::Big)?,
                cpusubtype: data.read_u32(off + 4, Endian::Big)?,
                offset: data.read_u64(off + 8, Endian::Big)?,
                size: data.read_u64(off + 16, Endian::Big)?,
                align: data.read_u32(off + 24, Endian::Big)?,
            }
        } else {
            FatArch {
                cputype: data.read_u32(off, Endian::Big)?,
                cpusubtype: data.read_u32(off + 4, Endian::Big)?,
                offset: data.read_u32(off + 8, Endian::Big)? as u64,
                size: data.read_u32(off + 12, Endian::Big)? as u64,
                align: data.read_u32(off + 16, Endian::Big)?,
            }
        };

        let in_bounds = arch
            .offset
            .checked_add(arch.size)
            .map(|end| end <= data.len() as u64)
            .unwrap_or(false);
        if !in_bounds {
            return Err(MachError::MalformedContainer(format!(
                "arch {} range {:#x}+{:#x} exceeds file size {:#x}",
                i,
                arch.offset,
                arch.size,
                data.len()
            )));
        }
        if (arch.offset as usize) < table_end && arch.size > 0 {
            return Err(MachError::MalformedContainer(format!(
                "arch {} at {:#x} overlaps the fat header",
                i, arch.offset
            )));
        }

        debug!(
            index = i,
            cpu = %arch.cpu(),
            offset = arch.offset,
            size = arch.size,
            "fat arch"
        );
        arches.push(arch);
    }

    let mut sorted: Vec<&FatArch> = arches.iter().collect();
    sorted.sort_by_key(|a| a.offset);
    for pair in sorted.windows(2) {
        if pair[0].end() > pair[1].offset {
            return Err(MachError::MalformedContainer(format!(
                "arch ranges overlap at {:#x}",
                pair[1].offset
            )));
        }
    }

    Ok(ContainerKind::Fat { is_64, arches })
}
