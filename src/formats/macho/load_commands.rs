//! Load command decoding

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::formats::macho::constants::*;
use crate::formats::macho::sections::{parse_segment, Segment};
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{format_packed_version, read_cstring, EndianRead};

/// Maximum length accepted for an embedded `lc_str`
const MAX_LC_STR: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DysymtabCommand {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

/// `linkedit_data_command` family (code signature, function starts, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkEditData {
    pub cmd: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DylibCommand {
    pub cmd: u32,
    pub name: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

impl DylibCommand {
    pub fn current_version_string(&self) -> String {
        format_packed_version(self.current_version)
    }

    pub fn compatibility_version_string(&self) -> String {
        format_packed_version(self.compatibility_version)
    }
}

/// Source version packed as `A.B.C.D.E` (24.10.10.10.10 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceVersion(pub u64);

impl fmt::Display for SourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        let a = v >> 40;
        let parts = [(v >> 30) & 0x3ff, (v >> 20) & 0x3ff, (v >> 10) & 0x3ff, v & 0x3ff];
        write!(f, "{}", a)?;
        // Trailing zero components are elided
        let last = parts.iter().rposition(|&p| p != 0).map(|i| i + 1).unwrap_or(0);
        for p in &parts[..last] {
            write!(f, ".{}", p)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildTool {
    pub tool: u32,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildVersionCommand {
    pub platform: u32,
    pub minos: u32,
    pub sdk: u32,
    pub tools: Vec<BuildTool>,
}

impl BuildVersionCommand {
    pub fn platform_name(&self) -> &'static str {
        platform_name(self.platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionMinCommand {
    pub cmd: u32,
    pub version: u32,
    pub sdk: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPointCommand {
    pub entryoff: u64,
    pub stacksize: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncryptionInfoCommand {
    pub cmd: u32,
    pub cryptoff: u32,
    pub cryptsize: u32,
    pub cryptid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// A decoded load command, dispatched by its `cmd` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoadCommand<'data> {
    Segment(Segment),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    LinkEditData(LinkEditData),
    Dylib(DylibCommand),
    Dylinker { cmd: u32, name: String },
    Uuid([u8; 16]),
    SourceVersion(SourceVersion),
    BuildVersion(BuildVersionCommand),
    VersionMin(VersionMinCommand),
    EntryPoint(EntryPointCommand),
    Rpath(String),
    EncryptionInfo(EncryptionInfoCommand),
    DyldInfo(DyldInfoCommand),
    /// Unrecognized commands are preserved verbatim
    Unknown { cmd: u32, cmdsize: u32, data: &'data [u8] },
}

/// A load command together with its position in the command stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCommandEntry<'data> {
    pub index: u32,
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
    pub command: LoadCommand<'data>,
}

impl<'data> LoadCommandEntry<'data> {
    pub fn name(&self) -> &'static str {
        load_command_name(self.cmd)
    }
}

impl fmt::Display for LoadCommandEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}: {:<28}", self.index, self.name())?;
        match &self.command {
            LoadCommand::Segment(seg) => write!(
                f,
                "sz=0x{:08x} off=0x{:08x}-0x{:08x} addr=0x{:09x}-0x{:09x} {}",
                seg.filesize,
                seg.fileoff,
                seg.fileoff.saturating_add(seg.filesize),
                seg.vmaddr,
                seg.vmaddr.saturating_add(seg.vmsize),
                seg.name
            ),
            LoadCommand::Symtab(s) => write!(
                f,
                "Symbol offset=0x{:08x}, Num Syms: {}, String offset=0x{:08x}-0x{:08x}",
                s.symoff,
                s.nsyms,
                s.stroff,
                s.stroff.saturating_add(s.strsize)
            ),
            LoadCommand::Dysymtab(d) => write!(
                f,
                "{} Indirect symbols at offset 0x{:08x}",
                d.nindirectsyms, d.indirectsymoff
            ),
            LoadCommand::LinkEditData(l) => write!(
                f,
                "offset=0x{:08x}-0x{:08x} size={:5}",
                l.dataoff,
                l.dataoff.saturating_add(l.datasize),
                l.datasize
            ),
            LoadCommand::Dylib(d) => write!(
                f,
                "{} ({})",
                d.name,
                d.current_version_string()
            ),
            LoadCommand::Dylinker { name, .. } => write!(f, "{}", name),
            LoadCommand::Uuid(uuid) => write!(f, "{}", format_uuid(uuid)),
            LoadCommand::SourceVersion(v) => write!(f, "{}", v),
            LoadCommand::BuildVersion(b) => write!(
                f,
                "Platform: {}, SDK: {}, MinOS: {}",
                b.platform_name(),
                format_packed_version(b.sdk),
                format_packed_version(b.minos)
            ),
            LoadCommand::VersionMin(v) => write!(
                f,
                "Version={}, SDK={}",
                format_packed_version(v.version),
                format_packed_version(v.sdk)
            ),
            LoadCommand::EntryPoint(e) => {
                write!(f, "Entry Point: 0x{:016x}, Stack Size: {:#x}", e.entryoff, e.stacksize)
            }
            LoadCommand::Rpath(path) => write!(f, "{}", path),
            LoadCommand::EncryptionInfo(e) => write!(
                f,
                "Offset: 0x{:x}, Size: 0x{:x}, CryptID: {:#x}",
                e.cryptoff, e.cryptsize, e.cryptid
            ),
            LoadCommand::DyldInfo(d) => write!(
                f,
                "Rebase_off=0x{:x}, Bind_off=0x{:x}, Export_off=0x{:x}",
                d.rebase_off, d.bind_off, d.export_off
            ),
            LoadCommand::Unknown { cmd, cmdsize, .. } => {
                write!(f, "cmd={:#x} size={}", cmd, cmdsize)
            }
        }
    }
}

pub fn format_uuid(uuid: &[u8; 16]) -> String {
    let h = hex::encode_upper(uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Result of walking the load command stream
pub struct DecodedCommands<'data> {
    pub commands: Vec<LoadCommandEntry<'data>>,
    pub inconsistencies: Vec<Inconsistency>,
}

/// Walk exactly `ncmds` load commands following the header.
///
/// A command extending past the `sizeofcmds` region (or the slice) is fatal.
/// A known command whose fields do not decode is kept as
/// [`LoadCommand::Unknown`] with an inconsistency, and a total size that
/// disagrees with `sizeofcmds` is only recorded.
pub fn decode_load_commands<'data>(
    data: &'data [u8],
    header: &MachHeader,
) -> Result<DecodedCommands<'data>> {
    let endian = header.endian;
    let start = header.size();
    let region_end = start
        .checked_add(header.sizeofcmds as usize)
        .filter(|&end| end <= data.len())
        .ok_or(MachError::TruncatedFile {
            offset: start,
            needed: header.sizeofcmds as usize,
        })?;

    let mut commands = Vec::with_capacity(header.ncmds.min(1024) as usize);
    let mut inconsistencies = Vec::new();
    let mut off = start;

    for index in 0..header.ncmds {
        if off + 8 > region_end {
            return Err(MachError::TruncatedFile { offset: off, needed: 8 });
        }
        let cmd = data.read_u32(off, endian)?;
        let cmdsize = data.read_u32(off + 4, endian)?;
        if cmdsize < 8 {
            return Err(MachError::MalformedLoadCommand {
                index,
                message: format!("cmdsize {} is smaller than the command header", cmdsize),
            });
        }
        let end = off
            .checked_add(cmdsize as usize)
            .filter(|&end| end <= region_end)
            .ok_or(MachError::TruncatedFile {
                offset: off,
                needed: cmdsize as usize,
            })?;
        if cmdsize % 4 != 0 {
            inconsistencies.push(Inconsistency::at(
                off as u64,
                format!("{} cmdsize {} is not 4-byte aligned", load_command_name(cmd), cmdsize),
            ));
        }

        let body = &data[off..end];
        let command = match decode_command(body, cmd, header) {
            Ok(command) => command,
            Err(e) => {
                warn!(index, cmd = load_command_name(cmd), error = %e, "undecodable load command");
                inconsistencies.push(Inconsistency::at(
                    off as u64,
                    format!("{} kept as raw bytes: {}", load_command_name(cmd), e),
                ));
                LoadCommand::Unknown {
                    cmd,
                    cmdsize,
                    data: body,
                }
            }
        };
        debug!(index, cmd = load_command_name(cmd), cmdsize, "load command");

        commands.push(LoadCommandEntry {
            index,
            offset: off,
            cmd,
            cmdsize,
            command,
        });
        off = end;
    }

    let consumed = off - start;
    if consumed != header.sizeofcmds as usize {
        warn!(
            consumed,
            sizeofcmds = header.sizeofcmds,
            "load commands do not fill sizeofcmds"
        );
        inconsistencies.push(Inconsistency::new(format!(
            "load commands consume {} bytes but sizeofcmds is {}",
            consumed, header.sizeofcmds
        )));
    }

    Ok(DecodedCommands {
        commands,
        inconsistencies,
    })
}

/// Decode one command from its own bytes (`body` starts at `cmd`).
fn decode_command<'data>(
    body: &'data [u8],
    cmd: u32,
    header: &MachHeader,
) -> Result<LoadCommand<'data>> {
    let e = header.endian;
    let u32_at = |off: usize| body.read_u32(off, e);

    let command = match cmd {
        LC_SEGMENT | LC_SEGMENT_64 => {
            let class = if cmd == LC_SEGMENT_64 {
                MachClass::MachO64
            } else {
                MachClass::MachO32
            };
            LoadCommand::Segment(parse_segment(body, 0, body.len(), class, e)?)
        }
        LC_SYMTAB => LoadCommand::Symtab(SymtabCommand {
            symoff: u32_at(8)?,
            nsyms: u32_at(12)?,
            stroff: u32_at(16)?,
            strsize: u32_at(20)?,
        }),
        LC_DYSYMTAB => {
            let mut f = [0u32; 18];
            for (i, slot) in f.iter_mut().enumerate() {
                *slot = u32_at(8 + i * 4)?;
            }
            LoadCommand::Dysymtab(DysymtabCommand {
                ilocalsym: f[0],
                nlocalsym: f[1],
                iextdefsym: f[2],
                nextdefsym: f[3],
                iundefsym: f[4],
                nundefsym: f[5],
                tocoff: f[6],
                ntoc: f[7],
                modtaboff: f[8],
                nmodtab: f[9],
                extrefsymoff: f[10],
                nextrefsyms: f[11],
                indirectsymoff: f[12],
                nindirectsyms: f[13],
                extreloff: f[14],
                nextrel: f[15],
                locreloff: f[16],
                nlocrel: f[17],
            })
        }
        LC_CODE_SIGNATURE
        | LC_SEGMENT_SPLIT_INFO
        | LC_FUNCTION_STARTS
        | LC_DATA_IN_CODE
        | LC_DYLIB_CODE_SIGN_DRS
        | LC_LINKER_OPTIMIZATION_HINT
        | LC_DYLD_EXPORTS_TRIE
        | LC_DYLD_CHAINED_FIXUPS => LoadCommand::LinkEditData(LinkEditData {
            cmd,
            dataoff: u32_at(8)?,
            datasize: u32_at(12)?,
        }),
        LC_LOAD_DYLIB | LC_ID_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB
        | LC_LAZY_LOAD_DYLIB | LC_LOAD_UPWARD_DYLIB => LoadCommand::Dylib(DylibCommand {
            cmd,
            name: lc_str(body, u32_at(8)?)?,
            timestamp: u32_at(12)?,
            current_version: u32_at(16)?,
            compatibility_version: u32_at(20)?,
        }),
        LC_LOAD_DYLINKER | LC_ID_DYLINKER | LC_DYLD_ENVIRONMENT => LoadCommand::Dylinker {
            cmd,
            name: lc_str(body, u32_at(8)?)?,
        },
        LC_UUID => {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(body.read_bytes(8, 16)?);
            LoadCommand::Uuid(uuid)
        }
        LC_SOURCE_VERSION => LoadCommand::SourceVersion(SourceVersion(body.read_u64(8, e)?)),
        LC_BUILD_VERSION => {
            let ntools = u32_at(20)?;
            let mut tools = Vec::new();
            for i in 0..ntools as usize {
                let off = 24 + i * 8;
                if off + 8 > body.len() {
                    break;
                }
                tools.push(BuildTool {
                    tool: u32_at(off)?,
                    version: u32_at(off + 4)?,
                });
            }
            LoadCommand::BuildVersion(BuildVersionCommand {
                platform: u32_at(8)?,
                minos: u32_at(12)?,
                sdk: u32_at(16)?,
                tools,
            })
        }
        LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS
        | LC_VERSION_MIN_WATCHOS => LoadCommand::VersionMin(VersionMinCommand {
            cmd,
            version: u32_at(8)?,
            sdk: u32_at(12)?,
        }),
        LC_MAIN => LoadCommand::EntryPoint(EntryPointCommand {
            entryoff: body.read_u64(8, e)?,
            stacksize: body.read_u64(16, e)?,
        }),
        LC_RPATH => LoadCommand::Rpath(lc_str(body, u32_at(8)?)?),
        LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
            LoadCommand::EncryptionInfo(EncryptionInfoCommand {
                cmd,
                cryptoff: u32_at(8)?,
                cryptsize: u32_at(12)?,
                cryptid: u32_at(16)?,
            })
        }
        LC_DYLD_INFO | LC_DYLD_INFO_ONLY => LoadCommand::DyldInfo(DyldInfoCommand {
            cmd,
            rebase_off: u32_at(8)?,
            rebase_size: u32_at(12)?,
            bind_off: u32_at(16)?,
            bind_size: u32_at(20)?,
            weak_bind_off: u32_at(24)?,
            weak_bind_size: u32_at(28)?,
            lazy_bind_off: u32_at(32)?,
            lazy_bind_size: u32_at(36)?,
            export_off: u32_at(40)?,
            export_size: u32_at(44)?,
        }),
        _ => LoadCommand::Unknown {
            cmd,
            cmdsize: body.len() as u32,
            data: body,
        },
    };
    Ok(command)
}

/// Read an `lc_str` whose offset is relative to the command start.
fn lc_str(body: &[u8], name_off: u32) -> Result<String> {
    let name_off = name_off as usize;
    if name_off >= body.len() {
        return Err(MachError::TruncatedFile {
            offset: name_off,
            needed: 1,
        });
    }
    read_cstring(body, name_off, MAX_LC_STR)
}
