//! Requirement Set decoding and a best-effort `csreq` expression decompiler

use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, trace};

use super::superblob::{Blob, BE};
use super::*;
use crate::formats::macho::types::{MachError, Result};
use crate::formats::macho::utils::{align_up, EndianRead};

const REQUIREMENT_SET_HEADER_SIZE: usize = 12;
const REQUIREMENT_HEADER_SIZE: usize = 12;
const MAX_EXPRESSION_DEPTH: usize = 64;

/// Expression form of a requirement (`kind` field)
pub const EXPR_FORM: u32 = 1;

const OP_FLAG_MASK: u32 = 0xff00_0000;
const OP_GENERIC_SKIP: u32 = 0x4000_0000;

/// Requirement type names by index type
pub fn requirement_type_name(kind: u32) -> &'static str {
    match kind {
        1 => "host",
        2 => "guest",
        3 => "designated",
        4 => "library",
        5 => "plugin",
        _ => "unknown",
    }
}

/// One entry of the Requirement Set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub index: usize,
    pub req_type: u32,
    pub offset: u32,
    /// Bytes up to the next entry or the end of the set
    pub length: u32,
    /// `kind` of the embedded requirement blob (1 = expression)
    pub kind: Option<u32>,
    /// Decompiled expression text, when decoding succeeded
    pub detail: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl Requirement {
    pub fn type_name(&self) -> &'static str {
        requirement_type_name(self.req_type)
    }
}

/// Decoded Requirement Set blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequirementSet {
    /// Blob length including the header
    pub length: u32,
    /// Bytes following the set header
    pub payload_length: u32,
    pub count: u32,
    pub requirements: Vec<Requirement>,
    /// Local failures; entries decoded before them are kept
    #[serde(skip)]
    pub errors: Vec<MachError>,
}

impl RequirementSet {
    pub fn from_blob(blob: &Blob<'_>) -> Result<Self> {
        Self::parse(blob.bytes)
    }

    /// Decode the set header and every entry.
    ///
    /// Entry lengths are derived from the offsets of the other entries, which
    /// need not be sorted.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let magic = bytes.read_u32(0, BE)?;
        if magic != CSMAGIC_REQUIREMENTS {
            return Err(MachError::CorruptRequirement {
                index: 0,
                message: format!("unexpected requirement set magic {:#010x}", magic),
            });
        }
        let length = bytes.read_u32(4, BE)?;
        let count = bytes.read_u32(8, BE)?;
        let end = (length as usize).min(bytes.len());

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for i in 0..count as usize {
            let off = REQUIREMENT_SET_HEADER_SIZE + i * 8;
            match (bytes.read_u32(off, BE), bytes.read_u32(off + 4, BE)) {
                (Ok(t), Ok(o)) if off + 8 <= end => entries.push((t, o)),
                _ => {
                    errors.push(MachError::CorruptRequirement {
                        index: i,
                        message: format!("index entry at {:#x} is outside the set", off),
                    });
                    break;
                }
            }
        }

        let mut requirements = Vec::with_capacity(entries.len());
        for (index, &(req_type, offset)) in entries.iter().enumerate() {
            let next = entries
                .iter()
                .map(|&(_, o)| o)
                .filter(|&o| o > offset)
                .min()
                .unwrap_or(end as u32);
            let start = offset as usize;
            let stop = next as usize;
            if start < REQUIREMENT_SET_HEADER_SIZE || start >= stop || stop > end {
                errors.push(MachError::CorruptRequirement {
                    index,
                    message: format!("offset {:#x} outside the requirement set", offset),
                });
                continue;
            }
            let chunk = &bytes[start..stop];
            let (kind, detail) = match decode_requirement(chunk) {
                Ok((kind, text)) => (Some(kind), Some(text)),
                Err(message) => {
                    debug!(index, %message, "requirement not decoded");
                    errors.push(MachError::CorruptRequirement { index, message });
                    (chunk.read_u32(8, BE).ok(), None)
                }
            };
            requirements.push(Requirement {
                index,
                req_type,
                offset,
                length: next - offset,
                kind,
                detail,
                bytes: chunk.to_vec(),
            });
        }

        Ok(Self {
            length,
            payload_length: length.saturating_sub(REQUIREMENT_SET_HEADER_SIZE as u32),
            count,
            requirements,
            errors,
        })
    }
}

/// Decode a single requirement blob into `(kind, text)`
fn decode_requirement(chunk: &[u8]) -> std::result::Result<(u32, String), String> {
    let magic = chunk
        .read_u32(0, BE)
        .map_err(|_| "requirement header truncated".to_string())?;
    if magic != CSMAGIC_REQUIREMENT {
        return Err(format!("unexpected requirement magic {:#010x}", magic));
    }
    let length = chunk.read_u32(4, BE).map_err(|e| e.to_string())? as usize;
    if length < REQUIREMENT_HEADER_SIZE || length > chunk.len() {
        return Err(format!(
            "requirement length {} does not fit in {} bytes",
            length,
            chunk.len()
        ));
    }
    let kind = chunk.read_u32(8, BE).map_err(|e| e.to_string())?;
    if kind != EXPR_FORM {
        return Ok((kind, format!("<requirement kind {}>", kind)));
    }
    let mut decompiler = Decompiler {
        data: &chunk[..length],
        pos: REQUIREMENT_HEADER_SIZE,
    };
    let text = decompiler.expression(0)?;
    Ok((kind, text.text))
}

/// Binding strength of a decompiled sub-expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Or,
    And,
    Not,
    Primary,
}

struct Expr {
    text: String,
    prec: Precedence,
}

impl Expr {
    fn primary(text: String) -> Self {
        Self {
            text,
            prec: Precedence::Primary,
        }
    }

    fn wrapped(self, min: Precedence) -> String {
        if self.prec < min {
            format!("({})", self.text)
        } else {
            self.text
        }
    }
}

/// Recursive-descent reader over a `csreq` expression
pub(crate) struct Decompiler<'a> {
    data: &'a [u8],
    pos: usize,
}

type DecodeResult<T> = std::result::Result<T, String>;

impl<'a> Decompiler<'a> {
    fn u32(&mut self) -> DecodeResult<u32> {
        let v = self
            .data
            .read_u32(self.pos, BE)
            .map_err(|_| format!("expression truncated at {:#x}", self.pos))?;
        self.pos += 4;
        Ok(v)
    }

    fn i32(&mut self) -> DecodeResult<i32> {
        self.u32().map(|v| v as i32)
    }

    fn u64(&mut self) -> DecodeResult<u64> {
        let v = self
            .data
            .read_u64(self.pos, BE)
            .map_err(|_| format!("expression truncated at {:#x}", self.pos))?;
        self.pos += 8;
        Ok(v)
    }

    /// Length-prefixed value padded to four bytes
    fn data(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.u32()? as usize;
        let bytes = self
            .data
            .read_bytes(self.pos, len)
            .map_err(|_| format!("data of {} bytes overruns expression", len))?;
        self.pos = align_up((self.pos + len) as u64, 4) as usize;
        Ok(bytes)
    }

    fn expression(&mut self, depth: usize) -> DecodeResult<Expr> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err("expression nesting too deep".to_string());
        }
        let raw = self.u32()?;
        let op = raw & !OP_FLAG_MASK;
        trace!(op, pos = self.pos, "csreq opcode");

        let expr = match op {
            0 => Expr::primary("never".to_string()),
            1 => Expr::primary("always".to_string()),
            2 => Expr::primary(format!("identifier {}", quoted(self.data()?))),
            3 => Expr::primary("anchor apple".to_string()),
            4 => {
                let slot = cert_slot(self.i32()?);
                Expr::primary(format!("certificate {} = {}", slot, hash_literal(self.data()?)))
            }
            5 => {
                let key = key_name(self.data()?);
                Expr::primary(format!("info[{}] = {}", key, quoted(self.data()?)))
            }
            6 | 7 => {
                let (prec, word) = if op == 6 {
                    (Precedence::And, "and")
                } else {
                    (Precedence::Or, "or")
                };
                let lhs = self.expression(depth + 1)?.wrapped(prec);
                let rhs = self.expression(depth + 1)?;
                // Right operand of the same operator needs grouping to keep tree shape
                let rhs = if rhs.prec <= prec && rhs.prec != Precedence::Primary {
                    format!("({})", rhs.text)
                } else {
                    rhs.text
                };
                Expr {
                    text: format!("{} {} {}", lhs, word, rhs),
                    prec,
                }
            }
            8 => Expr::primary(format!("cdhash {}", hash_literal(self.data()?))),
            9 => {
                let inner = self.expression(depth + 1)?.wrapped(Precedence::Not);
                Expr {
                    text: format!("! {}", inner),
                    prec: Precedence::Not,
                }
            }
            10 => {
                let key = key_name(self.data()?);
                let m = self.match_suffix()?;
                Expr::primary(format!("info[{}]{}", key, m))
            }
            11 => {
                let slot = cert_slot(self.i32()?);
                let field = key_name(self.data()?);
                let m = self.match_suffix()?;
                Expr::primary(format!("certificate {}[{}]{}", slot, field, m))
            }
            12 => Expr::primary(format!("certificate {} trusted", cert_slot(self.i32()?))),
            13 => Expr::primary("anchor trusted".to_string()),
            14 | 17 => {
                let slot = cert_slot(self.i32()?);
                let oid = decode_oid(self.data()?);
                let m = self.match_suffix()?;
                let prefix = if op == 14 { "field" } else { "policy" };
                Expr::primary(format!("certificate {}[{}.{}]{}", slot, prefix, oid, m))
            }
            15 => Expr::primary("anchor apple generic".to_string()),
            16 => {
                let key = key_name(self.data()?);
                let m = self.match_suffix()?;
                Expr::primary(format!("entitlement[{}]{}", key, m))
            }
            18 => Expr::primary(format!("anchor apple {}", quoted(self.data()?))),
            19 => Expr::primary(format!("({})", quoted(self.data()?))),
            20 => Expr::primary(format!("platform = {}", self.u32()?)),
            21 => Expr::primary("notarized".to_string()),
            22 => Expr::primary("legacy".to_string()),
            _ if raw & OP_GENERIC_SKIP != 0 => {
                let skipped = self.data()?.len();
                Expr::primary(format!("/* unknown opcode {:#x}, {} bytes */", op, skipped))
            }
            _ => return Err(format!("unknown opcode {:#x}", raw)),
        };
        Ok(expr)
    }

    /// Match operation following a field selector
    fn match_suffix(&mut self) -> DecodeResult<String> {
        let op = self.u32()?;
        let s = match op {
            0 => " /* exists */".to_string(),
            1 => format!(" = {}", quoted(self.data()?)),
            2 => format!(" ~ {}", quoted(self.data()?)),
            3 => format!(" = {}*", quoted(self.data()?)),
            4 => format!(" = *{}", quoted(self.data()?)),
            5 => format!(" < {}", quoted(self.data()?)),
            6 => format!(" > {}", quoted(self.data()?)),
            7 => format!(" <= {}", quoted(self.data()?)),
            8 => format!(" >= {}", quoted(self.data()?)),
            9..=13 => {
                let symbol = ["=", "<", ">", "<=", ">="][(op - 9) as usize];
                format!(" {} timestamp \"{}\"", symbol, self.u64()? as i64)
            }
            14 => " absent".to_string(),
            other => return Err(format!("unknown match operation {}", other)),
        };
        Ok(s)
    }
}

fn cert_slot(slot: i32) -> String {
    match slot {
        0 => "leaf".to_string(),
        -1 => "root".to_string(),
        n => n.to_string(),
    }
}

/// Render a value as a quoted string, or hex when it is not printable text
fn quoted(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        _ => hash_literal(bytes),
    }
}

/// Subscript key: bare when it is a dotted name, quoted otherwise
fn key_name(bytes: &[u8]) -> String {
    let bare = !bytes.is_empty()
        && !bytes[0].is_ascii_digit()
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_');
    match std::str::from_utf8(bytes) {
        Ok(s) if bare => s.to_string(),
        _ => quoted(bytes),
    }
}

fn hash_literal(bytes: &[u8]) -> String {
    format!("H\"{}\"", hex::encode(bytes))
}

/// Dotted form of DER object identifier contents
fn decode_oid(bytes: &[u8]) -> String {
    let mut arcs: Vec<u64> = Vec::new();
    let mut acc: u64 = 0;
    for &b in bytes {
        acc = (acc << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (acc / 40).min(2);
                arcs.push(first);
                arcs.push(acc - first * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        }
    }
    let mut out = String::new();
    for (i, arc) in arcs.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        let _ = write!(out, "{}", arc);
    }
    out
}
