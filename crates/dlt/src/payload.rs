//! Verbose argument decoding and encoding

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Type info bits of a verbose argument
pub mod type_info {
    pub const TYLE_MASK: u32 = 0x0F;
    pub const BOOL: u32 = 0x10;
    pub const SINT: u32 = 0x20;
    pub const UINT: u32 = 0x40;
    pub const FLOA: u32 = 0x80;
    pub const ARAY: u32 = 0x100;
    pub const STRG: u32 = 0x200;
    pub const RAWD: u32 = 0x400;
    pub const VARI: u32 = 0x800;
    pub const FIXP: u32 = 0x1000;
    pub const TRAI: u32 = 0x2000;
    pub const STRU: u32 = 0x4000;
    pub const SCOD_MASK: u32 = 0x38000;
    pub const SCOD_SHIFT: u32 = 15;
}

use type_info::*;

/// Argument value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    String(String),
    /// Raw data, 128-bit integers and half-precision floats
    Raw(#[serde(serialize_with = "serialize_hex")] Bytes),
}

fn serialize_hex<S: serde::Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex(bytes))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Raw(v) => f.write_str(&hex(v)),
        }
    }
}

/// One verbose argument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Argument {
    pub name: Option<String>,
    pub unit: Option<String>,
    pub value: Value,
}

impl Argument {
    pub fn new(value: Value) -> Self {
        Self {
            name: None,
            unit: None,
            value,
        }
    }

    pub fn named(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: Some(name.into()),
            unit: None,
            value,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum ArgumentError {
    #[error("argument truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("unsupported type info {0:#010x}")]
    Unsupported(u32),

    #[error("invalid integer width {0}")]
    Width(usize),
}

/// Bounds-checked reader in the payload's byte order
struct Reader<'a> {
    buf: &'a [u8],
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ArgumentError> {
        if self.buf.len() < n {
            return Err(ArgumentError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ArgumentError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        if !self.big_endian {
            out.reverse();
        }
        // `out` is now big endian regardless of the wire order
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ArgumentError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ArgumentError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Unsigned integer of `width` bytes, widened to u64
    fn unsigned(&mut self, width: usize) -> Result<u64, ArgumentError> {
        Ok(match width {
            1 => u64::from(self.take(1)?[0]),
            2 => u64::from(self.u16()?),
            4 => u64::from(self.u32()?),
            8 => u64::from_be_bytes(self.array()?),
            other => return Err(ArgumentError::Width(other)),
        })
    }

    /// Signed integer of `width` bytes, sign extended to i64
    fn signed(&mut self, width: usize) -> Result<i64, ArgumentError> {
        let raw = self.unsigned(width)?;
        let shift = 64 - 8 * width as u32;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Length-prefixed string, NUL terminator removed
    fn string(&mut self, len: usize) -> Result<String, ArgumentError> {
        let bytes = self.take(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// Width in bytes encoded by `TYLE`
fn type_length(info: u32) -> Option<usize> {
    match info & TYLE_MASK {
        1 => Some(1),
        2 => Some(2),
        3 => Some(4),
        4 => Some(8),
        5 => Some(16),
        _ => None,
    }
}

/// Decode up to `count` arguments
///
/// Returns what was decoded before the first failure together with the error.
pub(crate) fn decode_arguments(
    data: &[u8],
    count: u8,
    big_endian: bool,
) -> (Vec<Argument>, Option<ArgumentError>) {
    let mut reader = Reader {
        buf: data,
        big_endian,
    };
    let mut arguments = Vec::with_capacity(usize::from(count));

    for _ in 0..count {
        match decode_argument(&mut reader) {
            Ok(argument) => arguments.push(argument),
            Err(e) => return (arguments, Some(e)),
        }
    }
    (arguments, None)
}

fn decode_argument(reader: &mut Reader<'_>) -> Result<Argument, ArgumentError> {
    let info = reader.u32()?;
    if info & (ARAY | STRU) != 0 {
        return Err(ArgumentError::Unsupported(info));
    }
    let named = info & VARI != 0;

    if info & (STRG | RAWD | TRAI) != 0 {
        let len = usize::from(reader.u16()?);
        let name = if named && info & TRAI == 0 {
            let name_len = usize::from(reader.u16()?);
            Some(reader.string(name_len)?)
        } else {
            None
        };
        let value = if info & RAWD != 0 {
            Value::Raw(Bytes::copy_from_slice(reader.take(len)?))
        } else {
            Value::String(reader.string(len)?)
        };
        return Ok(Argument {
            name,
            unit: None,
            value,
        });
    }

    if info & BOOL != 0 {
        let name = if named {
            let name_len = usize::from(reader.u16()?);
            Some(reader.string(name_len)?)
        } else {
            None
        };
        let width = type_length(info).unwrap_or(1);
        let value = reader.take(width)?.iter().any(|&b| b != 0);
        return Ok(Argument {
            name,
            unit: None,
            value: Value::Bool(value),
        });
    }

    if info & (SINT | UINT | FLOA) != 0 {
        let width = type_length(info).ok_or(ArgumentError::Unsupported(info))?;
        let (name, unit) = if named {
            let name_len = usize::from(reader.u16()?);
            let unit_len = usize::from(reader.u16()?);
            let name = reader.string(name_len)?;
            let unit = reader.string(unit_len)?;
            (Some(name), (!unit.is_empty()).then_some(unit))
        } else {
            (None, None)
        };

        let scaling = if info & FIXP != 0 && info & FLOA == 0 {
            let quantization = f64::from(f32::from_bits(reader.u32()?));
            let offset = match width {
                16 => return Err(ArgumentError::Unsupported(info)),
                8 => reader.signed(8)? as f64,
                _ => reader.signed(4)? as f64,
            };
            Some((quantization, offset))
        } else {
            None
        };

        let value = if width == 16 || (info & FLOA != 0 && width == 2) {
            let mut bytes = reader.take(width)?.to_vec();
            if !reader.big_endian {
                bytes.reverse();
            }
            Value::Raw(Bytes::from(bytes))
        } else if info & FLOA != 0 {
            match width {
                4 => Value::Float(f64::from(f32::from_bits(reader.u32()?))),
                8 => Value::Float(f64::from_bits(reader.unsigned(8)?)),
                _ => return Err(ArgumentError::Unsupported(info)),
            }
        } else if info & SINT != 0 {
            Value::Signed(reader.signed(width)?)
        } else {
            Value::Unsigned(reader.unsigned(width)?)
        };

        let value = match (scaling, &value) {
            (Some((q, o)), Value::Signed(v)) => Value::Float(*v as f64 * q + o),
            (Some((q, o)), Value::Unsigned(v)) => Value::Float(*v as f64 * q + o),
            _ => value,
        };
        return Ok(Argument { name, unit, value });
    }

    Err(ArgumentError::Unsupported(info))
}

/// Render decoded arguments the way log viewers show them
pub(crate) fn render(arguments: &[Argument]) -> String {
    arguments
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Printable rendering of non-verbose data
pub(crate) fn printable(data: &[u8]) -> Option<String> {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let data = &data[..end];
    if data.is_empty() {
        return None;
    }
    let printable = data
        .iter()
        .all(|&b| b.is_ascii_graphic() || b == b' ' || b == b'\t' || b == b'\n' || b == b'\r');
    printable.then(|| String::from_utf8_lossy(data).into_owned())
}

struct Writer<'a> {
    buf: &'a mut BytesMut,
    big_endian: bool,
}

impl Writer<'_> {
    fn u16(&mut self, v: u16) {
        if self.big_endian {
            self.buf.put_u16(v)
        } else {
            self.buf.put_u16_le(v)
        }
    }

    fn u32(&mut self, v: u32) {
        if self.big_endian {
            self.buf.put_u32(v)
        } else {
            self.buf.put_u32_le(v)
        }
    }

    fn u64(&mut self, v: u64) {
        if self.big_endian {
            self.buf.put_u64(v)
        } else {
            self.buf.put_u64_le(v)
        }
    }

    fn text(&mut self, s: &str) {
        self.u16((s.len() + 1) as u16);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }
}

/// Append one argument in verbose wire format
pub(crate) fn encode_argument(argument: &Argument, big_endian: bool, buf: &mut BytesMut) {
    let mut w = Writer { buf, big_endian };
    let vari = if argument.name.is_some() { VARI } else { 0 };
    let name = argument.name.as_deref().unwrap_or_default();
    let unit = argument.unit.as_deref().unwrap_or_default();

    let numeric_names = |w: &mut Writer<'_>| {
        if vari != 0 {
            w.u16((name.len() + 1) as u16);
            w.u16((unit.len() + 1) as u16);
            for s in [name, unit] {
                w.buf.put_slice(s.as_bytes());
                w.buf.put_u8(0);
            }
        }
    };

    match &argument.value {
        Value::String(s) => {
            w.u32(STRG | vari);
            w.u16((s.len() + 1) as u16);
            if vari != 0 {
                w.text(name);
            }
            w.buf.put_slice(s.as_bytes());
            w.buf.put_u8(0);
        }
        Value::Raw(data) => {
            w.u32(RAWD | vari);
            w.u16(data.len() as u16);
            if vari != 0 {
                w.text(name);
            }
            w.buf.put_slice(data);
        }
        Value::Bool(v) => {
            w.u32(BOOL | 1 | vari);
            if vari != 0 {
                w.text(name);
            }
            w.buf.put_u8(u8::from(*v));
        }
        Value::Signed(v) => match i32::try_from(*v) {
            Ok(small) => {
                w.u32(SINT | 3 | vari);
                numeric_names(&mut w);
                w.u32(small as u32);
            }
            Err(_) => {
                w.u32(SINT | 4 | vari);
                numeric_names(&mut w);
                w.u64(*v as u64);
            }
        },
        Value::Unsigned(v) => match u32::try_from(*v) {
            Ok(small) => {
                w.u32(UINT | 3 | vari);
                numeric_names(&mut w);
                w.u32(small);
            }
            Err(_) => {
                w.u32(UINT | 4 | vari);
                numeric_names(&mut w);
                w.u64(*v);
            }
        },
        Value::Float(v) => {
            w.u32(FLOA | 4 | vari);
            numeric_names(&mut w);
            w.u64(v.to_bits());
        }
    }
}
