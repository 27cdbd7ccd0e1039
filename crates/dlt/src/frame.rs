//! DLT frame model
//!
//! Frames are produced by [`crate::DltCodec`] and never mutated afterwards;
//! every field is read through an accessor.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

use crate::payload::Argument;

/// Pattern every storage header starts with
pub const STORAGE_PATTERN: [u8; 4] = *b"DLT\x01";
pub const STORAGE_HEADER_LEN: usize = 16;
pub const STANDARD_HEADER_LEN: usize = 4;
pub const EXTENDED_HEADER_LEN: usize = 10;

/// Header type (`HTYP`) flags
pub mod htyp {
    pub const UEH: u8 = 0x01;
    pub const MSBF: u8 = 0x02;
    pub const WEID: u8 = 0x04;
    pub const WSID: u8 = 0x08;
    pub const WTMS: u8 = 0x10;
    pub const VERSION_MASK: u8 = 0xE0;
    pub const VERSION_SHIFT: u8 = 5;
}

/// Length of the standard header including its optional fields
pub fn standard_header_len(header_type: u8) -> usize {
    let mut len = STANDARD_HEADER_LEN;
    if header_type & htyp::WEID != 0 {
        len += 4;
    }
    if header_type & htyp::WSID != 0 {
        len += 4;
    }
    if header_type & htyp::WTMS != 0 {
        len += 4;
    }
    len
}

/// Decode a four-character identifier, dropping NUL padding
pub(crate) fn read_id(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a four-character identifier, NUL padded and truncated to four bytes
pub(crate) fn write_id(id: &str) -> [u8; 4] {
    let mut out = [0u8; 4];
    for (slot, byte) in out.iter_mut().zip(id.bytes()) {
        *slot = byte;
    }
    out
}

/// Storage header prepended by loggers and DLT files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageHeader {
    pub seconds: u32,
    pub microseconds: i32,
    pub ecu: String,
}

impl StorageHeader {
    pub(crate) fn parse(bytes: &[u8]) -> Self {
        Self {
            seconds: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            microseconds: i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            ecu: read_id(&bytes[12..16]),
        }
    }

    /// Reception time recorded by the logger
    pub fn time(&self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.microseconds).ok()?.checked_mul(1000)?;
        Utc.timestamp_opt(i64::from(self.seconds), nanos).single()
    }
}

/// Message type from the extended header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Log,
    AppTrace,
    NwTrace,
    Control,
    Unknown(u8),
}

impl MessageType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => MessageType::Log,
            1 => MessageType::AppTrace,
            2 => MessageType::NwTrace,
            3 => MessageType::Control,
            other => MessageType::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            MessageType::Log => 0,
            MessageType::AppTrace => 1,
            MessageType::NwTrace => 2,
            MessageType::Control => 3,
            MessageType::Unknown(raw) => raw & 0x07,
        }
    }

    /// Textual name of a subtype of this message type, if standardized
    pub fn subtype_name(self, subtype: u8) -> Option<&'static str> {
        let names: &[&str] = match self {
            MessageType::Log => &["fatal", "error", "warn", "info", "debug", "verbose"],
            MessageType::AppTrace => &["variable", "function_in", "function_out", "state", "vfb"],
            MessageType::NwTrace => &["ipc", "can", "flexray", "most", "ethernet", "someip"],
            MessageType::Control => &["request", "response", "time"],
            MessageType::Unknown(_) => &[],
        };
        subtype
            .checked_sub(1)
            .and_then(|i| names.get(usize::from(i)))
            .copied()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Log => write!(f, "log"),
            MessageType::AppTrace => write!(f, "app_trace"),
            MessageType::NwTrace => write!(f, "nw_trace"),
            MessageType::Control => write!(f, "control"),
            MessageType::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// Log level subtype of [`MessageType::Log`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
}

impl LogLevel {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => LogLevel::Fatal,
            2 => LogLevel::Error,
            3 => LogLevel::Warn,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            6 => LogLevel::Verbose,
            _ => return None,
        })
    }
}

/// Extended header: message info plus application and context IDs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtendedHeader {
    pub verbose: bool,
    pub message_type: MessageType,
    pub subtype: u8,
    pub argument_count: u8,
    pub apid: String,
    pub ctid: String,
}

impl ExtendedHeader {
    pub(crate) fn parse(bytes: &[u8]) -> Self {
        let msin = bytes[0];
        Self {
            verbose: msin & 0x01 != 0,
            message_type: MessageType::from_raw((msin >> 1) & 0x07),
            subtype: msin >> 4,
            argument_count: bytes[1],
            apid: read_id(&bytes[2..6]),
            ctid: read_id(&bytes[6..10]),
        }
    }

    pub(crate) fn message_info(&self) -> u8 {
        u8::from(self.verbose) | (self.message_type.raw() << 1) | (self.subtype << 4)
    }
}

/// Decoded payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    #[serde(skip)]
    pub(crate) raw: Bytes,
    pub(crate) message_id: Option<u32>,
    pub(crate) arguments: Vec<Argument>,
    pub(crate) text: Option<String>,
}

impl Payload {
    /// Payload bytes exactly as received
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Message ID of a non-verbose payload
    pub fn message_id(&self) -> Option<u32> {
        self.message_id
    }

    /// Non-verbose data following the message ID
    pub fn data(&self) -> &[u8] {
        match self.message_id {
            Some(_) => self.raw.get(4..).unwrap_or_default(),
            None => &self.raw,
        }
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Printable rendering, when the payload has one
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// One decoded DLT message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DltFrame {
    pub(crate) storage: Option<StorageHeader>,
    pub(crate) header_type: u8,
    pub(crate) counter: u8,
    pub(crate) length: u16,
    pub(crate) ecu: Option<String>,
    pub(crate) session_id: Option<u32>,
    pub(crate) timestamp: Option<u32>,
    pub(crate) extended: Option<ExtendedHeader>,
    pub(crate) payload: Payload,
}

impl DltFrame {
    pub fn storage_header(&self) -> Option<&StorageHeader> {
        self.storage.as_ref()
    }

    pub fn header_type(&self) -> u8 {
        self.header_type
    }

    pub fn version(&self) -> u8 {
        (self.header_type & htyp::VERSION_MASK) >> htyp::VERSION_SHIFT
    }

    /// Payload is big endian (`MSBF`)
    pub fn is_big_endian(&self) -> bool {
        self.header_type & htyp::MSBF != 0
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// Message length from the standard header, headers included
    pub fn length(&self) -> u16 {
        self.length
    }

    /// ECU ID from the standard header, falling back to the storage header
    pub fn ecu(&self) -> &str {
        self.ecu
            .as_deref()
            .or(self.storage.as_ref().map(|s| s.ecu.as_str()))
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Timestamp in 0.1 ms ticks since ECU startup
    pub fn timestamp(&self) -> Option<u32> {
        self.timestamp
    }

    pub fn timestamp_secs(&self) -> Option<f64> {
        self.timestamp.map(|ticks| f64::from(ticks) / 10_000.0)
    }

    pub fn extended_header(&self) -> Option<&ExtendedHeader> {
        self.extended.as_ref()
    }

    pub fn apid(&self) -> &str {
        self.extended.as_ref().map(|e| e.apid.as_str()).unwrap_or_default()
    }

    pub fn ctid(&self) -> &str {
        self.extended.as_ref().map(|e| e.ctid.as_str()).unwrap_or_default()
    }

    pub fn is_verbose(&self) -> bool {
        self.extended.as_ref().is_some_and(|e| e.verbose)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.extended.as_ref().map(|e| e.message_type)
    }

    pub fn subtype(&self) -> Option<u8> {
        self.extended.as_ref().map(|e| e.subtype)
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        match self.extended.as_ref()? {
            e if e.message_type == MessageType::Log => LogLevel::from_raw(e.subtype),
            _ => None,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Payload text, or a lossy rendering of the raw bytes
    pub fn text(&self) -> Cow<'_, str> {
        match self.payload.text() {
            Some(text) => Cow::Borrowed(text),
            None => String::from_utf8_lossy(self.payload.data()),
        }
    }
}

impl fmt::Display for DltFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self
            .timestamp_secs()
            .map(|s| format!("{:.4}", s))
            .unwrap_or_else(|| "-".to_string());
        let kind = match (self.message_type(), self.subtype()) {
            (Some(t), Some(s)) => match t.subtype_name(s) {
                Some(name) => format!("{} {}", t, name),
                None => format!("{} {}", t, s),
            },
            _ => "-".to_string(),
        };
        write!(
            f,
            "{} {:>3} {} {:<4} {:<4} {} {}",
            time,
            self.counter,
            self.ecu(),
            self.apid(),
            self.ctid(),
            kind,
            self.text()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_header_len_follows_flags() {
        assert_eq!(standard_header_len(0), 4);
        assert_eq!(standard_header_len(htyp::WEID), 8);
        assert_eq!(standard_header_len(htyp::WEID | htyp::WSID | htyp::WTMS), 16);
        assert_eq!(standard_header_len(htyp::UEH | htyp::MSBF), 4);
    }

    #[test]
    fn test_ids_are_nul_padded() {
        assert_eq!(write_id("AB"), *b"AB\0\0");
        assert_eq!(write_id("TOOLONG"), *b"TOOL");
        assert_eq!(read_id(b"AB\0\0"), "AB");
        assert_eq!(read_id(b"ECU1"), "ECU1");
    }

    #[test]
    fn test_message_info_round_trip() {
        let header = ExtendedHeader {
            verbose: true,
            message_type: MessageType::Log,
            subtype: LogLevel::Warn as u8,
            argument_count: 2,
            apid: "APP".into(),
            ctid: "CTX".into(),
        };
        assert_eq!(header.message_info(), 0x31);

        let mut bytes = vec![header.message_info(), 2];
        bytes.extend_from_slice(&write_id("APP"));
        bytes.extend_from_slice(&write_id("CTX"));
        assert_eq!(ExtendedHeader::parse(&bytes), header);
    }

    #[test]
    fn test_subtype_names() {
        assert_eq!(MessageType::Log.subtype_name(4), Some("info"));
        assert_eq!(MessageType::Control.subtype_name(2), Some("response"));
        assert_eq!(MessageType::Log.subtype_name(0), None);
        assert_eq!(MessageType::Unknown(7).subtype_name(1), None);
    }

    #[test]
    fn test_storage_header_time() {
        let mut bytes = STORAGE_PATTERN.to_vec();
        bytes.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        bytes.extend_from_slice(&250_000i32.to_le_bytes());
        bytes.extend_from_slice(b"ECU1");

        let header = StorageHeader::parse(&bytes);
        assert_eq!(header.ecu, "ECU1");
        let time = header.time().unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert_eq!(time.timestamp_subsec_micros(), 250_000);
    }
}
