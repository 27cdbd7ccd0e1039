//! Encoder for synthetic DLT messages

use bytes::{BufMut, BytesMut};
use chrono::Utc;

use crate::frame::{
    htyp, write_id, ExtendedHeader, LogLevel, MessageType, StorageHeader, EXTENDED_HEADER_LEN,
    STANDARD_HEADER_LEN, STORAGE_PATTERN,
};
use crate::payload::{encode_argument, Argument, Value};
use itf_common::{Error, Result};

const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone)]
enum Body {
    Verbose(Vec<Argument>),
    NonVerbose { message_id: u32, data: Vec<u8> },
}

/// Builds the wire bytes of one DLT message
///
/// ```
/// use itf_dlt::{FrameBuilder, LogLevel};
///
/// let frame = FrameBuilder::log("APP1", "CTX1", LogLevel::Info)
///     .timestamp(42)
///     .text("hello");
/// let bytes = itf_dlt::codec::encode(&frame).unwrap();
/// assert_eq!(bytes[0] & 0x01, 0x01);
/// ```
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    storage: Option<StorageHeader>,
    ecu: Option<String>,
    counter: u8,
    session_id: Option<u32>,
    timestamp: Option<u32>,
    big_endian: bool,
    extended: Option<(MessageType, u8, String, String)>,
    body: Body,
}

impl FrameBuilder {
    /// Verbose log message with no arguments yet
    pub fn log(apid: &str, ctid: &str, level: LogLevel) -> Self {
        Self::new(MessageType::Log, level as u8, apid, ctid)
    }

    pub fn new(message_type: MessageType, subtype: u8, apid: &str, ctid: &str) -> Self {
        Self {
            storage: None,
            ecu: Some("ECU1".to_string()),
            counter: 0,
            session_id: None,
            timestamp: None,
            big_endian: false,
            extended: Some((message_type, subtype, apid.to_string(), ctid.to_string())),
            body: Body::Verbose(Vec::new()),
        }
    }

    pub fn ecu(mut self, ecu: &str) -> Self {
        self.ecu = Some(ecu.to_string());
        self
    }

    pub fn without_ecu(mut self) -> Self {
        self.ecu = None;
        self
    }

    pub fn counter(mut self, counter: u8) -> Self {
        self.counter = counter;
        self
    }

    pub fn session_id(mut self, session_id: u32) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn timestamp(mut self, ticks: u32) -> Self {
        self.timestamp = Some(ticks);
        self
    }

    pub fn big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    /// Drop the extended header; the payload is then sent non-verbose
    pub fn without_extended_header(mut self) -> Self {
        self.extended = None;
        self
    }

    pub fn arg(self, value: Value) -> Self {
        self.argument(Argument::new(value))
    }

    pub fn argument(mut self, argument: Argument) -> Self {
        match &mut self.body {
            Body::Verbose(arguments) => arguments.push(argument),
            Body::NonVerbose { .. } => self.body = Body::Verbose(vec![argument]),
        }
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.arg(Value::String(text.into()))
    }

    /// Non-verbose payload: message ID followed by opaque data
    pub fn non_verbose(mut self, message_id: u32, data: Vec<u8>) -> Self {
        self.body = Body::NonVerbose { message_id, data };
        self
    }

    pub fn storage_header(mut self, seconds: u32, microseconds: i32) -> Self {
        let ecu = self.ecu.clone().unwrap_or_default();
        self.storage = Some(StorageHeader {
            seconds,
            microseconds,
            ecu,
        });
        self
    }

    pub(crate) fn storage_header_now(self) -> Self {
        let now = Utc::now();
        let seconds = u32::try_from(now.timestamp()).unwrap_or(u32::MAX);
        let micros = now.timestamp_subsec_micros() as i32;
        self.storage_header(seconds, micros)
    }

    pub fn has_storage_header(&self) -> bool {
        self.storage.is_some()
    }

    /// Append the encoded message to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        let verbose = match &self.body {
            Body::Verbose(arguments) => {
                for argument in arguments {
                    encode_argument(argument, self.big_endian, &mut payload);
                }
                self.extended.is_some()
            }
            Body::NonVerbose { message_id, data } => {
                if self.big_endian {
                    payload.put_u32(*message_id);
                } else {
                    payload.put_u32_le(*message_id);
                }
                payload.put_slice(data);
                false
            }
        };

        let mut header_type = PROTOCOL_VERSION << htyp::VERSION_SHIFT;
        let mut length = STANDARD_HEADER_LEN + payload.len();
        for (present, flag) in [
            (self.extended.is_some(), htyp::UEH),
            (self.big_endian, htyp::MSBF),
            (self.ecu.is_some(), htyp::WEID),
            (self.session_id.is_some(), htyp::WSID),
            (self.timestamp.is_some(), htyp::WTMS),
        ] {
            if present {
                header_type |= flag;
                if flag & (htyp::WEID | htyp::WSID | htyp::WTMS) != 0 {
                    length += 4;
                }
            }
        }
        if self.extended.is_some() {
            length += EXTENDED_HEADER_LEN;
        }
        let length = u16::try_from(length).map_err(|_| {
            Error::InvalidConfig(format!("DLT message of {} bytes is too long", length))
        })?;

        if let Some(storage) = &self.storage {
            dst.put_slice(&STORAGE_PATTERN);
            dst.put_u32_le(storage.seconds);
            dst.put_i32_le(storage.microseconds);
            dst.put_slice(&write_id(&storage.ecu));
        }

        dst.put_u8(header_type);
        dst.put_u8(self.counter);
        dst.put_u16(length);
        if let Some(ecu) = &self.ecu {
            dst.put_slice(&write_id(ecu));
        }
        if let Some(session_id) = self.session_id {
            dst.put_u32(session_id);
        }
        if let Some(timestamp) = self.timestamp {
            dst.put_u32(timestamp);
        }

        if let Some((message_type, subtype, apid, ctid)) = &self.extended {
            let argument_count = match &self.body {
                Body::Verbose(arguments) => arguments.len().min(usize::from(u8::MAX)) as u8,
                Body::NonVerbose { .. } => 0,
            };
            let header = ExtendedHeader {
                verbose,
                message_type: *message_type,
                subtype: *subtype,
                argument_count,
                apid: apid.clone(),
                ctid: ctid.clone(),
            };
            dst.put_u8(header.message_info());
            dst.put_u8(header.argument_count);
            dst.put_slice(&write_id(apid));
            dst.put_slice(&write_id(ctid));
        }

        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DltCodec;
    use tokio_util::codec::Decoder;

    #[test]
    fn test_minimal_message_layout() {
        let builder = FrameBuilder::log("A", "B", LogLevel::Fatal).without_ecu();
        let mut buf = BytesMut::new();
        builder.encode_into(&mut buf).unwrap();

        assert_eq!(buf[0], htyp::UEH | (1 << htyp::VERSION_SHIFT));
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 14);
        assert_eq!(buf.len(), 14);
        // verbose, log, fatal
        assert_eq!(buf[4], 0x01 | (1 << 4));
    }

    #[test]
    fn test_without_extended_header_is_non_verbose() {
        let builder = FrameBuilder::log("A", "B", LogLevel::Info)
            .without_extended_header()
            .non_verbose(7, vec![0xAA]);
        let mut buf = BytesMut::new();
        builder.encode_into(&mut buf).unwrap();

        let frame = DltCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(frame.extended_header().is_none());
        assert_eq!(frame.apid(), "");
        assert_eq!(frame.payload().message_id(), Some(7));
        assert_eq!(frame.payload().data(), &[0xAA]);
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let builder = FrameBuilder::log("A", "B", LogLevel::Info).non_verbose(1, vec![0; 70_000]);
        let mut buf = BytesMut::new();
        assert!(builder.encode_into(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
