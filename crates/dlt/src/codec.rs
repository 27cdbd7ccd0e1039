//! DLT wire codec
//!
//! [`DltCodec`] turns a byte stream (TCP, capture process output, DLT files)
//! or a single datagram into [`DltFrame`]s. Decode anomalies are logged and
//! skipped; the decoder never fails on malformed input.

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use std::path::Path;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::{debug, trace, warn};

use crate::builder::FrameBuilder;
use crate::frame::{
    htyp, standard_header_len, DltFrame, ExtendedHeader, Payload, StorageHeader,
    EXTENDED_HEADER_LEN, STANDARD_HEADER_LEN, STORAGE_HEADER_LEN, STORAGE_PATTERN,
};
use crate::payload;
use itf_common::{Error, Result};

/// Decoder and encoder for DLT messages
#[derive(Debug, Clone, Default)]
pub struct DltCodec {
    storage_header: bool,
    skipped: u64,
}

impl DltCodec {
    /// Codec for bare messages as sent over UDP and TCP
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec for storage-header prefixed messages (DLT files, receiver output)
    pub fn with_storage_header() -> Self {
        Self {
            storage_header: true,
            skipped: 0,
        }
    }

    pub fn expects_storage_header(&self) -> bool {
        self.storage_header
    }

    /// Bytes discarded while resynchronizing or skipping invalid messages
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Decode every complete message in `buf`, dropping any trailing bytes
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Vec<DltFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.decode(buf) {
            frames.push(frame);
        }
        if let Ok(Some(frame)) = self.decode_eof(buf) {
            frames.push(frame);
        }
        frames
    }

    fn skip(&mut self, src: &mut BytesMut, n: usize) {
        src.advance(n);
        self.skipped += n as u64;
    }

    /// Drop bytes until `src` starts with the storage pattern
    ///
    /// Returns false when more input is needed.
    fn resync(&mut self, src: &mut BytesMut) -> bool {
        if src.starts_with(&STORAGE_PATTERN) {
            return true;
        }
        let found = src
            .windows(STORAGE_PATTERN.len())
            .position(|w| w == STORAGE_PATTERN);
        match found {
            Some(offset) => {
                warn!("Skipped {} bytes before next storage header", offset);
                self.skip(src, offset);
                true
            }
            None => {
                // Keep a tail that may be the start of a split pattern
                let keep = STORAGE_PATTERN.len() - 1;
                if src.len() > keep {
                    let drop = src.len() - keep;
                    warn!("Skipped {} bytes without storage header", drop);
                    self.skip(src, drop);
                }
                false
            }
        }
    }
}

impl Decoder for DltCodec {
    type Item = DltFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DltFrame>> {
        loop {
            let prefix = if self.storage_header {
                if src.len() < STORAGE_PATTERN.len() || !self.resync(src) {
                    return Ok(None);
                }
                STORAGE_HEADER_LEN
            } else {
                0
            };

            if src.len() < prefix + STANDARD_HEADER_LEN {
                return Ok(None);
            }

            let header_type = src[prefix];
            let length = u16::from_be_bytes([src[prefix + 2], src[prefix + 3]]);
            let mut required = standard_header_len(header_type);
            if header_type & htyp::UEH != 0 {
                required += EXTENDED_HEADER_LEN;
            }

            if usize::from(length) < required {
                warn!(
                    "Message length {} is shorter than its {} header bytes, skipping",
                    length, required
                );
                // Storage mode resynchronizes on the next pattern; bare mode
                // drops the bad standard header and reads on after it
                let n = if self.storage_header {
                    STORAGE_PATTERN.len()
                } else {
                    STANDARD_HEADER_LEN
                };
                self.skip(src, n);
                continue;
            }

            let total = prefix + usize::from(length);
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let storage = (prefix > 0).then(|| StorageHeader::parse(&src[..prefix]));
            src.advance(prefix);
            let message = src.split_to(usize::from(length)).freeze();
            trace!("Decoded {} byte message", length);
            return Ok(Some(parse_message(storage, message)));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<DltFrame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    warn!("Dropping {} trailing bytes at end of stream", buf.len());
                    let n = buf.len();
                    self.skip(buf, n);
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<FrameBuilder> for DltCodec {
    type Error = Error;

    fn encode(&mut self, item: FrameBuilder, dst: &mut BytesMut) -> Result<()> {
        let item = if self.storage_header && !item.has_storage_header() {
            item.storage_header_now()
        } else {
            item
        };
        item.encode_into(dst)
    }
}

/// Parse one message whose length was already validated against its headers
fn parse_message(storage: Option<StorageHeader>, message: Bytes) -> DltFrame {
    let header_type = message[0];
    let counter = message[1];
    let length = u16::from_be_bytes([message[2], message[3]]);
    let big_endian = header_type & htyp::MSBF != 0;

    let mut offset = STANDARD_HEADER_LEN;
    let mut field = |flag: u8| -> Option<[u8; 4]> {
        (header_type & flag != 0).then(|| {
            let mut out = [0u8; 4];
            out.copy_from_slice(&message[offset..offset + 4]);
            offset += 4;
            out
        })
    };
    let ecu = field(htyp::WEID).map(|b| crate::frame::read_id(&b));
    let session_id = field(htyp::WSID).map(u32::from_be_bytes);
    let timestamp = field(htyp::WTMS).map(u32::from_be_bytes);

    let extended = (header_type & htyp::UEH != 0).then(|| {
        let header = ExtendedHeader::parse(&message[offset..offset + EXTENDED_HEADER_LEN]);
        offset += EXTENDED_HEADER_LEN;
        header
    });

    let version = (header_type & htyp::VERSION_MASK) >> htyp::VERSION_SHIFT;
    if version != 1 {
        debug!("Unexpected DLT protocol version {}", version);
    }

    let raw = message.slice(offset..);
    let payload = match &extended {
        Some(ext) if ext.verbose => {
            let (arguments, error) =
                payload::decode_arguments(&raw, ext.argument_count, big_endian);
            if let Some(e) = error {
                warn!(
                    "Stopped decoding arguments of {}:{} after {} of {}: {}",
                    ext.apid,
                    ext.ctid,
                    arguments.len(),
                    ext.argument_count,
                    e
                );
            }
            let text = (!arguments.is_empty()).then(|| payload::render(&arguments));
            Payload {
                raw,
                message_id: None,
                arguments,
                text,
            }
        }
        _ => {
            let message_id = (raw.len() >= 4).then(|| {
                let id = [raw[0], raw[1], raw[2], raw[3]];
                if big_endian {
                    u32::from_be_bytes(id)
                } else {
                    u32::from_le_bytes(id)
                }
            });
            let text = payload::printable(raw.get(4..).unwrap_or_default());
            Payload {
                raw,
                message_id,
                arguments: Vec::new(),
                text,
            }
        }
    };

    DltFrame {
        storage,
        header_type,
        counter,
        length,
        ecu,
        session_id,
        timestamp,
        extended,
        payload,
    }
}

/// Read every message from a DLT file (storage-header format)
pub async fn read_file(path: impl AsRef<Path>) -> Result<Vec<DltFrame>> {
    let path = path.as_ref();
    let file = tokio::fs::File::open(path).await?;
    let mut frames = FramedRead::new(file, DltCodec::with_storage_header());
    let mut out = Vec::new();
    while let Some(frame) = frames.next().await {
        out.push(frame?);
    }
    debug!("Read {} messages from {}", out.len(), path.display());
    Ok(out)
}

/// Write frames to a DLT file (storage-header format)
pub async fn write_file(path: impl AsRef<Path>, frames: Vec<FrameBuilder>) -> Result<()> {
    let mut codec = DltCodec::with_storage_header();
    let mut buf = BytesMut::new();
    for frame in frames {
        codec.encode(frame, &mut buf)?;
    }
    tokio::fs::write(path, &buf).await?;
    Ok(())
}

/// Convenience for encoding without a codec instance
pub fn encode(frame: &FrameBuilder) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf)?;
    Ok(buf.freeze())
}
