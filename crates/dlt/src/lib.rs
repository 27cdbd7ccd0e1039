//! ITF DLT support
//!
//! Parsing, capturing and querying AUTOSAR DLT traffic emitted by a target:
//! the wire codec, the append-only record with its query engine, the
//! capture reader and the scoped [`DltWindow`].

pub mod builder;
pub mod capture;
pub mod codec;
pub mod config;
pub mod frame;
pub mod payload;
pub mod query;
pub mod record;
pub mod window;

pub use builder::FrameBuilder;
pub use capture::{CaptureStats, DltCapture};
pub use codec::DltCodec;
pub use config::{CaptureConfig, CaptureFilter, DltConfig, Receiver, Transport, DEFAULT_PORT};
pub use frame::{DltFrame, ExtendedHeader, LogLevel, MessageType, Payload, StorageHeader};
pub use payload::{Argument, Value};
pub use query::{Field, Matcher, MatcherSpec, Query};
pub use record::DltRecord;
pub use window::DltWindow;
