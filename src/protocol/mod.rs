//! Wire Protocol Implementation
//!
//! This module frames raw bytes into typed requests and encodes typed
//! responses, under strict per-message resource bounds.
//!
//! ## Overview
//!
//! Messages are self-framing MessagePack maps carrying a type discriminant
//! and a payload. Requests are `Input`, `Query`, `Backup` and `Dump`. Query
//! results stream back as one `StreamStart` frame, zero or more
//! `StreamEntry` frames and one `StreamEnd` frame; dumps emit bare
//! `DumpEntry` frames without a Start/End bracket.
//!
//! ## Modules
//!
//! - `types`: `Entry`, request and response types, wire constants
//! - `parser`: bounded incremental decoder
//! - `encoder`: frame encoders writing into a bounded scratch buffer
//! - `stream`: per-connection decode stream over a pluggable read source
//!
//! ## Example
//!
//! ```
//! use pdnsgate::protocol::{encode_message, parse_message, Entry, InputRequest, ProtocolMessage};
//! use bytes::BytesMut;
//!
//! let entry = Entry::new("sensor", "example.com", "A", "192.0.2.1", 1, 10, 10);
//! let msg = ProtocolMessage::Input(InputRequest { entry });
//!
//! let mut buf = BytesMut::new();
//! encode_message(&msg, &mut buf, 64 * 1024).unwrap();
//!
//! let (decoded, consumed) = parse_message(&buf).unwrap().unwrap();
//! assert_eq!(decoded, msg);
//! assert_eq!(consumed, buf.len());
//! ```

pub mod encoder;
pub mod parser;
pub mod stream;
pub mod types;

// Re-export commonly used types for convenience
pub use encoder::{
    encode_dump_entry, encode_message, encode_stream_end, encode_stream_entry,
    encode_stream_start, EncodeError, EncodeResult,
};
pub use parser::{parse_message, DecodeError, DecodeLimits, DecodeResult, Decoder};
pub use stream::{ProtocolStream, StreamSource};
pub use types::{
    BackupRequest, DumpRequest, Entry, InputRequest, ProtocolMessage, QueryRequest, ResponseFrame,
    Value,
};
