//! Bounded Incremental Message Decoder
//!
//! This module turns buffered bytes into [`Value`] trees and then into typed
//! requests or response frames. Markers and headers are read with
//! [`rmp::decode`]; what this module adds is the incremental framing and
//! the resource accounting around those reads.
//!
//! ## How the Decoder Works
//!
//! Like a streaming parser it works over whatever bytes have been buffered so
//! far and returns either:
//! - `Ok(Some((value, consumed)))` - a complete message, `consumed` bytes used
//! - `Ok(None)` - the message is incomplete, read more and retry
//! - `Err(DecodeError)` - malformed or over budget, drop the connection
//!
//! ## Resource Bounds
//!
//! A peer must not be able to make the engine allocate without limit, so
//! every parse is charged against [`DecodeLimits`]:
//!
//! - every decoded node counts against `max_nodes`
//! - every node costs [`NODE_OVERHEAD`] bytes plus its payload against `memcap`
//!
//! Declared lengths are checked against the remaining budget *before* the
//! payload has arrived, so a header announcing a 4 GiB string fails at once
//! rather than after buffering it. Because the overhead per node is larger
//! than any MessagePack header, a message that fits the memcap is never
//! larger than the memcap on the wire either.

use crate::protocol::types::{
    key, lookup, message_type, BackupRequest, DumpRequest, Entry, InputRequest, ProtocolMessage,
    QueryRequest, ResponseFrame, Value,
};
use bytes::Bytes;
use rmp::decode;
use rmp::Marker;
use thiserror::Error;

/// Accounting cost of a single decoded node, in bytes.
pub const NODE_OVERHEAD: usize = 16;

/// Maximum container nesting depth.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Default decode memory cap (100 KiB).
pub const DEFAULT_MEMCAP: usize = 100 * 1024;

/// Default maximum node count per message.
pub const DEFAULT_MAX_NODES: usize = 1024;

/// Errors that can occur while decoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported marker byte: {0:#04x}")]
    UnsupportedMarker(u8),

    #[error("decode memory cap exceeded (max: {max} bytes)")]
    MemcapExceeded { max: usize },

    #[error("decode node limit exceeded (max: {max} nodes)")]
    NodeLimitExceeded { max: usize },

    #[error("maximum nesting depth exceeded: {0}")]
    TooDeep(usize),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("missing or invalid field `{0}`")]
    InvalidField(&'static str),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("invalid entry: count must be >= 1 and first_seen <= last_seen")]
    InvalidEntry,

    #[error("unexpected end of stream inside a message")]
    UnexpectedEof,
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Per-message resource bounds, fixed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub memcap: usize,
    pub max_nodes: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            memcap: DEFAULT_MEMCAP,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

/// Bytes taken by the marker plus its fixed-width length or value field.
///
/// Floats and extension types never appear in this protocol.
fn header_len(marker: Marker) -> Option<usize> {
    match marker {
        Marker::FixPos(_)
        | Marker::FixNeg(_)
        | Marker::Null
        | Marker::True
        | Marker::False
        | Marker::FixStr(_)
        | Marker::FixArray(_)
        | Marker::FixMap(_) => Some(1),
        Marker::U8 | Marker::I8 | Marker::Str8 | Marker::Bin8 => Some(2),
        Marker::U16
        | Marker::I16
        | Marker::Str16
        | Marker::Bin16
        | Marker::Array16
        | Marker::Map16 => Some(3),
        Marker::U32
        | Marker::I32
        | Marker::Str32
        | Marker::Bin32
        | Marker::Array32
        | Marker::Map32 => Some(5),
        Marker::U64 | Marker::I64 => Some(9),
        _ => None,
    }
}

/// The header is fully buffered before any `rmp::decode` reader runs, so a
/// reader error here means the bytes contradict their marker.
fn header<T, E>(read: Result<T, E>) -> DecodeResult<T> {
    read.map_err(|_| DecodeError::Malformed("invalid header"))
}

/// An incremental MessagePack decoder charged against [`DecodeLimits`].
#[derive(Debug)]
pub struct Decoder {
    limits: DecodeLimits,
    nodes: usize,
    memory: usize,
    depth: usize,
}

impl Decoder {
    pub fn new(limits: DecodeLimits) -> Self {
        Self {
            limits,
            nodes: 0,
            memory: 0,
            depth: 0,
        }
    }

    pub fn limits(&self) -> DecodeLimits {
        self.limits
    }

    /// Attempts to decode one complete value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> DecodeResult<Option<(Value, usize)>> {
        self.nodes = 0;
        self.memory = 0;
        self.depth = 0;
        self.parse_value(buf)
    }

    fn charge(&mut self, payload: usize) -> DecodeResult<()> {
        self.nodes += 1;
        if self.nodes > self.limits.max_nodes {
            return Err(DecodeError::NodeLimitExceeded {
                max: self.limits.max_nodes,
            });
        }
        self.memory = self
            .memory
            .saturating_add(NODE_OVERHEAD)
            .saturating_add(payload);
        if self.memory > self.limits.memcap {
            return Err(DecodeError::MemcapExceeded {
                max: self.limits.memcap,
            });
        }
        Ok(())
    }

    fn parse_value(&mut self, buf: &[u8]) -> DecodeResult<Option<(Value, usize)>> {
        let Some(&byte) = buf.first() else {
            return Ok(None);
        };
        let marker = Marker::from_u8(byte);
        let Some(hlen) = header_len(marker) else {
            return Err(DecodeError::UnsupportedMarker(byte));
        };
        if buf.len() < hlen {
            return Ok(None);
        }

        let mut rd = buf;
        match marker {
            Marker::Null => self.scalar(Value::Nil, hlen),
            Marker::True => self.scalar(Value::Boolean(true), hlen),
            Marker::False => self.scalar(Value::Boolean(false), hlen),
            Marker::FixPos(_) | Marker::U8 | Marker::U16 | Marker::U32 | Marker::U64 => {
                let n: u64 = header(decode::read_int(&mut rd))?;
                self.scalar(Value::from(n), hlen)
            }
            Marker::FixNeg(_) | Marker::I8 | Marker::I16 | Marker::I32 | Marker::I64 => {
                let n: i64 = header(decode::read_int(&mut rd))?;
                self.scalar(Value::from(n), hlen)
            }
            Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
                let len = header(decode::read_str_len(&mut rd))?;
                self.parse_bytes(buf, len as usize, hlen, false)
            }
            Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => {
                let len = header(decode::read_bin_len(&mut rd))?;
                self.parse_bytes(buf, len as usize, hlen, true)
            }
            Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
                let count = header(decode::read_array_len(&mut rd))?;
                self.parse_array(buf, count as usize, hlen)
            }
            Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
                let count = header(decode::read_map_len(&mut rd))?;
                self.parse_map(buf, count as usize, hlen)
            }
            _ => Err(DecodeError::UnsupportedMarker(byte)),
        }
    }

    fn scalar(&mut self, value: Value, consumed: usize) -> DecodeResult<Option<(Value, usize)>> {
        self.charge(0)?;
        Ok(Some((value, consumed)))
    }

    fn parse_bytes(
        &mut self,
        buf: &[u8],
        len: usize,
        hlen: usize,
        binary: bool,
    ) -> DecodeResult<Option<(Value, usize)>> {
        // Charge before waiting for the payload so oversized lengths fail early.
        self.charge(len)?;

        let total = hlen + len;
        if buf.len() < total {
            return Ok(None);
        }
        let data = buf[hlen..total].to_vec();
        let value = if binary {
            Value::Binary(data)
        } else {
            match String::from_utf8(data) {
                Ok(s) => Value::String(s.into()),
                Err(e) => Value::Binary(e.into_bytes()),
            }
        };
        Ok(Some((value, total)))
    }

    fn enter(&mut self, children: usize) -> DecodeResult<()> {
        self.charge(0)?;
        if children > self.limits.max_nodes.saturating_sub(self.nodes) {
            return Err(DecodeError::NodeLimitExceeded {
                max: self.limits.max_nodes,
            });
        }
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(DecodeError::TooDeep(MAX_NESTING_DEPTH));
        }
        Ok(())
    }

    fn parse_array(
        &mut self,
        buf: &[u8],
        count: usize,
        hlen: usize,
    ) -> DecodeResult<Option<(Value, usize)>> {
        self.enter(count)?;

        let mut elements = Vec::with_capacity(count);
        let mut consumed = hlen;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }

        self.depth -= 1;
        Ok(Some((Value::Array(elements), consumed)))
    }

    fn parse_map(
        &mut self,
        buf: &[u8],
        count: usize,
        hlen: usize,
    ) -> DecodeResult<Option<(Value, usize)>> {
        self.enter(count.saturating_mul(2))?;

        let mut pairs = Vec::with_capacity(count);
        let mut consumed = hlen;
        for _ in 0..count {
            let (k, used) = match self.parse_value(&buf[consumed..])? {
                Some(kv) => kv,
                None => return Ok(None),
            };
            consumed += used;
            let (v, used) = match self.parse_value(&buf[consumed..])? {
                Some(kv) => kv,
                None => return Ok(None),
            };
            consumed += used;
            pairs.push((k, v));
        }

        self.depth -= 1;
        Ok(Some((Value::Map(pairs), consumed)))
    }
}

fn required_bytes(map: &Value, k: &str, name: &'static str) -> DecodeResult<Bytes> {
    lookup(map, k)
        .and_then(Value::as_slice)
        .map(Bytes::copy_from_slice)
        .ok_or(DecodeError::InvalidField(name))
}

fn optional_bytes(map: &Value, k: &str, name: &'static str) -> DecodeResult<Option<Bytes>> {
    match lookup(map, k) {
        None | Some(Value::Nil) => Ok(None),
        Some(v) => v
            .as_slice()
            .map(|b| Some(Bytes::copy_from_slice(b)))
            .ok_or(DecodeError::InvalidField(name)),
    }
}

fn required_uint(map: &Value, k: &str, name: &'static str) -> DecodeResult<u64> {
    lookup(map, k)
        .and_then(Value::as_u64)
        .ok_or(DecodeError::InvalidField(name))
}

/// Builds an [`Entry`] from its payload map and validates it.
pub fn entry_from_value(map: &Value) -> DecodeResult<Entry> {
    if !map.is_map() {
        return Err(DecodeError::Malformed("entry payload is not a map"));
    }
    let entry = Entry {
        sensor_id: required_bytes(map, key::SENSOR_ID, "sensor_id")?,
        rrname: required_bytes(map, key::RRNAME, "rrname")?,
        rrtype: required_bytes(map, key::RRTYPE, "rrtype")?,
        rdata: required_bytes(map, key::RDATA, "rdata")?,
        count: required_uint(map, key::COUNT, "count")?,
        first_seen: required_uint(map, key::FIRST_SEEN, "first_seen")?,
        last_seen: required_uint(map, key::LAST_SEEN, "last_seen")?,
    };
    if !entry.is_valid() {
        return Err(DecodeError::InvalidEntry);
    }
    Ok(entry)
}

fn query_from_value(map: &Value) -> DecodeResult<QueryRequest> {
    let limit = match lookup(map, key::LIMIT) {
        None | Some(Value::Nil) => 0,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(DecodeError::InvalidField("limit"))?,
    };
    Ok(QueryRequest {
        sensor_id: optional_bytes(map, key::SENSOR_ID, "sensor_id")?,
        rrname: optional_bytes(map, key::RRNAME, "rrname")?,
        rrtype: optional_bytes(map, key::RRTYPE, "rrtype")?,
        rdata: optional_bytes(map, key::RDATA, "rdata")?,
        limit,
    })
}

/// Splits a message envelope into its type discriminant and payload.
fn envelope(value: &Value) -> DecodeResult<(u64, &Value)> {
    if !value.is_map() {
        return Err(DecodeError::Malformed("message is not a map"));
    }
    let ty = lookup(value, key::TYPE)
        .and_then(Value::as_u64)
        .ok_or(DecodeError::InvalidField("type"))?;
    let payload = lookup(value, key::MESSAGE)
        .filter(|v| v.is_map())
        .ok_or(DecodeError::InvalidField("message"))?;
    Ok((ty, payload))
}

impl ProtocolMessage {
    /// Interprets a decoded tree as a client request.
    pub fn from_value(value: &Value) -> DecodeResult<Self> {
        let (ty, payload) = envelope(value)?;
        match ty {
            message_type::INPUT_REQUEST => Ok(ProtocolMessage::Input(InputRequest {
                entry: entry_from_value(payload)?,
            })),
            message_type::QUERY_REQUEST => Ok(ProtocolMessage::Query(query_from_value(payload)?)),
            message_type::BACKUP_REQUEST => Ok(ProtocolMessage::Backup(BackupRequest {
                path: required_bytes(payload, key::PATH, "path")?,
            })),
            message_type::DUMP_REQUEST => Ok(ProtocolMessage::Dump(DumpRequest {
                path: required_bytes(payload, key::PATH, "path")?,
            })),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

impl ResponseFrame {
    /// Interprets a decoded tree as a server response frame.
    pub fn from_value(value: &Value) -> DecodeResult<Self> {
        let (ty, payload) = envelope(value)?;
        match ty {
            message_type::STREAM_START => Ok(ResponseFrame::StreamStart),
            message_type::STREAM_ENTRY => Ok(ResponseFrame::StreamEntry(entry_from_value(payload)?)),
            message_type::STREAM_END => Ok(ResponseFrame::StreamEnd),
            message_type::DUMP_ENTRY => Ok(ResponseFrame::DumpEntry(entry_from_value(payload)?)),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// Decodes a single request from a complete buffer with default limits.
///
/// This is a convenience function for simple use cases and tests.
pub fn parse_message(buf: &[u8]) -> DecodeResult<Option<(ProtocolMessage, usize)>> {
    match Decoder::new(DecodeLimits::default()).parse(buf)? {
        Some((value, used)) => Ok(Some((ProtocolMessage::from_value(&value)?, used))),
        None => Ok(None),
    }
}
