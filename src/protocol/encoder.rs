//! Frame Encoder
//!
//! Serializes requests and response frames into a caller-supplied buffer.
//! The connection hands in its scratch buffer together with the scratch
//! capacity. Writes go through a view of the buffer limited to that
//! capacity, so a frame that would not fit fails as soon as it runs out of
//! room instead of growing the buffer first.
//!
//! Integers are written in their smallest MessagePack form by
//! [`rmp::encode::write_uint`] and byte strings always use the `str` family,
//! so encoding the same value twice yields the same bytes.

use crate::protocol::types::{
    key, message_type, BackupRequest, DumpRequest, Entry, ProtocolMessage, QueryRequest,
};
use bytes::{BufMut, Bytes, BytesMut};
use rmp::encode::{self, ValueWriteError};
use std::io::{self, Write};
use thiserror::Error;

/// Errors that can occur while encoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("frame too large (max: {max} bytes)")]
    FrameTooLarge { max: usize },

    #[error("field too large for a MessagePack string header")]
    FieldTooLarge,
}

pub type EncodeResult<T> = Result<T, EncodeError>;

fn write_err(err: ValueWriteError<io::Error>) -> io::Error {
    match err {
        ValueWriteError::InvalidMarkerWrite(e) | ValueWriteError::InvalidDataWrite(e) => e,
    }
}

fn put_uint<W: Write>(wr: &mut W, n: u64) -> io::Result<()> {
    encode::write_uint(wr, n).map(drop).map_err(write_err)
}

/// Writes raw bytes under a `str` header; rdata need not be UTF-8.
fn put_str<W: Write>(wr: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too large"))?;
    encode::write_str_len(wr, len).map_err(write_err)?;
    wr.write_all(data)
}

fn put_key<W: Write>(wr: &mut W, k: &str) -> io::Result<()> {
    encode::write_str(wr, k).map_err(write_err)
}

fn put_map_header<W: Write>(wr: &mut W, len: u32) -> io::Result<()> {
    encode::write_map_len(wr, len).map(drop).map_err(write_err)
}

/// Writes the `{ "T": ty, "M": ` envelope prefix; the payload map follows.
fn put_envelope<W: Write>(wr: &mut W, ty: u64) -> io::Result<()> {
    put_map_header(wr, 2)?;
    put_key(wr, key::TYPE)?;
    put_uint(wr, ty)?;
    put_key(wr, key::MESSAGE)
}

fn put_entry<W: Write>(wr: &mut W, entry: &Entry) -> io::Result<()> {
    put_map_header(wr, 7)?;
    put_key(wr, key::SENSOR_ID)?;
    put_str(wr, &entry.sensor_id)?;
    put_key(wr, key::RRNAME)?;
    put_str(wr, &entry.rrname)?;
    put_key(wr, key::RRTYPE)?;
    put_str(wr, &entry.rrtype)?;
    put_key(wr, key::RDATA)?;
    put_str(wr, &entry.rdata)?;
    put_key(wr, key::COUNT)?;
    put_uint(wr, entry.count)?;
    put_key(wr, key::FIRST_SEEN)?;
    put_uint(wr, entry.first_seen)?;
    put_key(wr, key::LAST_SEEN)?;
    put_uint(wr, entry.last_seen)
}

fn put_query<W: Write>(wr: &mut W, query: &QueryRequest) -> io::Result<()> {
    let filters: [(&str, &Option<Bytes>); 4] = [
        (key::SENSOR_ID, &query.sensor_id),
        (key::RRNAME, &query.rrname),
        (key::RRTYPE, &query.rrtype),
        (key::RDATA, &query.rdata),
    ];
    let present = filters.iter().filter(|(_, v)| v.is_some()).count() as u32;

    put_map_header(wr, present + 1)?;
    for (k, v) in filters {
        if let Some(v) = v {
            put_key(wr, k)?;
            put_str(wr, v)?;
        }
    }
    put_key(wr, key::LIMIT)?;
    put_uint(wr, query.limit as u64)
}

fn put_path<W: Write>(wr: &mut W, path: &[u8]) -> io::Result<()> {
    put_map_header(wr, 1)?;
    put_key(wr, key::PATH)?;
    put_str(wr, path)
}

/// Clears `buf` and runs `write` against at most `max` bytes of it.
fn encode_with<F>(buf: &mut BytesMut, max: usize, write: F) -> EncodeResult<usize>
where
    F: FnOnce(&mut bytes::buf::Writer<bytes::buf::Limit<&mut BytesMut>>) -> io::Result<()>,
{
    buf.clear();
    let mut wr = (&mut *buf).limit(max).writer();
    match write(&mut wr) {
        Ok(()) => Ok(buf.len()),
        Err(e) => {
            buf.clear();
            if e.kind() == io::ErrorKind::WriteZero {
                Err(EncodeError::FrameTooLarge { max })
            } else {
                Err(EncodeError::FieldTooLarge)
            }
        }
    }
}

/// Encodes a client request.
pub fn encode_message(msg: &ProtocolMessage, buf: &mut BytesMut, max: usize) -> EncodeResult<usize> {
    encode_with(buf, max, |buf| {
        put_envelope(buf, msg.message_type())?;
        match msg {
            ProtocolMessage::Input(input) => put_entry(buf, &input.entry),
            ProtocolMessage::Query(query) => put_query(buf, query),
            ProtocolMessage::Backup(BackupRequest { path }) => put_path(buf, path),
            ProtocolMessage::Dump(DumpRequest { path }) => put_path(buf, path),
        }
    })
}

/// Encodes the frame opening a query result stream.
pub fn encode_stream_start(buf: &mut BytesMut, max: usize) -> EncodeResult<usize> {
    encode_with(buf, max, |buf| {
        put_envelope(buf, message_type::STREAM_START)?;
        put_map_header(buf, 0)
    })
}

/// Encodes one query result record.
pub fn encode_stream_entry(entry: &Entry, buf: &mut BytesMut, max: usize) -> EncodeResult<usize> {
    encode_with(buf, max, |buf| {
        put_envelope(buf, message_type::STREAM_ENTRY)?;
        put_entry(buf, entry)
    })
}

/// Encodes the frame closing a query result stream.
pub fn encode_stream_end(buf: &mut BytesMut, max: usize) -> EncodeResult<usize> {
    encode_with(buf, max, |buf| {
        put_envelope(buf, message_type::STREAM_END)?;
        put_map_header(buf, 0)
    })
}

/// Encodes a standalone record, outside of any Start/End bracket.
pub fn encode_dump_entry(entry: &Entry, buf: &mut BytesMut, max: usize) -> EncodeResult<usize> {
    encode_with(buf, max, |buf| {
        put_envelope(buf, message_type::DUMP_ENTRY)?;
        put_entry(buf, entry)
    })
}
