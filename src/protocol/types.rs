//! Wire Protocol Data Types
//!
//! This module defines the values exchanged between clients and the engine:
//! the passive-DNS [`Entry`], the request messages, the response frames, and
//! the generic decoded [`Value`] tree the parser produces.
//!
//! ## Message Layout
//!
//! Every message on the wire is a MessagePack map with two keys:
//!
//! ```text
//! { "T": <message type>, "M": <payload map> }
//! ```
//!
//! | Type | Name         | Direction        | Payload                      |
//! |------|--------------|------------------|------------------------------|
//! | 1    | Input        | client -> server | entry map                    |
//! | 2    | Query        | client -> server | filter map                   |
//! | 3    | Backup       | client -> server | `{ "P": path }`              |
//! | 4    | Dump         | client -> server | `{ "P": path }`              |
//! | 5    | StreamStart  | server -> client | `{}`                         |
//! | 6    | StreamEntry  | server -> client | entry map                    |
//! | 7    | StreamEnd    | server -> client | `{}`                         |
//! | 8    | DumpEntry    | server -> client | entry map                    |
//!
//! An entry map uses the keys `I` (sensor id), `N` (rrname), `T` (rrtype),
//! `D` (rdata), `C` (count), `F` (first seen) and `L` (last seen).

use bytes::Bytes;
use std::fmt;

/// Message type discriminants carried under the `T` key.
pub mod message_type {
    pub const INPUT_REQUEST: u64 = 1;
    pub const QUERY_REQUEST: u64 = 2;
    pub const BACKUP_REQUEST: u64 = 3;
    pub const DUMP_REQUEST: u64 = 4;
    pub const STREAM_START: u64 = 5;
    pub const STREAM_ENTRY: u64 = 6;
    pub const STREAM_END: u64 = 7;
    pub const DUMP_ENTRY: u64 = 8;
}

/// Map keys used by the message envelope and payloads.
pub mod key {
    pub const TYPE: &str = "T";
    pub const MESSAGE: &str = "M";

    pub const SENSOR_ID: &str = "I";
    pub const RRNAME: &str = "N";
    pub const RRTYPE: &str = "T";
    pub const RDATA: &str = "D";
    pub const COUNT: &str = "C";
    pub const FIRST_SEEN: &str = "F";
    pub const LAST_SEEN: &str = "L";

    pub const LIMIT: &str = "L";
    pub const PATH: &str = "P";
}

/// A decoded MessagePack tree.
///
/// `str` payloads that are not valid UTF-8 are kept as [`Value::Binary`]:
/// resource-record data is raw bytes and the engine never interprets it.
pub use rmpv::Value;

/// Looks up `key` in a map node by its raw bytes.
pub fn lookup<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_slice() == Some(key.as_bytes()))
        .map(|(_, v)| v)
}

/// One passive-DNS observation.
///
/// Entries are immutable value records: the protocol layer decodes them,
/// backends store and stream them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub sensor_id: Bytes,
    pub rrname: Bytes,
    pub rrtype: Bytes,
    pub rdata: Bytes,
    pub count: u64,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl Entry {
    pub fn new(
        sensor_id: impl Into<Bytes>,
        rrname: impl Into<Bytes>,
        rrtype: impl Into<Bytes>,
        rdata: impl Into<Bytes>,
        count: u64,
        first_seen: u64,
        last_seen: u64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            rrname: rrname.into(),
            rrtype: rrtype.into(),
            rdata: rdata.into(),
            count,
            first_seen,
            last_seen,
        }
    }

    /// Checks `count >= 1` and `first_seen <= last_seen`.
    pub fn is_valid(&self) -> bool {
        self.count >= 1 && self.first_seen <= self.last_seen
    }

    /// Folds another observation of the same record into this one.
    pub fn merge(&mut self, other: &Entry) {
        self.count = self.count.saturating_add(other.count);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sensor={} rrname={} rrtype={} rdata={} count={} first={} last={}",
            String::from_utf8_lossy(&self.sensor_id),
            String::from_utf8_lossy(&self.rrname),
            String::from_utf8_lossy(&self.rrtype),
            String::from_utf8_lossy(&self.rdata),
            self.count,
            self.first_seen,
            self.last_seen
        )
    }
}

/// Ingest exactly one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    pub entry: Entry,
}

/// A record filter. Every field that is set must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub sensor_id: Option<Bytes>,
    pub rrname: Option<Bytes>,
    pub rrtype: Option<Bytes>,
    pub rdata: Option<Bytes>,
    /// Maximum number of records to stream back; `0` means unlimited.
    pub limit: u32,
}

impl QueryRequest {
    pub fn by_rrname(rrname: impl Into<Bytes>) -> Self {
        Self {
            rrname: Some(rrname.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Returns true if `entry` satisfies every filter that is set.
    pub fn matches(&self, entry: &Entry) -> bool {
        fn field(filter: &Option<Bytes>, value: &Bytes) -> bool {
            filter.as_ref().map(|f| f == value).unwrap_or(true)
        }

        field(&self.sensor_id, &entry.sensor_id)
            && field(&self.rrname, &entry.rrname)
            && field(&self.rrtype, &entry.rrtype)
            && field(&self.rdata, &entry.rdata)
    }

    /// Returns true once `produced` records satisfy the limit.
    pub fn limit_reached(&self, produced: usize) -> bool {
        self.limit != 0 && produced >= self.limit as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub path: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub path: Bytes,
}

/// A decoded client request. Exactly one variant is active per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Input(InputRequest),
    Query(QueryRequest),
    Backup(BackupRequest),
    Dump(DumpRequest),
}

impl ProtocolMessage {
    /// Wire discriminant of this message.
    pub fn message_type(&self) -> u64 {
        match self {
            ProtocolMessage::Input(_) => message_type::INPUT_REQUEST,
            ProtocolMessage::Query(_) => message_type::QUERY_REQUEST,
            ProtocolMessage::Backup(_) => message_type::BACKUP_REQUEST,
            ProtocolMessage::Dump(_) => message_type::DUMP_REQUEST,
        }
    }

    /// Backup and dump requests close the connection once dispatched.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, ProtocolMessage::Backup(_) | ProtocolMessage::Dump(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::Input(_) => "input",
            ProtocolMessage::Query(_) => "query",
            ProtocolMessage::Backup(_) => "backup",
            ProtocolMessage::Dump(_) => "dump",
        }
    }
}

/// A decoded server response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    StreamStart,
    StreamEntry(Entry),
    StreamEnd,
    DumpEntry(Entry),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry::new("sensor", "example.com", "A", "192.0.2.1", 3, 100, 200)
    }

    #[test]
    fn test_entry_validity() {
        assert!(sample().is_valid());

        let mut zero = sample();
        zero.count = 0;
        assert!(!zero.is_valid());

        let mut inverted = sample();
        inverted.first_seen = 300;
        assert!(!inverted.is_valid());
    }

    #[test]
    fn test_entry_merge() {
        let mut a = sample();
        let b = Entry::new("sensor", "example.com", "A", "192.0.2.1", 2, 50, 150);
        a.merge(&b);
        assert_eq!(a.count, 5);
        assert_eq!(a.first_seen, 50);
        assert_eq!(a.last_seen, 200);
    }

    #[test]
    fn test_entry_merge_saturates() {
        let mut a = sample();
        a.count = u64::MAX;
        a.merge(&sample());
        assert_eq!(a.count, u64::MAX);
    }

    #[test]
    fn test_query_matches() {
        let entry = sample();
        assert!(QueryRequest::default().matches(&entry));
        assert!(QueryRequest::by_rrname("example.com").matches(&entry));
        assert!(!QueryRequest::by_rrname("example.org").matches(&entry));

        let q = QueryRequest {
            rrtype: Some(Bytes::from("AAAA")),
            ..QueryRequest::by_rrname("example.com")
        };
        assert!(!q.matches(&entry));
    }

    #[test]
    fn test_query_limit() {
        let unlimited = QueryRequest::default();
        assert!(!unlimited.limit_reached(1_000_000));

        let limited = QueryRequest::default().with_limit(2);
        assert!(!limited.limit_reached(1));
        assert!(limited.limit_reached(2));
    }

    #[test]
    fn test_value_lookup() {
        let map = Value::Map(vec![
            (Value::from("T"), Value::from(2u64)),
            (Value::from("M"), Value::Map(vec![])),
            (Value::from(vec![b'P']), Value::from("/tmp/b")),
        ]);
        assert_eq!(lookup(&map, key::TYPE).and_then(Value::as_u64), Some(2));
        assert!(lookup(&map, key::MESSAGE).map(Value::is_map).unwrap_or(false));
        assert_eq!(
            lookup(&map, key::PATH).and_then(Value::as_slice),
            Some(&b"/tmp/b"[..])
        );
        assert!(lookup(&map, "X").is_none());
        assert!(lookup(&Value::from(1u64), key::TYPE).is_none());
        assert_eq!(Value::from(-1i64).as_u64(), None);
        assert_eq!(Value::from(7i64).as_u64(), Some(7));
    }

    #[test]
    fn test_one_shot_messages() {
        let backup = ProtocolMessage::Backup(BackupRequest {
            path: Bytes::from("/tmp/b"),
        });
        let query = ProtocolMessage::Query(QueryRequest::default());
        assert!(backup.is_one_shot());
        assert!(!query.is_one_shot());
        assert_eq!(backup.message_type(), message_type::BACKUP_REQUEST);
    }
}
