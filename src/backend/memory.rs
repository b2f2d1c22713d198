//! Sharded In-Memory Observation Store
//!
//! A complete [`Backend`] that keeps every observation in memory.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: records are spread over `NUM_SHARDS` shards by
//!    rrname, each behind its own `RwLock`, so inputs for different names
//!    rarely contend and a query by rrname touches a single shard.
//! 2. **Merge on Input**: a record is identified by
//!    `(sensor_id, rrname, rrtype, rdata)`. A repeated observation adds to the
//!    count and widens the first/last-seen window.
//! 3. **No Locks Across Awaits**: a query collects its matches under the read
//!    lock, releases it, and only then streams them to the client.
//!
//! ## Snapshots
//!
//! `backup` writes every record to a file as a sequence of `DumpEntry`
//! frames, the same framing `dump` sends to clients. `dump` reads such a file
//! back and streams each record to the requesting client.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MemoryBackend                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐            │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │            │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │            │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │            │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::backend::{Backend, BackendError, Session};
use crate::connection::Connection;
use crate::protocol::{
    encode_dump_entry, BackupRequest, DecodeLimits, Decoder, DumpRequest, Entry, InputRequest,
    QueryRequest, ResponseFrame,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info};

/// Number of shards for the record map.
const NUM_SHARDS: usize = 64;

/// Identity of a record; observations with the same key are merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    sensor_id: Bytes,
    rrname: Bytes,
    rrtype: Bytes,
    rdata: Bytes,
}

impl RecordKey {
    fn of(entry: &Entry) -> Self {
        Self {
            sensor_id: entry.sensor_id.clone(),
            rrname: entry.rrname.clone(),
            rrtype: entry.rrtype.clone(),
            rdata: entry.rdata.clone(),
        }
    }
}

#[derive(Debug)]
struct Shard {
    records: RwLock<HashMap<RecordKey, Entry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

/// Session state: which connection it belongs to and what it ingested.
#[derive(Debug)]
struct MemorySession {
    conn_id: u64,
    inputs: u64,
}

/// Point-in-time counters of a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub records: u64,
    pub inputs: u64,
    pub queries: u64,
    pub open_sessions: u64,
}

pub struct MemoryBackend {
    shards: Vec<Shard>,
    record_count: AtomicU64,
    input_count: AtomicU64,
    query_count: AtomicU64,
    open_sessions: AtomicU64,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("shards", &self.shards.len())
            .field("records", &self.record_count.load(Ordering::Relaxed))
            .field("open_sessions", &self.open_sessions.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::new()).collect();

        Self {
            shards,
            record_count: AtomicU64::new(0),
            input_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            open_sessions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, rrname: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        rrname.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, rrname: &[u8]) -> &Shard {
        &self.shards[self.shard_index(rrname)]
    }

    /// Stores an observation, merging it into an existing record.
    ///
    /// Returns `true` if a new record was created.
    pub fn insert(&self, entry: Entry) -> bool {
        self.input_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(&entry.rrname);
        let mut records = shard
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match records.get_mut(&RecordKey::of(&entry)) {
            Some(existing) => {
                existing.merge(&entry);
                false
            }
            None => {
                records.insert(RecordKey::of(&entry), entry);
                self.record_count.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Returns the records matching `request`, ordered by rrname, rrtype,
    /// rdata and sensor id, cut at the request limit.
    pub fn find(&self, request: &QueryRequest) -> Vec<Entry> {
        let collect = |shard: &Shard, out: &mut Vec<Entry>| {
            let records = shard
                .records
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            out.extend(records.values().filter(|e| request.matches(e)).cloned());
        };

        let mut found = Vec::new();
        match &request.rrname {
            Some(rrname) => collect(self.get_shard(rrname), &mut found),
            None => {
                for shard in &self.shards {
                    collect(shard, &mut found);
                }
            }
        }

        sort_records(&mut found);
        if request.limit != 0 {
            found.truncate(request.limit as usize);
        }
        found
    }

    /// Every stored record, in the same order as [`find`](Self::find).
    pub fn snapshot(&self) -> Vec<Entry> {
        self.find(&QueryRequest::default())
    }

    pub fn len(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            records: self.record_count.load(Ordering::Relaxed),
            inputs: self.input_count.load(Ordering::Relaxed),
            queries: self.query_count.load(Ordering::Relaxed),
            open_sessions: self.open_sessions.load(Ordering::Relaxed),
        }
    }

    /// Removes every record.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard
                .records
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        self.record_count.store(0, Ordering::Relaxed);
    }

    /// Writes all records to `path` as `DumpEntry` frames.
    ///
    /// Returns the number of records written.
    pub async fn write_snapshot(&self, path: &Path) -> Result<usize, BackendError> {
        let records = self.snapshot();

        let mut out = BytesMut::new();
        let mut frame = BytesMut::new();
        for entry in &records {
            encode_dump_entry(entry, &mut frame, usize::MAX)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            out.extend_from_slice(&frame);
        }

        // Write beside the target first so a failed backup never leaves a
        // truncated snapshot in place.
        let staging = staging_path(path);
        tokio::fs::write(&staging, &out).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(records.len())
    }

    /// Reads a snapshot written by [`write_snapshot`](Self::write_snapshot).
    pub async fn read_snapshot(path: &Path) -> Result<Vec<Entry>, BackendError> {
        let data = tokio::fs::read(path).await?;
        let invalid = |msg: String| BackendError::Io(io::Error::new(io::ErrorKind::InvalidData, msg));

        let mut decoder = Decoder::new(DecodeLimits::default());
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (value, consumed) = match decoder.parse(&data[pos..]) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return Err(invalid(format!("truncated snapshot at byte {}", pos))),
                Err(e) => return Err(invalid(e.to_string())),
            };
            match ResponseFrame::from_value(&value) {
                Ok(ResponseFrame::DumpEntry(entry)) => entries.push(entry),
                Ok(_) => return Err(invalid(format!("unexpected frame at byte {}", pos))),
                Err(e) => return Err(invalid(e.to_string())),
            }
            pos += consumed;
        }
        Ok(entries)
    }
}

fn sort_records(records: &mut [Entry]) {
    records.sort_by(|a, b| {
        (&a.rrname, &a.rrtype, &a.rdata, &a.sensor_id).cmp(&(
            &b.rrname,
            &b.rrtype,
            &b.rdata,
            &b.sensor_id,
        ))
    });
}

/// Maps request path bytes to a filesystem path without altering them.
#[cfg(unix)]
fn request_path(raw: &[u8]) -> io::Result<PathBuf> {
    use std::os::unix::ffi::OsStrExt;
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(raw)))
}

#[cfg(not(unix))]
fn request_path(raw: &[u8]) -> io::Result<PathBuf> {
    std::str::from_utf8(raw)
        .map(PathBuf::from)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8"))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn init_session(&self, conn_id: u64, peer: SocketAddr) -> Result<Session, BackendError> {
        self.open_sessions.fetch_add(1, Ordering::Relaxed);
        debug!(conn = conn_id, client = %peer, "Memory session opened");
        Ok(Box::new(MemorySession { conn_id, inputs: 0 }))
    }

    fn deinit_session(&self, conn_id: u64, session: Session) {
        self.open_sessions.fetch_sub(1, Ordering::Relaxed);
        if let Some(session) = session.downcast_ref::<MemorySession>() {
            debug!(
                conn = session.conn_id,
                inputs = session.inputs,
                "Memory session closed"
            );
        } else {
            debug!(conn = conn_id, "Memory session closed");
        }
    }

    fn teardown(&self) {
        info!(records = self.len(), "Memory backend teardown");
        self.clear();
    }

    async fn query(
        &self,
        conn: &mut Connection,
        request: &QueryRequest,
    ) -> Result<(), BackendError> {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let found = self.find(request);
        debug!(conn = conn.id(), matches = found.len(), "Memory query");
        for entry in &found {
            conn.push_entry(entry).await?;
        }
        Ok(())
    }

    async fn input(
        &self,
        conn: &mut Connection,
        request: &InputRequest,
    ) -> Result<(), BackendError> {
        self.insert(request.entry.clone());
        if let Some(session) = conn.session_mut::<MemorySession>() {
            session.inputs += 1;
        }
        Ok(())
    }

    async fn backup(&self, conn: &mut Connection, request: &BackupRequest) {
        let path = match request_path(&request.path) {
            Ok(path) => path,
            Err(e) => {
                error!(conn = conn.id(), error = %e, "Backup failed");
                return;
            }
        };
        match self.write_snapshot(&path).await {
            Ok(n) => info!(conn = conn.id(), path = %path.display(), records = n, "Backup written"),
            Err(e) => error!(conn = conn.id(), path = %path.display(), error = %e, "Backup failed"),
        }
    }

    async fn dump(&self, conn: &mut Connection, request: &DumpRequest) {
        let path = match request_path(&request.path) {
            Ok(path) => path,
            Err(e) => {
                error!(conn = conn.id(), error = %e, "Dump failed");
                return;
            }
        };
        let entries = match Self::read_snapshot(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(conn = conn.id(), path = %path.display(), error = %e, "Dump failed");
                return;
            }
        };

        for entry in &entries {
            if let Err(e) = conn.dump_entry(entry).await {
                error!(conn = conn.id(), error = %e, "Dump aborted");
                return;
            }
        }
        info!(conn = conn.id(), path = %path.display(), records = entries.len(), "Dump streamed");
    }
}
