//! Mock backend.
//!
//! Answers every query with a fixed set of records (by default a single
//! canned test entry), accepts every input, and counts each call so tests can
//! assert on what the engine did. Failures can be injected for session setup,
//! input and queries.

use crate::backend::{Backend, BackendError, Session};
use crate::connection::Connection;
use crate::protocol::{BackupRequest, DumpRequest, Entry, InputRequest, QueryRequest};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// Session handed out by [`MockBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSession {
    pub id: u64,
}

/// Per-connection query count, kept in the connection's user context.
#[derive(Debug, Default)]
struct QueryCount(u64);

#[derive(Debug, Default)]
struct Calls {
    init: AtomicUsize,
    deinit: AtomicUsize,
    teardown: AtomicUsize,
    query: AtomicUsize,
    input: AtomicUsize,
    backup: AtomicUsize,
    dump: AtomicUsize,
}

#[derive(Debug)]
pub struct MockBackend {
    entries: Vec<Entry>,
    fail_session_init: bool,
    fail_input: bool,
    fail_query_after: Option<usize>,
    next_session: AtomicU64,
    calls: Calls,
    received: Mutex<Vec<Entry>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            entries: vec![Self::canned_entry()],
            fail_session_init: false,
            fail_input: false,
            fail_query_after: None,
            next_session: AtomicU64::new(1),
            calls: Calls::default(),
            received: Mutex::new(Vec::new()),
        }
    }

    /// The record every query returns unless configured otherwise.
    pub fn canned_entry() -> Entry {
        Entry::new(
            "test-sensor-id",
            "test-rrname",
            "A",
            "",
            23,
            15_000_000,
            15_001_000,
        )
    }

    /// Replaces the records returned by queries and dumps.
    pub fn with_entries(mut self, entries: Vec<Entry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn fail_session_init(mut self) -> Self {
        self.fail_session_init = true;
        self
    }

    pub fn fail_input(mut self) -> Self {
        self.fail_input = true;
        self
    }

    /// Makes every query fail once `pushed` records have been streamed.
    pub fn fail_query_after(mut self, pushed: usize) -> Self {
        self.fail_query_after = Some(pushed);
        self
    }

    pub fn init_calls(&self) -> usize {
        self.calls.init.load(Ordering::SeqCst)
    }

    pub fn deinit_calls(&self) -> usize {
        self.calls.deinit.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> usize {
        self.calls.teardown.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.calls.query.load(Ordering::SeqCst)
    }

    pub fn input_calls(&self) -> usize {
        self.calls.input.load(Ordering::SeqCst)
    }

    pub fn backup_calls(&self) -> usize {
        self.calls.backup.load(Ordering::SeqCst)
    }

    pub fn dump_calls(&self) -> usize {
        self.calls.dump.load(Ordering::SeqCst)
    }

    /// Every entry accepted by `input`, in arrival order.
    pub fn received(&self) -> Vec<Entry> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn injected_query_failure(&self, pushed: usize) -> Result<(), BackendError> {
        match self.fail_query_after {
            Some(limit) if pushed >= limit => {
                Err(BackendError::Rejected("injected query failure".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn init_session(&self, conn_id: u64, peer: SocketAddr) -> Result<Session, BackendError> {
        self.calls.init.fetch_add(1, Ordering::SeqCst);
        if self.fail_session_init {
            return Err(BackendError::SessionInit(format!(
                "injected failure for {}",
                peer
            )));
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        trace!(conn = conn_id, session = id, "Mock session opened");
        Ok(Box::new(MockSession { id }))
    }

    fn deinit_session(&self, conn_id: u64, _session: Session) {
        trace!(conn = conn_id, "Mock session closed");
        self.calls.deinit.fetch_add(1, Ordering::SeqCst);
    }

    fn teardown(&self) {
        debug!("Mock backend teardown");
        self.calls.teardown.fetch_add(1, Ordering::SeqCst);
    }

    async fn query(
        &self,
        conn: &mut Connection,
        request: &QueryRequest,
    ) -> Result<(), BackendError> {
        self.calls.query.fetch_add(1, Ordering::SeqCst);

        let session = conn
            .session::<MockSession>()
            .copied()
            .ok_or_else(|| BackendError::Rejected("no mock session".to_string()))?;

        if conn.user_context::<QueryCount>().is_none() {
            conn.set_user_context(QueryCount::default());
        }
        if let Some(count) = conn.user_context_mut::<QueryCount>() {
            count.0 += 1;
            trace!(session = session.id, queries = count.0, "Mock query");
        }

        // Filters are ignored; only the limit is honored.
        let mut pushed = 0;
        for entry in &self.entries {
            self.injected_query_failure(pushed)?;
            if request.limit_reached(pushed) {
                return Ok(());
            }
            conn.push_entry(entry).await?;
            pushed += 1;
        }
        self.injected_query_failure(pushed)
    }

    async fn input(
        &self,
        _conn: &mut Connection,
        request: &InputRequest,
    ) -> Result<(), BackendError> {
        self.calls.input.fetch_add(1, Ordering::SeqCst);
        if self.fail_input {
            return Err(BackendError::Rejected("injected input failure".to_string()));
        }

        trace!(entry = %request.entry, "Mock input");
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.entry.clone());
        Ok(())
    }

    async fn backup(&self, _conn: &mut Connection, request: &BackupRequest) {
        self.calls.backup.fetch_add(1, Ordering::SeqCst);
        debug!(path = %String::from_utf8_lossy(&request.path), "Mock backup");
    }

    async fn dump(&self, conn: &mut Connection, request: &DumpRequest) {
        self.calls.dump.fetch_add(1, Ordering::SeqCst);
        debug!(path = %String::from_utf8_lossy(&request.path), "Mock dump");

        for entry in &self.entries {
            if let Err(e) = conn.dump_entry(entry).await {
                warn!(error = %e, "Mock dump aborted");
                return;
            }
        }
    }
}
