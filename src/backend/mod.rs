//! Storage Backend Contract
//!
//! The engine never touches storage directly. Everything it knows about a
//! backend is the [`Backend`] trait: a session is opened when a connection is
//! constructed, request operations run against that connection, the session
//! is released when the connection goes away, and the backend is torn down
//! once after every connection has exited.
//!
//! ## Responsibility Split for Queries
//!
//! ```text
//! handler                    backend
//!    │ stream_start()           │
//!    │────────── query() ──────>│ push_entry() x N
//!    │<──────── Ok / Err ───────│
//!    │ stream_end()  (Ok only)  │
//! ```
//!
//! A query that fails after pushing some entries leaves those entries on the
//! wire and no End frame; the connection is then closed.
//!
//! ## Backup and Dump
//!
//! `backup` and `dump` return no status. The engine treats them as accepted
//! and closes the connection afterwards; a backend reports its own failures
//! through logging.
//!
//! ## Implementations
//!
//! - [`MockBackend`]: canned answers, failure injection and call counters
//! - [`MemoryBackend`]: sharded in-memory observation store with snapshots

pub mod memory;
pub mod mock;

pub use memory::MemoryBackend;
pub use mock::MockBackend;

use crate::connection::{Connection, ConnectionError};
use crate::protocol::{BackupRequest, DumpRequest, InputRequest, QueryRequest};
use async_trait::async_trait;
use std::any::Any;
use std::net::SocketAddr;
use thiserror::Error;

/// Opaque per-connection state handed out by [`Backend::init_session`].
///
/// The engine stores it on the connection and never looks inside; a backend
/// gets it back through [`Connection::session`].
pub type Session = Box<dyn Any + Send + Sync>;

/// Errors a backend can report for session setup, queries and input.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("session init failed: {0}")]
    SessionInit(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    /// Streaming a response back to the client failed
    #[error("connection error: {0}")]
    Connection(#[source] Box<ConnectionError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConnectionError> for BackendError {
    fn from(e: ConnectionError) -> Self {
        BackendError::Connection(Box::new(e))
    }
}

/// The capability set every storage backend supplies.
///
/// One backend instance is shared by all connections. Calls from different
/// connections may run concurrently; a backend synchronizes its own state.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Opens the session for a newly accepted connection.
    ///
    /// An error aborts the connection before it is started.
    fn init_session(&self, conn_id: u64, peer: SocketAddr) -> Result<Session, BackendError>;

    /// Releases a session. Called exactly once per successful
    /// [`init_session`](Backend::init_session); must not fail.
    fn deinit_session(&self, conn_id: u64, session: Session);

    /// Releases backend-global resources. Called once, after every
    /// connection has exited.
    fn teardown(&self);

    /// Streams matching records with [`Connection::push_entry`].
    ///
    /// The caller has already sent the Start frame and sends the End frame
    /// only if this returns `Ok`.
    async fn query(&self, conn: &mut Connection, request: &QueryRequest)
        -> Result<(), BackendError>;

    /// Ingests one observation. Success has no response payload.
    async fn input(&self, conn: &mut Connection, request: &InputRequest)
        -> Result<(), BackendError>;

    async fn backup(&self, conn: &mut Connection, request: &BackupRequest);

    /// May emit records with [`Connection::dump_entry`].
    async fn dump(&self, conn: &mut Connection, request: &DumpRequest);
}
