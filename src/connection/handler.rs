//! Connection Handler Module
//!
//! A [`Connection`] is the per-client state: the socket, the decode stream,
//! the outbound scratch buffer, the backend session and an optional user
//! context slot for the backend. [`handle_connection`] drives one connection
//! through its decode-dispatch loop on its own task.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Engine accepts the socket and opens a backend session
//!        │
//!        ▼
//! 2. handle_connection spawned (already counted as live)
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  stop requested? ──> exit    │
//!    │  decode one message          │
//!    │    EOF ──────────> exit      │
//!    │    error ────────> exit      │
//!    │  dispatch to the backend     │
//!    │    error ────────> exit      │
//!    │  backup/dump ─────> exit     │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Session released, socket closed, live count dropped
//! ```
//!
//! ## Buffer Management
//!
//! Inbound bytes are staged in the decode stream so that pipelined requests
//! survive the writes of earlier responses. Outbound frames are encoded into
//! a fixed-capacity scratch buffer; a frame that does not fit is an error.

use crate::backend::{Backend, BackendError, Session};
use crate::config::ConnectionSettings;
use crate::connection::dispatch::dispatch;
use crate::connection::transport::Transport;
use crate::engine::{EngineContext, LiveGuard, StatsCounter};
use crate::protocol::{
    encode_dump_entry, encode_message, encode_stream_end, encode_stream_entry,
    encode_stream_start, BackupRequest, DecodeError, DumpRequest, EncodeError, Entry,
    InputRequest, ProtocolMessage, ProtocolStream, QueryRequest, ResponseFrame,
};
use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The engine is stopping
    #[error("engine stop requested")]
    Stopped,

    /// A request arrived on a connection without a backend
    #[error("connection has no backend")]
    NoBackend,

    /// The peer closed the connection in the middle of a response
    #[error("connection closed by peer")]
    Closed,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}

impl ConnectionError {
    /// True for endings that are not failures of this connection.
    pub fn is_graceful(&self) -> bool {
        match self {
            ConnectionError::Stopped => true,
            // A backend that propagated a connection error with `?`
            ConnectionError::Backend(BackendError::Connection(inner)) => inner.is_graceful(),
            ConnectionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// State of one client connection, server or client side.
pub struct Connection {
    id: u64,
    transport: Transport,
    stream: ProtocolStream,
    scratch: BytesMut,
    scratch_size: usize,
    backend: Option<Arc<dyn Backend>>,
    session: Option<Session>,
    user_context: Option<Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.transport.peer())
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("buffered", &self.stream.buffered())
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

impl Connection {
    fn new(
        id: u64,
        socket: TcpStream,
        peer: SocketAddr,
        context: Arc<EngineContext>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            id,
            transport: Transport::new(socket, peer, context, settings.timeouts),
            stream: ProtocolStream::new(settings.decode_limits),
            scratch: BytesMut::with_capacity(settings.scratch_size),
            scratch_size: settings.scratch_size,
            backend: None,
            session: None,
            user_context: None,
        }
    }

    /// Builds a server-side connection and opens its backend session.
    ///
    /// A session init failure is returned and the socket is dropped.
    pub fn accept(
        id: u64,
        socket: TcpStream,
        peer: SocketAddr,
        context: Arc<EngineContext>,
        backend: Arc<dyn Backend>,
        settings: ConnectionSettings,
    ) -> Result<Self, BackendError> {
        let session = backend.init_session(id, peer)?;

        let mut conn = Self::new(id, socket, peer, context, settings);
        conn.backend = Some(backend);
        conn.session = Some(session);
        Ok(conn)
    }

    /// Builds a client-side connection. It owns no backend.
    pub fn connect(
        socket: TcpStream,
        peer: SocketAddr,
        context: Arc<EngineContext>,
        settings: ConnectionSettings,
    ) -> Self {
        Self::new(0, socket, peer, context, settings)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.transport.peer()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        self.transport.context()
    }

    pub fn backend(&self) -> Option<&Arc<dyn Backend>> {
        self.backend.as_ref()
    }

    /// The backend session, downcast to the backend's own type.
    pub fn session<T: Any>(&self) -> Option<&T> {
        self.session.as_ref().and_then(|s| s.downcast_ref::<T>())
    }

    pub fn session_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.session.as_mut().and_then(|s| s.downcast_mut::<T>())
    }

    /// Attaches backend-specific state to this connection.
    pub fn set_user_context<T: Any + Send + Sync>(&mut self, value: T) {
        self.user_context = Some(Box::new(value));
    }

    pub fn user_context<T: Any>(&self) -> Option<&T> {
        self.user_context.as_ref().and_then(|c| c.downcast_ref::<T>())
    }

    pub fn user_context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_context.as_mut().and_then(|c| c.downcast_mut::<T>())
    }

    fn check_stop(&self) -> Result<(), ConnectionError> {
        if self.context().stop_requested() {
            debug!(conn = self.id, "Engine stop detected");
            return Err(ConnectionError::Stopped);
        }
        Ok(())
    }

    async fn flush_scratch(&mut self) -> Result<(), ConnectionError> {
        self.transport.write_all(&self.scratch).await
    }

    /// Sends the frame that opens a query result stream.
    pub async fn stream_start(&mut self) -> Result<(), ConnectionError> {
        self.check_stop()?;
        encode_stream_start(&mut self.scratch, self.scratch_size)?;
        self.flush_scratch().await
    }

    /// Sends one query result record.
    pub async fn push_entry(&mut self, entry: &Entry) -> Result<(), ConnectionError> {
        self.check_stop()?;
        trace!(conn = self.id, %entry, "Query stream push entry");
        encode_stream_entry(entry, &mut self.scratch, self.scratch_size)?;
        self.flush_scratch().await
    }

    /// Sends the frame that closes a query result stream.
    pub async fn stream_end(&mut self) -> Result<(), ConnectionError> {
        self.check_stop()?;
        encode_stream_end(&mut self.scratch, self.scratch_size)?;
        self.flush_scratch().await
    }

    /// Sends a standalone record outside of any query stream.
    pub async fn dump_entry(&mut self, entry: &Entry) -> Result<(), ConnectionError> {
        self.check_stop()?;
        trace!(conn = self.id, %entry, "Dump push entry");
        encode_dump_entry(entry, &mut self.scratch, self.scratch_size)?;
        self.flush_scratch().await
    }

    /// Decodes the next client request; `None` on a clean end of stream.
    pub async fn read_message(&mut self) -> Result<Option<ProtocolMessage>, ConnectionError> {
        self.stream.decode(&mut self.transport).await
    }

    /// Runs the decode-dispatch loop until end of stream, an error, or a
    /// one-shot request.
    pub async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.check_stop()?;

            let msg = match self.read_message().await? {
                Some(msg) => msg,
                None => return Ok(()),
            };

            trace!(conn = self.id, request = msg.name(), "Dispatching request");
            let one_shot = msg.is_one_shot();
            dispatch(self, msg).await?;

            if one_shot {
                debug!(conn = self.id, "One-shot request done, closing connection");
                return Ok(());
            }
        }
    }

    /// Sends one request to the server.
    pub async fn send_message(&mut self, msg: &ProtocolMessage) -> Result<(), ConnectionError> {
        encode_message(msg, &mut self.scratch, self.scratch_size)?;
        self.flush_scratch().await
    }

    /// Reads one response frame; `None` when the server closed the connection.
    pub async fn read_frame(&mut self) -> Result<Option<ResponseFrame>, ConnectionError> {
        self.stream.decode_frame(&mut self.transport).await
    }

    pub async fn input(&mut self, entry: Entry) -> Result<(), ConnectionError> {
        self.send_message(&ProtocolMessage::Input(InputRequest { entry }))
            .await
    }

    /// Runs a query and collects the streamed records.
    pub async fn query(&mut self, request: QueryRequest) -> Result<Vec<Entry>, ConnectionError> {
        self.send_message(&ProtocolMessage::Query(request)).await?;

        match self.read_frame().await? {
            Some(ResponseFrame::StreamStart) => {}
            Some(_) => return Err(ConnectionError::UnexpectedFrame("expected stream start")),
            None => return Err(ConnectionError::Closed),
        }

        let mut entries = Vec::new();
        loop {
            match self.read_frame().await? {
                Some(ResponseFrame::StreamEntry(entry)) => entries.push(entry),
                Some(ResponseFrame::StreamEnd) => return Ok(entries),
                Some(_) => return Err(ConnectionError::UnexpectedFrame("expected stream entry")),
                None => return Err(ConnectionError::Closed),
            }
        }
    }

    /// Asks the server to write a backup to `path`. The server closes the
    /// connection afterwards.
    pub async fn backup(&mut self, path: impl Into<Bytes>) -> Result<(), ConnectionError> {
        let path = path.into();
        self.send_message(&ProtocolMessage::Backup(BackupRequest { path }))
            .await
    }

    /// Asks the server to dump `path` and collects the records it emits
    /// until it closes the connection.
    pub async fn dump(&mut self, path: impl Into<Bytes>) -> Result<Vec<Entry>, ConnectionError> {
        let path = path.into();
        self.send_message(&ProtocolMessage::Dump(DumpRequest { path }))
            .await?;

        let mut entries = Vec::new();
        loop {
            match self.read_frame().await? {
                Some(ResponseFrame::DumpEntry(entry)) => entries.push(entry),
                Some(_) => return Err(ConnectionError::UnexpectedFrame("expected dump entry")),
                None => return Ok(entries),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stream.teardown();
        if let (Some(backend), Some(session)) = (self.backend.as_ref(), self.session.take()) {
            backend.deinit_session(self.id, session);
        }
    }
}

/// Drives a server-side connection to completion.
///
/// The `guard` keeps the connection counted as live; it is released only
/// after the backend session and the socket are gone.
pub async fn handle_connection(mut conn: Connection, guard: LiveGuard) {
    let peer = conn.peer();
    let id = conn.id();
    info!(client = %peer, conn = id, "Client connected");

    match conn.serve().await {
        Ok(()) => info!(client = %peer, conn = id, "Client disconnected"),
        Err(e) if e.is_graceful() => {
            debug!(client = %peer, conn = id, reason = %e, "Connection closed")
        }
        Err(e) => {
            conn.context().stats().bump(StatsCounter::Errors);
            warn!(client = %peer, conn = id, error = %e, "Connection error");
        }
    }

    drop(conn);
    drop(guard);
}
