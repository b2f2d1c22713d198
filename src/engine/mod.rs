//! Connection Engine
//!
//! The [`Engine`] owns the listening socket and runs the accept loop. It
//! admits connections up to the throttle limit, spawns one task per
//! connection, supervises the auxiliary stats and signal tasks, and drains
//! cooperatively on stop.
//!
//! ## Accept Loop
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ stop requested? ─────────────────────────────> drain     │
//! │ live >= throttle? ──> sleep(throttle_backoff), retry     │
//! │ accept with timeout                                      │
//! │   timeout ──> retry (re-checks stop)                     │
//! │   error ────> request_stop, drain                        │
//! │   socket ───> init session, count live, spawn handler    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shutdown
//!
//! Stop is a flag, never a forced abort. After the accept loop exits the
//! listener is closed, the engine waits until the live-connection count
//! reaches zero, joins the auxiliary tasks and finally tears the backend
//! down.

pub mod context;
pub mod signal;
pub mod stats;

pub use context::{EngineContext, LiveGuard};
pub use signal::SignalConsumer;
pub use stats::{Stats, StatsCounter, StatsReporter, StatsSnapshot};

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::connection::{handle_connection, Connection};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Pending-connection queue length of the listening socket.
const LISTEN_BACKLOG: u32 = 1024;

/// Setup errors. No partial engine is ever returned.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("socket creation failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

fn parse_address(config: &EngineConfig) -> Result<SocketAddr, EngineError> {
    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|_| EngineError::InvalidAddress(config.bind_address()))?;
    Ok(SocketAddr::new(ip, config.port))
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, EngineError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(EngineError::Socket)?;

    socket.set_reuseaddr(true).map_err(EngineError::Socket)?;
    socket
        .bind(addr)
        .map_err(|source| EngineError::Bind { addr, source })?;
    socket.listen(LISTEN_BACKLOG).map_err(EngineError::Listen)
}

/// A bound server engine, ready to [`run`](Engine::run).
pub struct Engine {
    listener: TcpListener,
    local_addr: SocketAddr,
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    context: Arc<EngineContext>,
    next_conn_id: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("local_addr", &self.local_addr)
            .field("backend", &self.backend.name())
            .field("conn_throttle_limit", &self.config.conn_throttle_limit)
            .field("live_connections", &self.context.live_connections())
            .finish()
    }
}

impl Engine {
    /// Binds and listens on the configured address.
    ///
    /// Requires server mode, a backend and a throttle limit of at least one.
    /// Registering the listener needs a running tokio runtime, hence `async`.
    pub async fn start_server(config: EngineConfig) -> Result<Self, EngineError> {
        if !config.is_server {
            return Err(EngineError::InvalidConfig("server mode required"));
        }
        let backend = config
            .backend
            .clone()
            .ok_or(EngineError::InvalidConfig("server mode requires a backend"))?;
        if config.conn_throttle_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "connection throttle limit must be at least 1",
            ));
        }

        let addr = parse_address(&config)?;
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr().map_err(EngineError::Listen)?;

        info!(
            addr = %local_addr,
            backend = backend.name(),
            throttle = config.conn_throttle_limit,
            "Engine listening"
        );

        Ok(Self {
            listener,
            local_addr,
            backend,
            config,
            context: Arc::new(EngineContext::new()),
            next_conn_id: 0,
        })
    }

    /// Opens an outbound connection that speaks the protocol as a client.
    ///
    /// Requires client mode and no backend. The connection gets its own
    /// private context.
    pub async fn start_client(config: EngineConfig) -> Result<Connection, EngineError> {
        if config.is_server {
            return Err(EngineError::InvalidConfig("client mode required"));
        }
        if config.backend.is_some() {
            return Err(EngineError::InvalidConfig("client mode takes no backend"));
        }

        let addr = parse_address(&config)?;
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|source| EngineError::Connect { addr, source })?;

        debug!(server = %addr, "Client connected");
        Ok(Connection::connect(
            socket,
            addr,
            Arc::new(EngineContext::new()),
            config.connection_settings(),
        ))
    }

    /// The address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state; hold on to it to stop the engine or read its counters.
    pub fn context(&self) -> Arc<EngineContext> {
        Arc::clone(&self.context)
    }

    pub fn request_stop(&self) {
        self.context.request_stop();
    }

    /// Receiver of the per-interval stats snapshots.
    ///
    /// Take it before [`run`](Engine::run); it keeps working for as long as
    /// the engine runs with the stats reporter enabled.
    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.context.subscribe_stats()
    }

    /// Runs the accept loop until stop is requested, then drains and tears
    /// down.
    pub async fn run(mut self) {
        let reporter = self.config.enable_stats_reporter.then(|| {
            StatsReporter::start(Arc::clone(&self.context), self.config.stats_interval)
        });
        let signals = self
            .config
            .enable_signal_consumer
            .then(|| SignalConsumer::start(Arc::clone(&self.context)));

        self.accept_loop().await;

        let Engine {
            listener,
            backend,
            config,
            context,
            ..
        } = self;

        // No new connection can arrive while draining.
        drop(listener);
        context.wait_drained(config.timeouts.drain_backoff).await;

        // Releases the auxiliary tasks when the loop ended on its own.
        context.request_stop();
        if let Some(reporter) = reporter {
            reporter.join().await;
        }
        if let Some(signals) = signals {
            signals.join().await;
        }

        backend.teardown();
        info!(
            peak_connections = context.peak_connections(),
            "Engine stopped"
        );
    }

    async fn accept_loop(&mut self) {
        let timeouts = self.config.timeouts;
        let limit = self.config.conn_throttle_limit;
        let mut stop_rx = self.context.subscribe_stop();

        loop {
            if self.context.stop_requested() {
                debug!("Engine stop detected, leaving accept loop");
                return;
            }

            let live = self.context.live_connections();
            if live >= limit {
                trace!(live = live, limit = limit, "Connection throttle reached");
                tokio::time::sleep(timeouts.throttle_backoff).await;
                continue;
            }

            let accepted = tokio::select! {
                res = tokio::time::timeout(timeouts.accept, self.listener.accept()) => res,
                _ = stop_rx.changed() => continue,
            };

            match accepted {
                Err(_) => trace!("Accept timeout, re-checking stop"),
                Ok(Ok((socket, peer))) => self.admit(socket, peer),
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed, stopping engine");
                    self.context.request_stop();
                    return;
                }
            }
        }
    }

    fn admit(&mut self, socket: TcpStream, peer: SocketAddr) {
        self.next_conn_id += 1;
        let id = self.next_conn_id;

        let conn = match Connection::accept(
            id,
            socket,
            peer,
            Arc::clone(&self.context),
            Arc::clone(&self.backend),
            self.config.connection_settings(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                self.context.stats().bump(StatsCounter::Errors);
                warn!(client = %peer, conn = id, error = %e, "Session init failed, dropping connection");
                return;
            }
        };

        self.context.stats().bump(StatsCounter::Connections);
        // Counted before the task starts so the throttle check above never
        // sees a spawned but uncounted connection.
        let guard = self.context.enter_connection();
        trace!(client = %peer, conn = id, live = self.context.live_connections(), "Connection admitted");
        tokio::spawn(handle_connection(conn, guard));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MockBackend};
    use crate::config::Timeouts;
    use crate::protocol::{encode_message, DecodeLimits, DumpRequest, Entry, ProtocolMessage, QueryRequest};
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::task::JoinHandle;

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            read: Duration::from_millis(50),
            write: Duration::from_millis(200),
            accept: Duration::from_millis(50),
            throttle_backoff: Duration::from_millis(10),
            drain_backoff: Duration::from_millis(20),
        }
    }

    fn server_config(backend: Arc<dyn Backend>, throttle: usize) -> EngineConfig {
        EngineConfig::server("127.0.0.1", 0, backend)
            .with_throttle_limit(throttle)
            .with_signal_consumer(false)
            .with_stats_reporter(false)
            .with_timeouts(fast_timeouts())
    }

    async fn start(config: EngineConfig) -> (SocketAddr, Arc<EngineContext>, JoinHandle<()>) {
        let engine = Engine::start_server(config).await.unwrap();
        let addr = engine.local_addr();
        let ctx = engine.context();
        (addr, ctx, tokio::spawn(engine.run()))
    }

    async fn client(addr: SocketAddr) -> Connection {
        let config = EngineConfig::client(addr.ip().to_string(), addr.port())
            .with_timeouts(fast_timeouts());
        Engine::start_client(config).await.unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn entry(rrname: &str, rdata: &str) -> Entry {
        Entry::new("sensor", rrname.to_string(), "A", rdata.to_string(), 1, 100, 100)
    }

    #[tokio::test]
    async fn test_start_server_validates_config() {
        let no_backend = EngineConfig {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(
            Engine::start_server(no_backend).await,
            Err(EngineError::InvalidConfig(_))
        ));

        let client_mode = EngineConfig::client("127.0.0.1", 0);
        assert!(matches!(
            Engine::start_server(client_mode).await,
            Err(EngineError::InvalidConfig(_))
        ));

        let zero_throttle = server_config(Arc::new(MockBackend::new()), 0);
        assert!(matches!(
            Engine::start_server(zero_throttle).await,
            Err(EngineError::InvalidConfig(_))
        ));

        let mut bad_host = server_config(Arc::new(MockBackend::new()), 1);
        bad_host.host = "not-an-address".to_string();
        assert!(matches!(
            Engine::start_server(bad_host).await,
            Err(EngineError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_setup_error() {
        let (addr, ctx, handle) =
            start(server_config(Arc::new(MockBackend::new()), 1)).await;

        // Both sockets set SO_REUSEADDR, which does not allow two listeners.
        let config = EngineConfig::server("127.0.0.1", addr.port(), Arc::new(MockBackend::new()));
        assert!(matches!(
            Engine::start_server(config).await,
            Err(EngineError::Bind { .. })
        ));

        ctx.request_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_client_validates_config() {
        let server_mode = EngineConfig::server("127.0.0.1", 1, Arc::new(MockBackend::new()));
        assert!(matches!(
            Engine::start_client(server_mode).await,
            Err(EngineError::InvalidConfig(_))
        ));

        let mut with_backend = EngineConfig::client("127.0.0.1", 1);
        with_backend.backend = Some(Arc::new(MockBackend::new()));
        assert!(matches!(
            Engine::start_client(with_backend).await,
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_client_connect_failure() {
        // Grab a free port, then close it again.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = Engine::start_client(EngineConfig::client("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_query_round_trip_through_engine() {
        let backend = Arc::new(MockBackend::new());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 4)).await;

        let mut conn = client(addr).await;
        let result = conn.query(QueryRequest::by_rrname("anything")).await.unwrap();
        assert_eq!(result, vec![MockBackend::canned_entry()]);
        drop(conn);

        wait_until(|| ctx.live_connections() == 0).await;
        assert_eq!(ctx.stats().get(StatsCounter::Connections), 1);
        assert_eq!(ctx.stats().get(StatsCounter::Queries), 1);
        assert!(ctx.stats().get(StatsCounter::BytesSent) > 0);
        assert!(ctx.stats().get(StatsCounter::BytesReceived) > 0);

        ctx.request_stop();
        handle.await.unwrap();
        assert_eq!(backend.teardown_calls(), 1);
    }

    #[tokio::test]
    async fn test_throttle_holds_second_client() {
        let backend = Arc::new(MockBackend::new());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 1)).await;

        let first = client(addr).await;
        wait_until(|| ctx.live_connections() == 1).await;

        // The kernel completes the handshake, but the engine does not admit it.
        let mut second = client(addr).await;
        second.input(entry("a.example", "192.0.2.1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.live_connections(), 1);
        assert_eq!(backend.input_calls(), 0);
        assert_eq!(ctx.stats().get(StatsCounter::Connections), 1);

        drop(first);
        wait_until(|| backend.input_calls() == 1).await;
        assert_eq!(ctx.stats().get(StatsCounter::Connections), 2);
        assert_eq!(ctx.peak_connections(), 1);

        drop(second);
        ctx.request_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_init_failure_drops_connection() {
        let backend = Arc::new(MockBackend::new().fail_session_init());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 2)).await;

        let mut conn = client(addr).await;
        wait_until(|| backend.init_calls() == 1).await;

        // The server side is gone before any request is served.
        let frame = conn.query(QueryRequest::default()).await;
        assert!(frame.is_err());
        wait_until(|| ctx.stats().get(StatsCounter::Errors) == 1).await;
        assert_eq!(ctx.live_connections(), 0);
        assert_eq!(ctx.stats().get(StatsCounter::Connections), 0);
        assert_eq!(backend.query_calls(), 0);
        assert_eq!(backend.deinit_calls(), 0);

        ctx.request_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_input_failure_closes_connection() {
        let backend = Arc::new(MockBackend::new().fail_input());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 2)).await;

        let mut conn = client(addr).await;
        conn.input(entry("a.example", "192.0.2.1")).await.unwrap();
        assert!(matches!(conn.read_frame().await, Ok(None) | Err(_)));

        wait_until(|| ctx.live_connections() == 0).await;
        assert_eq!(ctx.stats().get(StatsCounter::Errors), 1);

        ctx.request_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_and_refuses_new_clients() {
        let backend = Arc::new(MockBackend::new());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 4)).await;

        let _idle = client(addr).await;
        let _also_idle = client(addr).await;
        wait_until(|| ctx.live_connections() == 2).await;

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not drain")
            .unwrap();

        assert_eq!(ctx.live_connections(), 0);
        assert_eq!(backend.deinit_calls(), 2);
        assert_eq!(backend.teardown_calls(), 1);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_request_is_dropped() {
        let backend = Arc::new(MockBackend::new());
        let config = server_config(backend.clone(), 2).with_decode_limits(DecodeLimits {
            memcap: 512,
            max_nodes: 64,
        });
        let (addr, ctx, handle) = start(config).await;

        let mut conn = client(addr).await;
        let _ = conn.input(entry(&"x".repeat(4096), "")).await;

        wait_until(|| ctx.stats().get(StatsCounter::Errors) == 1).await;
        wait_until(|| ctx.live_connections() == 0).await;
        assert_eq!(backend.input_calls(), 0);

        ctx.request_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dump_ignores_trailing_bytes() {
        let backend = Arc::new(MockBackend::new());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 2)).await;

        let mut conn = client(addr).await;
        let dumped = conn.dump("/var/lib/pdns/snapshot").await.unwrap();
        assert_eq!(dumped.len(), 1);

        // Two dump requests in one write: only the first is dispatched.
        let mut frame = bytes::BytesMut::new();
        encode_message(
            &ProtocolMessage::Dump(DumpRequest {
                path: "/tmp/x".into(),
            }),
            &mut frame,
            usize::MAX,
        )
        .unwrap();
        let mut pipelined = frame.to_vec();
        pipelined.extend_from_slice(&frame);

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let _ = raw.write_all(&pipelined).await;

        wait_until(|| backend.dump_calls() == 2 && ctx.live_connections() == 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.dump_calls(), 2);
        assert_eq!(ctx.stats().get(StatsCounter::Dumps), 2);

        ctx.request_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend_end_to_end() {
        let backend = Arc::new(MemoryBackend::new());
        let (addr, ctx, handle) = start(server_config(backend.clone(), 4)).await;

        let mut writer = client(addr).await;
        writer.input(entry("a.example", "192.0.2.1")).await.unwrap();
        writer.input(entry("a.example", "192.0.2.1")).await.unwrap();
        writer.input(entry("b.example", "192.0.2.2")).await.unwrap();
        let found = writer.query(QueryRequest::by_rrname("a.example")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].count, 2);

        let path = std::env::temp_dir().join(format!("pdnsgate-engine-{}.snap", std::process::id()));
        let path_str = path.to_string_lossy().into_owned();

        let mut admin = client(addr).await;
        admin.backup(path_str.clone()).await.unwrap();
        assert_eq!(admin.read_frame().await.unwrap(), None);
        assert!(path.exists());

        let mut reader = client(addr).await;
        let dumped = reader.dump(path_str).await.unwrap();
        assert_eq!(dumped, backend.snapshot());
        assert_eq!(dumped.len(), 2);

        assert_eq!(ctx.stats().get(StatsCounter::Backups), 1);
        assert_eq!(ctx.stats().get(StatsCounter::Dumps), 1);

        let _ = std::fs::remove_file(&path);
        drop(writer);
        ctx.request_stop();
        handle.await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_stats_snapshots_reach_subscribers() {
        let config = server_config(Arc::new(MockBackend::new()), 2)
            .with_stats_reporter(true)
            .with_stats_interval(Duration::from_millis(100));
        let engine = Engine::start_server(config).await.unwrap();
        let addr = engine.local_addr();
        let ctx = engine.context();
        let mut snapshots = engine.subscribe_stats();
        let handle = tokio::spawn(engine.run());

        let mut conn = client(addr).await;
        conn.query(QueryRequest::default()).await.unwrap();
        conn.query(QueryRequest::default()).await.unwrap();
        drop(conn);

        // Activity may straddle an interval boundary; add up the reports.
        let mut queries = 0;
        let mut connections = 0;
        tokio::time::timeout(Duration::from_secs(5), async {
            while queries < 2 || connections < 1 {
                snapshots.changed().await.unwrap();
                let s = *snapshots.borrow_and_update();
                queries += s.queries;
                connections += s.connections;
            }
        })
        .await
        .expect("no snapshot with the traffic was published");
        assert_eq!(queries, 2);
        assert_eq!(connections, 1);

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_reporter_runs_with_engine() {
        let config = server_config(Arc::new(MockBackend::new()), 2)
            .with_stats_reporter(true)
            .with_stats_interval(Duration::from_millis(30));
        let (addr, ctx, handle) = start(config).await;

        let mut conn = client(addr).await;
        conn.query(QueryRequest::default()).await.unwrap();
        drop(conn);

        // The reporter slurps the counters, so they read zero afterwards.
        wait_until(|| ctx.stats().get(StatsCounter::Queries) == 0).await;

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_live_connections_never_exceed_throttle(
            limit in 1usize..4,
            arrivals in proptest::collection::vec((0u64..15, 0u64..40), 1..8),
        ) {
            let (peak, accepted) = tokio_test::block_on(async move {
                let backend = Arc::new(MockBackend::new());
                let (addr, ctx, handle) = start(server_config(backend.clone(), limit)).await;

                let clients: Vec<_> = arrivals
                    .into_iter()
                    .map(|(delay, hold)| {
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            let conn = client(addr).await;
                            tokio::time::sleep(Duration::from_millis(hold)).await;
                            drop(conn);
                        })
                    })
                    .collect();
                let total = clients.len();
                for c in clients {
                    c.await.unwrap();
                }

                wait_until(|| {
                    ctx.stats().get(StatsCounter::Connections) as usize == total
                        && ctx.live_connections() == 0
                })
                .await;

                ctx.request_stop();
                handle.await.unwrap();
                (ctx.peak_connections(), backend.init_calls())
            });

            prop_assert!(peak <= limit);
            prop_assert!(peak >= 1);
            prop_assert!(accepted >= 1);
        }
    }
}
