//! Engine Configuration
//!
//! [`EngineConfig`] carries everything the engine needs at construction:
//! the address, server/client mode, the connection throttle, which auxiliary
//! loops to run, the storage backend, and the timeouts and resource bounds
//! applied to every connection.

use crate::backend::Backend;
use crate::protocol::DecodeLimits;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum number of concurrently served connections.
pub const DEFAULT_CONN_THROTTLE_LIMIT: usize = 64;

/// Default size of the per-connection outbound scratch buffer (64 KiB).
pub const DEFAULT_SCRATCH_SIZE: usize = 64 * 1024;

/// Default stats reporting interval.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Timeouts and backoffs for every bounded wait in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Readiness wait before each raw read
    pub read: Duration,
    /// Readiness wait before each write
    pub write: Duration,
    /// Readiness wait on the listening socket
    pub accept: Duration,
    /// Sleep while the connection throttle is saturated
    pub throttle_backoff: Duration,
    /// Poll interval while draining live connections at shutdown
    pub drain_backoff: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(60),
            write: Duration::from_secs(30),
            accept: Duration::from_secs(5),
            throttle_backoff: Duration::from_secs(1),
            drain_backoff: Duration::from_secs(2),
        }
    }
}

/// Per-connection settings derived from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub timeouts: Timeouts,
    pub decode_limits: DecodeLimits,
    pub scratch_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            decode_limits: DecodeLimits::default(),
            scratch_size: DEFAULT_SCRATCH_SIZE,
        }
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// Listen for clients (`true`) or connect out as a client (`false`)
    pub is_server: bool,
    /// Max concurrent connections, server mode only
    pub conn_throttle_limit: usize,
    pub enable_signal_consumer: bool,
    pub enable_stats_reporter: bool,
    /// Storage backend, required in server mode and absent in client mode
    pub backend: Option<Arc<dyn Backend>>,
    pub timeouts: Timeouts,
    pub stats_interval: Duration,
    pub decode_limits: DecodeLimits,
    pub scratch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            is_server: true,
            conn_throttle_limit: DEFAULT_CONN_THROTTLE_LIMIT,
            enable_signal_consumer: true,
            enable_stats_reporter: true,
            backend: None,
            timeouts: Timeouts::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
            decode_limits: DecodeLimits::default(),
            scratch_size: DEFAULT_SCRATCH_SIZE,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("is_server", &self.is_server)
            .field("conn_throttle_limit", &self.conn_throttle_limit)
            .field("enable_signal_consumer", &self.enable_signal_consumer)
            .field("enable_stats_reporter", &self.enable_stats_reporter)
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("timeouts", &self.timeouts)
            .field("stats_interval", &self.stats_interval)
            .field("decode_limits", &self.decode_limits)
            .field("scratch_size", &self.scratch_size)
            .finish()
    }
}

impl EngineConfig {
    /// Server-mode configuration serving `backend` on `host:port`.
    pub fn server(host: impl Into<String>, port: u16, backend: Arc<dyn Backend>) -> Self {
        Self {
            host: host.into(),
            port,
            backend: Some(backend),
            ..Default::default()
        }
    }

    /// Client-mode configuration connecting to `host:port`.
    ///
    /// Client connections never own a backend and run no auxiliary loops.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            is_server: false,
            enable_signal_consumer: false,
            enable_stats_reporter: false,
            ..Default::default()
        }
    }

    pub fn with_throttle_limit(mut self, limit: usize) -> Self {
        self.conn_throttle_limit = limit;
        self
    }

    pub fn with_signal_consumer(mut self, enabled: bool) -> Self {
        self.enable_signal_consumer = enabled;
        self
    }

    pub fn with_stats_reporter(mut self, enabled: bool) -> Self {
        self.enable_stats_reporter = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_decode_limits(mut self, limits: DecodeLimits) -> Self {
        self.decode_limits = limits;
        self
    }

    pub fn with_scratch_size(mut self, size: usize) -> Self {
        self.scratch_size = size;
        self
    }

    /// Returns the bind or connect address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings handed to every connection this engine creates.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            timeouts: self.timeouts,
            decode_limits: self.decode_limits,
            scratch_size: self.scratch_size,
        }
    }
}
