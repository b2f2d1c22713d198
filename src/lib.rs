//! # pdnsgate - A Passive-DNS Observation Store Front End
//!
//! pdnsgate accepts client connections, decodes a compact binary message
//! protocol and hands each request to a pluggable storage backend: ingest an
//! observation, stream the results of a query, write a backup, or stream a
//! dump back to the client.
//!
//! ## Features
//!
//! - **Bounded decoding**: every message is decoded under a memory cap and a
//!   node-count cap, so one peer cannot make the server grow without bound
//! - **Connection throttle**: at most `conn_throttle_limit` connections are
//!   served at once; further clients wait in the listen backlog
//! - **Cooperative shutdown**: stop is a flag observed at every bounded wait;
//!   no connection is ever interrupted mid-write
//! - **Pluggable storage**: any [`Backend`] implementation can be served
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              pdnsgate                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Engine    │───>│ Connection  │───>│  Dispatch   │                  │
//! │  │ accept loop │    │  Handler    │    │             │                  │
//! │  └──────┬──────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │         │                  │                  │                         │
//! │         │                  ▼                  ▼                         │
//! │         │           ┌─────────────┐    ┌──────────────────────────────┐ │
//! │         │           │  Protocol   │    │   Backend (dyn trait)        │ │
//! │         │           │ decode/enc. │    │   MockBackend, MemoryBackend │ │
//! │         │           └─────────────┘    └──────────────────────────────┘ │
//! │         ▼                                                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │ EngineContext: stop flag, live connections, stats counters       │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │         ▲                                   ▲                           │
//! │  ┌──────┴────────┐                  ┌───────┴────────┐                  │
//! │  │ StatsReporter │                  │ SignalConsumer │                  │
//! │  └───────────────┘                  └────────────────┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use pdnsgate::{Engine, EngineConfig, MemoryBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::server("127.0.0.1", 4242, Arc::new(MemoryBackend::new()));
//!     let engine = Engine::start_server(config).await?;
//!     engine.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: message types, bounded decoder, frame encoders
//! - [`connection`]: per-connection state and the decode-dispatch loop
//! - [`engine`]: accept loop, throttle, drain, stats and signal tasks
//! - [`backend`]: the storage contract and its implementations
//! - [`config`]: engine configuration

pub mod backend;
pub mod config;
pub mod connection;
pub mod engine;
pub mod protocol;

// Re-export commonly used types for convenience
pub use backend::{Backend, BackendError, MemoryBackend, MockBackend, Session};
pub use config::{EngineConfig, Timeouts};
pub use connection::{Connection, ConnectionError};
pub use engine::{Engine, EngineContext, EngineError, StatsCounter};
pub use protocol::{Entry, ProtocolMessage, QueryRequest};

/// The default port pdnsgate listens on
pub const DEFAULT_PORT: u16 = 4242;

/// The default host pdnsgate binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of pdnsgate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
