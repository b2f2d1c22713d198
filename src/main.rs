//! pdnsgate - Passive-DNS Observation Store Front End
//!
//! This is the main entry point for the pdnsgate server.
//! It parses the command line, sets up logging, builds the backend and runs
//! the engine until a termination signal arrives.

use anyhow::{bail, Context};
use pdnsgate::{Backend, Engine, EngineConfig, MemoryBackend, MockBackend};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Which storage backend to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    Mock,
    Memory,
}

/// Server configuration from the command line
#[derive(Debug)]
struct Args {
    host: String,
    port: u16,
    throttle: usize,
    backend: BackendKind,
    stats: bool,
    signals: bool,
    verbose: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            host: pdnsgate::DEFAULT_HOST.to_string(),
            port: pdnsgate::DEFAULT_PORT,
            throttle: pdnsgate::config::DEFAULT_CONN_THROTTLE_LIMIT,
            backend: BackendKind::Memory,
            stats: true,
            signals: true,
            verbose: false,
        }
    }
}

impl Args {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        let mut args = Args::default();
        let mut argv = std::env::args().skip(1);

        while let Some(arg) = argv.next() {
            match arg.as_str() {
                "--host" | "-h" => {
                    args.host = argv.next().context("--host requires a value")?;
                }
                "--port" | "-p" => {
                    let value = argv.next().context("--port requires a value")?;
                    args.port = value
                        .parse()
                        .with_context(|| format!("invalid port number `{}`", value))?;
                }
                "--throttle" | "-t" => {
                    let value = argv.next().context("--throttle requires a value")?;
                    args.throttle = value
                        .parse()
                        .with_context(|| format!("invalid throttle limit `{}`", value))?;
                }
                "--backend" | "-b" => {
                    let value = argv.next().context("--backend requires a value")?;
                    args.backend = match value.as_str() {
                        "mock" => BackendKind::Mock,
                        "memory" => BackendKind::Memory,
                        other => bail!("unknown backend `{}` (expected mock or memory)", other),
                    };
                }
                "--no-stats" => args.stats = false,
                "--no-signals" => args.signals = false,
                "--verbose" => args.verbose = true,
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("pdnsgate version {}", pdnsgate::VERSION);
                    std::process::exit(0);
                }
                other => {
                    print_help();
                    bail!("unknown argument `{}`", other);
                }
            }
        }

        Ok(args)
    }

    fn engine_config(&self) -> EngineConfig {
        let backend: Arc<dyn Backend> = match self.backend {
            BackendKind::Mock => Arc::new(MockBackend::new()),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };

        EngineConfig::server(self.host.clone(), self.port, backend)
            .with_throttle_limit(self.throttle)
            .with_stats_reporter(self.stats)
            .with_signal_consumer(self.signals)
    }
}

fn print_help() {
    println!(
        r#"
pdnsgate - Passive-DNS Observation Store Front End

USAGE:
    pdnsgate [OPTIONS]

OPTIONS:
    -h, --host <HOST>         Address to bind to (default: 127.0.0.1)
    -p, --port <PORT>         Port to listen on (default: 4242)
    -t, --throttle <N>        Max concurrent connections (default: 64)
    -b, --backend <KIND>      Storage backend: memory | mock (default: memory)
        --no-stats            Disable the periodic stats reporter
        --no-signals          Do not handle SIGINT/SIGTERM/SIGQUIT
        --verbose             Log at debug level
    -v, --version             Print version information
        --help                Print this help message

Log filtering can also be set with RUST_LOG, e.g. RUST_LOG=pdnsgate=trace.

EXAMPLES:
    pdnsgate                          # Serve the in-memory store on 127.0.0.1:4242
    pdnsgate --host 0.0.0.0 -t 256    # Listen on all interfaces, 256 clients
    pdnsgate --backend mock --verbose # Canned answers, debug logging
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::from_args()?;

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!(version = pdnsgate::VERSION, "pdnsgate starting");

    let engine = Engine::start_server(args.engine_config())
        .await
        .with_context(|| format!("failed to start server on {}:{}", args.host, args.port))?;
    info!(
        addr = %engine.local_addr(),
        backend = ?args.backend,
        signals = args.signals,
        "Ready to accept connections"
    );

    engine.run().await;

    info!("Server shutdown complete");
    Ok(())
}
