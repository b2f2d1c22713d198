//! Process Signal Consumer
//!
//! Turns termination signals into a cooperative engine stop. This is the only
//! path by which a process signal reaches the engine; embedders and tests call
//! [`EngineContext::request_stop`] directly instead.

use crate::engine::context::EngineContext;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A handle to the running signal consumer task.
#[derive(Debug)]
pub struct SignalConsumer {
    handle: JoinHandle<()>,
}

impl SignalConsumer {
    pub fn start(context: Arc<EngineContext>) -> Self {
        let handle = tokio::spawn(consume(context));
        debug!("Signal consumer started");
        Self { handle }
    }

    /// Waits for the consumer task to exit. It exits once stop is requested.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

#[cfg(unix)]
async fn consume(context: Arc<EngineContext>) {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn watch(kind: SignalKind, name: &'static str) -> Option<Signal> {
        match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(signal = name, error = %e, "Failed to install signal handler");
                None
            }
        }
    }

    // Pends forever once a stream is missing or closed.
    async fn next(sig: &mut Option<Signal>) {
        match sig {
            Some(s) => {
                if s.recv().await.is_none() {
                    *sig = None;
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    let mut interrupt = watch(SignalKind::interrupt(), "SIGINT");
    let mut terminate = watch(SignalKind::terminate(), "SIGTERM");
    let mut quit = watch(SignalKind::quit(), "SIGQUIT");
    let mut usr1 = watch(SignalKind::user_defined1(), "SIGUSR1");
    let mut usr2 = watch(SignalKind::user_defined2(), "SIGUSR2");
    let mut pipe = watch(SignalKind::pipe(), "SIGPIPE");

    let mut stop_rx = context.subscribe_stop();

    while !context.stop_requested() {
        let stop_signal = tokio::select! {
            _ = next(&mut interrupt) => Some("SIGINT"),
            _ = next(&mut terminate) => Some("SIGTERM"),
            _ = next(&mut quit) => Some("SIGQUIT"),
            _ = next(&mut usr1) => {
                debug!(signal = "SIGUSR1", "Ignoring signal");
                None
            }
            _ = next(&mut usr2) => {
                debug!(signal = "SIGUSR2", "Ignoring signal");
                None
            }
            _ = next(&mut pipe) => {
                debug!(signal = "SIGPIPE", "Ignoring signal");
                None
            }
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                None
            }
        };

        if let Some(name) = stop_signal {
            info!(signal = name, "Received signal, stopping engine");
            context.request_stop();
        }
    }

    debug!("Signal consumer exiting");
}

#[cfg(not(unix))]
async fn consume(context: Arc<EngineContext>) {
    let mut stop_rx = context.subscribe_stop();

    while !context.stop_requested() {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => {
                    info!(signal = "ctrl-c", "Received signal, stopping engine");
                    context.request_stop();
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                    let _ = stop_rx.changed().await;
                }
            },
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }

    debug!("Signal consumer exiting");
}
