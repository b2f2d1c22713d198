//! Shared Engine State
//!
//! The [`EngineContext`] is the only mutable state shared between the accept
//! loop, the connection tasks and the auxiliary loops:
//!
//! - the cooperative stop counter (any positive value means "stop")
//! - the live-connection counter used for throttling and drain
//! - the stats counters
//!
//! It is an explicit object handed to every component, so several engines can
//! live in one process and tests can drive `request_stop` directly.

use crate::engine::stats::{Stats, StatsSnapshot};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

#[derive(Debug)]
pub struct EngineContext {
    stop: AtomicUsize,
    stop_tx: watch::Sender<bool>,
    live: AtomicUsize,
    peak: AtomicUsize,
    drained: Notify,
    stats: Stats,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineContext {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop: AtomicUsize::new(0),
            stop_tx,
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            drained: Notify::new(),
            stats: Stats::new(),
        }
    }

    /// Requests a cooperative stop. Idempotent and safe from any thread.
    pub fn request_stop(&self) {
        if self.stop.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("Engine stop requested");
        }
        self.stop_tx.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst) > 0
    }

    /// Returns a receiver that changes once stop is requested.
    ///
    /// Lets long sleeps wake early; the counter stays the source of truth.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live connections seen so far.
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Receiver of the per-interval snapshots the stats reporter publishes.
    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.stats.subscribe()
    }

    /// Registers a live connection until the returned guard is dropped.
    pub fn enter_connection(self: &Arc<Self>) -> LiveGuard {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        LiveGuard {
            context: Arc::clone(self),
        }
    }

    /// Waits until no connection is live, re-checking every `backoff`.
    pub async fn wait_drained(&self, backoff: Duration) {
        loop {
            let live = self.live_connections();
            if live == 0 {
                return;
            }
            warn!(connections = live, "Waiting for connection(s) to finish");

            tokio::select! {
                _ = self.drained.notified() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Keeps one connection counted as live.
#[derive(Debug)]
pub struct LiveGuard {
    context: Arc<EngineContext>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.context.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.context.drained.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_stop_is_idempotent() {
        let ctx = EngineContext::new();
        assert!(!ctx.stop_requested());
        ctx.request_stop();
        ctx.request_stop();
        assert!(ctx.stop_requested());
        assert!(*ctx.subscribe_stop().borrow());
    }

    #[test]
    fn test_live_guard_counts() {
        let ctx = Arc::new(EngineContext::new());
        let a = ctx.enter_connection();
        let b = ctx.enter_connection();
        assert_eq!(ctx.live_connections(), 2);
        drop(a);
        assert_eq!(ctx.live_connections(), 1);
        drop(b);
        assert_eq!(ctx.live_connections(), 0);
        assert_eq!(ctx.peak_connections(), 2);
    }

    #[tokio::test]
    async fn test_stop_wakes_subscribers() {
        let ctx = Arc::new(EngineContext::new());
        let mut rx = ctx.subscribe_stop();

        let stopper = Arc::clone(&ctx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.request_stop();
        });

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("stop was not observed")
            .unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_drained_wakes_on_last_exit() {
        let ctx = Arc::new(EngineContext::new());
        let guard = ctx.enter_connection();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        // The backoff is far longer than the test timeout, so only the
        // notification can end the wait in time.
        tokio::time::timeout(
            Duration::from_secs(2),
            ctx.wait_drained(Duration::from_secs(60)),
        )
        .await
        .expect("drain did not finish");
        assert_eq!(ctx.live_connections(), 0);
    }
}
