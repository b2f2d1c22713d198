//! Engine Statistics and Periodic Reporter
//!
//! [`Stats`] is a fixed set of independently updated atomic counters. The
//! [`StatsReporter`] task wakes once per interval, *slurps* every counter
//! (reads it and resets it to zero in one atomic step) and logs the result,
//! so each report shows activity for that interval only, not running totals.
//!
//! Counters are not snapshotted together: a report is not a consistent cut
//! across all counters, only per counter.
//!
//! Every report is also published on a `watch` channel owned by [`Stats`],
//! so a subscriber taken from the engine before it runs sees each interval.

use crate::engine::context::EngineContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The named engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsCounter {
    Queries,
    Inputs,
    Errors,
    BytesSent,
    BytesReceived,
    Connections,
    Backups,
    Dumps,
}

impl StatsCounter {
    pub const ALL: [StatsCounter; 8] = [
        StatsCounter::Queries,
        StatsCounter::Inputs,
        StatsCounter::Errors,
        StatsCounter::BytesSent,
        StatsCounter::BytesReceived,
        StatsCounter::Connections,
        StatsCounter::Backups,
        StatsCounter::Dumps,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StatsCounter::Queries => "queries",
            StatsCounter::Inputs => "inputs",
            StatsCounter::Errors => "errors",
            StatsCounter::BytesSent => "bytes_sent",
            StatsCounter::BytesReceived => "bytes_received",
            StatsCounter::Connections => "connections",
            StatsCounter::Backups => "backups",
            StatsCounter::Dumps => "dumps",
        }
    }
}

/// Per-interval counter values taken by [`Stats::slurp_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Wall-clock time since the previous snapshot
    pub elapsed: Duration,
    pub queries: u64,
    pub inputs: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub backups: u64,
    pub dumps: u64,
}

#[derive(Debug)]
pub struct Stats {
    counters: [AtomicU64; StatsCounter::ALL.len()],
    last_flush: Mutex<Instant>,
    reports: watch::Sender<StatsSnapshot>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            last_flush: Mutex::new(Instant::now()),
            reports: watch::channel(StatsSnapshot::default()).0,
        }
    }

    /// Receiver of the most recently reported snapshot.
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.reports.subscribe()
    }

    fn publish(&self, snapshot: StatsSnapshot) {
        self.reports.send_replace(snapshot);
    }

    #[inline]
    pub fn bump(&self, counter: StatsCounter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: StatsCounter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    /// Current value without resetting it.
    pub fn get(&self, counter: StatsCounter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Reads and resets one counter.
    pub fn slurp(&self, counter: StatsCounter) -> u64 {
        self.counters[counter.index()].swap(0, Ordering::Relaxed)
    }

    /// Reads and resets every counter and records the flush time.
    pub fn slurp_all(&self) -> StatsSnapshot {
        let now = Instant::now();
        let elapsed = {
            let mut last = self
                .last_flush
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };

        StatsSnapshot {
            elapsed,
            queries: self.slurp(StatsCounter::Queries),
            inputs: self.slurp(StatsCounter::Inputs),
            errors: self.slurp(StatsCounter::Errors),
            bytes_sent: self.slurp(StatsCounter::BytesSent),
            bytes_received: self.slurp(StatsCounter::BytesReceived),
            connections: self.slurp(StatsCounter::Connections),
            backups: self.slurp(StatsCounter::Backups),
            dumps: self.slurp(StatsCounter::Dumps),
        }
    }
}

/// A handle to the running stats reporter task.
#[derive(Debug)]
pub struct StatsReporter {
    handle: JoinHandle<()>,
    context: Arc<EngineContext>,
}

impl StatsReporter {
    /// Starts the reporter; it runs until stop is requested on `context`.
    pub fn start(context: Arc<EngineContext>, interval: Duration) -> Self {
        let handle = tokio::spawn(reporter_loop(Arc::clone(&context), interval));

        info!(interval_ms = interval.as_millis() as u64, "Stats reporter started");

        Self { handle, context }
    }

    /// Receiver of the most recent per-interval snapshot.
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.context.stats().subscribe()
    }

    /// Waits for the reporter task to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn reporter_loop(context: Arc<EngineContext>, interval: Duration) {
    let mut stop_rx = context.subscribe_stop();
    // Start the first interval now rather than at engine construction.
    let _ = context.stats().slurp_all();

    loop {
        if context.stop_requested() {
            debug!("Stats reporter observed engine stop");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        let s = context.stats().slurp_all();
        info!(
            delta_t_ms = s.elapsed.as_millis() as u64,
            queries = s.queries,
            inputs = s.inputs,
            errors = s.errors,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            connections = s.connections,
            backups = s.backups,
            dumps = s.dumps,
            "Engine stats"
        );
        context.stats().publish(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_get() {
        let stats = Stats::new();
        stats.bump(StatsCounter::Queries);
        stats.bump(StatsCounter::Queries);
        stats.add(StatsCounter::BytesSent, 100);
        assert_eq!(stats.get(StatsCounter::Queries), 2);
        assert_eq!(stats.get(StatsCounter::BytesSent), 100);
        assert_eq!(stats.get(StatsCounter::Inputs), 0);
    }

    #[test]
    fn test_slurp_resets() {
        let stats = Stats::new();
        for _ in 0..5 {
            stats.bump(StatsCounter::Inputs);
        }
        assert_eq!(stats.slurp(StatsCounter::Inputs), 5);
        assert_eq!(stats.slurp(StatsCounter::Inputs), 0);
        assert_eq!(stats.get(StatsCounter::Inputs), 0);
    }

    #[test]
    fn test_slurp_reports_activity_between_reads() {
        let stats = Stats::new();
        stats.bump(StatsCounter::Dumps);
        let first = stats.slurp_all();
        assert_eq!(first.dumps, 1);

        // An idle interval reports zero.
        let idle = stats.slurp_all();
        assert_eq!(idle, StatsSnapshot {
            elapsed: idle.elapsed,
            ..Default::default()
        });

        for _ in 0..7 {
            stats.bump(StatsCounter::Dumps);
        }
        stats.add(StatsCounter::BytesReceived, 42);
        let second = stats.slurp_all();
        assert_eq!(second.dumps, 7);
        assert_eq!(second.bytes_received, 42);
    }

    #[test]
    fn test_counter_names_are_unique() {
        let mut names: Vec<_> = StatsCounter::ALL.iter().map(|c| c.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), StatsCounter::ALL.len());
    }

    #[tokio::test]
    async fn test_reporter_publishes_interval_snapshots() {
        let ctx = Arc::new(EngineContext::new());
        let reporter = StatsReporter::start(Arc::clone(&ctx), Duration::from_millis(50));
        let mut rx = reporter.subscribe();

        // Let the reporter take its initial flush before counting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..3 {
            ctx.stats().bump(StatsCounter::Inputs);
        }

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("no report published")
            .unwrap();
        assert_eq!(rx.borrow().inputs, 3);
        assert_eq!(ctx.stats().get(StatsCounter::Inputs), 0);

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("no second report published")
            .unwrap();
        assert_eq!(rx.borrow().inputs, 0);

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(2), reporter.join())
            .await
            .expect("reporter did not stop");
    }
}
