//! Ticker-driven background workers.
//!
//! Each worker is one tokio task running one tick at a time. A shared
//! [`Shutdown`] stops new ticks from starting; a tick that is already
//! running is awaited to completion.
//!
//! ## Example
//!
//! ```ignore
//! let shutdown = Shutdown::new();
//! let relay = spawn_periodic(relay, Duration::from_secs(5), shutdown.signal());
//! let scanner = spawn_periodic(scanner, Duration::from_secs(5), shutdown.signal());
//!
//! // ... serve ...
//!
//! shutdown.trigger();
//! let stats = relay.join().await;
//! println!("relay ran {} ticks", stats.ticks);
//! ```

mod shutdown;

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use shutdown::{Shutdown, ShutdownSignal};

/// Work done by a single tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub processed: usize,
    pub failed: usize,
}

/// Running totals kept by a worker task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub ticks: usize,
    pub processed: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn record(&mut self, report: TickReport) {
        self.ticks += 1;
        self.processed += report.processed;
        self.failed += report.failed;
    }
}

/// A unit of periodic work.
///
/// `tick` must not fail: errors are logged by the implementation and
/// surface as `failed` counts, and the next tick retries.
#[async_trait]
pub trait Periodic: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self) -> TickReport;
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    name: &'static str,
    handle: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to exit and return its totals.
    pub async fn join(self) -> WorkerStats {
        match self.handle.await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(worker = self.name, error = %err, "worker task did not exit cleanly");
                WorkerStats::default()
            }
        }
    }

    /// Wait for the task until `deadline`, aborting it afterwards.
    ///
    /// Returns `None` when the task had to be aborted. Handles joined one
    /// after another against the same deadline share a single grace period.
    pub async fn join_until(mut self, deadline: Instant) -> Option<WorkerStats> {
        match tokio::time::timeout_at(deadline, &mut self.handle).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(err)) => {
                warn!(worker = self.name, error = %err, "worker task did not exit cleanly");
                None
            }
            Err(_) => {
                warn!(worker = self.name, "grace period elapsed, aborting worker");
                self.handle.abort();
                None
            }
        }
    }
}

/// Spawn `worker` on the current runtime, ticking every `interval`.
///
/// The first tick fires one full interval after spawning. A slow tick
/// delays the following one rather than causing a burst.
pub fn spawn_periodic<W: Periodic>(
    worker: W,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) -> WorkerHandle {
    let name = worker.name();

    let handle = tokio::spawn(async move {
        let mut stats = WorkerStats::default();
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(worker = name, ?interval, "worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = worker.tick().await;
                    debug!(
                        worker = name,
                        processed = report.processed,
                        failed = report.failed,
                        "tick finished"
                    );
                    stats.record(report);
                }
            }
        }

        info!(worker = name, ticks = stats.ticks, "worker stopped");
        stats
    });

    WorkerHandle { name, handle }
}
