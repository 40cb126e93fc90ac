//! Retention enforcement.

use crate::lifecycle::Lifecycle;
use crate::metrics::{ArchiveMetrics, NoopMetrics};
use mailvault_storage::{ArchiveStore, StorageResult};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Default interval between retention passes.
pub const DEFAULT_CLEANER_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Default number of deletions committed per batch.
pub const DEFAULT_CLEANER_BATCH_SIZE: usize = 1000;

/// Shortest accepted interval between passes.
const MIN_CLEANER_PERIOD: Duration = Duration::from_millis(1);

/// Periodically removes envelopes older than the retention window.
pub struct Cleaner {
    settings: CleanerSettings,
    lifecycle: Lifecycle,
}

#[derive(Clone)]
struct CleanerSettings {
    store: Arc<dyn ArchiveStore>,
    retention: Duration,
    period: Duration,
    batch_size: usize,
    metrics: Arc<dyn ArchiveMetrics>,
}

impl CleanerSettings {
    fn prune(&self) -> StorageResult<usize> {
        let before = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(UNIX_EPOCH);
        let removed = self.store.prune(before, self.batch_size)?;
        self.metrics.envelopes_pruned(removed);
        Ok(removed)
    }
}

impl Cleaner {
    /// Creates a cleaner keeping `retention` worth of history in `store`.
    pub fn new(store: Arc<dyn ArchiveStore>, retention: Duration) -> Self {
        Self {
            settings: CleanerSettings {
                store,
                retention,
                period: DEFAULT_CLEANER_PERIOD,
                batch_size: DEFAULT_CLEANER_BATCH_SIZE,
                metrics: Arc::new(NoopMetrics),
            },
            lifecycle: Lifecycle::new("retention-cleaner"),
        }
    }

    /// Sets the interval between passes, at least one millisecond.
    ///
    /// Takes effect at the next [`start`](Self::start).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.settings.period = period.max(MIN_CLEANER_PERIOD);
        self
    }

    /// Sets the number of deletions per committed batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.settings.batch_size = batch_size.max(1);
        self
    }

    /// Reports pruned counts to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn ArchiveMetrics>) -> Self {
        self.settings.metrics = metrics;
        self
    }

    /// The retention window.
    pub fn retention(&self) -> Duration {
        self.settings.retention
    }

    /// The interval between passes.
    pub fn period(&self) -> Duration {
        self.settings.period
    }

    /// Runs one retention pass now. Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns the storage error that interrupted the pass. A
    /// [`mailvault_storage::StorageError::PartialPrune`] reports how much was
    /// removed before it.
    pub fn prune_now(&self) -> StorageResult<usize> {
        self.settings.prune()
    }

    /// Starts periodic passes on the current tokio runtime.
    ///
    /// The first pass runs one period after start. A failed pass is logged
    /// and retried at the next period.
    pub fn start(&self) {
        let settings = Arc::new(self.settings.clone());
        let period = settings.period;

        self.lifecycle.start(move |cancel| async move {
            tracing::info!(
                retention_secs = settings.retention.as_secs(),
                period_secs = period.as_secs(),
                "retention cleaner started"
            );
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pass = Arc::clone(&settings);
                        match tokio::task::spawn_blocking(move || pass.prune()).await {
                            Ok(Ok(removed)) => {
                                tracing::info!(removed, "retention pass finished");
                            }
                            Ok(Err(err)) => {
                                tracing::error!(
                                    error = %err,
                                    removed = err.removed_before_failure().unwrap_or(0),
                                    "retention pass failed"
                                );
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "retention pass panicked");
                            }
                        }
                    }
                }
            }
            tracing::info!("retention cleaner stopped");
        });
    }

    /// Stops periodic passes without waiting for one in progress.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Returns true while periodic passes are scheduled.
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}
