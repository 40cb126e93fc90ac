//! Per-peer request rate limiting.

use crate::lifecycle::Lifecycle;
use crate::protocol::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Default interval between sweeps of expired entries.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Shortest accepted sweep interval.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Allows one request per peer per `lifespan`.
///
/// Entries are only kept in memory. A background sweep drops expired ones
/// so the map does not grow with every peer ever seen.
pub struct RateLimiter {
    lifespan: Duration,
    period: Duration,
    entries: Arc<RwLock<HashMap<PeerId, Instant>>>,
    sweeper: Lifecycle,
}

impl RateLimiter {
    /// Creates a limiter with the default sweep period.
    pub fn new(lifespan: Duration) -> Self {
        Self::with_period(lifespan, DEFAULT_SWEEP_PERIOD)
    }

    /// Creates a limiter sweeping every `period`, at least one millisecond.
    pub fn with_period(lifespan: Duration, period: Duration) -> Self {
        Self {
            lifespan,
            period: period.max(MIN_SWEEP_PERIOD),
            entries: Arc::new(RwLock::new(HashMap::new())),
            sweeper: Lifecycle::new("rate-limiter-sweep"),
        }
    }

    /// Minimum interval between two requests of one peer.
    pub fn lifespan(&self) -> Duration {
        self.lifespan
    }

    /// Interval between background sweeps.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Records a request from `peer` at the current instant.
    pub fn add(&self, peer: PeerId) {
        self.entries.write().insert(peer, Instant::now());
    }

    /// Returns true if `peer` has no live entry.
    pub fn is_allowed(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(peer)
            .map_or(true, |last| expired(*last, self.lifespan, now))
    }

    /// Admits a request: records it and returns true if the peer is allowed,
    /// otherwise leaves the entry untouched and returns false.
    pub fn check(&self, peer: PeerId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get(&peer) {
            Some(last) if !expired(*last, self.lifespan, now) => false,
            _ => {
                entries.insert(peer, now);
                true
            }
        }
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no peer is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_entries(&self.entries, self.lifespan)
    }

    /// Starts the periodic sweep on the current tokio runtime.
    pub fn start(&self) {
        let entries = Arc::clone(&self.entries);
        let lifespan = self.lifespan;
        let period = self.period;

        self.sweeper.start(move |cancel| async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweep_entries(&entries, lifespan);
                        if removed > 0 {
                            tracing::trace!(removed, "swept rate limit entries");
                        }
                    }
                }
            }
        });
    }

    /// Stops the sweep. Safe to call more than once.
    pub fn stop(&self) {
        self.sweeper.stop();
    }

    /// Returns true while the sweep task is running.
    pub fn is_running(&self) -> bool {
        self.sweeper.is_running()
    }
}

fn expired(last: Instant, lifespan: Duration, now: Instant) -> bool {
    last + lifespan < now
}

fn sweep_entries(entries: &RwLock<HashMap<PeerId, Instant>>, lifespan: Duration) -> usize {
    let now = Instant::now();
    let mut entries = entries.write();
    let before = entries.len();
    entries.retain(|_, last| !expired(*last, lifespan, now));
    before - entries.len()
}
