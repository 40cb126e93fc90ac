//! Archive service telemetry.
//!
//! The service reports through the [`ArchiveMetrics`] trait so an embedding
//! node can forward events to whatever metrics system it runs. Two
//! implementations ship with the crate: [`NoopMetrics`] and [`ArchiveStats`],
//! a set of atomic counters.
//!
//! # Usage
//!
//! ```rust
//! use mailvault_server::{ArchiveMetrics, ArchiveStats};
//!
//! let stats = ArchiveStats::new();
//! stats.envelope_archived(120);
//! assert_eq!(stats.snapshot().envelopes_archived, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives events from the archive service.
///
/// Every method has an empty default so implementors only override what
/// they record.
pub trait ArchiveMetrics: Send + Sync {
    /// An envelope was stored.
    fn envelope_archived(&self, _size: usize) {}

    /// Storing an envelope failed.
    fn archive_failed(&self) {}

    /// A point-to-point history request arrived.
    fn delivery_attempted(&self) {}

    /// A point-to-point history request failed. `reason` is a short label.
    fn delivery_failed(&self, _reason: &'static str) {}

    /// A sync request arrived.
    fn sync_attempted(&self) {}

    /// A sync request failed. `reason` is a short label.
    fn sync_failed(&self, _reason: &'static str) {}

    /// A request asked for batched delivery.
    fn batched_request(&self) {}

    /// A request finished with `envelopes` envelopes totalling `bytes`.
    fn request_served(&self, _envelopes: usize, _bytes: u64) {}

    /// A `"delivery"` or `"sync"` request took `elapsed` to process, whether
    /// it succeeded or not.
    fn request_duration(&self, _protocol: &'static str, _elapsed: Duration) {}

    /// The retention cleaner removed `count` entries.
    fn envelopes_pruned(&self, _count: usize) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ArchiveMetrics for NoopMetrics {}

/// Archive counters.
///
/// All counters are atomic and can be read while requests are in flight.
#[derive(Debug, Default)]
pub struct ArchiveStats {
    envelopes_archived: AtomicU64,
    archived_bytes: AtomicU64,
    archive_errors: AtomicU64,
    delivery_attempts: AtomicU64,
    delivery_failures: AtomicU64,
    sync_attempts: AtomicU64,
    sync_failures: AtomicU64,
    batched_requests: AtomicU64,
    envelopes_delivered: AtomicU64,
    delivered_bytes: AtomicU64,
    timed_requests: AtomicU64,
    request_time_micros: AtomicU64,
    envelopes_pruned: AtomicU64,
}

impl ArchiveStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            envelopes_archived: self.envelopes_archived.load(Ordering::Relaxed),
            archived_bytes: self.archived_bytes.load(Ordering::Relaxed),
            archive_errors: self.archive_errors.load(Ordering::Relaxed),
            delivery_attempts: self.delivery_attempts.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            sync_attempts: self.sync_attempts.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            batched_requests: self.batched_requests.load(Ordering::Relaxed),
            envelopes_delivered: self.envelopes_delivered.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            timed_requests: self.timed_requests.load(Ordering::Relaxed),
            request_time_micros: self.request_time_micros.load(Ordering::Relaxed),
            envelopes_pruned: self.envelopes_pruned.load(Ordering::Relaxed),
        }
    }
}

impl ArchiveMetrics for ArchiveStats {
    fn envelope_archived(&self, size: usize) {
        self.envelopes_archived.fetch_add(1, Ordering::Relaxed);
        self.archived_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn archive_failed(&self) {
        self.archive_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn delivery_attempted(&self) {
        self.delivery_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn delivery_failed(&self, _reason: &'static str) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_attempted(&self) {
        self.sync_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_failed(&self, _reason: &'static str) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn batched_request(&self) {
        self.batched_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn request_served(&self, envelopes: usize, bytes: u64) {
        self.envelopes_delivered.fetch_add(envelopes as u64, Ordering::Relaxed);
        self.delivered_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn request_duration(&self, _protocol: &'static str, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.timed_requests.fetch_add(1, Ordering::Relaxed);
        self.request_time_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn envelopes_pruned(&self, count: usize) {
        self.envelopes_pruned.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// A point-in-time copy of [`ArchiveStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Envelopes stored.
    pub envelopes_archived: u64,
    /// Bytes stored.
    pub archived_bytes: u64,
    /// Failed stores.
    pub archive_errors: u64,
    /// Point-to-point requests received.
    pub delivery_attempts: u64,
    /// Point-to-point requests that failed.
    pub delivery_failures: u64,
    /// Sync requests received.
    pub sync_attempts: u64,
    /// Sync requests that failed.
    pub sync_failures: u64,
    /// Requests asking for batched delivery.
    pub batched_requests: u64,
    /// Envelopes handed to the transport.
    pub envelopes_delivered: u64,
    /// Bytes handed to the transport.
    pub delivered_bytes: u64,
    /// Requests whose processing time was recorded.
    pub timed_requests: u64,
    /// Total processing time of timed requests, in microseconds.
    pub request_time_micros: u64,
    /// Entries removed by retention.
    pub envelopes_pruned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(ArchiveStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_events() {
        let stats = ArchiveStats::new();
        stats.envelope_archived(100);
        stats.envelope_archived(50);
        stats.delivery_attempted();
        stats.delivery_failed("iterator");
        stats.request_served(3, 300);
        stats.request_duration("delivery", Duration::from_millis(4));
        stats.request_duration("sync", Duration::from_micros(250));
        stats.envelopes_pruned(7);

        let snap = stats.snapshot();
        assert_eq!(snap.envelopes_archived, 2);
        assert_eq!(snap.archived_bytes, 150);
        assert_eq!(snap.delivery_attempts, 1);
        assert_eq!(snap.delivery_failures, 1);
        assert_eq!(snap.envelopes_delivered, 3);
        assert_eq!(snap.delivered_bytes, 300);
        assert_eq!(snap.timed_requests, 2);
        assert_eq!(snap.request_time_micros, 4_250);
        assert_eq!(snap.envelopes_pruned, 7);
    }

    #[test]
    fn noop_accepts_everything() {
        let metrics: &dyn ArchiveMetrics = &NoopMetrics;
        metrics.envelope_archived(1);
        metrics.sync_failed("routine");
        metrics.request_duration("sync", Duration::from_secs(1));
    }
}
