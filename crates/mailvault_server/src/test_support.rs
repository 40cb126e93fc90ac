//! Store doubles for failure paths.

use mailvault_codec::{ArchiveKey, Envelope};
use mailvault_storage::{
    ArchiveIterator, ArchiveStore, InMemoryStore, RangeQuery, StorageError, StorageResult,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// Text of the injected disk error. Must never reach a peer.
pub(crate) const DISK_FAILURE: &str = "disk sector 99 unreadable";

fn disk_error() -> StorageError {
    StorageError::Io(io::Error::other(DISK_FAILURE))
}

/// An [`InMemoryStore`] that fails on demand.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: InMemoryStore,
    failing_prunes: AtomicUsize,
    prune_calls: AtomicUsize,
    scan_budget: Option<usize>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next `count` prunes fail before touching the data.
    pub(crate) fn failing_prunes(self, count: usize) -> Self {
        self.failing_prunes.store(count, Ordering::SeqCst);
        self
    }

    /// Scans yield `entries` entries, then end with an I/O error.
    pub(crate) fn failing_scans_after(mut self, entries: usize) -> Self {
        self.scan_budget = Some(entries);
        self
    }

    pub(crate) fn prune_calls(&self) -> usize {
        self.prune_calls.load(Ordering::SeqCst)
    }
}

impl ArchiveStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn save_envelope(&self, envelope: &Envelope) -> StorageResult<ArchiveKey> {
        self.inner.save_envelope(envelope)
    }

    fn get_envelope(&self, key: &ArchiveKey) -> StorageResult<Vec<u8>> {
        self.inner.get_envelope(key)
    }

    fn prune(&self, before: SystemTime, batch_size: usize) -> StorageResult<usize> {
        self.prune_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failing_prunes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(disk_error());
        }
        self.inner.prune(before, batch_size)
    }

    fn build_iterator(&self, query: &RangeQuery) -> StorageResult<Box<dyn ArchiveIterator>> {
        let iter = self.inner.build_iterator(query)?;
        Ok(match self.scan_budget {
            Some(remaining) => Box::new(BrokenIterator {
                inner: iter,
                remaining,
                broken: false,
                error: None,
            }),
            None => iter,
        })
    }

    fn count(&self) -> StorageResult<usize> {
        self.inner.count()
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }
}

struct BrokenIterator {
    inner: Box<dyn ArchiveIterator>,
    remaining: usize,
    broken: bool,
    error: Option<StorageError>,
}

impl ArchiveIterator for BrokenIterator {
    fn next(&mut self) -> bool {
        if self.broken {
            return false;
        }
        if self.remaining == 0 {
            self.broken = true;
            self.error = Some(disk_error());
            return false;
        }
        self.remaining -= 1;
        self.inner.next()
    }

    fn current(&self) -> Option<(&ArchiveKey, &[u8])> {
        if self.broken {
            None
        } else {
            self.inner.current()
        }
    }

    fn error(&self) -> Option<&StorageError> {
        self.error.as_ref().or_else(|| self.inner.error())
    }

    fn take_error(&mut self) -> Option<StorageError> {
        self.error.take().or_else(|| self.inner.take_error())
    }

    fn release(&mut self) -> StorageResult<()> {
        self.inner.release()
    }
}
