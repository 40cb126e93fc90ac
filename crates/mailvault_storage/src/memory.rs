//! In-memory archive store for testing.

use crate::error::{StorageError, StorageResult};
use crate::paged::{PageSource, PagedIterator};
use crate::query::RangeQuery;
use crate::store::{encode_for_archive, prune_bound, ArchiveIterator, ArchiveStore};
use mailvault_codec::{ArchiveKey, Envelope};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// An in-memory archive store.
///
/// This store keeps every entry in a `BTreeMap` and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral archives that don't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads. Clones share
/// the same entries.
///
/// # Example
///
/// ```rust
/// use mailvault_codec::{Envelope, Topic};
/// use mailvault_storage::{ArchiveStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// let env = Envelope::new(1_100, 100, Topic::from_bytes([1, 1, 1, 1]), b"hi".to_vec());
/// let key = store.save_envelope(&env).unwrap();
/// assert_eq!(store.get_envelope(&key).unwrap(), env.encode().unwrap());
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: RwLock<BTreeMap<ArchiveKey, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryInner {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every stored key, in order.
    ///
    /// Useful for testing and debugging.
    #[must_use]
    pub fn keys(&self) -> Vec<ArchiveKey> {
        self.inner.entries.read().keys().copied().collect()
    }
}

impl ArchiveStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn save_envelope(&self, envelope: &Envelope) -> StorageResult<ArchiveKey> {
        self.inner.check_open()?;
        let (key, encoded) = encode_for_archive(envelope)?;
        self.inner.entries.write().insert(key, encoded);
        Ok(key)
    }

    fn get_envelope(&self, key: &ArchiveKey) -> StorageResult<Vec<u8>> {
        self.inner.check_open()?;
        self.inner
            .entries
            .read()
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound(*key))
    }

    fn prune(&self, before: SystemTime, batch_size: usize) -> StorageResult<usize> {
        self.inner.check_open()?;
        let bound = prune_bound(before);
        let batch_size = batch_size.max(1);
        let mut removed = 0;

        loop {
            let mut entries = self.inner.entries.write();
            let batch: Vec<ArchiveKey> = entries
                .range(..bound)
                .take(batch_size)
                .map(|(key, _)| *key)
                .collect();
            for key in &batch {
                entries.remove(key);
            }
            removed += batch.len();
            if batch.len() < batch_size {
                break;
            }
        }

        Ok(removed)
    }

    fn build_iterator(&self, query: &RangeQuery) -> StorageResult<Box<dyn ArchiveIterator>> {
        self.inner.check_open()?;
        let source = MemoryPages {
            inner: Arc::clone(&self.inner),
        };
        Ok(Box::new(PagedIterator::new(
            source,
            query.scan_lower_bound(),
            query.end,
        )))
    }

    fn count(&self) -> StorageResult<usize> {
        self.inner.check_open()?;
        Ok(self.inner.entries.read().len())
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryPages {
    inner: Arc<MemoryInner>,
}

impl PageSource for MemoryPages {
    fn fetch(
        &self,
        lower: &Bound<ArchiveKey>,
        end: &ArchiveKey,
        limit: usize,
    ) -> StorageResult<Vec<(ArchiveKey, Vec<u8>)>> {
        self.inner.check_open()?;
        let entries = self.inner.entries.read();
        Ok(entries
            .range((*lower, Bound::Excluded(*end)))
            .take(limit)
            .map(|(key, value)| (*key, value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailvault_codec::Topic;
    use std::time::{Duration, UNIX_EPOCH};

    fn env(sent: u32, topic: u8) -> Envelope {
        Envelope::new(sent + 10, 10, Topic::from_bytes([topic; 4]), vec![topic; 8])
    }

    fn scan(store: &InMemoryStore, query: &RangeQuery) -> Vec<u32> {
        let mut iter = store.build_iterator(query).unwrap();
        let mut out = Vec::new();
        while iter.next() {
            out.push(iter.key().unwrap().timestamp());
        }
        assert!(iter.error().is_none());
        iter.release().unwrap();
        out
    }

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryStore::new();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn memory_save_is_idempotent() {
        let store = InMemoryStore::new();
        let e = env(100, 1);
        let k1 = store.save_envelope(&e).unwrap();
        let k2 = store.save_envelope(&e).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn memory_get_missing_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get_envelope(&ArchiveKey::lower_bound(1)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn memory_scan_is_ordered_and_bounded() {
        let store = InMemoryStore::new();
        for ts in [300, 100, 200, 400] {
            store.save_envelope(&env(ts, 1)).unwrap();
        }
        assert_eq!(scan(&store, &RangeQuery::between(100, 300)), vec![100, 200, 300]);
        assert_eq!(scan(&store, &RangeQuery::between(150, 250)), vec![200]);
    }

    #[test]
    fn memory_scan_resumes_after_cursor() {
        let store = InMemoryStore::new();
        let keys: Vec<_> = [100, 200, 300]
            .iter()
            .map(|ts| store.save_envelope(&env(*ts, 1)).unwrap())
            .collect();
        let query = RangeQuery::between(0, 1000)
            .with_cursor(Some(keys[0].cursor().as_bytes().to_vec()));
        assert_eq!(scan(&store, &query), vec![200, 300]);
    }

    #[test]
    fn memory_prune_in_batches() {
        let store = InMemoryStore::new();
        for ts in 0..25 {
            store.save_envelope(&env(ts, 2)).unwrap();
        }
        let before = UNIX_EPOCH + Duration::from_secs(20);
        assert_eq!(store.prune(before, 7).unwrap(), 20);
        assert_eq!(store.prune(before, 7).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 5);
    }

    #[test]
    fn memory_closed_rejects_operations() {
        let store = InMemoryStore::new();
        store.close().unwrap();
        assert!(matches!(store.count(), Err(StorageError::Closed)));
        assert!(matches!(
            store.save_envelope(&env(1, 1)),
            Err(StorageError::Closed)
        ));
    }
}
