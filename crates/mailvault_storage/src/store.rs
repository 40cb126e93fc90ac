//! Storage contract shared by every archive backend.

use crate::error::{StorageError, StorageResult};
use crate::query::RangeQuery;
use mailvault_codec::{hash_encoded, ArchiveKey, BloomFilter, Envelope, Topic};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Durable archive of serialized envelopes.
///
/// Backends store opaque envelope bytes under [`ArchiveKey`]s and scan them
/// in key order. They never interpret the payload.
///
/// # Invariants
///
/// - `save_envelope` is an idempotent upsert: saving the same envelope twice
///   leaves one entry with identical bytes
/// - Scans return entries in ascending key order, which is chronological
/// - A scan resumed from a cursor never yields an entry at or before it
/// - Implementations must be `Send + Sync`; concurrent scans and writes are
///   the backend's responsibility
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing and ephemeral use
/// - [`super::RedbStore`] - Ordered key-value store
/// - [`super::SqliteStore`] - Relational store
pub trait ArchiveStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Stores an envelope under `ArchiveKey::new(expiry - ttl, topic, hash)`.
    ///
    /// Returns the key it was stored under.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or written.
    fn save_envelope(&self, envelope: &Envelope) -> StorageResult<ArchiveKey>;

    /// Looks up the serialized envelope stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if nothing is stored under `key`.
    fn get_envelope(&self, key: &ArchiveKey) -> StorageResult<Vec<u8>>;

    /// Deletes every entry whose key timestamp is strictly before `before`.
    ///
    /// Deletions are committed in chunks of `batch_size`. Returns the number
    /// of entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PartialPrune`] carrying the number of entries
    /// already committed when a chunk fails.
    fn prune(&self, before: SystemTime, batch_size: usize) -> StorageResult<usize>;

    /// Opens a scan over `[query.start, query.end)`.
    ///
    /// If `query.cursor` is a well-formed cursor the scan starts right after
    /// it instead of at `query.start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan cannot be opened.
    fn build_iterator(&self, query: &RangeQuery) -> StorageResult<Box<dyn ArchiveIterator>>;

    /// Returns the number of archived entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn count(&self) -> StorageResult<usize>;

    /// Closes the store. Later calls fail with [`StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to shut down cleanly.
    fn close(&self) -> StorageResult<()>;
}

/// An open scan over an [`ArchiveStore`].
///
/// Usage follows a fixed pattern: call [`next`](Self::next) until it returns
/// false, then check [`error`](Self::error), then [`release`](Self::release).
pub trait ArchiveIterator: Send {
    /// Advances to the next entry. Returns false at the end or on error.
    fn next(&mut self) -> bool;

    /// The entry the iterator is positioned on.
    fn current(&self) -> Option<(&ArchiveKey, &[u8])>;

    /// The sticky error that ended the scan, if any.
    fn error(&self) -> Option<&StorageError>;

    /// Moves the error that ended the scan out of the iterator.
    ///
    /// The iterator stays exhausted afterwards.
    fn take_error(&mut self) -> Option<StorageError>;

    /// Releases the scan. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to release its resources.
    fn release(&mut self) -> StorageResult<()>;

    /// Key of the current entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotPositioned`] before the first `next` or
    /// after the end.
    fn key(&self) -> StorageResult<ArchiveKey> {
        self.current()
            .map(|(key, _)| *key)
            .ok_or(StorageError::NotPositioned)
    }

    /// Serialized envelope of the current entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotPositioned`] before the first `next` or
    /// after the end.
    fn value(&self) -> StorageResult<&[u8]> {
        self.current()
            .map(|(_, value)| value)
            .ok_or(StorageError::NotPositioned)
    }

    /// Returns the current envelope bytes if its topic is in `topics`.
    ///
    /// `Ok(None)` means the entry does not match and should be skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotPositioned`] if there is no current entry.
    fn match_by_topics(&self, topics: &HashSet<Topic>) -> StorageResult<Option<Vec<u8>>> {
        let (key, value) = self.current().ok_or(StorageError::NotPositioned)?;
        if topics.contains(&key.topic()) {
            Ok(Some(value.to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Returns the current envelope bytes if its topic passes `bloom`.
    ///
    /// `Ok(None)` means the entry does not match and should be skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotPositioned`] if there is no current entry.
    fn match_by_bloom(&self, bloom: &BloomFilter) -> StorageResult<Option<Vec<u8>>> {
        let (key, value) = self.current().ok_or(StorageError::NotPositioned)?;
        if bloom.contains(&key.topic()) {
            Ok(Some(value.to_vec()))
        } else {
            Ok(None)
        }
    }
}

/// Serializes an envelope and derives the key it is archived under.
pub(crate) fn encode_for_archive(envelope: &Envelope) -> StorageResult<(ArchiveKey, Vec<u8>)> {
    let encoded = envelope.encode()?;
    let key = ArchiveKey::new(envelope.sent_at()?, envelope.topic, hash_encoded(&encoded));
    Ok((key, encoded))
}

/// The smallest key that survives a prune at `before`.
pub(crate) fn prune_bound(before: SystemTime) -> ArchiveKey {
    let secs = before
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ArchiveKey::lower_bound(u32::try_from(secs).unwrap_or(u32::MAX))
}
