//! Grouping matched envelopes into size-bounded bundles.

use mailvault_codec::{ArchiveKey, BloomFilter, Cursor, EnvelopeHash, Topic};
use mailvault_storage::{ArchiveIterator, StorageResult};
use std::collections::HashSet;

/// Decides which archived entries a request wants.
#[derive(Debug, Clone)]
pub(crate) enum TopicMatcher {
    /// Exact topic membership.
    Topics(HashSet<Topic>),
    /// Bloom filter test.
    Bloom(BloomFilter),
}

impl TopicMatcher {
    /// Explicit topics win over the bloom filter.
    pub(crate) fn new(topics: &[Topic], bloom: Option<BloomFilter>) -> Self {
        if topics.is_empty() {
            Self::Bloom(bloom.unwrap_or_else(BloomFilter::empty))
        } else {
            Self::Topics(topics.iter().copied().collect())
        }
    }

    pub(crate) fn classify(&self, iter: &dyn ArchiveIterator) -> StorageResult<Option<Vec<u8>>> {
        match self {
            Self::Topics(topics) => iter.match_by_topics(topics),
            Self::Bloom(bloom) => iter.match_by_bloom(bloom),
        }
    }
}

/// Outcome of feeding one matched envelope to the [`Bundler`].
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Step {
    /// A completed bundle ready to publish.
    pub(crate) ready: Option<Vec<Vec<u8>>>,
    /// The limit was reached; stop scanning.
    pub(crate) done: bool,
}

/// Accumulates matched envelopes into bundles.
///
/// A bundle grows while the limit is not reached and its total size stays
/// strictly below `max_size`. An envelope larger than `max_size` travels
/// alone. When the limit is reached the current bundle is flushed, the
/// limiting envelope starts the trailing bundle and its cursor becomes the
/// next-page cursor. So a range holding exactly `limit` matches yields all
/// of them plus a cursor whose page is empty.
#[derive(Debug)]
pub(crate) struct Bundler {
    limit: u32,
    max_size: u64,
    processed: u32,
    bundle: Vec<Vec<u8>>,
    bundle_size: u64,
    total_size: u64,
    bundles: usize,
    last_hash: Option<EnvelopeHash>,
    next_cursor: Option<Cursor>,
}

/// What a finished bundling pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BundleSummary {
    pub(crate) processed: u32,
    pub(crate) bundles: usize,
    pub(crate) total_size: u64,
    pub(crate) last_hash: Option<EnvelopeHash>,
    pub(crate) next_cursor: Option<Cursor>,
}

impl Bundler {
    pub(crate) fn new(limit: u32, max_size: u32) -> Self {
        Self {
            limit,
            max_size: u64::from(max_size),
            processed: 0,
            bundle: Vec::new(),
            bundle_size: 0,
            total_size: 0,
            bundles: 0,
            last_hash: None,
            next_cursor: None,
        }
    }

    pub(crate) fn push(&mut self, key: &ArchiveKey, payload: Vec<u8>) -> Step {
        let size = payload.len() as u64;
        self.processed += 1;
        self.last_hash = Some(key.hash());
        let limit_reached = self.processed >= self.limit;
        let new_size = self.bundle_size + size;

        if !limit_reached && new_size < self.max_size {
            self.bundle.push(payload);
            self.bundle_size = new_size;
            return Step::default();
        }

        let ready = self.take_bundle();
        self.bundle.push(payload);
        self.bundle_size = size;

        if limit_reached {
            self.next_cursor = Some(key.cursor());
        }
        Step {
            ready,
            done: limit_reached,
        }
    }

    /// Flushes the trailing bundle, if any.
    pub(crate) fn finish(&mut self) -> Option<Vec<Vec<u8>>> {
        self.take_bundle()
    }

    pub(crate) fn summary(&self) -> BundleSummary {
        BundleSummary {
            processed: self.processed,
            bundles: self.bundles,
            total_size: self.total_size,
            last_hash: self.last_hash,
            next_cursor: self.next_cursor,
        }
    }

    fn take_bundle(&mut self) -> Option<Vec<Vec<u8>>> {
        if self.bundle.is_empty() {
            return None;
        }
        self.bundles += 1;
        self.total_size += self.bundle_size;
        self.bundle_size = 0;
        Some(std::mem::take(&mut self.bundle))
    }
}
