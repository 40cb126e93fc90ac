//! Range queries understood by every backend.

use mailvault_codec::{ArchiveKey, BloomFilter, Cursor, Topic};
use std::ops::Bound;

/// A bounded scan over the archive.
///
/// The query is filter-technology-agnostic: it carries both the explicit
/// topic set and the bloom filter and lets each backend decide what it can
/// push down. Iterators still classify entries with
/// [`crate::ArchiveIterator::match_by_topics`] or
/// [`crate::ArchiveIterator::match_by_bloom`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    /// Inclusive lower key bound.
    pub start: ArchiveKey,
    /// Exclusive upper key bound.
    pub end: ArchiveKey,
    /// Raw resumption cursor. Ignored unless it has the exact cursor length.
    pub cursor: Option<Vec<u8>>,
    /// Maximum number of matches the caller intends to consume.
    pub limit: u32,
    /// Bloom filter, when the requester did not send explicit topics.
    pub bloom: Option<BloomFilter>,
    /// Explicit topic set.
    pub topics: Vec<Topic>,
}

impl RangeQuery {
    /// Creates a query over `[start, end)`.
    pub fn new(start: ArchiveKey, end: ArchiveKey) -> Self {
        Self {
            start,
            end,
            cursor: None,
            limit: 0,
            bloom: None,
            topics: Vec::new(),
        }
    }

    /// Creates a query covering the whole seconds `lower..=upper`.
    pub fn between(lower: u32, upper: u32) -> Self {
        Self::new(
            ArchiveKey::lower_bound(lower),
            ArchiveKey::lower_bound(upper.saturating_add(1)),
        )
    }

    /// Sets the resumption cursor.
    pub fn with_cursor(mut self, cursor: Option<Vec<u8>>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Sets the limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the bloom filter.
    pub fn with_bloom(mut self, bloom: Option<BloomFilter>) -> Self {
        self.bloom = bloom;
        self
    }

    /// Sets the explicit topics.
    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }

    /// The cursor to resume after, if a well-formed one was supplied.
    pub fn resume_point(&self) -> Option<Cursor> {
        self.cursor
            .as_deref()
            .and_then(|raw| Cursor::from_bytes(raw).ok())
    }

    /// The lower bound a scan should start from.
    ///
    /// With a cursor the scan continues strictly after every key sharing its
    /// prefix, but never before `start`.
    pub fn scan_lower_bound(&self) -> Bound<ArchiveKey> {
        match self.resume_point() {
            Some(cursor) if cursor.last_key() >= self.start => {
                Bound::Excluded(cursor.last_key())
            }
            _ => Bound::Included(self.start),
        }
    }
}

/// Returns true if no key can satisfy `lower` while staying below `end`.
pub(crate) fn is_empty_range(lower: &Bound<ArchiveKey>, end: &ArchiveKey) -> bool {
    match lower {
        Bound::Included(key) | Bound::Excluded(key) => key >= end,
        Bound::Unbounded => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailvault_codec::{EnvelopeHash, CURSOR_LENGTH};

    #[test]
    fn between_covers_upper_second() {
        let query = RangeQuery::between(1000, 2000);
        assert_eq!(query.start.timestamp(), 1000);
        assert_eq!(query.end.timestamp(), 2001);

        let at_upper = ArchiveKey::new(
            2000,
            Topic::from_bytes([0xFF; 4]),
            EnvelopeHash::from_bytes([0xFF; 32]),
        );
        assert!(at_upper < query.end);
    }

    #[test]
    fn between_saturates_at_max() {
        let query = RangeQuery::between(0, u32::MAX);
        assert_eq!(query.end.timestamp(), u32::MAX);
    }

    #[test]
    fn malformed_cursor_is_ignored() {
        let query = RangeQuery::between(10, 20).with_cursor(Some(vec![1, 2, 3]));
        assert!(query.resume_point().is_none());
        assert_eq!(query.scan_lower_bound(), Bound::Included(query.start));
    }

    #[test]
    fn cursor_moves_lower_bound() {
        let key = ArchiveKey::new(15, Topic::from_bytes([1; 4]), EnvelopeHash::from_bytes([2; 32]));
        let query = RangeQuery::between(10, 20).with_cursor(Some(key.cursor().as_bytes().to_vec()));
        assert_eq!(query.cursor.as_ref().map(Vec::len), Some(CURSOR_LENGTH));
        assert_eq!(query.scan_lower_bound(), Bound::Excluded(key.cursor().last_key()));
    }

    #[test]
    fn cursor_before_start_is_clamped() {
        let key = ArchiveKey::new(5, Topic::default(), EnvelopeHash::default());
        let query = RangeQuery::between(10, 20).with_cursor(Some(key.cursor().as_bytes().to_vec()));
        assert_eq!(query.scan_lower_bound(), Bound::Included(query.start));
    }

    #[test]
    fn empty_range_detection() {
        let end = ArchiveKey::lower_bound(10);
        assert!(is_empty_range(&Bound::Included(end), &end));
        assert!(!is_empty_range(&Bound::Included(ArchiveKey::lower_bound(9)), &end));
        assert!(!is_empty_range(&Bound::Unbounded, &end));
    }
}
