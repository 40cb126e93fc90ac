//! 512-bit topic bloom filters.
//!
//! Peers that do not want to reveal their exact topics send a bloom filter
//! instead. Each topic sets three bits, derived from its first three bytes
//! with the low bits of the fourth byte selecting the upper half.

use crate::envelope::Topic;
use crate::error::{CodecError, CodecResult};
use std::fmt;

/// Size of a bloom filter in bytes.
pub const BLOOM_FILTER_SIZE: usize = 64;

/// A compact probabilistic topic set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BloomFilter([u8; BLOOM_FILTER_SIZE]);

impl BloomFilter {
    /// Creates a filter from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; BLOOM_FILTER_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a filter from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidBloomLength`] unless the slice is exactly
    /// [`BLOOM_FILTER_SIZE`] bytes.
    pub fn from_slice(slice: &[u8]) -> CodecResult<Self> {
        if slice.len() != BLOOM_FILTER_SIZE {
            return Err(CodecError::InvalidBloomLength {
                expected: BLOOM_FILTER_SIZE,
                actual: slice.len(),
            });
        }
        let mut raw = [0u8; BLOOM_FILTER_SIZE];
        raw.copy_from_slice(slice);
        Ok(Self(raw))
    }

    /// A filter that matches every topic.
    #[must_use]
    pub const fn full() -> Self {
        Self([0xFF; BLOOM_FILTER_SIZE])
    }

    /// A filter that matches nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self([0; BLOOM_FILTER_SIZE])
    }

    /// Builds the single-topic sample for `topic`.
    #[must_use]
    pub fn from_topic(topic: &Topic) -> Self {
        let mut filter = Self::empty();
        filter.insert(topic);
        filter
    }

    /// Builds a filter covering every topic in `topics`.
    #[must_use]
    pub fn from_topics<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Self {
        let mut filter = Self::empty();
        for topic in topics {
            filter.insert(topic);
        }
        filter
    }

    /// Adds a topic to the filter.
    pub fn insert(&mut self, topic: &Topic) {
        let t = topic.as_bytes();
        for j in 0..3 {
            let mut index = usize::from(t[j]);
            if t[3] & (1 << j) != 0 {
                index += 256;
            }
            self.0[index / 8] |= 1 << (index % 8);
        }
    }

    /// Returns true if every bit set in `sample` is also set in this filter.
    #[must_use]
    pub fn matches(&self, sample: &BloomFilter) -> bool {
        self.0
            .iter()
            .zip(sample.0.iter())
            .all(|(f, s)| (f | s) == *f)
    }

    /// Returns true if this filter could contain `topic`.
    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.matches(&Self::from_topic(topic))
    }

    /// Returns true if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLOOM_FILTER_SIZE] {
        &self.0
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BloomFilter({})", hex::encode(self.0))
    }
}
