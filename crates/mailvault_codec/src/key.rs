//! Ordered archive keys.
//!
//! Every archived envelope is stored under a fixed-width key:
//!
//! ```text
//! +----------------+----------------------+-------------+
//! | timestamp (BE) | envelope hash        | topic       |
//! | 4 bytes        | 32 bytes             | 4 bytes     |
//! +----------------+----------------------+-------------+
//! ```
//!
//! Because the timestamp comes first and is big-endian, comparing two keys
//! bytewise orders them chronologically. Ties are broken by hash, then topic.
//! The first 36 bytes form a [`Cursor`], which is enough to resume a scan.

use crate::envelope::{EnvelopeHash, Topic, HASH_LENGTH, TOPIC_LENGTH};
use crate::error::{CodecError, CodecResult};
use std::fmt;

/// Length of the timestamp prefix.
pub const TIMESTAMP_LENGTH: usize = 4;

/// Total length of an encoded [`ArchiveKey`].
pub const KEY_LENGTH: usize = TIMESTAMP_LENGTH + HASH_LENGTH + TOPIC_LENGTH;

/// Length of a [`Cursor`] (key without the trailing topic).
pub const CURSOR_LENGTH: usize = KEY_LENGTH - TOPIC_LENGTH;

/// A fixed-width, order-preserving storage key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey([u8; KEY_LENGTH]);

impl ArchiveKey {
    /// Builds the key for an envelope observed at `timestamp`.
    #[must_use]
    pub fn new(timestamp: u32, topic: Topic, hash: EnvelopeHash) -> Self {
        let mut raw = [0u8; KEY_LENGTH];
        raw[..TIMESTAMP_LENGTH].copy_from_slice(&timestamp.to_be_bytes());
        raw[TIMESTAMP_LENGTH..CURSOR_LENGTH].copy_from_slice(hash.as_bytes());
        raw[CURSOR_LENGTH..].copy_from_slice(topic.as_bytes());
        Self(raw)
    }

    /// The smallest key at `timestamp` (zero hash and topic).
    ///
    /// Used as a range bound when translating time windows into key ranges.
    #[must_use]
    pub fn lower_bound(timestamp: u32) -> Self {
        Self::new(timestamp, Topic::default(), EnvelopeHash::default())
    }

    /// Decodes a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidKeyLength`] unless `bytes` is exactly
    /// [`KEY_LENGTH`] long.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(CodecError::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; KEY_LENGTH];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Returns the raw key bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Returns the timestamp component.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        let mut ts = [0u8; TIMESTAMP_LENGTH];
        ts.copy_from_slice(&self.0[..TIMESTAMP_LENGTH]);
        u32::from_be_bytes(ts)
    }

    /// Returns the envelope hash component.
    #[must_use]
    pub fn hash(&self) -> EnvelopeHash {
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&self.0[TIMESTAMP_LENGTH..CURSOR_LENGTH]);
        EnvelopeHash::from_bytes(hash)
    }

    /// Returns the topic component.
    #[must_use]
    pub fn topic(&self) -> Topic {
        let mut topic = [0u8; TOPIC_LENGTH];
        topic.copy_from_slice(&self.0[CURSOR_LENGTH..]);
        Topic::from_bytes(topic)
    }

    /// Returns the resumption cursor for this key.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        let mut raw = [0u8; CURSOR_LENGTH];
        raw.copy_from_slice(&self.0[..CURSOR_LENGTH]);
        Cursor(raw)
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArchiveKey({}, {}, {})",
            self.timestamp(),
            self.hash(),
            self.topic()
        )
    }
}

/// The `timestamp ∥ hash` prefix of an [`ArchiveKey`].
///
/// A scan resumed from a cursor starts strictly after every key carrying
/// this prefix.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor([u8; CURSOR_LENGTH]);

impl Cursor {
    /// Decodes a cursor from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidCursorLength`] unless `bytes` is exactly
    /// [`CURSOR_LENGTH`] long.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() != CURSOR_LENGTH {
            return Err(CodecError::InvalidCursorLength {
                expected: CURSOR_LENGTH,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; CURSOR_LENGTH];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Returns the raw cursor bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CURSOR_LENGTH] {
        &self.0
    }

    /// Returns the timestamp the cursor points at.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        let mut ts = [0u8; TIMESTAMP_LENGTH];
        ts.copy_from_slice(&self.0[..TIMESTAMP_LENGTH]);
        u32::from_be_bytes(ts)
    }

    /// The greatest key that shares this cursor's prefix.
    ///
    /// Resuming a scan means continuing strictly after this key.
    #[must_use]
    pub fn last_key(&self) -> ArchiveKey {
        let mut raw = [0xFFu8; KEY_LENGTH];
        raw[..CURSOR_LENGTH].copy_from_slice(&self.0);
        ArchiveKey(raw)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", hex::encode(self.0))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
