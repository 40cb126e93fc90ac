//! The archived envelope and its identifiers.

use crate::bloom::BloomFilter;
use crate::error::{CodecError, CodecResult};
use crate::key::ArchiveKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a topic identifier.
pub const TOPIC_LENGTH: usize = 4;

/// Length of an envelope hash.
pub const HASH_LENGTH: usize = 32;

/// A fixed-width publish/subscribe topic.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic([u8; TOPIC_LENGTH]);

impl Topic {
    /// Creates a topic from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TOPIC_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a topic from a slice.
    ///
    /// Returns `None` if the slice is not exactly 4 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOPIC_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// SHA-256 digest identifying an envelope.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvelopeHash([u8; HASH_LENGTH]);

impl EnvelopeHash {
    /// Creates a hash from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a hash from a slice.
    ///
    /// Returns `None` if the slice is not exactly 32 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Returns true for the all-zero hash.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for EnvelopeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvelopeHash(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for EnvelopeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A topic-tagged, time-bounded message unit.
///
/// The archive never looks inside `data`. It only needs the timing fields
/// and the topic to place the envelope in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Expiry time (unix seconds).
    pub expiry: u32,
    /// Time-to-live (seconds).
    pub ttl: u32,
    /// Topic the envelope was published on.
    pub topic: Topic,
    /// Opaque payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Proof-of-work nonce, carried verbatim.
    pub nonce: u64,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(expiry: u32, ttl: u32, topic: Topic, data: impl Into<Vec<u8>>) -> Self {
        Self {
            expiry,
            ttl,
            topic,
            data: data.into(),
            nonce: 0,
        }
    }

    /// Sets the nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// The time the envelope was sent (`expiry - ttl`).
    ///
    /// # Errors
    ///
    /// Fails if `ttl` exceeds `expiry`.
    pub fn sent_at(&self) -> CodecResult<u32> {
        self.expiry
            .checked_sub(self.ttl)
            .ok_or(CodecError::InvalidEnvelopeTiming {
                expiry: self.expiry,
                ttl: self.ttl,
            })
    }

    /// Serializes the envelope to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.data.len() + 32);
        ciborium::into_writer(self, &mut buf).map_err(|e| CodecError::encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Deserializes an envelope from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoded envelope.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::decoding(e.to_string()))
    }

    /// Computes the envelope hash (SHA-256 of the encoded form).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn hash(&self) -> CodecResult<EnvelopeHash> {
        let encoded = self.encode()?;
        Ok(hash_encoded(&encoded))
    }

    /// Returns the archive key this envelope is stored under.
    ///
    /// # Errors
    ///
    /// Fails if the timing fields are inconsistent or encoding fails.
    pub fn archive_key(&self) -> CodecResult<ArchiveKey> {
        Ok(ArchiveKey::new(self.sent_at()?, self.topic, self.hash()?))
    }

    /// Returns the bloom filter sample for this envelope's topic.
    #[must_use]
    pub fn bloom(&self) -> BloomFilter {
        BloomFilter::from_topic(&self.topic)
    }
}

/// Hashes an already-encoded envelope.
#[must_use]
pub fn hash_encoded(encoded: &[u8]) -> EnvelopeHash {
    let digest = Sha256::digest(encoded);
    let mut hash = [0u8; HASH_LENGTH];
    hash.copy_from_slice(&digest);
    EnvelopeHash(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(1200, 100, Topic::from_bytes([1, 2, 3, 4]), b"payload".to_vec())
    }

    #[test]
    fn encode_decode() {
        let env = sample().with_nonce(77);
        let bytes = env.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn decode_garbage_fails() {
        let result = Envelope::decode(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = sample();
        assert_eq!(a.hash().unwrap(), a.clone().hash().unwrap());

        let b = sample().with_nonce(1);
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
        assert!(!a.hash().unwrap().is_zero());
    }

    #[test]
    fn archive_key_uses_send_time() {
        let env = sample();
        let key = env.archive_key().unwrap();
        assert_eq!(key.timestamp(), 1100);
        assert_eq!(key.topic(), env.topic);
        assert_eq!(key.hash(), env.hash().unwrap());
    }

    #[test]
    fn ttl_beyond_expiry_is_rejected() {
        let env = Envelope::new(10, 20, Topic::default(), Vec::new());
        assert_eq!(
            env.sent_at(),
            Err(CodecError::InvalidEnvelopeTiming { expiry: 10, ttl: 20 })
        );
        assert!(env.archive_key().is_err());
    }

    #[test]
    fn topic_from_slice() {
        assert_eq!(
            Topic::from_slice(&[9, 9, 9, 9]),
            Some(Topic::from_bytes([9; 4]))
        );
        assert_eq!(Topic::from_slice(&[9, 9]), None);
        assert_eq!(Topic::from_bytes([0xAB, 0, 0, 1]).to_string(), "0xab000001");
    }
}
