//! # Mailvault Codec
//!
//! Data layout shared by every Mailvault component.
//!
//! This crate provides:
//! - [`ArchiveKey`] and [`Cursor`]: the ordered 40-byte storage key and its
//!   36-byte resumption prefix
//! - [`Envelope`]: the archived unit with CBOR serialization and SHA-256 hash
//! - [`BloomFilter`]: 512-bit topic filters used by peers that do not send
//!   an explicit topic list
//!
//! This is a pure crate with no I/O.
//!
//! ## Example
//!
//! ```
//! use mailvault_codec::{ArchiveKey, Envelope, Topic};
//!
//! let env = Envelope::new(1_100, 100, Topic::from_bytes([1, 2, 3, 4]), b"hi".to_vec());
//! let key = env.archive_key().unwrap();
//! assert_eq!(key.timestamp(), 1_000);
//!
//! let decoded = ArchiveKey::from_bytes(key.as_bytes()).unwrap();
//! assert_eq!(decoded, key);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bloom;
mod envelope;
mod error;
mod key;

pub use bloom::{BloomFilter, BLOOM_FILTER_SIZE};
pub use envelope::{hash_encoded, Envelope, EnvelopeHash, Topic, HASH_LENGTH, TOPIC_LENGTH};
pub use error::{CodecError, CodecResult};
pub use key::{ArchiveKey, Cursor, CURSOR_LENGTH, KEY_LENGTH, TIMESTAMP_LENGTH};
