//! # Mailvault Storage
//!
//! Archive storage contract and backend implementations for Mailvault.
//!
//! Backends are **opaque byte stores** keyed by [`mailvault_codec::ArchiveKey`].
//! They store serialized envelopes and scan them in key order; topic and
//! bloom classification happens on the iterator.
//!
//! ## Available Backends
//!
//! - [`InMemoryStore`] - For testing and ephemeral archives
//! - [`RedbStore`] - Ordered key-value archive on redb
//! - [`SqliteStore`] - Relational archive on SQLite
//!
//! ## Example
//!
//! ```rust
//! use mailvault_codec::{Envelope, Topic};
//! use mailvault_storage::{ArchiveStore, InMemoryStore, RangeQuery};
//!
//! let store = InMemoryStore::new();
//! let env = Envelope::new(1_060, 60, Topic::from_bytes([7; 4]), b"hello".to_vec());
//! store.save_envelope(&env).unwrap();
//!
//! let mut iter = store.build_iterator(&RangeQuery::between(1_000, 1_000)).unwrap();
//! assert!(iter.next());
//! assert_eq!(iter.key().unwrap().timestamp(), 1_000);
//! assert!(!iter.next());
//! iter.release().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod ordered_kv;
mod paged;
mod query;
mod relational;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStore;
pub use ordered_kv::{RedbStore, REDB_FILE_NAME};
pub use query::RangeQuery;
pub use relational::{SqliteStore, SQLITE_FILE_NAME};
pub use store::{ArchiveIterator, ArchiveStore};
