//! Error types for storage operations.

use mailvault_codec::{ArchiveKey, CodecError};
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No envelope is stored under the key.
    #[error("envelope not found: {0:?}")]
    NotFound(ArchiveKey),

    /// A stored key or value could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The ordered key-value engine failed.
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    /// The relational engine failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store is closed.
    #[error("storage is closed")]
    Closed,

    /// An iterator was read while not positioned on an entry.
    #[error("iterator is not positioned on an entry")]
    NotPositioned,

    /// Pruning failed after some batches were already committed.
    #[error("prune failed after removing {removed} entries: {source}")]
    PartialPrune {
        /// Entries removed before the failure.
        removed: usize,
        /// The underlying failure.
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Returns true if this is a [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Number of entries removed before a prune failed, if any.
    pub fn removed_before_failure(&self) -> Option<usize> {
        match self {
            StorageError::PartialPrune { removed, .. } => Some(*removed),
            _ => None,
        }
    }
}

macro_rules! impl_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    StorageError::Redb(redb::Error::from(err))
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguished() {
        let err = StorageError::NotFound(ArchiveKey::lower_bound(5));
        assert!(err.is_not_found());
        assert!(!StorageError::Closed.is_not_found());
    }

    #[test]
    fn partial_prune_reports_progress() {
        let err = StorageError::PartialPrune {
            removed: 12,
            source: Box::new(StorageError::Closed),
        };
        assert_eq!(err.removed_before_failure(), Some(12));
        assert!(err.to_string().contains("12"));
        assert_eq!(StorageError::Closed.removed_before_failure(), None);
    }
}
