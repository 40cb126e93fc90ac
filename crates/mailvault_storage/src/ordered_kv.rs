//! redb-backed ordered key-value archive.

use crate::error::{StorageError, StorageResult};
use crate::paged::{PageSource, PagedIterator};
use crate::query::RangeQuery;
use crate::store::{encode_for_archive, prune_bound, ArchiveIterator, ArchiveStore};
use mailvault_codec::{ArchiveKey, Envelope};
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Envelopes table: key = 40-byte archive key, value = serialized envelope
const ENVELOPES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("envelopes");

/// File name of the archive inside the data directory.
pub const REDB_FILE_NAME: &str = "archive.redb";

/// An ordered key-value archive on top of redb.
///
/// Keys are stored as raw bytes, which redb orders lexicographically, so a
/// range scan over keys is a chronological scan over envelopes.
///
/// # Example
///
/// ```no_run
/// use mailvault_storage::{ArchiveStore, RedbStore};
/// use std::path::Path;
///
/// let store = RedbStore::open_dir(Path::new("/var/lib/mailvault")).unwrap();
/// println!("{} envelopes archived", store.count().unwrap());
/// ```
pub struct RedbStore {
    path: Option<PathBuf>,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbStore {
    /// Opens or creates an archive file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or initialized.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db, Some(path.to_path_buf()))
    }

    /// Opens or creates `archive.redb` inside `dir`, creating `dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be created.
    pub fn open_dir(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(REDB_FILE_NAME))
    }

    /// Opens a store kept entirely in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be initialized.
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENVELOPES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            path,
            db: RwLock::new(Some(Arc::new(db))),
        })
    }

    /// Returns the path of the archive file, if it is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn db(&self) -> StorageResult<Arc<Database>> {
        self.db.read().clone().ok_or(StorageError::Closed)
    }

    fn prune_batch(db: &Database, bound: &ArchiveKey, batch_size: usize) -> StorageResult<usize> {
        let txn = db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(ENVELOPES_TABLE)?;
            let keys = table
                .range::<&[u8]>(..bound.as_bytes().as_slice())?
                .take(batch_size)
                .map(|entry| entry.map(|(key, _)| key.value().to_vec()))
                .collect::<Result<Vec<_>, redb::StorageError>>()?;
            for key in &keys {
                table.remove(key.as_slice())?;
            }
            keys.len()
        };
        txn.commit()?;
        Ok(removed)
    }
}

impl ArchiveStore for RedbStore {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn save_envelope(&self, envelope: &Envelope) -> StorageResult<ArchiveKey> {
        let db = self.db()?;
        let (key, encoded) = encode_for_archive(envelope)?;

        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(ENVELOPES_TABLE)?;
            table.insert(key.as_bytes().as_slice(), encoded.as_slice())?;
        }
        txn.commit()?;

        Ok(key)
    }

    fn get_envelope(&self, key: &ArchiveKey) -> StorageResult<Vec<u8>> {
        let db = self.db()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(ENVELOPES_TABLE)?;

        match table.get(key.as_bytes().as_slice())? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StorageError::NotFound(*key)),
        }
    }

    fn prune(&self, before: SystemTime, batch_size: usize) -> StorageResult<usize> {
        let db = self.db()?;
        let bound = prune_bound(before);
        let batch_size = batch_size.max(1);
        let mut removed = 0;

        loop {
            match Self::prune_batch(&db, &bound, batch_size) {
                Ok(n) => {
                    removed += n;
                    if n < batch_size {
                        return Ok(removed);
                    }
                }
                Err(err) => {
                    return Err(StorageError::PartialPrune {
                        removed,
                        source: Box::new(err),
                    })
                }
            }
        }
    }

    fn build_iterator(&self, query: &RangeQuery) -> StorageResult<Box<dyn ArchiveIterator>> {
        let source = RedbPages { db: self.db()? };
        Ok(Box::new(PagedIterator::new(
            source,
            query.scan_lower_bound(),
            query.end,
        )))
    }

    fn count(&self) -> StorageResult<usize> {
        let db = self.db()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(ENVELOPES_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn close(&self) -> StorageResult<()> {
        self.db.write().take();
        Ok(())
    }
}

struct RedbPages {
    db: Arc<Database>,
}

impl PageSource for RedbPages {
    fn fetch(
        &self,
        lower: &Bound<ArchiveKey>,
        end: &ArchiveKey,
        limit: usize,
    ) -> StorageResult<Vec<(ArchiveKey, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENVELOPES_TABLE)?;

        let lower: Bound<&[u8]> = match lower {
            Bound::Included(key) => Bound::Included(key.as_bytes().as_slice()),
            Bound::Excluded(key) => Bound::Excluded(key.as_bytes().as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper: Bound<&[u8]> = Bound::Excluded(end.as_bytes().as_slice());

        let mut page = Vec::with_capacity(limit);
        for entry in table.range::<&[u8]>((lower, upper))?.take(limit) {
            let (key, value) = entry?;
            page.push((ArchiveKey::from_bytes(key.value())?, value.value().to_vec()));
        }
        Ok(page)
    }
}
