//! SQLite-backed relational archive.

use crate::error::{StorageError, StorageResult};
use crate::paged::{PageSource, PagedIterator};
use crate::query::RangeQuery;
use crate::store::{encode_for_archive, prune_bound, ArchiveIterator, ArchiveStore};
use mailvault_codec::{ArchiveKey, Envelope, Topic};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// File name of the archive inside the data directory.
pub const SQLITE_FILE_NAME: &str = "archive.sqlite3";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS envelopes (
    id BLOB PRIMARY KEY,
    topic BLOB NOT NULL,
    data BLOB NOT NULL
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS envelopes_topic ON envelopes (topic);
";

/// A relational archive on top of SQLite.
///
/// Rows are keyed by the 40-byte archive key. The topic is duplicated into
/// its own indexed column so explicit-topic scans can filter in SQL.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Opens or creates a database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    /// Opens or creates `archive.sqlite3` inside `dir`, creating `dir` if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the database cannot be created.
    pub fn open_dir(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(SQLITE_FILE_NAME))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }
}

impl ArchiveStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn save_envelope(&self, envelope: &Envelope) -> StorageResult<ArchiveKey> {
        let (key, encoded) = encode_for_archive(envelope)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO envelopes (id, topic, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    key.as_bytes().as_slice(),
                    envelope.topic.as_bytes().as_slice(),
                    encoded
                ],
            )?;
            Ok(key)
        })
    }

    fn get_envelope(&self, key: &ArchiveKey) -> StorageResult<Vec<u8>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT data FROM envelopes WHERE id = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .ok_or(StorageError::NotFound(*key))
        })
    }

    fn prune(&self, before: SystemTime, batch_size: usize) -> StorageResult<usize> {
        let bound = prune_bound(before);
        let batch_size = batch_size.max(1);
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let mut removed = 0;

        loop {
            let batch = self.with_conn(|conn| {
                let n = conn.execute(
                    "DELETE FROM envelopes WHERE id IN (
                         SELECT id FROM envelopes WHERE id < ?1 ORDER BY id LIMIT ?2
                     )",
                    params![bound.as_bytes().as_slice(), limit],
                )?;
                Ok(n)
            });
            match batch {
                Ok(n) => {
                    removed += n;
                    if n < batch_size {
                        return Ok(removed);
                    }
                }
                Err(StorageError::Closed) if removed == 0 => return Err(StorageError::Closed),
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
        if self.conn.lock().is_none() {
            return Err(StorageError::Closed);
        }
        let source = SqlitePages {
            conn: Arc::clone(&self.conn),
            topics: query.topics.clone(),
        };
        Ok(Box::new(PagedIterator::new(
            source,
            query.scan_lower_bound(),
            query.end,
        )))
    }

    fn count(&self) -> StorageResult<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM envelopes", [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
    }

    fn close(&self) -> StorageResult<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, err)| StorageError::Sqlite(err))?;
        }
        Ok(())
    }
}

struct SqlitePages {
    conn: Arc<Mutex<Option<Connection>>>,
    topics: Vec<Topic>,
}

impl SqlitePages {
    fn statement(
        &self,
        lower: &Bound<ArchiveKey>,
        end: &ArchiveKey,
        limit: usize,
    ) -> (String, Vec<Value>) {
        let mut sql = String::from("SELECT id, data FROM envelopes WHERE id < ?");
        let mut args = vec![Value::Blob(end.as_bytes().to_vec())];

        match lower {
            Bound::Included(key) => {
                sql.push_str(" AND id >= ?");
                args.push(Value::Blob(key.as_bytes().to_vec()));
            }
            Bound::Excluded(key) => {
                sql.push_str(" AND id > ?");
                args.push(Value::Blob(key.as_bytes().to_vec()));
            }
            Bound::Unbounded => {}
        }

        if !self.topics.is_empty() {
            let placeholders = vec!["?"; self.topics.len()].join(", ");
            sql.push_str(&format!(" AND topic IN ({placeholders})"));
            args.extend(
                self.topics
                    .iter()
                    .map(|topic| Value::Blob(topic.as_bytes().to_vec())),
            );
        }

        sql.push_str(" ORDER BY id LIMIT ?");
        args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        (sql, args)
    }
}

impl PageSource for SqlitePages {
    fn fetch(
        &self,
        lower: &Bound<ArchiveKey>,
        end: &ArchiveKey,
        limit: usize,
    ) -> StorageResult<Vec<(ArchiveKey, Vec<u8>)>> {
        let (sql, args) = self.statement(lower, end, limit);
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut page = Vec::with_capacity(limit);
        for row in rows {
            let (id, data) = row?;
            page.push((ArchiveKey::from_bytes(&id)?, data));
        }
        Ok(page)
    }
}
