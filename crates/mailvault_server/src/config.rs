//! Server configuration.

use crate::error::{ArchiveError, ArchiveResult};
use crate::request::MAX_QUERY_LIMIT;
use mailvault_storage::{ArchiveStore, InMemoryStore, RedbStore, SqliteStore};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Seconds in one day of retention.
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Which storage engine backs the archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Entries live in memory only.
    Memory,
    /// Ordered key-value store (redb).
    #[default]
    Redb,
    /// Relational store (SQLite).
    Sqlite,
}

impl BackendKind {
    /// Returns true if the backend writes to `data_dir`.
    pub fn is_durable(self) -> bool {
        !matches!(self, BackendKind::Memory)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Memory => "memory",
            BackendKind::Redb => "redb",
            BackendKind::Sqlite => "sqlite",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendKind::Memory),
            "redb" | "kv" => Ok(BackendKind::Redb),
            "sqlite" | "sql" => Ok(BackendKind::Sqlite),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Configuration for the archive service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the archive files.
    pub data_dir: PathBuf,
    /// Storage engine.
    pub backend: BackendKind,
    /// Minimum interval between two requests from one peer. `None` disables
    /// rate limiting.
    pub rate_limit: Option<Duration>,
    /// Days of history to keep. Zero keeps everything.
    pub data_retention_days: u32,
    /// Largest limit a request may ask for.
    pub max_query_limit: u32,
    /// Bundle size ceiling. `None` uses the transport's own ceiling.
    pub max_message_size: Option<u32>,
    /// How long to wait when handing one bundle to the sender.
    pub publish_timeout: Duration,
    /// How often expired rate-limit entries are swept.
    pub rate_limit_sweep_period: Duration,
    /// How often the retention cleaner runs.
    pub cleaner_period: Duration,
    /// Deletions committed per cleaner batch.
    pub cleaner_batch_size: usize,
}

impl ServerConfig {
    /// Creates a configuration storing data in `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backend: BackendKind::default(),
            rate_limit: None,
            data_retention_days: 0,
            max_query_limit: MAX_QUERY_LIMIT,
            max_message_size: None,
            publish_timeout: Duration::from_secs(60),
            rate_limit_sweep_period: Duration::from_secs(1),
            cleaner_period: Duration::from_secs(60 * 60),
            cleaner_batch_size: 1000,
        }
    }

    /// Creates a configuration for a memory-only archive.
    pub fn in_memory() -> Self {
        Self::new(PathBuf::new()).with_backend(BackendKind::Memory)
    }

    /// Sets the storage engine.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Enables per-peer rate limiting.
    pub fn with_rate_limit(mut self, interval: Duration) -> Self {
        self.rate_limit = Some(interval).filter(|d| !d.is_zero());
        self
    }

    /// Sets the retention window in days.
    pub fn with_data_retention_days(mut self, days: u32) -> Self {
        self.data_retention_days = days;
        self
    }

    /// Sets the largest accepted request limit.
    pub fn with_max_query_limit(mut self, limit: u32) -> Self {
        self.max_query_limit = limit;
        self
    }

    /// Overrides the bundle size ceiling.
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Sets the per-bundle publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the rate-limit sweep period.
    pub fn with_rate_limit_sweep_period(mut self, period: Duration) -> Self {
        self.rate_limit_sweep_period = period;
        self
    }

    /// Sets the cleaner period.
    pub fn with_cleaner_period(mut self, period: Duration) -> Self {
        self.cleaner_period = period;
        self
    }

    /// Sets the cleaner batch size.
    pub fn with_cleaner_batch_size(mut self, size: usize) -> Self {
        self.cleaner_batch_size = size;
        self
    }

    /// The retention window, if retention is enabled.
    pub fn retention(&self) -> Option<Duration> {
        (self.data_retention_days > 0)
            .then(|| Duration::from_secs(u64::from(self.data_retention_days) * SECS_PER_DAY))
    }

    /// Checks the configuration for values the service cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Config`] describing the first problem.
    pub fn validate(&self) -> ArchiveResult<()> {
        if self.backend.is_durable() && self.data_dir.as_os_str().is_empty() {
            return Err(ArchiveError::Config("data directory is empty".into()));
        }
        if self.max_query_limit == 0 {
            return Err(ArchiveError::Config("max query limit must be positive".into()));
        }
        if self.max_message_size == Some(0) {
            return Err(ArchiveError::Config("max message size must be positive".into()));
        }
        if self.cleaner_batch_size == 0 {
            return Err(ArchiveError::Config("cleaner batch size must be positive".into()));
        }
        if self.rate_limit_sweep_period.is_zero() || self.cleaner_period.is_zero() {
            return Err(ArchiveError::Config("background periods must be positive".into()));
        }
        Ok(())
    }

    /// Opens the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be opened.
    pub fn open_store(&self) -> ArchiveResult<Arc<dyn ArchiveStore>> {
        self.validate()?;
        let store: Arc<dyn ArchiveStore> = match self.backend {
            BackendKind::Memory => Arc::new(InMemoryStore::new()),
            BackendKind::Redb => Arc::new(RedbStore::open_dir(&self.data_dir)?),
            BackendKind::Sqlite => Arc::new(SqliteStore::open_dir(&self.data_dir)?),
        };
        Ok(store)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("mailvault-data")
    }
}
