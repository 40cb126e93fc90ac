//! CLI command implementations.

pub mod import;
pub mod inspect;
pub mod prune;
pub mod query;

use mailvault_server::{BackendKind, ServerConfig};
use mailvault_storage::{ArchiveStore, REDB_FILE_NAME, SQLITE_FILE_NAME};
use std::sync::Arc;

/// Opens an archive that must already exist.
pub fn open_existing(
    config: &ServerConfig,
) -> Result<Arc<dyn ArchiveStore>, Box<dyn std::error::Error>> {
    let file = match config.backend {
        BackendKind::Redb => Some(REDB_FILE_NAME),
        BackendKind::Sqlite => Some(SQLITE_FILE_NAME),
        BackendKind::Memory => None,
    };
    if let Some(file) = file {
        let path = config.data_dir.join(file);
        if !path.exists() {
            let backend = config.backend;
            return Err(format!("No {backend} archive found at {:?}", config.data_dir).into());
        }
    }
    Ok(config.open_store()?)
}
