//! Prune command implementation.

use super::open_existing;
use mailvault_server::{Cleaner, ServerConfig};
use mailvault_storage::{ArchiveStore, RangeQuery};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Runs the prune command.
pub fn run(config: &ServerConfig, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let retention = config
        .retention()
        .ok_or("Retention must be at least one day")?;
    let store = open_existing(config)?;

    if dry_run {
        let expired = count_expired(store.as_ref(), retention)?;
        println!("Would remove {expired} envelopes older than {} days", config.data_retention_days);
        store.close()?;
        return Ok(());
    }

    let cleaner =
        Cleaner::new(store.clone(), retention).with_batch_size(config.cleaner_batch_size);
    let outcome = cleaner.prune_now();
    store.close()?;

    match outcome {
        Ok(removed) => {
            println!("Removed {removed} envelopes");
            Ok(())
        }
        Err(err) => {
            if let Some(removed) = err.removed_before_failure() {
                println!("Removed {removed} envelopes before failing");
            }
            Err(err.into())
        }
    }
}

/// Counts envelopes a prune with `retention` would remove.
pub fn count_expired(
    store: &dyn ArchiveStore,
    retention: Duration,
) -> Result<usize, Box<dyn std::error::Error>> {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)?
        .as_secs();
    let cutoff = u32::try_from(cutoff).unwrap_or(u32::MAX);
    if cutoff == 0 {
        return Ok(0);
    }

    let mut iter = store.build_iterator(&RangeQuery::between(0, cutoff - 1))?;
    let mut count = 0;
    while iter.next() {
        count += 1;
    }
    if let Some(err) = iter.take_error() {
        return Err(err.into());
    }
    iter.release()?;
    Ok(count)
}
