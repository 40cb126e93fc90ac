//! Inspect command implementation.

use super::open_existing;
use mailvault_server::ServerConfig;
use mailvault_storage::{ArchiveStore, RangeQuery};
use serde::Serialize;
use std::collections::BTreeMap;

/// Archive inspection result.
#[derive(Debug, Default, Serialize)]
pub struct InspectResult {
    /// Archive directory.
    pub path: String,
    /// Backend name.
    pub backend: String,
    /// Number of archived envelopes.
    pub envelope_count: usize,
    /// Total stored bytes.
    pub stored_bytes: u64,
    /// Oldest archive timestamp.
    pub oldest: Option<u32>,
    /// Newest archive timestamp.
    pub newest: Option<u32>,
    /// Envelopes per topic (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<BTreeMap<String, usize>>,
}

/// Runs the inspect command.
pub fn run(
    config: &ServerConfig,
    show_topics: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(config)?;
    let mut result = analyze(store.as_ref(), show_topics)?;
    result.path = config.data_dir.display().to_string();
    store.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Walks the whole archive once.
pub fn analyze(
    store: &dyn ArchiveStore,
    show_topics: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut result = InspectResult {
        backend: store.name().to_string(),
        ..InspectResult::default()
    };
    let mut topics = BTreeMap::new();

    let mut iter = store.build_iterator(&RangeQuery::between(0, u32::MAX))?;
    while iter.next() {
        let key = iter.key()?;
        let size = iter.value()?.len();

        if result.oldest.is_none() {
            result.oldest = Some(key.timestamp());
        }
        result.newest = Some(key.timestamp());
        result.envelope_count += 1;
        result.stored_bytes += size as u64;
        if show_topics {
            *topics.entry(key.topic().to_string()).or_insert(0) += 1;
        }
    }
    if let Some(err) = iter.take_error() {
        return Err(err.into());
    }
    iter.release()?;

    if show_topics {
        result.topics = Some(topics);
    }
    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("Mailvault Archive Inspection");
    println!("============================");
    println!();
    println!("Path:      {}", result.path);
    println!("Backend:   {}", result.backend);
    println!("Envelopes: {}", result.envelope_count);
    println!("Size:      {}", format_bytes(result.stored_bytes));
    match (result.oldest, result.newest) {
        (Some(oldest), Some(newest)) => println!("Range:     {oldest} .. {newest}"),
        _ => println!("Range:     (empty)"),
    }

    if let Some(topics) = &result.topics {
        println!();
        println!("Topics:");
        println!("-------");
        for (topic, count) in topics {
            println!("  {topic}: {count} envelopes");
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailvault_codec::{Envelope, Topic};
    use mailvault_storage::InMemoryStore;

    #[test]
    fn counts_envelopes_and_topics() {
        let store = InMemoryStore::new();
        for (sent, topic) in [(300, 1u8), (100, 2), (200, 1)] {
            let env = Envelope::new(sent + 10, 10, Topic::from_bytes([topic; 4]), vec![0; 16]);
            store.save_envelope(&env).unwrap();
        }

        let result = analyze(&store, true).unwrap();
        assert_eq!(result.envelope_count, 3);
        assert_eq!(result.oldest, Some(100));
        assert_eq!(result.newest, Some(300));
        let topics = result.topics.unwrap();
        assert_eq!(topics["0x01010101"], 2);
        assert_eq!(topics["0x02020202"], 1);
    }

    #[test]
    fn empty_archive() {
        let result = analyze(&InMemoryStore::new(), false).unwrap();
        assert_eq!(result.envelope_count, 0);
        assert!(result.oldest.is_none());
        assert!(result.topics.is_none());
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(12), "12 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }
}
