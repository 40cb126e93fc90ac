//! Import command implementation.

use mailvault_codec::{Envelope, Topic};
use mailvault_server::{ArchiveStats, MailServer, RecordingTransport, ServerConfig};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// One envelope in an import file.
///
/// ```json
/// [{ "expiry": 1700000060, "ttl": 60, "topic": "0xdeadbeef", "data": "68656c6c6f" }]
/// ```
#[derive(Debug, Deserialize)]
pub struct ImportRecord {
    /// Expiry time (unix seconds).
    pub expiry: u32,
    /// Time-to-live (seconds).
    pub ttl: u32,
    /// Topic as 8 hex digits.
    pub topic: String,
    /// Payload as hex.
    #[serde(default)]
    pub data: String,
    /// Proof-of-work nonce.
    #[serde(default)]
    pub nonce: u64,
}

impl ImportRecord {
    /// Converts the record into an envelope.
    pub fn into_envelope(self) -> Result<Envelope, String> {
        let topic_bytes = decode_hex(&self.topic)?;
        let topic = Topic::from_slice(&topic_bytes)
            .ok_or_else(|| format!("topic must be 4 bytes: {}", self.topic))?;
        let data = decode_hex(&self.data)?;
        Ok(Envelope::new(self.expiry, self.ttl, topic, data).with_nonce(self.nonce))
    }
}

/// Runs the import command.
pub fn run(config: &ServerConfig, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(file)?;
    let records: Vec<ImportRecord> = serde_json::from_str(&raw)?;
    let envelopes = records
        .into_iter()
        .map(ImportRecord::into_envelope)
        .collect::<Result<Vec<_>, _>>()?;

    let stats = Arc::new(ArchiveStats::new());
    let server = MailServer::with_store(
        config.clone(),
        config.open_store()?,
        Arc::new(RecordingTransport::default()),
        stats.clone(),
    )?;
    let imported = import_all(&server, &envelopes);
    server.close()?;

    let snapshot = stats.snapshot();
    println!(
        "Imported {imported} of {} envelopes ({} bytes, {} failed)",
        envelopes.len(),
        snapshot.archived_bytes,
        snapshot.archive_errors
    );
    Ok(())
}

/// Archives every envelope, skipping the ones that fail. Returns how many
/// were stored.
pub fn import_all(server: &MailServer, envelopes: &[Envelope]) -> usize {
    envelopes
        .iter()
        .filter(|envelope| server.archive(envelope).is_ok())
        .count()
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(trimmed).map_err(|err| format!("invalid hex {raw:?}: {err}"))
}
