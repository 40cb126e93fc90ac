//! Query command implementation.
//!
//! Serves a history request through the regular delivery path with a
//! recording transport, then prints what a peer would have received.

use super::open_existing;
use mailvault_codec::{Envelope, Topic};
use mailvault_server::{
    ArchiveRequest, MailServer, NoopMetrics, PeerId, RecordingTransport, RequestId, ServerConfig,
};
use serde::Serialize;
use std::sync::Arc;

/// Request parameters taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    /// Lower time bound.
    pub lower: u32,
    /// Upper time bound.
    pub upper: u32,
    /// Topics as hex strings.
    pub topics: Vec<String>,
    /// Result limit.
    pub limit: u32,
    /// Resumption cursor as hex.
    pub cursor: Option<String>,
}

/// One delivered envelope.
#[derive(Debug, Serialize)]
pub struct QueryEntry {
    /// Archive timestamp.
    pub sent: u32,
    /// Topic as hex.
    pub topic: String,
    /// Envelope hash as hex.
    pub hash: String,
    /// Payload size in bytes.
    pub size: usize,
}

/// Query output.
#[derive(Debug, Serialize)]
pub struct QueryResult {
    /// Delivered envelopes in order.
    pub envelopes: Vec<QueryEntry>,
    /// Cursor for the next page, empty when exhausted.
    pub cursor: String,
}

/// Runs the query command.
pub fn run(
    config: ServerConfig,
    args: &QueryArgs,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = build_request(args)?;
    let store = open_existing(&config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async {
        let transport = Arc::new(RecordingTransport::default());
        let server =
            MailServer::with_store(config, store, transport.clone(), Arc::new(NoopMetrics))?;
        let result = execute(&server, &transport, request).await;
        server.close()?;
        result
    })?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            for entry in &result.envelopes {
                println!(
                    "{}  {}  {}  {} bytes",
                    entry.sent, entry.topic, entry.hash, entry.size
                );
            }
            println!();
            println!("{} envelopes", result.envelopes.len());
            if result.cursor.is_empty() {
                println!("No more results");
            } else {
                println!("Next cursor: {}", result.cursor);
            }
        }
    }
    Ok(())
}

/// Serves `request` and collects what was delivered.
pub async fn execute(
    server: &MailServer,
    transport: &RecordingTransport,
    request: ArchiveRequest,
) -> Result<QueryResult, Box<dyn std::error::Error>> {
    server
        .deliver_mail(PeerId::default(), RequestId::default(), request)
        .await?;

    let envelopes = transport
        .delivered_envelopes()
        .iter()
        .map(|raw| {
            let envelope = Envelope::decode(raw)?;
            Ok(QueryEntry {
                sent: envelope.sent_at()?,
                topic: envelope.topic.to_string(),
                hash: envelope.hash()?.to_string(),
                size: envelope.data.len(),
            })
        })
        .collect::<Result<Vec<_>, mailvault_codec::CodecError>>()?;

    let cursor = transport
        .completions()
        .last()
        .map(|done| hex::encode(&done.cursor))
        .unwrap_or_default();

    Ok(QueryResult { envelopes, cursor })
}

/// Turns command-line arguments into a request.
pub fn build_request(args: &QueryArgs) -> Result<ArchiveRequest, Box<dyn std::error::Error>> {
    let topics = args
        .topics
        .iter()
        .map(|raw| parse_topic(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let mut request = ArchiveRequest::new(args.lower, args.upper)
        .with_topics(topics)
        .with_limit(args.limit);
    if let Some(cursor) = &args.cursor {
        request = request.with_cursor(decode_hex(cursor)?);
    }
    Ok(request)
}

fn parse_topic(raw: &str) -> Result<Topic, String> {
    let bytes = decode_hex(raw)?;
    Topic::from_slice(&bytes).ok_or_else(|| format!("topic must be 4 bytes: {raw}"))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(trimmed).map_err(|err| format!("invalid hex {raw:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailvault_storage::{ArchiveStore, InMemoryStore};

    #[test]
    fn parses_topics_and_cursor() {
        let args = QueryArgs {
            lower: 10,
            upper: 20,
            topics: vec!["0x01020304".into(), "aabbccdd".into()],
            limit: 5,
            cursor: Some("00ff".into()),
        };
        let request = build_request(&args).unwrap();
        assert_eq!(request.topics[0], Topic::from_bytes([1, 2, 3, 4]));
        assert_eq!(request.topics[1], Topic::from_bytes([0xaa, 0xbb, 0xcc, 0xdd]));
        assert_eq!(request.cursor, Some(vec![0x00, 0xff]));
    }

    #[test]
    fn rejects_bad_topic() {
        let args = QueryArgs {
            topics: vec!["0102".into()],
            ..QueryArgs::default()
        };
        assert!(build_request(&args).is_err());

        let args = QueryArgs {
            topics: vec!["zz".into()],
            ..QueryArgs::default()
        };
        assert!(build_request(&args).is_err());
    }

    #[tokio::test]
    async fn execute_pages_through_results() {
        let store = Arc::new(InMemoryStore::new());
        let topic = Topic::from_bytes([7; 4]);
        for sent in [100, 200, 300] {
            store
                .save_envelope(&Envelope::new(sent + 5, 5, topic, vec![1, 2]))
                .unwrap();
        }
        let transport = Arc::new(RecordingTransport::default());
        let server = MailServer::with_store(
            ServerConfig::in_memory(),
            store,
            transport.clone(),
            Arc::new(NoopMetrics),
        )
        .unwrap();

        let args = QueryArgs {
            lower: 0,
            upper: 1000,
            topics: vec!["07070707".into()],
            limit: 2,
            cursor: None,
        };
        let first = execute(&server, &transport, build_request(&args).unwrap())
            .await
            .unwrap();
        assert_eq!(first.envelopes.len(), 2);
        assert_eq!(first.envelopes[0].sent, 100);
        assert!(!first.cursor.is_empty());

        transport.clear();
        let args = QueryArgs {
            cursor: Some(first.cursor),
            ..args
        };
        let second = execute(&server, &transport, build_request(&args).unwrap())
            .await
            .unwrap();
        assert_eq!(second.envelopes.len(), 1);
        assert_eq!(second.envelopes[0].sent, 300);
        assert!(second.cursor.is_empty());
    }
}
