//! Producer/consumer delivery of matched envelopes.
//!
//! The producer walks the storage iterator on a blocking thread, bundles
//! matches and publishes bundles into a bounded channel. The consumer task
//! hands each bundle to the transport. Either side stops the other through
//! a shared cancellation token: the consumer on its first send failure, the
//! producer when a bundle cannot be published within the timeout.

use crate::bundler::{BundleSummary, Bundler, TopicMatcher};
use crate::error::{ArchiveError, ArchiveResult, TransportError, TransportResult};
use crate::protocol::{PeerId, SyncResponse};
use crate::transport::ArchiveTransport;
use mailvault_storage::{ArchiveIterator, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bundles buffered between producer and consumer.
pub(crate) const BUNDLE_CHANNEL_CAPACITY: usize = 5;

type Bundle = Vec<Vec<u8>>;

/// How bundles leave the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sink {
    /// Point-to-point delivery, one message per bundle or per envelope.
    Envelopes { batched: bool },
    /// Non-final sync responses.
    Sync,
}

pub(crate) struct Pipeline {
    pub(crate) transport: Arc<dyn ArchiveTransport>,
    pub(crate) peer: PeerId,
    pub(crate) sink: Sink,
    pub(crate) limit: u32,
    pub(crate) max_message_size: u32,
    pub(crate) publish_timeout: Duration,
    pub(crate) label: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Publish {
    Sent,
    Cancelled,
    Closed,
    TimedOut,
}

struct Produced {
    summary: BundleSummary,
    scan_error: Option<StorageError>,
    timed_out: bool,
}

impl Pipeline {
    /// Streams every match of `iter` to the peer.
    ///
    /// Send failures take precedence over scan failures, which take
    /// precedence over publish timeouts.
    pub(crate) async fn run(
        self,
        iter: Box<dyn ArchiveIterator>,
        matcher: TopicMatcher,
    ) -> ArchiveResult<BundleSummary> {
        let (tx, rx) = mpsc::channel::<Bundle>(BUNDLE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(consume(
            Arc::clone(&self.transport),
            self.peer,
            self.sink,
            rx,
            cancel.clone(),
            self.label.clone(),
        ));

        let handle = Handle::current();
        let producer = Producer {
            bundler: Bundler::new(self.limit, self.max_message_size),
            matcher,
            tx,
            cancel,
            timeout: self.publish_timeout,
            handle,
            label: self.label.clone(),
        };
        let produced = tokio::task::spawn_blocking(move || producer.run(iter))
            .await
            .map_err(|e| ArchiveError::Internal(format!("producer task failed: {e}")))?;

        let sent = consumer
            .await
            .map_err(|e| ArchiveError::Internal(format!("consumer task failed: {e}")))?;
        sent?;

        if let Some(err) = produced.scan_error {
            return Err(ArchiveError::Storage(err));
        }
        if produced.timed_out {
            return Err(TransportError::Timeout(self.publish_timeout).into());
        }
        Ok(produced.summary)
    }
}

struct Producer {
    bundler: Bundler,
    matcher: TopicMatcher,
    tx: mpsc::Sender<Bundle>,
    cancel: CancellationToken,
    timeout: Duration,
    handle: Handle,
    label: String,
}

impl Producer {
    fn run(mut self, mut iter: Box<dyn ArchiveIterator>) -> Produced {
        tracing::debug!(request_id = %self.label, "started publishing envelopes");
        let mut stopped = None;

        while iter.next() {
            let payload = match self.matcher.classify(iter.as_ref()) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(
                        request_id = %self.label,
                        error = %err,
                        "failed to get envelope from iterator"
                    );
                    continue;
                }
            };
            let key = match iter.key() {
                Ok(key) => key,
                Err(err) => {
                    tracing::error!(request_id = %self.label, error = %err, "failed getting key");
                    break;
                }
            };

            let step = self.bundler.push(&key, payload);
            if let Some(bundle) = step.ready {
                let outcome = self.publish(bundle);
                if outcome != Publish::Sent {
                    stopped = Some(outcome);
                    break;
                }
            }
            if step.done {
                break;
            }
        }

        if stopped.is_none() {
            if let Some(bundle) = self.bundler.finish() {
                let outcome = self.publish(bundle);
                if outcome != Publish::Sent {
                    stopped = Some(outcome);
                }
            }
        }

        let scan_error = iter.take_error();
        if let Err(err) = iter.release() {
            tracing::warn!(request_id = %self.label, error = %err, "failed to release iterator");
        }

        let summary = self.bundler.summary();
        tracing::info!(
            request_id = %self.label,
            bundles = summary.bundles,
            envelopes = summary.processed,
            bytes = summary.total_size,
            cursor = ?summary.next_cursor,
            "envelopes published"
        );

        Produced {
            summary,
            scan_error,
            timed_out: stopped == Some(Publish::TimedOut),
        }
    }

    fn publish(&self, bundle: Bundle) -> Publish {
        let outcome = self.handle.block_on(async {
            tokio::select! {
                res = self.tx.send(bundle) => {
                    if res.is_ok() { Publish::Sent } else { Publish::Closed }
                }
                _ = self.cancel.cancelled() => Publish::Cancelled,
                _ = tokio::time::sleep(self.timeout) => Publish::TimedOut,
            }
        });

        match outcome {
            Publish::Sent => {}
            Publish::Cancelled | Publish::Closed => {
                tracing::info!(request_id = %self.label, "failed to push all batches");
            }
            Publish::TimedOut => {
                tracing::error!(request_id = %self.label, "timed out pushing a batch");
                self.cancel.cancel();
            }
        }
        outcome
    }
}

async fn consume(
    transport: Arc<dyn ArchiveTransport>,
    peer: PeerId,
    sink: Sink,
    mut rx: mpsc::Receiver<Bundle>,
    cancel: CancellationToken,
    label: String,
) -> TransportResult<usize> {
    let mut sent = 0usize;
    loop {
        let bundle = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(bundle) => bundle,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            res = send_bundle(transport.as_ref(), &peer, sink, bundle) => res,
        };
        if let Err(err) = result {
            cancel.cancel();
            tracing::warn!(request_id = %label, %peer, error = %err, "failed to send bundle");
            return Err(err);
        }
        sent += 1;
    }

    tracing::info!(request_id = %label, %peer, counter = sent, "finished sending bundles");
    Ok(sent)
}

async fn send_bundle(
    transport: &dyn ArchiveTransport,
    peer: &PeerId,
    sink: Sink,
    bundle: Bundle,
) -> TransportResult<()> {
    match sink {
        Sink::Envelopes { batched: true } => transport.send_batch(peer, &bundle, true).await,
        Sink::Envelopes { batched: false } => {
            for envelope in &bundle {
                transport
                    .send_batch(peer, std::slice::from_ref(envelope), false)
                    .await?;
            }
            Ok(())
        }
        Sink::Sync => {
            transport
                .send_sync_response(peer, &SyncResponse::bundle(bundle))
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestCompleted, RequestFailed};
    use crate::transport::RecordingTransport;
    use async_trait::async_trait;
    use mailvault_codec::{BloomFilter, Envelope, Topic};
    use mailvault_storage::{ArchiveStore, InMemoryStore, RangeQuery};

    fn store_with(n: u32, size: usize) -> InMemoryStore {
        let store = InMemoryStore::new();
        for i in 0..n {
            let topic = Topic::from_bytes([1; 4]);
            let env = Envelope::new(1000 + i + 10, 10, topic, vec![i as u8; size]);
            store.save_envelope(&env).unwrap();
        }
        store
    }

    fn pipeline(transport: Arc<dyn ArchiveTransport>, sink: Sink, limit: u32) -> Pipeline {
        Pipeline {
            max_message_size: transport.max_message_size(),
            transport,
            peer: PeerId::from_bytes([7; 32]),
            sink,
            limit,
            publish_timeout: Duration::from_secs(5),
            label: "test".into(),
        }
    }

    fn iter(store: &InMemoryStore) -> Box<dyn ArchiveIterator> {
        store.build_iterator(&RangeQuery::between(0, 5000)).unwrap()
    }

    #[tokio::test]
    async fn delivers_everything_in_order() {
        let store = store_with(40, 100);
        let transport = Arc::new(RecordingTransport::new(1000));
        let summary = pipeline(transport.clone(), Sink::Envelopes { batched: true }, 1000)
            .run(iter(&store), TopicMatcher::new(&[], Some(BloomFilter::full())))
            .await
            .unwrap();

        let delivered = transport.delivered_envelopes();
        assert_eq!(delivered.len(), 40);
        assert_eq!(summary.processed, 40);
        assert!(summary.next_cursor.is_none());
        assert!(summary.bundles >= 5);
        for (i, raw) in delivered.iter().enumerate() {
            assert_eq!(Envelope::decode(raw).unwrap().data[0], i as u8);
        }
    }

    #[tokio::test]
    async fn unbatched_sends_one_message_per_envelope() {
        let store = store_with(6, 10);
        let transport = Arc::new(RecordingTransport::default());
        pipeline(transport.clone(), Sink::Envelopes { batched: false }, 1000)
            .run(iter(&store), TopicMatcher::new(&[Topic::from_bytes([1; 4])], None))
            .await
            .unwrap();
        assert_eq!(transport.sent().len(), 6);
    }

    #[tokio::test]
    async fn sync_sink_wraps_bundles() {
        let store = store_with(3, 10);
        let transport = Arc::new(RecordingTransport::default());
        pipeline(transport.clone(), Sink::Sync, 1000)
            .run(iter(&store), TopicMatcher::new(&[], Some(BloomFilter::full())))
            .await
            .unwrap();
        let responses = transport.sync_responses();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].is_final);
        assert_eq!(responses[0].envelopes.len(), 3);
    }

    #[tokio::test]
    async fn send_failure_cancels_producer() {
        let store = store_with(200, 200);
        let transport = Arc::new(RecordingTransport::new(500).failing_after(2));
        let err = pipeline(transport.clone(), Sink::Envelopes { batched: true }, 1000)
            .run(iter(&store), TopicMatcher::new(&[], Some(BloomFilter::full())))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Delivery(TransportError::NotConnected(_))));
        assert_eq!(transport.sent().len(), 2);
    }

    struct StallingTransport;

    #[async_trait]
    impl ArchiveTransport for StallingTransport {
        async fn send_batch(&self, _: &PeerId, _: &[Vec<u8>], _: bool) -> TransportResult<()> {
            std::future::pending().await
        }

        async fn send_completion(&self, _: &PeerId, _: &RequestCompleted) -> TransportResult<()> {
            Ok(())
        }

        async fn send_failure(&self, _: &PeerId, _: &RequestFailed) -> TransportResult<()> {
            Ok(())
        }

        async fn send_sync_response(&self, _: &PeerId, _: &SyncResponse) -> TransportResult<()> {
            std::future::pending().await
        }

        fn max_message_size(&self) -> u32 {
            64
        }
    }

    #[tokio::test]
    async fn stalled_consumer_times_out() {
        let store = store_with(50, 40);
        let mut pipeline = pipeline(
            Arc::new(StallingTransport),
            Sink::Envelopes { batched: true },
            1000,
        );
        pipeline.publish_timeout = Duration::from_millis(50);

        let err = pipeline
            .run(iter(&store), TopicMatcher::new(&[], Some(BloomFilter::full())))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Delivery(TransportError::Timeout(_))));
    }
}
