//! The archive service.

use crate::bundler::{BundleSummary, TopicMatcher};
use crate::cleaner::Cleaner;
use crate::config::ServerConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::limiter::RateLimiter;
use crate::metrics::ArchiveMetrics;
use crate::pipeline::{Pipeline, Sink};
use crate::protocol::{PeerId, RequestCompleted, RequestFailed, RequestId, SyncResponse};
use crate::request::ArchiveRequest;
use crate::transport::ArchiveTransport;
use mailvault_codec::{ArchiveKey, Cursor, Envelope, EnvelopeHash};
use mailvault_storage::ArchiveStore;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;
use uuid::Uuid;

/// What a served request delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Cursor for the next page, if the limit cut the range short.
    pub cursor: Option<Cursor>,
    /// Hash of the last matched envelope.
    pub last_envelope_hash: Option<EnvelopeHash>,
    /// Envelopes delivered.
    pub envelopes: u32,
    /// Bundles delivered.
    pub bundles: usize,
    /// Total bytes delivered.
    pub bytes: u64,
}

impl DeliveryOutcome {
    /// The cursor as sent on the wire: empty when the range is exhausted.
    pub fn cursor_bytes(&self) -> Vec<u8> {
        self.cursor
            .map(|c| c.as_bytes().to_vec())
            .unwrap_or_default()
    }
}

impl From<BundleSummary> for DeliveryOutcome {
    fn from(summary: BundleSummary) -> Self {
        Self {
            cursor: summary.next_cursor,
            last_envelope_hash: summary.last_hash,
            envelopes: summary.processed,
            bundles: summary.bundles,
            bytes: summary.total_size,
        }
    }
}

/// Archives envelopes and serves history requests.
///
/// The service persists envelopes in an [`ArchiveStore`], answers
/// point-to-point history requests ([`deliver_mail`](Self::deliver_mail))
/// and sync requests ([`sync_mail`](Self::sync_mail)) through an
/// [`ArchiveTransport`], throttles peers and prunes expired history in the
/// background.
///
/// Construction starts background tasks, so it must happen inside a tokio
/// runtime.
///
/// # Example
///
/// ```no_run
/// use mailvault_server::{
///     ArchiveRequest, MailServer, NoopMetrics, PeerId, RecordingTransport, RequestId,
///     ServerConfig,
/// };
/// use mailvault_codec::Topic;
/// use std::sync::Arc;
///
/// # async fn run() -> mailvault_server::ArchiveResult<()> {
/// let server = MailServer::open(
///     ServerConfig::new("/var/lib/mailvault"),
///     Arc::new(RecordingTransport::default()),
///     Arc::new(NoopMetrics),
/// )?;
///
/// let request = ArchiveRequest::new(1_000, 2_000).with_topics(vec![Topic::from_bytes([1; 4])]);
/// let outcome = server
///     .deliver_mail(PeerId::from_bytes([1; 32]), RequestId::from_bytes([2; 32]), request)
///     .await?;
/// println!("delivered {} envelopes", outcome.envelopes);
/// # Ok(())
/// # }
/// ```
pub struct MailServer {
    config: ServerConfig,
    store: Arc<dyn ArchiveStore>,
    transport: Arc<dyn ArchiveTransport>,
    metrics: Arc<dyn ArchiveMetrics>,
    limiter: Option<RateLimiter>,
    cleaner: Option<Cleaner>,
}

impl MailServer {
    /// Opens the configured store and starts the service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be opened. The service does not start in that case.
    pub fn open(
        config: ServerConfig,
        transport: Arc<dyn ArchiveTransport>,
        metrics: Arc<dyn ArchiveMetrics>,
    ) -> ArchiveResult<Self> {
        let store = config.open_store()?;
        Self::with_store(config, store, transport, metrics)
    }

    /// Starts the service on an already opened store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn ArchiveStore>,
        transport: Arc<dyn ArchiveTransport>,
        metrics: Arc<dyn ArchiveMetrics>,
    ) -> ArchiveResult<Self> {
        config.validate()?;

        let limiter = config.rate_limit.map(|lifespan| {
            let limiter = RateLimiter::with_period(lifespan, config.rate_limit_sweep_period);
            limiter.start();
            limiter
        });

        let cleaner = config.retention().map(|retention| {
            let cleaner = Cleaner::new(Arc::clone(&store), retention)
                .with_period(config.cleaner_period)
                .with_batch_size(config.cleaner_batch_size)
                .with_metrics(Arc::clone(&metrics));
            cleaner.start();
            cleaner
        });

        tracing::info!(
            backend = store.name(),
            data_dir = %config.data_dir.display(),
            rate_limit = ?config.rate_limit,
            retention_days = config.data_retention_days,
            "mail server started"
        );

        Ok(Self {
            config,
            store,
            transport,
            metrics,
            limiter,
            cleaner,
        })
    }

    /// The service configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn ArchiveStore> {
        &self.store
    }

    /// The rate limiter, if rate limiting is enabled.
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    /// The retention cleaner, if retention is enabled.
    pub fn cleaner(&self) -> Option<&Cleaner> {
        self.cleaner.as_ref()
    }

    /// Stores an envelope. Failures are logged and returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or written.
    pub fn archive(&self, envelope: &Envelope) -> ArchiveResult<ArchiveKey> {
        match self.store.save_envelope(envelope) {
            Ok(key) => {
                self.metrics.envelope_archived(envelope.data.len());
                tracing::trace!(key = ?key, "envelope archived");
                Ok(key)
            }
            Err(err) => {
                self.metrics.archive_failed();
                tracing::error!(
                    hash = ?envelope.hash().ok(),
                    error = %err,
                    "could not save envelope"
                );
                Err(err.into())
            }
        }
    }

    /// Serves a point-to-point history request.
    ///
    /// Matching envelopes are sent with
    /// [`ArchiveTransport::send_batch`], followed by a
    /// [`RequestCompleted`] response. Any failure is answered with a
    /// [`RequestFailed`] response and returned. Storage failures reach the
    /// peer as a fixed text, never as the backend message.
    ///
    /// # Errors
    ///
    /// Returns the reason the request could not be served.
    pub async fn deliver_mail(
        &self,
        peer: PeerId,
        request_id: RequestId,
        request: ArchiveRequest,
    ) -> ArchiveResult<DeliveryOutcome> {
        let started = Instant::now();
        let result = self.deliver(peer, request_id, request).await;
        self.metrics.request_duration("delivery", started.elapsed());
        result
    }

    async fn deliver(
        &self,
        peer: PeerId,
        request_id: RequestId,
        mut request: ArchiveRequest,
    ) -> ArchiveResult<DeliveryOutcome> {
        self.metrics.delivery_attempted();
        tracing::info!(%peer, %request_id, "delivering mail");

        let label = request_id.to_string();
        let sink = Sink::Envelopes {
            batched: request.batch,
        };

        match self.serve(peer, &label, &mut request, sink).await {
            Ok(summary) => {
                let outcome = DeliveryOutcome::from(summary);
                let response = RequestCompleted {
                    request_id,
                    last_envelope_hash: outcome.last_envelope_hash.unwrap_or_default(),
                    cursor: outcome.cursor_bytes(),
                };
                tracing::info!(
                    %peer,
                    %request_id,
                    last = ?outcome.last_envelope_hash,
                    next = ?outcome.cursor,
                    "sending historic message response"
                );
                if let Err(err) = self.transport.send_completion(&peer, &response).await {
                    self.metrics.delivery_failed("response_send");
                    tracing::error!(%peer, %request_id, error = %err, "failed to send response");
                    return Err(err.into());
                }
                self.metrics.request_served(outcome.envelopes as usize, outcome.bytes);
                Ok(outcome)
            }
            Err(err) => {
                self.metrics.delivery_failed(err.kind());
                log_failure(&err, &peer, &label, "delivery");

                let response = RequestFailed {
                    request_id,
                    error: failure_text(&err),
                };
                if let Err(send_err) = self.transport.send_failure(&peer, &response).await {
                    tracing::error!(
                        %peer,
                        %request_id,
                        error = %send_err,
                        "failed to send error response"
                    );
                }
                Err(err)
            }
        }
    }

    /// Serves a sync request.
    ///
    /// Each bundle is sent as a non-final [`SyncResponse`]; success ends with
    /// a final response carrying the next cursor. Failure is reported with a
    /// non-final response carrying an error text.
    ///
    /// # Errors
    ///
    /// Returns the reason the request could not be served.
    pub async fn sync_mail(
        &self,
        peer: PeerId,
        request: ArchiveRequest,
    ) -> ArchiveResult<DeliveryOutcome> {
        let started = Instant::now();
        let result = self.sync(peer, request).await;
        self.metrics.request_duration("sync", started.elapsed());
        result
    }

    async fn sync(
        &self,
        peer: PeerId,
        mut request: ArchiveRequest,
    ) -> ArchiveResult<DeliveryOutcome> {
        let sync_id = Uuid::new_v4().to_string();
        self.metrics.sync_attempted();
        tracing::info!(%peer, %sync_id, "started syncing envelopes");

        match self.serve(peer, &sync_id, &mut request, Sink::Sync).await {
            Ok(summary) => {
                let outcome = DeliveryOutcome::from(summary);
                let response = SyncResponse::finished(outcome.cursor_bytes());
                if let Err(err) = self.transport.send_sync_response(&peer, &response).await {
                    self.metrics.sync_failed("response_send");
                    tracing::error!(
                        %peer,
                        %sync_id,
                        error = %err,
                        "failed to send the final sync response"
                    );
                    return Err(err.into());
                }
                tracing::info!(
                    %peer,
                    %sync_id,
                    envelopes = outcome.envelopes,
                    "finished syncing envelopes"
                );
                self.metrics.request_served(outcome.envelopes as usize, outcome.bytes);
                Ok(outcome)
            }
            Err(err) => {
                self.metrics.sync_failed(sync_failure_label(&err));
                log_failure(&err, &peer, &sync_id, "sync");

                let response = SyncResponse::failed(sync_failure_text(&err));
                if let Err(send_err) = self.transport.send_sync_response(&peer, &response).await {
                    tracing::warn!(
                        %peer,
                        %sync_id,
                        error = %send_err,
                        "failed to send sync error response"
                    );
                }
                Err(err)
            }
        }
    }

    /// Stops background tasks and closes the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to close.
    pub fn close(&self) -> ArchiveResult<()> {
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
        if let Some(cleaner) = &self.cleaner {
            cleaner.stop();
        }
        if let Err(err) = self.store.close() {
            tracing::error!(error = %err, "closing database failed");
            return Err(err.into());
        }
        tracing::info!("mail server closed");
        Ok(())
    }

    async fn serve(
        &self,
        peer: PeerId,
        label: &str,
        request: &mut ArchiveRequest,
        sink: Sink,
    ) -> ArchiveResult<BundleSummary> {
        let max_limit = self.config.max_query_limit;
        request.set_defaults(SystemTime::now(), max_limit);

        tracing::info!(
            %peer,
            request_id = label,
            lower = request.lower,
            upper = request.upper,
            topics = request.topics.len(),
            bloom = request.bloom.is_some(),
            limit = request.limit,
            cursor = ?request.cursor.as_deref().map(hex::encode),
            batch = request.batch,
            "processing request"
        );

        request.validate(max_limit)?;

        if let Some(limiter) = &self.limiter {
            if !limiter.check(peer) {
                return Err(ArchiveError::RateLimitExceeded { peer });
            }
        }

        if request.batch {
            self.metrics.batched_request();
        }

        let iter = self.store.build_iterator(&request.to_query())?;
        let pipeline = Pipeline {
            transport: Arc::clone(&self.transport),
            peer,
            sink,
            limit: request.limit,
            max_message_size: self.max_message_size(),
            publish_timeout: self.config.publish_timeout,
            label: label.to_string(),
        };
        pipeline
            .run(iter, TopicMatcher::new(&request.topics, request.bloom))
            .await
    }

    fn max_message_size(&self) -> u32 {
        self.config
            .max_message_size
            .unwrap_or_else(|| self.transport.max_message_size())
    }
}

fn log_failure(err: &ArchiveError, peer: &PeerId, label: &str, protocol: &'static str) {
    if err.is_request_error() {
        tracing::warn!(%peer, request_id = label, protocol, error = %err, "request rejected");
    } else {
        tracing::error!(%peer, request_id = label, protocol, error = %err, "request failed");
    }
}

fn sync_failure_label(err: &ArchiveError) -> &'static str {
    match err {
        ArchiveError::RateLimitExceeded { .. } => "req_per_sec_limit",
        ArchiveError::Delivery(_) => "routine",
        other => other.kind(),
    }
}

/// Error text sent to the peer. Only requester mistakes are spelled out.
fn failure_text(err: &ArchiveError) -> String {
    match err {
        ArchiveError::Validation(_) | ArchiveError::RateLimitExceeded { .. } => err.to_string(),
        ArchiveError::Delivery(_) => "failed to send a response".to_string(),
        ArchiveError::Storage(_)
        | ArchiveError::Codec(_)
        | ArchiveError::Config(_)
        | ArchiveError::Internal(_) => "failed to process all envelopes".to_string(),
    }
}

fn sync_failure_text(err: &ArchiveError) -> String {
    match err {
        ArchiveError::RateLimitExceeded { .. } => "requests per seconds limit exceeded".to_string(),
        other => failure_text(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ArchiveStats, NoopMetrics};
    use crate::test_support::{FlakyStore, DISK_FAILURE};
    use crate::transport::RecordingTransport;
    use mailvault_codec::Topic;
    use mailvault_storage::InMemoryStore;
    use std::time::Duration;

    const T1: Topic = Topic::from_bytes([1, 1, 1, 1]);

    fn server(config: ServerConfig) -> (MailServer, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let server = MailServer::with_store(
            config,
            Arc::new(InMemoryStore::new()),
            transport.clone(),
            Arc::new(NoopMetrics),
        )
        .unwrap();
        (server, transport)
    }

    fn server_on(
        store: Arc<dyn ArchiveStore>,
    ) -> (MailServer, Arc<RecordingTransport>, Arc<ArchiveStats>) {
        let transport = Arc::new(RecordingTransport::default());
        let stats = Arc::new(ArchiveStats::new());
        let server = MailServer::with_store(
            ServerConfig::in_memory(),
            store,
            transport.clone(),
            stats.clone(),
        )
        .unwrap();
        (server, transport, stats)
    }

    /// Three archived envelopes on `T1`; scans break after the second.
    fn breaking_store() -> Arc<FlakyStore> {
        let store = FlakyStore::new().failing_scans_after(2);
        for sent in [1000, 1001, 1002] {
            store
                .save_envelope(&Envelope::new(sent + 10, 10, T1, vec![sent as u8]))
                .unwrap();
        }
        Arc::new(store)
    }

    fn peer() -> PeerId {
        PeerId::from_bytes([3; 32])
    }

    fn rid(b: u8) -> RequestId {
        RequestId::from_bytes([b; 32])
    }

    #[tokio::test]
    async fn archive_counts_metrics() {
        let stats = Arc::new(ArchiveStats::new());
        let server = MailServer::with_store(
            ServerConfig::in_memory(),
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingTransport::default()),
            stats.clone(),
        )
        .unwrap();

        let env = Envelope::new(1010, 10, T1, vec![1, 2, 3]);
        let key = server.archive(&env).unwrap();
        assert_eq!(key.timestamp(), 1000);
        assert_eq!(stats.snapshot().envelopes_archived, 1);
    }

    #[tokio::test]
    async fn invalid_request_sends_failure() {
        let (server, transport) = server(ServerConfig::in_memory());
        let err = server
            .deliver_mail(peer(), rid(1), ArchiveRequest::new(2000, 1000).with_topics(vec![T1]))
            .await
            .unwrap_err();
        assert!(err.is_request_error());

        let failures = transport.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].request_id, rid(1));
        assert_eq!(failures[0].error, "request is invalid: query range is invalid: lower > upper");
        assert!(transport.completions().is_empty());
    }

    #[tokio::test]
    async fn empty_range_completes_without_cursor() {
        let (server, transport) = server(ServerConfig::in_memory());
        let outcome = server
            .deliver_mail(peer(), rid(2), ArchiveRequest::new(1, 2).with_topics(vec![T1]))
            .await
            .unwrap();
        assert_eq!(outcome.envelopes, 0);

        let completions = transport.completions();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].cursor.is_empty());
        assert!(completions[0].last_envelope_hash.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejects_second_request() {
        let (server, transport) =
            server(ServerConfig::in_memory().with_rate_limit(Duration::from_secs(10)));
        let req = ArchiveRequest::new(1, 2).with_topics(vec![T1]);

        server.deliver_mail(peer(), rid(1), req.clone()).await.unwrap();
        let err = server.deliver_mail(peer(), rid(2), req.clone()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::RateLimitExceeded { .. }));
        assert_eq!(transport.failures()[0].error, "rate limit exceeded");

        // Another peer is unaffected.
        server
            .deliver_mail(PeerId::from_bytes([9; 32]), rid(3), req)
            .await
            .unwrap();
        server.close().unwrap();
    }

    #[tokio::test]
    async fn invalid_request_does_not_consume_rate_limit() {
        let (server, _) =
            server(ServerConfig::in_memory().with_rate_limit(Duration::from_secs(60)));
        let bad = ArchiveRequest::new(5, 1).with_topics(vec![T1]);
        assert!(server.deliver_mail(peer(), rid(1), bad).await.is_err());

        let good = ArchiveRequest::new(1, 5).with_topics(vec![T1]);
        assert!(server.deliver_mail(peer(), rid(2), good).await.is_ok());
    }

    #[tokio::test]
    async fn sync_failure_is_non_final() {
        let (server, transport) = server(ServerConfig::in_memory());
        let err = server
            .sync_mail(peer(), ArchiveRequest::new(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Validation(_)));

        let responses = transport.sync_responses();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].is_final);
        assert_eq!(responses[0].error, "request is invalid: bloom filter and topics is empty");
    }

    #[tokio::test]
    async fn closed_store_fails_request() {
        let (server, transport) = server(ServerConfig::in_memory());
        server.close().unwrap();
        let err = server
            .deliver_mail(peer(), rid(4), ArchiveRequest::new(1, 2).with_topics(vec![T1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Storage(_)));

        let failures = transport.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, "failed to process all envelopes");
    }

    #[tokio::test]
    async fn scan_error_fails_delivery_after_partial_send() {
        let (server, transport, stats) = server_on(breaking_store());
        let err = server
            .deliver_mail(peer(), rid(5), ArchiveRequest::new(1000, 2000).with_topics(vec![T1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Storage(_)));

        // Envelopes read before the error are still flushed.
        assert_eq!(transport.delivered_envelopes().len(), 2);
        assert!(transport.completions().is_empty());

        let failures = transport.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].request_id, rid(5));
        assert_eq!(failures[0].error, "failed to process all envelopes");
        assert!(!failures[0].error.contains(DISK_FAILURE));

        let snap = stats.snapshot();
        assert_eq!(snap.delivery_failures, 1);
        assert_eq!(snap.envelopes_delivered, 0);
    }

    #[tokio::test]
    async fn scan_error_fails_sync_without_final_response() {
        let (server, transport, stats) = server_on(breaking_store());
        let err = server
            .sync_mail(peer(), ArchiveRequest::new(1000, 2000).with_topics(vec![T1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Storage(_)));

        let responses = transport.sync_responses();
        assert!(responses.iter().all(|response| !response.is_final));
        let (last, bundles) = responses.split_last().unwrap();
        assert_eq!(last.error, "failed to process all envelopes");
        assert!(last.envelopes.is_empty());
        let synced: usize = bundles.iter().map(|bundle| bundle.envelopes.len()).sum();
        assert_eq!(synced, 2);
        assert_eq!(stats.snapshot().sync_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_record_processing_time() {
        let (server, _, stats) = server_on(Arc::new(InMemoryStore::new()));
        let good = ArchiveRequest::new(1, 2).with_topics(vec![T1]);

        server.deliver_mail(peer(), rid(1), good.clone()).await.unwrap();
        server.sync_mail(peer(), good).await.unwrap();
        assert!(server
            .deliver_mail(peer(), rid(2), ArchiveRequest::new(2, 1).with_topics(vec![T1]))
            .await
            .is_err());

        let snap = stats.snapshot();
        assert_eq!(snap.timed_requests, 3);
        assert_eq!(snap.delivery_attempts, 2);
        assert_eq!(snap.sync_attempts, 1);
    }

    #[tokio::test]
    async fn background_tasks_follow_config() {
        let (plain, _) = server(ServerConfig::in_memory());
        assert!(plain.rate_limiter().is_none());
        assert!(plain.cleaner().is_none());

        let (full, _) = server(
            ServerConfig::in_memory()
                .with_rate_limit(Duration::from_secs(1))
                .with_data_retention_days(30),
        );
        assert!(full.rate_limiter().is_some_and(RateLimiter::is_running));
        assert!(full.cleaner().is_some_and(Cleaner::is_running));

        full.close().unwrap();
        assert!(!full.rate_limiter().is_some_and(RateLimiter::is_running));
        assert!(!full.cleaner().is_some_and(Cleaner::is_running));
    }
}
