//! Outbound transport abstraction.

use crate::error::{TransportError, TransportResult};
use crate::protocol::{PeerId, RequestCompleted, RequestFailed, SyncResponse};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Default ceiling for a single outbound message.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Sends archive output back to peers.
///
/// The archive service never talks to the network itself. Whatever carries
/// peer messages (a p2p node, a test harness) implements this trait.
#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    /// Sends serialized envelopes to a peer.
    ///
    /// With `batched` the envelopes travel as one message; otherwise the
    /// service calls this once per envelope.
    async fn send_batch(
        &self,
        peer: &PeerId,
        envelopes: &[Vec<u8>],
        batched: bool,
    ) -> TransportResult<()>;

    /// Reports a finished history request.
    async fn send_completion(
        &self,
        peer: &PeerId,
        response: &RequestCompleted,
    ) -> TransportResult<()>;

    /// Reports a history request that could not be served.
    async fn send_failure(&self, peer: &PeerId, response: &RequestFailed) -> TransportResult<()>;

    /// Sends one message of the sync protocol.
    async fn send_sync_response(
        &self,
        peer: &PeerId,
        response: &SyncResponse,
    ) -> TransportResult<()>;

    /// Largest message the transport accepts, in bytes.
    fn max_message_size(&self) -> u32;
}

/// A message captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    /// Envelopes sent with [`ArchiveTransport::send_batch`].
    Envelopes {
        /// Recipient.
        peer: PeerId,
        /// Payloads in send order.
        envelopes: Vec<Vec<u8>>,
        /// Whether they were sent as one message.
        batched: bool,
    },
    /// A completion response.
    Completed(PeerId, RequestCompleted),
    /// A failure response.
    Failed(PeerId, RequestFailed),
    /// A sync protocol response.
    Sync(PeerId, SyncResponse),
}

/// A transport that records everything it is asked to send.
///
/// Useful for tests and for dry runs. It can be told to start failing after
/// a number of envelope sends to exercise cancellation.
#[derive(Debug)]
pub struct RecordingTransport {
    max_message_size: u32,
    fail_after: Option<usize>,
    sent: Mutex<Vec<SentMessage>>,
    envelope_sends: Mutex<usize>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl RecordingTransport {
    /// Creates a transport that accepts messages up to `max_message_size`.
    pub fn new(max_message_size: u32) -> Self {
        Self {
            max_message_size,
            fail_after: None,
            sent: Mutex::new(Vec::new()),
            envelope_sends: Mutex::new(0),
        }
    }

    /// Makes every envelope send after the first `sends` fail.
    pub fn failing_after(mut self, sends: usize) -> Self {
        self.fail_after = Some(sends);
        self
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// All envelopes delivered through `send_batch` or sync bundles, in order.
    pub fn delivered_envelopes(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .flat_map(|msg| match msg {
                SentMessage::Envelopes { envelopes, .. } => envelopes.clone(),
                SentMessage::Sync(_, resp) => resp.envelopes.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Completion responses sent so far.
    pub fn completions(&self) -> Vec<RequestCompleted> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                SentMessage::Completed(_, resp) => Some(resp.clone()),
                _ => None,
            })
            .collect()
    }

    /// Failure responses sent so far.
    pub fn failures(&self) -> Vec<RequestFailed> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                SentMessage::Failed(_, resp) => Some(resp.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sync responses sent so far.
    pub fn sync_responses(&self) -> Vec<SyncResponse> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                SentMessage::Sync(_, resp) => Some(resp.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    fn check_envelope_send(&self, peer: &PeerId) -> TransportResult<()> {
        let mut sends = self.envelope_sends.lock();
        if self.fail_after.is_some_and(|max| *sends >= max) {
            return Err(TransportError::NotConnected(*peer));
        }
        *sends += 1;
        Ok(())
    }

    fn check_size(&self, size: usize) -> TransportResult<()> {
        if size > self.max_message_size as usize {
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveTransport for RecordingTransport {
    async fn send_batch(
        &self,
        peer: &PeerId,
        envelopes: &[Vec<u8>],
        batched: bool,
    ) -> TransportResult<()> {
        self.check_envelope_send(peer)?;
        if batched {
            self.check_size(envelopes.iter().map(Vec::len).sum())?;
        }
        self.sent.lock().push(SentMessage::Envelopes {
            peer: *peer,
            envelopes: envelopes.to_vec(),
            batched,
        });
        Ok(())
    }

    async fn send_completion(
        &self,
        peer: &PeerId,
        response: &RequestCompleted,
    ) -> TransportResult<()> {
        self.sent
            .lock()
            .push(SentMessage::Completed(*peer, response.clone()));
        Ok(())
    }

    async fn send_failure(&self, peer: &PeerId, response: &RequestFailed) -> TransportResult<()> {
        self.sent
            .lock()
            .push(SentMessage::Failed(*peer, response.clone()));
        Ok(())
    }

    async fn send_sync_response(
        &self,
        peer: &PeerId,
        response: &SyncResponse,
    ) -> TransportResult<()> {
        if !response.envelopes.is_empty() {
            self.check_envelope_send(peer)?;
        }
        self.sent
            .lock()
            .push(SentMessage::Sync(*peer, response.clone()));
        Ok(())
    }

    fn max_message_size(&self) -> u32 {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use mailvault_codec::EnvelopeHash;

    fn peer() -> PeerId {
        PeerId::from_bytes([5; 32])
    }

    #[tokio::test]
    async fn records_in_order() {
        let transport = RecordingTransport::default();
        transport
            .send_batch(&peer(), &[vec![1], vec![2]], true)
            .await
            .unwrap();
        transport
            .send_completion(
                &peer(),
                &RequestCompleted {
                    request_id: RequestId::from_bytes([1; 32]),
                    last_envelope_hash: EnvelopeHash::default(),
                    cursor: Vec::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(transport.sent().len(), 2);
        assert_eq!(transport.delivered_envelopes(), vec![vec![1], vec![2]]);
        assert_eq!(transport.completions().len(), 1);
        assert!(transport.failures().is_empty());
    }

    #[tokio::test]
    async fn fails_after_configured_sends() {
        let transport = RecordingTransport::default().failing_after(1);
        assert!(transport.send_batch(&peer(), &[vec![1]], false).await.is_ok());
        let err = transport
            .send_batch(&peer(), &[vec![2]], false)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected(peer()));
        assert_eq!(transport.delivered_envelopes().len(), 1);
    }

    #[tokio::test]
    async fn rejects_oversize_batch() {
        let transport = RecordingTransport::new(4);
        let err = transport
            .send_batch(&peer(), &[vec![0; 3], vec![0; 3]], true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 6, max: 4 }));
    }
}
