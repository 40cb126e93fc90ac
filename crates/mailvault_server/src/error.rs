//! Error types for the archive service.

use crate::protocol::PeerId;
use mailvault_codec::CodecError;
use mailvault_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for archive service operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Reasons an [`crate::ArchiveRequest`] is rejected before any storage work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The lower bound is after the upper bound.
    #[error("query range is invalid: lower > upper")]
    InvalidRange {
        /// Requested lower bound.
        lower: u32,
        /// Requested upper bound.
        upper: u32,
    },

    /// Neither topics nor a bloom filter were given.
    #[error("bloom filter and topics is empty")]
    EmptyFilter,

    /// The limit is above the configured maximum.
    #[error("limit exceeds the maximum allowed value")]
    LimitExceeded {
        /// Requested limit.
        limit: u32,
        /// Configured maximum.
        max: u32,
    },
}

/// Errors raised by an [`crate::ArchiveTransport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is no longer reachable.
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// A message exceeds what the transport can carry.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Transport ceiling.
        max: u32,
    },

    /// A bundle could not be handed to the sender in time.
    #[error("timed out after {0:?} pushing a bundle")]
    Timeout(Duration),

    /// Any other send failure.
    #[error("send failed: {0}")]
    Send(String),
}

/// Errors that can occur in the archive service.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The request is malformed.
    #[error("request is invalid: {0}")]
    Validation(#[from] ValidationError),

    /// The peer sent requests faster than the configured rate.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// The throttled peer.
        peer: PeerId,
    },

    /// The archive store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Envelopes or responses could not be sent.
    #[error("delivery failed: {0}")]
    Delivery(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The service configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background task panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Returns true if the requester caused the failure.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            ArchiveError::Validation(_) | ArchiveError::RateLimitExceeded { .. }
        )
    }

    /// Returns true if the failure is on the service side.
    pub fn is_server_error(&self) -> bool {
        !self.is_request_error()
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveError::Validation(_) => "req_invalid",
            ArchiveError::RateLimitExceeded { .. } => "peer_req_limit",
            ArchiveError::Storage(_) => "iterator",
            ArchiveError::Delivery(_) => "process",
            ArchiveError::Codec(_) => "codec",
            ArchiveError::Config(_) => "config",
            ArchiveError::Internal(_) => "internal",
        }
    }
}
