//! # Mailvault Server
//!
//! Historic message archive for a peer-to-peer messaging network.
//!
//! This crate provides:
//! - Envelope archival into any [`mailvault_storage::ArchiveStore`]
//! - Point-to-point history delivery with cursor pagination
//! - Sync responses for peers pulling history in bulk
//! - Per-peer rate limiting and retention-based pruning
//!
//! # Architecture
//!
//! The server never talks to the network itself. Peers' requests are handed
//! to [`MailServer`], and every outgoing message leaves through an
//! [`ArchiveTransport`] implementation supplied by the host.
//!
//! Serving a request runs two halves concurrently:
//! - A producer walks the storage iterator and groups matches into
//!   size-bounded bundles
//! - A consumer sends each bundle through the transport
//!
//! A request returns at most `limit` envelopes. When the limit cuts the range
//! short the response carries a cursor; passing it back resumes the scan
//! right after the last delivered envelope.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailvault_server::{ArchiveRequest, MailServer, NoopMetrics, ServerConfig};
//!
//! let config = ServerConfig::new("/var/lib/mailvault")
//!     .with_rate_limit(Duration::from_secs(1))
//!     .with_data_retention_days(30);
//! let server = MailServer::open(config, transport, Arc::new(NoopMetrics))?;
//!
//! server.archive(&envelope)?;
//! let outcome = server.deliver_mail(peer, request_id, request).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod bundler;
mod cleaner;
mod config;
mod error;
mod lifecycle;
mod limiter;
mod metrics;
mod pipeline;
mod protocol;
mod request;
mod server;
#[cfg(test)]
mod test_support;
mod transport;

pub use cleaner::{Cleaner, DEFAULT_CLEANER_BATCH_SIZE, DEFAULT_CLEANER_PERIOD};
pub use config::{BackendKind, ServerConfig};
pub use error::{
    ArchiveError, ArchiveResult, TransportError, TransportResult, ValidationError,
};
pub use limiter::{RateLimiter, DEFAULT_SWEEP_PERIOD};
pub use metrics::{ArchiveMetrics, ArchiveStats, NoopMetrics, StatsSnapshot};
pub use protocol::{
    PeerId, RequestCompleted, RequestFailed, RequestId, SyncResponse, ID_LENGTH,
};
pub use request::{ArchiveRequest, MAX_QUERY_LIMIT, TTL_SAFETY_MARGIN_SECS};
pub use server::{DeliveryOutcome, MailServer};
pub use transport::{
    ArchiveTransport, RecordingTransport, SentMessage, DEFAULT_MAX_MESSAGE_SIZE,
};
