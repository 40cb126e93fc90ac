//! History requests.

use crate::error::ValidationError;
use mailvault_codec::{BloomFilter, CodecError, CodecResult, Topic};
use mailvault_storage::RangeQuery;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Most envelopes a single request may ask for.
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Margin added to "now" when a request leaves `upper` unset, so envelopes
/// stamped slightly in the future are still covered.
pub const TTL_SAFETY_MARGIN_SECS: u32 = 60;

/// A peer's request for archived envelopes.
///
/// The time bounds are inclusive unix seconds. A peer selects envelopes with
/// either an explicit topic list or, when the list is empty, a bloom filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveRequest {
    /// Lower time bound (inclusive).
    pub lower: u32,
    /// Upper time bound (inclusive). Zero means "now".
    pub upper: u32,
    /// Topic bloom filter, used when `topics` is empty.
    pub bloom: Option<BloomFilter>,
    /// Explicit topics.
    pub topics: Vec<Topic>,
    /// Maximum envelopes to return. Zero means the server maximum.
    pub limit: u32,
    /// Cursor returned by a previous response.
    pub cursor: Option<Vec<u8>>,
    /// Send each bundle as one message instead of one message per envelope.
    pub batch: bool,
}

#[derive(Serialize, Deserialize)]
struct ArchiveRequestWire {
    lower: u32,
    upper: u32,
    #[serde(default)]
    bloom: Option<ByteBuf>,
    #[serde(default)]
    topics: Vec<Topic>,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    cursor: Option<ByteBuf>,
    #[serde(default)]
    batch: bool,
}

impl ArchiveRequest {
    /// Creates a request for the inclusive range `lower..=upper`.
    pub fn new(lower: u32, upper: u32) -> Self {
        Self {
            lower,
            upper,
            ..Self::default()
        }
    }

    /// Sets the explicit topics.
    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }

    /// Sets the bloom filter.
    pub fn with_bloom(mut self, bloom: BloomFilter) -> Self {
        self.bloom = Some(bloom);
        self
    }

    /// Sets the limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the resumption cursor. An empty cursor clears it.
    pub fn with_cursor(mut self, cursor: Vec<u8>) -> Self {
        self.cursor = if cursor.is_empty() { None } else { Some(cursor) };
        self
    }

    /// Requests batched delivery.
    pub fn batched(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Fills in defaults: a zero limit becomes `max_limit` and a zero upper
    /// bound becomes `now` plus [`TTL_SAFETY_MARGIN_SECS`].
    pub fn set_defaults(&mut self, now: SystemTime, max_limit: u32) {
        if self.limit == 0 {
            self.limit = max_limit;
        }
        if self.upper == 0 {
            let secs = now
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let secs = u32::try_from(secs).unwrap_or(u32::MAX);
            self.upper = secs.saturating_add(TTL_SAFETY_MARGIN_SECS);
        }
    }

    /// Checks the request against the service limits.
    ///
    /// # Errors
    ///
    /// Returns the first rule the request breaks.
    pub fn validate(&self, max_limit: u32) -> Result<(), ValidationError> {
        if self.upper < self.lower {
            return Err(ValidationError::InvalidRange {
                lower: self.lower,
                upper: self.upper,
            });
        }
        if self.bloom.is_none() && self.topics.is_empty() {
            return Err(ValidationError::EmptyFilter);
        }
        if self.limit > max_limit {
            return Err(ValidationError::LimitExceeded {
                limit: self.limit,
                max: max_limit,
            });
        }
        Ok(())
    }

    /// The storage query covering this request.
    pub fn to_query(&self) -> RangeQuery {
        RangeQuery::between(self.lower, self.upper)
            .with_cursor(self.cursor.clone())
            .with_limit(self.limit)
            .with_bloom(self.bloom)
            .with_topics(self.topics.clone())
    }

    /// Serializes the request as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let wire = ArchiveRequestWire {
            lower: self.lower,
            upper: self.upper,
            bloom: self.bloom.map(|b| ByteBuf::from(b.as_bytes().to_vec())),
            topics: self.topics.clone(),
            limit: self.limit,
            cursor: self.cursor.clone().map(ByteBuf::from),
            batch: self.batch,
        };
        let mut out = Vec::new();
        ciborium::into_writer(&wire, &mut out).map_err(|e| CodecError::encoding(e.to_string()))?;
        Ok(out)
    }

    /// Parses a CBOR request.
    ///
    /// An empty bloom field is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or the bloom filter has
    /// the wrong length.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let wire: ArchiveRequestWire =
            ciborium::from_reader(bytes).map_err(|e| CodecError::decoding(e.to_string()))?;
        let bloom = match wire.bloom {
            Some(raw) if !raw.is_empty() => Some(BloomFilter::from_slice(&raw)?),
            _ => None,
        };
        Ok(Self {
            lower: wire.lower,
            upper: wire.upper,
            bloom,
            topics: wire.topics,
            limit: wire.limit,
            cursor: wire.cursor.map(ByteBuf::into_vec).filter(|c| !c.is_empty()),
            batch: wire.batch,
        })
    }
}
