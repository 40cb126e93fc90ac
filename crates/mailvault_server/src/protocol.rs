//! Identifiers and response payloads exchanged with peers.

use mailvault_codec::{CodecError, CodecResult, EnvelopeHash, HASH_LENGTH};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::fmt;

/// Length of peer and request identifiers.
pub const ID_LENGTH: usize = 32;

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            /// Creates an identifier from raw bytes.
            pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Creates an identifier from a slice, if it has the right length.
            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                slice.try_into().ok().map(Self)
            }

            /// Returns the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }
    };
}

hex_id!(
    /// Identity of a requesting peer.
    PeerId
);

hex_id!(
    /// Identifier of a point-to-point history request.
    RequestId
);

/// Sent when a history request finished.
///
/// Wire layout: `request_id (32) ∥ last_envelope_hash (32) ∥ cursor`.
/// An empty cursor means the range is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCompleted {
    /// The request being answered.
    pub request_id: RequestId,
    /// Hash of the last envelope that matched, or zero if none did.
    pub last_envelope_hash: EnvelopeHash,
    /// Cursor to resume from; empty when nothing is left.
    pub cursor: Vec<u8>,
}

impl RequestCompleted {
    /// Serializes the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ID_LENGTH + HASH_LENGTH + self.cursor.len());
        out.extend_from_slice(self.request_id.as_bytes());
        out.extend_from_slice(self.last_envelope_hash.as_bytes());
        out.extend_from_slice(&self.cursor);
        out
    }

    /// Parses a payload produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is shorter than its fixed header.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < ID_LENGTH + HASH_LENGTH {
            return Err(CodecError::decoding(format!(
                "completion payload too short: {} bytes",
                bytes.len()
            )));
        }
        let (id, rest) = bytes.split_at(ID_LENGTH);
        let (hash, cursor) = rest.split_at(HASH_LENGTH);
        Ok(Self {
            request_id: RequestId::from_slice(id)
                .ok_or_else(|| CodecError::decoding("bad request id"))?,
            last_envelope_hash: EnvelopeHash::from_slice(hash)
                .ok_or_else(|| CodecError::decoding("bad envelope hash"))?,
            cursor: cursor.to_vec(),
        })
    }
}

/// Sent when a history request could not be served.
///
/// Wire layout: `request_id (32) ∥ UTF-8 error text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailed {
    /// The request being answered.
    pub request_id: RequestId,
    /// Human-readable reason.
    pub error: String,
}

impl RequestFailed {
    /// Serializes the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ID_LENGTH + self.error.len());
        out.extend_from_slice(self.request_id.as_bytes());
        out.extend_from_slice(self.error.as_bytes());
        out
    }

    /// Parses a payload produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error if the header is missing or the text is not UTF-8.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < ID_LENGTH {
            return Err(CodecError::decoding("failure payload too short"));
        }
        let (id, text) = bytes.split_at(ID_LENGTH);
        let error = String::from_utf8(text.to_vec())
            .map_err(|e| CodecError::decoding(e.to_string()))?;
        Ok(Self {
            request_id: RequestId::from_slice(id)
                .ok_or_else(|| CodecError::decoding("bad request id"))?,
            error,
        })
    }
}

/// One message of the sync protocol.
///
/// A sync exchange is a series of non-final responses carrying envelopes,
/// closed by a final response carrying the next cursor. A non-final response
/// with an error text reports failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResponse {
    /// Serialized envelopes.
    pub envelopes: Vec<Vec<u8>>,
    /// Cursor to resume from. Only set on the final response.
    pub cursor: Vec<u8>,
    /// Whether this response ends the exchange.
    pub is_final: bool,
    /// Error text, empty on success.
    pub error: String,
}

#[derive(Serialize, Deserialize)]
struct SyncResponseWire {
    envelopes: Vec<ByteBuf>,
    cursor: ByteBuf,
    #[serde(rename = "final")]
    is_final: bool,
    error: String,
}

impl SyncResponse {
    /// A non-final response carrying one bundle.
    pub fn bundle(envelopes: Vec<Vec<u8>>) -> Self {
        Self {
            envelopes,
            ..Self::default()
        }
    }

    /// The final response of a successful exchange.
    pub fn finished(cursor: Vec<u8>) -> Self {
        Self {
            cursor,
            is_final: true,
            ..Self::default()
        }
    }

    /// A non-final response reporting failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    /// Returns true if this response reports a failure.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Serializes the response as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let wire = SyncResponseWire {
            envelopes: self.envelopes.iter().cloned().map(ByteBuf::from).collect(),
            cursor: ByteBuf::from(self.cursor.clone()),
            is_final: self.is_final,
            error: self.error.clone(),
        };
        let mut out = Vec::new();
        ciborium::into_writer(&wire, &mut out).map_err(|e| CodecError::encoding(e.to_string()))?;
        Ok(out)
    }

    /// Parses a CBOR response.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid response.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let wire: SyncResponseWire =
            ciborium::from_reader(bytes).map_err(|e| CodecError::decoding(e.to_string()))?;
        Ok(Self {
            envelopes: wire.envelopes.into_iter().map(ByteBuf::into_vec).collect(),
            cursor: wire.cursor.into_vec(),
            is_final: wire.is_final,
            error: wire.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_as_hex() {
        let peer = PeerId::from_bytes([0xAB; 32]);
        assert!(peer.to_string().starts_with("0xabab"));
        assert_eq!(peer.to_string().len(), 2 + 64);
        assert!(PeerId::from_slice(&[1; 31]).is_none());
    }

    #[test]
    fn completion_layout() {
        let payload = RequestCompleted {
            request_id: RequestId::from_bytes([1; 32]),
            last_envelope_hash: EnvelopeHash::from_bytes([2; 32]),
            cursor: vec![3; 36],
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 100);
        assert_eq!(&bytes[..32], &[1; 32]);
        assert_eq!(&bytes[32..64], &[2; 32]);
        assert_eq!(RequestCompleted::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn completion_without_cursor() {
        let payload = RequestCompleted {
            request_id: RequestId::from_bytes([9; 32]),
            last_envelope_hash: EnvelopeHash::default(),
            cursor: Vec::new(),
        };
        let decoded = RequestCompleted::decode(&payload.encode()).unwrap();
        assert!(decoded.cursor.is_empty());
        assert!(decoded.last_envelope_hash.is_zero());
    }

    #[test]
    fn completion_too_short() {
        assert!(RequestCompleted::decode(&[0; 63]).is_err());
    }

    #[test]
    fn failure_layout() {
        let payload = RequestFailed {
            request_id: RequestId::from_bytes([4; 32]),
            error: "rate limit exceeded".into(),
        };
        let bytes = payload.encode();
        assert_eq!(&bytes[32..], b"rate limit exceeded");
        assert_eq!(RequestFailed::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn sync_response_kinds() {
        let bundle = SyncResponse::bundle(vec![vec![1, 2], vec![3]]);
        assert!(!bundle.is_final && !bundle.is_error());

        let done = SyncResponse::finished(vec![7; 36]);
        assert!(done.is_final);

        let failed = SyncResponse::failed("failed to process all envelopes");
        assert!(!failed.is_final && failed.is_error());

        let decoded = SyncResponse::decode(&bundle.encode().unwrap()).unwrap();
        assert_eq!(decoded, bundle);
    }
}
