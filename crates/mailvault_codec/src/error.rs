//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding archive data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A byte string did not have the length of an archive key.
    #[error("invalid archive key: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// A byte string did not have the length of a cursor.
    #[error("invalid cursor: expected {expected} bytes, got {actual}")]
    InvalidCursorLength {
        /// Required cursor length.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// A bloom filter had the wrong size.
    #[error("invalid bloom filter: expected {expected} bytes, got {actual}")]
    InvalidBloomLength {
        /// Required filter length.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// Envelope timing fields are inconsistent.
    #[error("invalid envelope: ttl {ttl} exceeds expiry {expiry}")]
    InvalidEnvelopeTiming {
        /// Envelope expiry (unix seconds).
        expiry: u32,
        /// Envelope time-to-live (seconds).
        ttl: u32,
    },

    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },
}

impl CodecError {
    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_display() {
        let err = CodecError::InvalidKeyLength {
            expected: 40,
            actual: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("40"));
        assert!(msg.contains("12"));
    }

    #[test]
    fn helper_constructors() {
        assert!(matches!(
            CodecError::decoding("truncated"),
            CodecError::DecodingFailed { .. }
        ));
        assert!(matches!(
            CodecError::encoding("io"),
            CodecError::EncodingFailed { .. }
        ));
    }
}
