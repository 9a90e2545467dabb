//! Error types for packet decoding in sensorfuse-types.

use thiserror::Error;

/// Errors that can occur when decoding sensor notification payloads.
///
/// Only whole-packet problems (a header that cannot be read at all) surface as
/// errors. Individual corrupt samples are dropped by the decoders instead.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in sensorfuse-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Payload is shorter than the fixed header it must carry.
    #[error("Insufficient bytes: requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// Payload carried a value that cannot be interpreted.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using sensorfuse-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_bytes_display() {
        let err = ParseError::InsufficientBytes {
            expected: 4,
            actual: 1,
        };
        assert_eq!(err.to_string(), "Insufficient bytes: requires 4 bytes, got 1");
    }

    #[test]
    fn test_invalid_value_display() {
        let err = ParseError::InvalidValue("bad flags".to_string());
        assert_eq!(err.to_string(), "Invalid value: bad flags");
    }
}
