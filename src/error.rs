//! Error types for the census interception layer

use thiserror::Error;

/// Result type alias for the census interception layer
pub type Result<T> = std::result::Result<T, CensusError>;

/// Main error type for the census interception layer.
///
/// Nothing in this crate lets one of these reach the underlying RPC: every
/// variant is either logged and absorbed (fail-open) or returned from a
/// metadata/codec helper whose caller degrades to an empty value.
#[derive(Debug, Error)]
pub enum CensusError {
    /// Metadata key is not valid on the wire
    #[error("invalid metadata key: {key:?}")]
    InvalidKey { key: String },

    /// Encoded value would exceed the wire ceiling for its kind
    #[error("encoded value is {len} bytes, ceiling is {max}")]
    OversizedValue { len: usize, max: usize },

    /// Binary context blob failed to parse
    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CensusError::InvalidKey {
            key: "Bad-Key".to_string(),
        };
        assert_eq!(err.to_string(), "invalid metadata key: \"Bad-Key\"");

        let err = CensusError::OversizedValue { len: 40, max: 32 };
        assert_eq!(err.to_string(), "encoded value is 40 bytes, ceiling is 32");
    }

    #[test]
    fn test_error_from_codec() {
        let codec_err = crate::codec::CodecError::UnsupportedVersion(7);
        let err: CensusError = codec_err.into();
        assert!(matches!(err, CensusError::Codec(_)));
    }
}
