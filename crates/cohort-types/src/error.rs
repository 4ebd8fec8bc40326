//! Error types for the data model and wire envelopes.

use thiserror::Error;

/// Errors raised while encoding or validating model values.
#[derive(Debug, Error)]
pub enum TypesError {
    /// The bytes are not a cohort event envelope.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// The event exceeds size limits.
    #[error("event too large: {size} bytes (max {max})")]
    TooLarge {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// The envelope was readable but could not be classified.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons a well-formed envelope cannot be turned into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The category is not one this protocol version knows.
    #[error("unknown event category: {0}")]
    UnknownCategory(String),

    /// The category is known but the kind is not.
    #[error("unknown {category} event kind: {kind}")]
    UnknownKind {
        /// Event category.
        category: String,
        /// Unrecognized kind.
        kind: String,
    },

    /// The kind is known but the payload does not match it.
    #[error("bad {category}/{kind} payload: {reason}")]
    BadPayload {
        /// Event category.
        category: String,
        /// Event kind.
        kind: String,
        /// What went wrong.
        reason: String,
    },
}

impl DecodeError {
    /// Returns true if the event came from a newer protocol version rather than
    /// being corrupt.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::UnknownCategory(_) | Self::UnknownKind { .. })
    }
}

/// A specialized Result type for model operations.
pub type Result<T> = std::result::Result<T, TypesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::UnknownKind {
            category: "registry".into(),
            kind: "handshake".into(),
        };
        assert_eq!(err.to_string(), "unknown registry event kind: handshake");
        assert!(err.is_unknown());

        let err = DecodeError::BadPayload {
            category: "instance".into(),
            kind: "create".into(),
            reason: "missing field `guid`".into(),
        };
        assert!(!err.is_unknown());
    }
}
