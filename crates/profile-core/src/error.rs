//! Error types shared by the profile-server data model

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core data-model error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Hash mismatch (computed != transmitted id)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Float normalization error (NaN, Inf, or a value outside the fixed-point range)
    #[error("float normalization error: {0}")]
    FloatNormalization(String),

    /// A validated field failed its check; `path` is the dotted field path
    /// used verbatim in the wire-level ErrorInvalidValue.details.
    #[error("invalid value at {path}: {reason}")]
    InvalidField { path: String, reason: String },

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),
}
