//! Error types for quarry-protocol.

use thiserror::Error;

/// Result type for quarry-protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or authenticating messages.
#[derive(Debug, Error)]
pub enum Error {
    /// A commitment's signature does not verify against the claimed sender.
    #[error("commit from {0} is not signed by that player")]
    IncorrectPlayer(String),

    /// A per-message signature does not verify.
    #[error("invalid signature from {0}")]
    InvalidSignature(String),

    /// A public key or signature string could not be decoded.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A hash or coordinate payload has the wrong shape.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    /// A message is missing a field its type requires.
    #[error("{message_type} message missing `{field}`")]
    MissingField {
        message_type: &'static str,
        field: &'static str,
    },

    /// The message type tag is not one we know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The causal logging layer rejected an incoming buffer.
    #[error("causal log: {0}")]
    Stamp(String),

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
