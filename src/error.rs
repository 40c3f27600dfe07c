//! Error types for the sync core.

use thiserror::Error;

/// Errors raised by identity, codec, relay and store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An imported secret key could not be decoded or is not an `nsec`.
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// An event was about to be originated without a bound identity.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A relay endpoint refused or dropped the connection.
    #[error("endpoint unreachable ({url}): {reason}")]
    EndpointUnreachable { url: String, reason: String },

    /// Inbound payload failed parsing, verification or the namespace check.
    #[error("malformed inbound event: {0}")]
    MalformedInboundEvent(String),

    /// The persisted identity record could not be read back.
    #[error("identity storage corrupted: {0}")]
    StorageCorruption(String),

    /// Profile data was rejected (e.g. blank display name).
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// Signing or signature verification failed.
    #[error("signature error: {0}")]
    Signature(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Signature(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Signature(e.to_string())
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;
