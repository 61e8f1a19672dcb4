//! Error types for the core library.

use thiserror::Error;

/// Errors produced when decoding or using key material.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    /// Text is not valid hexadecimal
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Decoded key has the wrong number of bytes
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    /// Bytes do not encode a point on the curve
    #[error("bytes are not a valid public key")]
    InvalidPoint,
    /// Signature did not verify against the public key
    #[error("signature verification failed")]
    BadSignature,
    /// Public key was not derived from the secret key it is paired with
    #[error("public key does not match secret key")]
    Mismatch,
}

// `hex::FromHexError` implements `PartialEq` but not `Eq`; its equality is
// nonetheless total, so `Eq` is asserted manually.
impl Eq for KeyError {}

/// Errors produced by the address codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    /// Address does not have exactly two colon-separated fields
    #[error("invalid address {0:?}: expected <public-key>:<port>")]
    Format(String),
    /// First field is not a valid public key
    #[error("invalid public key {text:?} in address: {source}")]
    InvalidKey {
        text: String,
        #[source]
        source: KeyError,
    },
    /// Second field is neither `~` nor a decimal port
    #[error("invalid port {0:?} in address")]
    Port(String),
}

/// A backend type identifier outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown network type {0:?}")]
pub struct UnknownNetwork(pub String);
