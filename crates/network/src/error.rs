//! Error types for the network layer.
//!
//! Backends report [`BackendError`]. The facade wraps those with the backend
//! type they came from, so callers can tell a transport-level cause from an
//! addressing-level one.

use std::time::Duration;

use corelib::{AddrError, KeyError, NetworkType, PublicKey};
use thiserror::Error;

use crate::net::NetworkState;

/// Result type alias for the network layer.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Failures reported by a transport backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Socket level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's cancellation fired first
    #[error("operation cancelled")]
    Cancelled,

    /// The port is already bound by this backend
    #[error("port {0} is already bound")]
    PortInUse(u16),

    /// Every ephemeral port is taken
    #[error("no free ephemeral port")]
    PortsExhausted,

    /// No transport address is known for the peer
    #[error("no address known for {0}")]
    NoAddress(PublicKey),

    /// The peer does not accept connections on that port
    #[error("{pk} is not listening on port {port}")]
    Unreachable { pk: PublicKey, port: u16 },

    /// The backend or listener was closed
    #[error("closed")]
    Closed,

    /// Peer rejected or garbled the connection handshake
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Signature or key decoding failure
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Anything else a backend wants to surface
    #[error("{0}")]
    Other(String),
}

/// Errors returned by the network facade and its wrappers.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Backend type is not recognized or not configured
    #[error("unknown network type {0:?}")]
    UnknownNetwork(String),

    /// A raw endpoint reported an address the codec cannot parse
    #[error("bad endpoint address: {0}")]
    Addr(#[from] AddrError),

    #[error("{network}: dial failed: {source}")]
    Dial {
        network: NetworkType,
        #[source]
        source: BackendError,
    },

    #[error("{network}: listen failed: {source}")]
    Listen {
        network: NetworkType,
        #[source]
        source: BackendError,
    },

    #[error("{network}: accept failed: {source}")]
    Accept {
        network: NetworkType,
        #[source]
        source: BackendError,
    },

    #[error("{network}: close failed: {source}")]
    Close {
        network: NetworkType,
        #[source]
        source: BackendError,
    },

    #[error("{network}: close did not finish within {timeout:?}")]
    CloseTimeout {
        network: NetworkType,
        timeout: Duration,
    },

    #[error("{network}: failed to start: {source}")]
    Init {
        network: NetworkType,
        #[source]
        source: BackendError,
    },

    #[error("{network}: not ready within {timeout:?}")]
    ReadinessTimeout {
        network: NetworkType,
        timeout: Duration,
    },

    /// The caller's cancellation fired first
    #[error("operation cancelled")]
    Cancelled,

    /// Operation is not valid in the facade's current lifecycle state
    #[error("network is {state}, operation requires {required}")]
    InvalidState {
        state: NetworkState,
        required: NetworkState,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<corelib::UnknownNetwork> for NetworkError {
    fn from(err: corelib::UnknownNetwork) -> Self {
        NetworkError::UnknownNetwork(err.0)
    }
}
