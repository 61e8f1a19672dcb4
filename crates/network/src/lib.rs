//! Public-key addressed networking over pluggable transport backends.
//!
//! This crate provides:
//! - The backend contract every transport implements ([`Backend`])
//! - Connection and listener wrappers that expose peer identities
//! - The [`Network`] facade that owns, starts and closes backends
//! - A direct TCP backend and an in-process backend

pub mod backend;
pub mod config;
pub mod conn;
pub mod direct;
pub mod error;
pub mod memory;
pub mod net;
mod ports;
pub mod supervisor;

pub use backend::{Backend, NoBackend, RawConn, RawListener, Readiness};
pub use config::{DirectConfig, MeshConfig, NetworkConfig};
pub use conn::{Conn, Listener};
pub use direct::{DirectClient, DirectTable};
pub use error::{BackendError, NetworkError, Result};
pub use memory::{MemoryBackend, MemoryHub};
pub use net::{Network, NetworkState};
pub use ports::EPHEMERAL_PORTS;
pub use supervisor::{BackendFault, BackendStatus, HealthReport};
