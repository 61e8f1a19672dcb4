//! Core library for the public-key addressed overlay network.
//!
//! This crate provides the primitives every other crate speaks in:
//! - Node identity keys
//! - The textual address codec (`<public-key>:<port>`)
//! - Backend type identifiers and well-known ports

pub mod addr;
pub mod error;
pub mod keys;
pub mod network;

pub use addr::{Addr, ANY_PORT};
pub use error::{AddrError, KeyError, UnknownNetwork};
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use network::{NetworkType, AWAIT_SETUP_PORT, SETUP_PORT, TRANSPORT_PORT};
