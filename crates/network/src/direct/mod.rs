//! Direct backend: authenticated TCP streams to peers at known addresses.
//!
//! - [`DirectClient`] - the [`Backend`](crate::Backend) implementation
//! - [`DirectTable`] - public key to TCP address lookup
//! - handshake - signed request/response naming both endpoints

mod client;
mod handshake;
mod table;

pub use client::{DirectClient, DirectConn};
pub use table::DirectTable;
