//! Backend type identifiers and well-known ports shared across the workspace.
//!
//! Inside the code a backend is named by [`NetworkType`]. The string form
//! only appears where values cross a serialization boundary: configuration
//! files, command-line arguments and log fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::UnknownNetwork;

/// Listening port of a setup node.
pub const SETUP_PORT: u16 = 36;
/// Listening port of a node awaiting setup operations.
pub const AWAIT_SETUP_PORT: u16 = 136;
/// Listening port of a node for incoming transports.
pub const TRANSPORT_PORT: u16 = 45;

/// Kind of transport backend.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum NetworkType {
    /// Relayed, multiplexed overlay reached through a discovery service.
    Mesh,
    /// Point-to-point transport dialed at a statically known address.
    Direct,
}

impl NetworkType {
    /// Every known type, in initialization order.
    pub const ALL: [NetworkType; 2] = [NetworkType::Mesh, NetworkType::Direct];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Mesh => "mesh",
            NetworkType::Direct => "direct",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetworkType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownNetwork(s.to_string()))
    }
}

impl Serialize for NetworkType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NetworkType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
