//! Network configuration.
//!
//! Assembled once, before the facade is built, and never mutated after.
//! Everything derives serde so that node configuration files can carry it
//! directly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use corelib::{KeyPair, NetworkType, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};

const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 10_000;

/// Settings for the mesh backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Discovery service the mesh client registers with.
    pub discovery_addr: String,
    /// Number of relay sessions the client keeps open.
    #[serde(default = "default_min_sessions")]
    pub min_sessions: usize,
}

fn default_min_sessions() -> usize {
    1
}

/// Settings for the direct backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectConfig {
    /// Local bind address. Absent or empty means outbound-dial-only.
    #[serde(default)]
    pub local_addr: Option<String>,
    /// Static public key to transport address table.
    #[serde(default)]
    pub table: HashMap<PublicKey, String>,
}

impl DirectConfig {
    /// Bind address, if the backend should listen at all.
    pub fn listen_addr(&self) -> Option<&str> {
        self.local_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }
}

/// Full network configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local identity.
    pub keys: KeyPair,
    /// Backend types used for peer-to-peer transports.
    #[serde(default)]
    pub transport_networks: Vec<NetworkType>,
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
    #[serde(default)]
    pub direct: Option<DirectConfig>,
    /// Upper bound on each backend's readiness wait during init.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Upper bound on each backend's close.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_ready_timeout_ms() -> u64 {
    DEFAULT_READY_TIMEOUT_MS
}

fn default_close_timeout_ms() -> u64 {
    DEFAULT_CLOSE_TIMEOUT_MS
}

impl NetworkConfig {
    /// Configuration with no backends and default timeouts.
    pub fn new(keys: KeyPair) -> Self {
        Self {
            keys,
            transport_networks: Vec::new(),
            mesh: None,
            direct: None,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_direct(mut self, direct: DirectConfig) -> Self {
        self.direct = Some(direct);
        self
    }

    pub fn with_transport_networks(
        mut self,
        networks: impl IntoIterator<Item = NetworkType>,
    ) -> Self {
        self.transport_networks = networks.into_iter().collect();
        self
    }

    pub fn local_pk(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn local_sk(&self) -> &SecretKey {
        self.keys.secret_key()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// True if a configuration block exists for `network`.
    pub fn is_configured(&self, network: NetworkType) -> bool {
        match network {
            NetworkType::Mesh => self.mesh.is_some(),
            NetworkType::Direct => self.direct.is_some(),
        }
    }

    /// Checks the rules the facade relies on.
    ///
    /// - transport networks are unique and each one is configured
    /// - the mesh block names a discovery service
    /// - timeouts are non-zero
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for network in &self.transport_networks {
            if !seen.insert(*network) {
                return Err(NetworkError::Config(format!(
                    "transport network {} listed twice",
                    network
                )));
            }
            if !self.is_configured(*network) {
                return Err(NetworkError::Config(format!(
                    "transport network {} has no configuration block",
                    network
                )));
            }
        }

        if let Some(mesh) = &self.mesh {
            if mesh.discovery_addr.trim().is_empty() {
                return Err(NetworkError::Config(
                    "mesh discovery address is empty".to_string(),
                ));
            }
        }

        if self.ready_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(NetworkError::Config("timeouts must be non-zero".to_string()));
        }

        Ok(())
    }
}
