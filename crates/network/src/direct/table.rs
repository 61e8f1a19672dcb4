//! Public key to transport address table.

use std::collections::HashMap;

use corelib::PublicKey;
use parking_lot::RwLock;

/// Where to reach each known peer over TCP.
///
/// Seeded from configuration and editable at runtime.
#[derive(Debug, Default)]
pub struct DirectTable {
    entries: RwLock<HashMap<PublicKey, String>>,
}

impl DirectTable {
    pub fn new(entries: HashMap<PublicKey, String>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn lookup(&self, pk: &PublicKey) -> Option<String> {
        self.entries.read().get(pk).cloned()
    }

    /// Adds or replaces an entry, returning the previous address.
    pub fn insert(&self, pk: PublicKey, addr: impl Into<String>) -> Option<String> {
        self.entries.write().insert(pk, addr.into())
    }

    pub fn remove(&self, pk: &PublicKey) -> Option<String> {
        self.entries.write().remove(pk)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
