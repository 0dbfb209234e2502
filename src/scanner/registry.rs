//! Watched addresses
//!
//! Maps an address to the key of whoever watches it (an account or user id).
//! Lookups happen from every extraction worker; registration is rare.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Resolves an address to its watcher's source key
#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn lookup(&self, address: &str) -> Option<String>;
}

/// In-memory address to source key map
#[derive(Debug, Default)]
pub struct AddressRegistry {
    entries: RwLock<HashMap<String, String>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `address` for `source_key`, returning the previous owner
    pub async fn register(&self, address: &str, source_key: &str) -> Option<String> {
        self.entries
            .write()
            .await
            .insert(address.to_string(), source_key.to_string())
    }

    pub async fn register_many<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)> + Send,
        I::IntoIter: Send,
    {
        let mut map = self.entries.write().await;
        for (address, source_key) in entries {
            map.insert(address.to_string(), source_key.to_string());
        }
    }

    pub async fn unregister(&self, address: &str) -> Option<String> {
        self.entries.write().await.remove(address)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AddressLookup for AddressRegistry {
    async fn lookup(&self, address: &str) -> Option<String> {
        self.entries.read().await.get(address).cloned()
    }
}
