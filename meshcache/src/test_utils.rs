//! Utilities for testing instances of the cluster without a real storage
//! engine.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use parking_lot::RwLock;

use crate::storage::{unix_millis_now, CacheStore};

#[derive(Default)]
/// A very basic in-memory store with lazy expiry, implementing
/// [`CacheStore`].
pub struct MemStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

struct StoredEntry {
    data: Vec<u8>,
    /// Absolute unix-millis expiry, `0` = never.
    expiry_at: u64,
}

impl MemStore {
    /// The absolute expiry recorded for a key, ignoring liveness.
    pub fn expiry_of(&self, key: &str) -> Option<u64> {
        self.entries.read().get(key).map(|entry| entry.expiry_at)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CacheStore for MemStore {
    type Error = Infallible;

    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64, Self::Error> {
        let expiry_at = ttl
            .map(|ttl| unix_millis_now() + ttl.as_millis() as u64)
            .unwrap_or(0);
        self.put_with_expiry(key, value, expiry_at)?;
        Ok(expiry_at)
    }

    fn put_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry_at: u64,
    ) -> Result<(), Self::Error> {
        self.entries.write().insert(
            key.to_owned(),
            StoredEntry {
                data: value,
                expiry_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let entries = self.entries.read();
        let data = entries
            .get(key)
            .filter(|entry| entry.expiry_at == 0 || entry.expiry_at > unix_millis_now())
            .map(|entry| entry.data.clone());
        Ok(data)
    }

    fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.entries.write().remove(key).is_some())
    }
}
