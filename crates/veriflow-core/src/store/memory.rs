//! In-memory state store for embedded and test use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;

use super::{StateStore, VersionedValue};

const CHANNEL_CAPACITY: usize = 256;

struct Entry {
    version: u64,
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local [`StateStore`] backend.
///
/// Expiry is lazy: expired entries are treated as absent on access and
/// dropped when touched.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("channel map poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(VersionedValue {
                version: entry.version,
                value: entry.value.clone(),
            })),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store poisoned");
        let version = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.version + 1,
            _ => 1,
        };
        entries.insert(
            key.to_string(),
            Entry {
                version,
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(version)
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store poisoned");
        let current = match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.version),
            None => None,
        };
        let matches = match (expected, current) {
            (None, None) => true,
            (Some(e), Some(v)) => e == v,
            _ => false,
        };
        if !matches {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
            });
        }
        let version = current.map(|v| v + 1).unwrap_or(1);
        entries.insert(
            key.to_string(),
            Entry {
                version,
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().expect("store poisoned").remove(key);
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("store poisoned");
        let mut out: Vec<_> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    VersionedValue {
                        version: entry.version,
                        value: entry.value.clone(),
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), StoreError> {
        // send fails when nobody is subscribed, which is fine
        let _ = self.sender(channel).send(message.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, StoreError> {
        Ok(self.sender(channel).subscribe())
    }
}
