//! src/store.rs
//!
//! The in-memory TTL store. Every entry carries an expiry deadline; expired
//! entries are logically gone the moment the deadline passes and are
//! physically removed on next access or by the background sweeper, whichever
//! comes first. There is no durability and no undo.

use crate::error::{Error, Result};
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, SystemTime},
};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// How often the background sweeper scans for expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A single stored value and its TTL bookkeeping.
#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    created_at: SystemTime,
    ttl: Duration,
    expires_at: SystemTime,
}

impl StoredEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        let created_at = SystemTime::now();
        Self {
            value,
            created_at,
            ttl,
            expires_at: created_at + ttl,
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    fn remaining_ttl(&self, now: SystemTime) -> u64 {
        self.expires_at
            .duration_since(now)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A read of a key together with its TTL metadata, for the HTTP headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub value: Vec<u8>,
    pub created_at: SystemTime,
    pub ttl_seconds: u64,
    pub remaining_ttl_seconds: u64,
}

/// Aggregate store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub keys: usize,
    pub value_bytes: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, StoredEntry>,
    used_bytes: u64,
}

/// The per-node in-memory key/value store.
pub struct Store {
    inner: RwLock<Inner>,
    /// Total value-byte cap. 0 disables the cap.
    max_bytes: u64,
}

impl Store {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_bytes,
        }
    }

    /// Stores a copy of `value` under `key`, overwriting any existing entry
    /// and restarting the TTL window. No TTL clamping happens here; that is
    /// the HTTP shell's responsibility.
    pub fn put(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let old_size = inner.entries.get(key).map_or(0, |e| e.value.len() as u64);
        let new_size = value.len() as u64;
        let projected = inner.used_bytes - old_size + new_size;
        if self.max_bytes > 0 && projected > self.max_bytes {
            return Err(Error::StoreFull);
        }

        inner.entries.insert(
            key.to_string(),
            StoredEntry::new(value.to_vec(), Duration::from_secs(ttl_seconds)),
        );
        inner.used_bytes = projected;
        Ok(())
    }

    /// Returns a copy of the live value, or `None` if the key is absent or
    /// expired. An expired entry is evicted on the spot.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.get_with_metadata(key).map(|meta| meta.value)
    }

    /// Like [`Store::get`], but also reports creation time and TTL state.
    pub fn get_with_metadata(&self, key: &str) -> Option<EntryMetadata> {
        let now = SystemTime::now();
        let mut inner = self.inner.write().expect("store lock poisoned");

        match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {}
            Some(entry) => {
                return Some(EntryMetadata {
                    value: entry.value.clone(),
                    created_at: entry.created_at,
                    ttl_seconds: entry.ttl.as_secs(),
                    remaining_ttl_seconds: entry.remaining_ttl(now),
                })
            }
            None => return None,
        }

        // Expiry-on-access: the read found a dead entry, so evict it now.
        if let Some(entry) = inner.entries.remove(key) {
            inner.used_bytes -= entry.value.len() as u64;
        }
        None
    }

    /// Cheap liveness probe: remaining TTL in seconds, without copying the
    /// value. Does not evict.
    pub fn exists(&self, key: &str) -> Option<u64> {
        let now = SystemTime::now();
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.remaining_ttl(now))
    }

    /// Enumerates currently-live keys, optionally restricted to a prefix.
    /// Order is unspecified at this layer; the HTTP shell sorts for
    /// pagination.
    pub fn scan(&self, prefix: Option<&str>) -> Vec<String> {
        let now = SystemTime::now();
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().expect("store lock poisoned");
        StoreStats {
            keys: inner.entries.len(),
            value_bytes: inner.used_bytes,
        }
    }

    /// Removes every expired entry and returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = SystemTime::now();
        let mut inner = self.inner.write().expect("store lock poisoned");

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.used_bytes -= entry.value.len() as u64;
            }
        }
        expired.len()
    }

    /// Background sweep service. Runs until the shutdown token fires.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, shutdown_token: CancellationToken) {
        let mut timer = time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Store sweeper received shutdown signal.");
                    break;
                }
                _ = timer.tick() => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        tracing::info!(count = evicted, "Swept expired entries");
                    }
                }
            }
        }
    }
}

// --- Unit Tests ---
