//! Fresh-value cache contract and in-memory implementations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A single cached value with its freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: Instant,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
    Self {
      key: key.into(),
      value,
      stored_at: Instant::now(),
      ttl,
    }
  }

  /// Time since the entry was stored.
  pub fn age(&self) -> Duration {
    self.stored_at.elapsed()
  }

  /// Whether the entry has outlived its time-to-live.
  /// An entry exactly at the boundary counts as expired.
  pub fn is_expired(&self) -> bool {
    self.age() >= self.ttl
  }

  /// Whether the entry is stale for a caller with the given tolerance.
  /// A zero tolerance means every entry is stale.
  pub fn is_stale(&self, stale_time: Duration) -> bool {
    self.age() >= stale_time
  }
}

/// Trait for fresh-value cache backends.
///
/// Semantics are per-key last-write-wins; nothing is guaranteed across keys.
/// Entries carry their own time-to-live and an expired entry must never be
/// returned from `get`.
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Look up an entry. Expired entries are treated as absent.
  async fn get(&self, key: &str) -> Option<CacheEntry>;

  /// Store a value under `key` with the given time-to-live.
  async fn set(&self, key: &str, value: Value, ttl: Duration);

  /// Drop an entry if present.
  async fn remove(&self, key: &str);
}

/// In-memory cache store with lazy TTL eviction.
///
/// Expired entries are evicted when a lookup touches them rather than by a
/// sweeper task.
#[derive(Default)]
pub struct MemoryCacheStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
  async fn get(&self, key: &str) -> Option<CacheEntry> {
    let mut entries = self.entries.lock().await;
    match entries.get(key) {
      Some(entry) if entry.is_expired() => {
        entries.remove(key);
        None
      }
      Some(entry) => Some(entry.clone()),
      None => None,
    }
  }

  async fn set(&self, key: &str, value: Value, ttl: Duration) {
    let mut entries = self.entries.lock().await;
    entries.insert(key.to_string(), CacheEntry::new(key, value, ttl));
  }

  async fn remove(&self, key: &str) {
    let mut entries = self.entries.lock().await;
    entries.remove(key);
  }
}

/// Cache store that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopCacheStore;

#[async_trait]
impl CacheStore for NoopCacheStore {
  async fn get(&self, _key: &str) -> Option<CacheEntry> {
    None // Always miss
  }

  async fn set(&self, _key: &str, _value: Value, _ttl: Duration) {
    // Discard
  }

  async fn remove(&self, _key: &str) {}
}
