//! Short-TTL anticipatory cache, populated ahead of need.
//!
//! Always an explicitly owned instance: construct one per application scope
//! and pass it by reference. Entries expire after a short TTL because
//! prefetched data ages quickly, and a key being prefetched is reserved so
//! concurrent prefetches of the same key do not duplicate work.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::DataError;

const DEFAULT_PREFETCH_TTL: Duration = Duration::from_secs(30);

enum Slot {
  InFlight,
  Ready { value: Value, stored_at: Instant },
}

/// Anticipatory cache with per-instance ownership.
pub struct PrefetchCache {
  ttl: Duration,
  slots: Mutex<HashMap<String, Slot>>,
}

impl PrefetchCache {
  pub fn new() -> Self {
    Self::with_ttl(DEFAULT_PREFETCH_TTL)
  }

  pub fn with_ttl(ttl: Duration) -> Self {
    Self {
      ttl,
      slots: Mutex::new(HashMap::new()),
    }
  }

  /// Populate `key` ahead of need.
  ///
  /// No-op when the key is already fresh or currently being prefetched.
  /// Failures are dropped silently so a later prefetch can try again;
  /// prefetching is best-effort by nature.
  pub async fn prefetch<T, F, Fut>(&self, key: &str, fetch: F)
  where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, DataError>>,
  {
    {
      let mut slots = self.slots.lock().await;
      match slots.get(key) {
        Some(Slot::InFlight) => return,
        Some(Slot::Ready { stored_at, .. }) if stored_at.elapsed() < self.ttl => return,
        _ => {}
      }
      slots.insert(key.to_string(), Slot::InFlight);
    }

    let outcome = fetch().await.and_then(|value| {
      serde_json::to_value(&value).map_err(DataError::from)
    });

    let mut slots = self.slots.lock().await;
    // Fill only the slot we reserved; an invalidate may have cleared it
    let reserved = matches!(slots.get(key), Some(Slot::InFlight));
    match outcome {
      Ok(json) if reserved => {
        slots.insert(
          key.to_string(),
          Slot::Ready {
            value: json,
            stored_at: Instant::now(),
          },
        );
      }
      Ok(_) => {}
      Err(error) => {
        debug!(key = %key, error = %error, "prefetch failed");
        if reserved {
          slots.remove(key);
        }
      }
    }
  }

  /// Fresh-only lookup. Expired entries are evicted lazily; a key still
  /// being prefetched reads as absent.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let mut slots = self.slots.lock().await;
    match slots.get(key) {
      Some(Slot::Ready { value, stored_at }) if stored_at.elapsed() < self.ttl => {
        serde_json::from_value(value.clone()).ok()
      }
      Some(Slot::Ready { .. }) => {
        slots.remove(key);
        None
      }
      _ => None,
    }
  }

  pub async fn invalidate(&self, key: &str) {
    let mut slots = self.slots.lock().await;
    slots.remove(key);
  }

  /// Live entry count, in-flight reservations included.
  pub async fn len(&self) -> usize {
    let mut slots = self.slots.lock().await;
    let ttl = self.ttl;
    slots.retain(|_, slot| match slot {
      Slot::InFlight => true,
      Slot::Ready { stored_at, .. } => stored_at.elapsed() < ttl,
    });
    slots.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

impl Default for PrefetchCache {
  fn default() -> Self {
    Self::new()
  }
}
