//! Offline store contract: durable last-known-good payloads plus the
//! connectivity signal controllers consult before going to the network.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::error::DataError;
use crate::signal::Connectivity;

/// Trait for offline fallback backends.
///
/// Values stored here are complete payloads previously confirmed by the
/// remote store; partial results must never be written. The store also owns
/// the connectivity view controllers use to decide between fetching and
/// falling back.
#[async_trait]
pub trait OfflineStore: Send + Sync {
  /// Persist the last known good payload for `key`.
  async fn store(&self, key: &str, value: &Value) -> Result<(), DataError>;

  /// Retrieve the last known good payload for `key`.
  async fn retrieve(&self, key: &str) -> Result<Option<Value>, DataError>;

  /// Current connectivity.
  fn is_online(&self) -> bool;

  /// Watch connectivity transitions (true = online).
  fn online_changes(&self) -> watch::Receiver<bool>;
}

/// In-memory offline store, mainly for tests and cache-only deployments.
pub struct MemoryOfflineStore {
  entries: Mutex<HashMap<String, Value>>,
  connectivity: Connectivity,
}

impl MemoryOfflineStore {
  pub fn new(connectivity: Connectivity) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      connectivity,
    }
  }
}

impl Default for MemoryOfflineStore {
  fn default() -> Self {
    Self::new(Connectivity::default())
  }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
  async fn store(&self, key: &str, value: &Value) -> Result<(), DataError> {
    let mut entries = self.entries.lock().await;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  async fn retrieve(&self, key: &str) -> Result<Option<Value>, DataError> {
    let entries = self.entries.lock().await;
    Ok(entries.get(key).cloned())
  }

  fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  fn online_changes(&self) -> watch::Receiver<bool> {
    self.connectivity.subscribe()
  }
}
