//! SQLite-backed offline store.
//!
//! Persists last-known-good payloads across process restarts so offline
//! fallback keeps working after a relaunch.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::DataError;
use crate::signal::Connectivity;
use crate::store::offline::OfflineStore;

/// Schema for the offline payload table.
const OFFLINE_SCHEMA: &str = r#"
-- Last known good payloads (serialized JSON)
CREATE TABLE IF NOT EXISTS offline_cache (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Durable offline store backed by SQLite.
pub struct SqliteOfflineStore {
  conn: Mutex<Connection>,
  connectivity: Connectivity,
}

impl SqliteOfflineStore {
  /// Open the store at the default location.
  pub fn open(connectivity: Connectivity) -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path, connectivity)
  }

  /// Open the store at an explicit path, creating parent directories.
  pub fn open_at(path: &Path, connectivity: Connectivity) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create offline store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open offline store at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
      connectivity,
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store. Contents do not survive the connection.
  pub fn open_in_memory(connectivity: Connectivity) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
      connectivity,
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("docquery").join("offline.db"))
  }

  /// Run database migrations for the offline table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(OFFLINE_SCHEMA)
      .map_err(|e| eyre!("Failed to run offline store migrations: {}", e))?;

    Ok(())
  }
}

#[async_trait]
impl OfflineStore for SqliteOfflineStore {
  async fn store(&self, key: &str, value: &Value) -> Result<(), DataError> {
    let data = serde_json::to_vec(value)?;

    let conn = self
      .conn
      .lock()
      .map_err(|_| DataError::storage("offline store lock poisoned"))?;

    conn.execute(
      "INSERT OR REPLACE INTO offline_cache (key, data, stored_at)
       VALUES (?, ?, datetime('now'))",
      params![key, data],
    )?;

    Ok(())
  }

  async fn retrieve(&self, key: &str) -> Result<Option<Value>, DataError> {
    let conn = self
      .conn
      .lock()
      .map_err(|_| DataError::storage("offline store lock poisoned"))?;

    let mut stmt = conn.prepare("SELECT data FROM offline_cache WHERE key = ?")?;

    let result: Option<Vec<u8>> = stmt.query_row(params![key], |row| row.get(0)).ok();

    match result {
      Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
      None => Ok(None),
    }
  }

  fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  fn online_changes(&self) -> watch::Receiver<bool> {
    self.connectivity.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[tokio::test]
  async fn test_store_then_retrieve_in_memory() {
    let store = SqliteOfflineStore::open_in_memory(Connectivity::default()).unwrap();
    store
      .store("k", &json!({"nested": {"a": [1, 2, 3]}}))
      .await
      .unwrap();

    assert_eq!(
      store.retrieve("k").await.unwrap(),
      Some(json!({"nested": {"a": [1, 2, 3]}}))
    );
    assert_eq!(store.retrieve("missing").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_store_overwrites() {
    let store = SqliteOfflineStore::open_in_memory(Connectivity::default()).unwrap();
    store.store("k", &json!(1)).await.unwrap();
    store.store("k", &json!(2)).await.unwrap();
    assert_eq!(store.retrieve("k").await.unwrap(), Some(json!(2)));
  }

  #[tokio::test]
  async fn test_payloads_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    {
      let store = SqliteOfflineStore::open_at(&path, Connectivity::default()).unwrap();
      store.store("k", &json!({"saved": true})).await.unwrap();
    }

    let reopened = SqliteOfflineStore::open_at(&path, Connectivity::default()).unwrap();
    assert_eq!(
      reopened.retrieve("k").await.unwrap(),
      Some(json!({"saved": true}))
    );
  }

  #[tokio::test]
  async fn test_connectivity_passthrough() {
    let connectivity = Connectivity::new(false);
    let store = SqliteOfflineStore::open_in_memory(connectivity.clone()).unwrap();
    assert!(!store.is_online());

    connectivity.set_online(true);
    assert!(store.is_online());
  }
}
