//! Stable cache-key derivation for typed queries.
//!
//! Controllers address the cache by plain string keys. This module provides
//! the trait that maps a typed query identity onto such a key, plus a ready
//! key type for the common document-store shapes.

use sha2::{Digest, Sha256};

use crate::store::types::CollectionQuery;

/// Trait for typed query identities that map to stable cache keys.
///
/// Implementors describe *what* is being fetched; the hash gives a stable,
/// fixed-length key for it.
pub trait QueryKey {
  /// Stable, fixed-length cache key.
  fn cache_hash(&self) -> String;

  /// Human-readable description for logging.
  fn description(&self) -> String;
}

/// Query key types for remote document-store reads.
#[derive(Clone, Debug)]
pub enum StoreQueryKey {
  /// A single document by collection path and id
  Document { collection: String, id: String },
  /// A constrained collection read
  Collection {
    path: String,
    query: CollectionQuery,
  },
}

impl StoreQueryKey {
  pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self::Document {
      collection: collection.into(),
      id: id.into(),
    }
  }

  pub fn collection(path: impl Into<String>, query: CollectionQuery) -> Self {
    Self::Collection {
      path: path.into(),
      query,
    }
  }
}

impl QueryKey for StoreQueryKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::Document { collection, id } => {
        format!("document:{}:{}", normalize_path(collection), id)
      }
      Self::Collection { path, query } => {
        format!("collection:{}:{}", normalize_path(path), canonical_query(query))
      }
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
  }

  fn description(&self) -> String {
    match self {
      Self::Document { collection, id } => format!("document {}/{}", collection, id),
      Self::Collection { path, query } => {
        if query.filters.is_empty() {
          format!("collection {}", path)
        } else {
          format!("collection {} ({} filters)", path, query.filters.len())
        }
      }
    }
  }
}

/// Normalize a collection path for consistent hashing.
/// Trims whitespace and surrounding slashes.
fn normalize_path(path: &str) -> String {
  path.trim().trim_matches('/').to_string()
}

/// Canonical form of a collection query.
///
/// Filters are sorted so that logically equal queries hash equally
/// regardless of construction order. Ordering specs keep their order
/// because it is significant.
fn canonical_query(query: &CollectionQuery) -> String {
  let mut filters: Vec<String> = query
    .filters
    .iter()
    .map(|f| {
      format!(
        "{}|{:?}|{}",
        f.field,
        f.op,
        serde_json::to_string(&f.value).unwrap_or_default()
      )
    })
    .collect();
  filters.sort();

  let order: Vec<String> = query
    .order_by
    .iter()
    .map(|s| format!("{}|{:?}", s.field, s.direction))
    .collect();

  format!(
    "f[{}]o[{}]l[{}]",
    filters.join(","),
    order.join(","),
    query.limit.map(|l| l.to_string()).unwrap_or_default()
  )
}
