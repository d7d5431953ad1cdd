//! Observable state published by the controllers.

use tokio::time::Instant;

use crate::error::DataError;
use crate::store::types::Cursor;

/// Where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Fresh data from the remote store
  Network,
  /// Data from cache, still within the caller's staleness tolerance
  CacheFresh,
  /// Data from cache, stale for this caller; a network fetch is in progress
  /// or has failed
  CacheStale,
  /// Network unavailable, serving the last known good payload
  Offline,
}

/// Snapshot of a fetch controller's observable state.
///
/// Mutated only by the owning controller's task and published through a
/// watch channel, so a snapshot is always internally consistent.
#[derive(Debug, Clone)]
pub struct FetchState<T> {
  pub data: Option<T>,
  pub loading: bool,
  pub error: Option<DataError>,
  pub last_fetched_at: Option<Instant>,
  pub source: Option<DataSource>,
}

impl<T> Default for FetchState<T> {
  fn default() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      last_fetched_at: None,
      source: None,
    }
  }
}

impl<T> FetchState<T> {
  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

/// Accumulated pagination state.
///
/// Items are appended in arrival order and never reordered or deduplicated.
#[derive(Debug, Clone)]
pub struct PageState<T> {
  pub items: Vec<T>,
  pub cursor: Option<Cursor>,
  pub has_more: bool,
  pub page_size: usize,
}

impl<T> PageState<T> {
  pub fn new(page_size: usize) -> Self {
    Self {
      items: Vec::new(),
      cursor: None,
      has_more: true,
      page_size,
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}
