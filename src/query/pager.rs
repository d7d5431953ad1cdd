//! Cursor paging and live subscriptions directly against the remote store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::DataError;
use crate::query::state::PageState;
use crate::store::remote::RemoteStore;
use crate::store::types::{CollectionQuery, Document, Page, PageRequest};

/// Shape of the paged view: where it reads from and how.
pub struct PagerOptions {
  pub path: String,
  pub query: CollectionQuery,
  pub page_size: usize,
  /// Realtime instances subscribe instead of paging; the two modes are
  /// mutually exclusive per instance.
  pub realtime: bool,
}

impl PagerOptions {
  pub fn new(path: impl Into<String>, page_size: usize) -> Self {
    Self {
      path: path.into(),
      query: CollectionQuery::new(),
      page_size,
      realtime: false,
    }
  }

  pub fn with_query(mut self, query: CollectionQuery) -> Self {
    self.query = query;
    self
  }

  pub fn with_realtime(mut self, realtime: bool) -> Self {
    self.realtime = realtime;
    self
  }
}

/// Observable state of the paged (or live) result set.
#[derive(Debug, Clone)]
pub struct PagerState {
  pub pages: PageState<Document>,
  pub loading: bool,
  pub error: Option<DataError>,
  /// Stamped on every realtime push.
  pub last_updated: Option<DateTime<Utc>>,
}

struct PagerInner {
  remote: Arc<dyn RemoteStore>,
  options: PagerOptions,
  state_tx: watch::Sender<PagerState>,
  // Bumped by reset() under the channel lock, see load_next_page
  epoch: AtomicU64,
  started: AtomicBool,
  disposed: AtomicBool,
  realtime_task: Mutex<Option<JoinHandle<()>>>,
}

/// Pages a remote collection by cursor, or mirrors it live when
/// constructed with `realtime`. An instance is one mode or the other;
/// switching requires a new instance.
pub struct RemoteCollectionPager {
  inner: Arc<PagerInner>,
}

impl RemoteCollectionPager {
  pub fn new(remote: Arc<dyn RemoteStore>, options: PagerOptions) -> Self {
    let page_size = options.page_size;
    let (state_tx, _state_rx) = watch::channel(PagerState {
      pages: PageState::new(page_size),
      loading: false,
      error: None,
      last_updated: None,
    });

    Self {
      inner: Arc::new(PagerInner {
        remote,
        options,
        state_tx,
        epoch: AtomicU64::new(0),
        started: AtomicBool::new(false),
        disposed: AtomicBool::new(false),
        realtime_task: Mutex::new(None),
      }),
    }
  }

  /// Fetch and append the next page. No-op while a page is loading or
  /// once the collection is exhausted. Errors in realtime mode.
  pub async fn load_next_page(&self) -> Result<(), DataError> {
    let inner = &self.inner;
    if inner.options.realtime {
      return Err(DataError::validation("pager is in realtime mode"));
    }
    if inner.disposed.load(Ordering::SeqCst) {
      return Err(DataError::Cancelled);
    }

    // The epoch is read inside the closure so it serializes with
    // reset(), which bumps it under the same channel lock
    let mut acquired = None;
    inner.state_tx.send_if_modified(|state| {
      if state.loading || !state.pages.has_more {
        return false;
      }
      state.loading = true;
      state.error = None;
      let request = match &state.pages.cursor {
        Some(cursor) => PageRequest::after(inner.options.page_size, cursor.clone()),
        None => PageRequest::first(inner.options.page_size),
      };
      acquired = Some((inner.epoch.load(Ordering::SeqCst), request));
      true
    });
    let Some((epoch, request)) = acquired else {
      return Ok(());
    };

    let fetched = inner
      .remote
      .get_page(&inner.options.path, &inner.options.query, &request)
      .await;

    match fetched {
      Ok(page) => {
        let Page {
          data,
          has_more,
          last_cursor,
        } = page;
        inner.state_tx.send_if_modified(|state| {
          if inner.epoch.load(Ordering::SeqCst) != epoch {
            return false;
          }
          state.pages.items.extend(data);
          if let Some(cursor) = last_cursor {
            state.pages.cursor = Some(cursor);
          }
          state.pages.has_more = has_more;
          state.loading = false;
          true
        });
        Ok(())
      }
      Err(error) => {
        inner.state_tx.send_if_modified(|state| {
          if inner.epoch.load(Ordering::SeqCst) != epoch {
            return false;
          }
          state.loading = false;
          state.error = Some(error.clone());
          true
        });
        Err(error)
      }
    }
  }

  /// Drop all accumulated items and the cursor, permitting
  /// re-pagination from the start. No-op once disposed.
  pub fn reset(&self) {
    let inner = &self.inner;
    let page_size = inner.options.page_size;
    inner.state_tx.send_if_modified(|state| {
      if inner.disposed.load(Ordering::SeqCst) {
        return false;
      }
      inner.epoch.fetch_add(1, Ordering::SeqCst);
      state.pages = PageState::new(page_size);
      state.loading = false;
      state.error = None;
      true
    });
  }

  /// Reset and load the first page again.
  pub async fn refetch(&self) -> Result<(), DataError> {
    if self.inner.options.realtime {
      return Err(DataError::validation("pager is in realtime mode"));
    }
    self.reset();
    self.load_next_page().await
  }

  /// Establish the collection subscription; every push replaces the
  /// full held result set. Errors in one-shot mode. Idempotent.
  pub async fn start_realtime(&self) -> Result<(), DataError> {
    let inner = &self.inner;
    if !inner.options.realtime {
      return Err(DataError::validation("pager is in one-shot mode"));
    }
    if inner.disposed.load(Ordering::SeqCst) {
      return Err(DataError::Cancelled);
    }
    if inner.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    let mut subscription = inner
      .remote
      .subscribe_collection(&inner.options.path, &inner.options.query)
      .await?;

    let task_inner = inner.clone();
    let handle = tokio::spawn(async move {
      while let Some(event) = subscription.next().await {
        match event {
          Ok(snapshot) => {
            task_inner.state_tx.send_if_modified(|state| {
              if task_inner.disposed.load(Ordering::SeqCst) {
                return false;
              }
              state.pages.items = snapshot.docs;
              state.pages.cursor = None;
              state.pages.has_more = false;
              state.loading = false;
              state.error = None;
              state.last_updated = Some(Utc::now());
              true
            });
          }
          Err(error) => {
            warn!(error = %error, "collection subscription error");
            task_inner.state_tx.send_if_modified(|state| {
              if task_inner.disposed.load(Ordering::SeqCst) {
                return false;
              }
              state.error = Some(error);
              true
            });
          }
        }
      }
      debug!("collection subscription closed");
    });

    if let Ok(mut slot) = inner.realtime_task.lock() {
      *slot = Some(handle);
    }
    Ok(())
  }

  pub fn state(&self) -> PagerState {
    self.inner.state_tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<PagerState> {
    self.inner.state_tx.subscribe()
  }

  /// Tear down the subscription task, if any. Terminal.
  pub fn dispose(&self) {
    self.inner.shutdown();
  }
}

impl PagerInner {
  fn shutdown(&self) {
    if self.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    if let Ok(mut slot) = self.realtime_task.lock() {
      if let Some(handle) = slot.take() {
        handle.abort();
      }
    }
  }
}

impl Drop for RemoteCollectionPager {
  fn drop(&mut self) {
    self.inner.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::time::Duration;

  use serde_json::json;
  use tokio::time::sleep;

  use super::*;
  use crate::store::memory::MemoryRemoteStore;
  use crate::store::types::{DocumentRef, WriteOperation};

  async fn seeded_store(count: usize) -> Arc<MemoryRemoteStore> {
    let store = Arc::new(MemoryRemoteStore::new());
    for i in 0..count {
      store
        .seed("items", &format!("doc-{:02}", i), json!({ "rank": i }))
        .await;
    }
    store
  }

  #[tokio::test]
  async fn test_accumulates_pages_with_distinct_cursors() {
    let store = seeded_store(14).await;
    let pager = RemoteCollectionPager::new(store, PagerOptions::new("items", 10));

    let mut cursors = HashSet::new();

    pager.load_next_page().await.unwrap();
    let state = pager.state();
    assert_eq!(state.pages.len(), 10);
    assert!(state.pages.has_more);
    assert!(cursors.insert(state.pages.cursor.clone().unwrap()));

    pager.load_next_page().await.unwrap();
    let state = pager.state();
    assert_eq!(state.pages.len(), 14);
    assert!(!state.pages.has_more);
    assert!(cursors.insert(state.pages.cursor.clone().unwrap()));

    // Exhausted: a further call is a no-op
    pager.load_next_page().await.unwrap();
    assert_eq!(pager.state().pages.len(), 14);
  }

  #[tokio::test]
  async fn test_refetch_starts_over() {
    let store = seeded_store(6).await;
    let pager = RemoteCollectionPager::new(store.clone(), PagerOptions::new("items", 4));

    pager.load_next_page().await.unwrap();
    pager.load_next_page().await.unwrap();
    assert_eq!(pager.state().pages.len(), 6);

    store.seed("items", "doc-99", json!({ "rank": 99 })).await;

    pager.refetch().await.unwrap();
    let state = pager.state();
    assert_eq!(state.pages.len(), 4);
    assert!(state.pages.has_more);
  }

  #[tokio::test]
  async fn test_fetch_error_is_published_and_returned() {
    let store = seeded_store(3).await;
    store
      .push_read_failure(DataError::transient("listing offline"))
      .await;
    let pager = RemoteCollectionPager::new(store, PagerOptions::new("items", 2));

    let result = pager.load_next_page().await;
    assert_eq!(result, Err(DataError::transient("listing offline")));

    let state = pager.state();
    assert!(!state.loading);
    assert!(state.error.is_some());
    assert!(state.pages.is_empty());

    // The next call retries the same page
    pager.load_next_page().await.unwrap();
    assert_eq!(pager.state().pages.len(), 2);
  }

  #[tokio::test]
  async fn test_realtime_replaces_the_result_set_on_push() {
    let store = seeded_store(2).await;
    let pager = RemoteCollectionPager::new(
      store.clone(),
      PagerOptions::new("items", 10).with_realtime(true),
    );

    pager.start_realtime().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let state = pager.state();
    assert_eq!(state.pages.len(), 2);
    let first_stamp = state.last_updated.expect("initial push stamps the state");

    store
      .execute_batch(vec![WriteOperation::set(
        DocumentRef::new("items", "doc-02"),
        json!({ "rank": 2 }),
      )])
      .await
      .unwrap();
    sleep(Duration::from_millis(50)).await;

    let state = pager.state();
    assert_eq!(state.pages.len(), 3);
    assert!(state.last_updated.unwrap() >= first_stamp);
  }

  #[tokio::test]
  async fn test_modes_are_mutually_exclusive() {
    let store = seeded_store(2).await;

    let one_shot = RemoteCollectionPager::new(store.clone(), PagerOptions::new("items", 10));
    assert_eq!(
      one_shot.start_realtime().await,
      Err(DataError::validation("pager is in one-shot mode"))
    );

    let realtime = RemoteCollectionPager::new(
      store,
      PagerOptions::new("items", 10).with_realtime(true),
    );
    assert_eq!(
      realtime.load_next_page().await,
      Err(DataError::validation("pager is in realtime mode"))
    );
    assert_eq!(
      realtime.refetch().await,
      Err(DataError::validation("pager is in realtime mode"))
    );
  }

  #[tokio::test]
  async fn test_dispose_tears_the_subscription_down() {
    let store = seeded_store(1).await;
    let pager = RemoteCollectionPager::new(
      store.clone(),
      PagerOptions::new("items", 10).with_realtime(true),
    );

    pager.start_realtime().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.subscriber_count().await, 1);

    pager.dispose();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.subscriber_count().await, 0);

    // Disposed pagers refuse further work
    assert_eq!(pager.start_realtime().await, Err(DataError::Cancelled));
  }

  #[tokio::test]
  async fn test_dispose_is_terminal() {
    let store = seeded_store(4).await;
    let pager = RemoteCollectionPager::new(store, PagerOptions::new("items", 4));

    pager.load_next_page().await.unwrap();
    assert_eq!(pager.state().pages.len(), 4);

    pager.dispose();
    let mut states = pager.subscribe();

    // A disposed pager ignores reset: no mutation, no notification
    pager.reset();
    assert!(!states.has_changed().unwrap());
    assert_eq!(pager.state().pages.len(), 4);

    assert_eq!(pager.load_next_page().await, Err(DataError::Cancelled));
    assert_eq!(pager.refetch().await, Err(DataError::Cancelled));
  }
}
