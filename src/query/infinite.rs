//! Page-accumulating queries driven by an indexed page-fetch function.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::DataError;
use crate::query::state::PageState;
use crate::store::cache::CacheStore;

/// One fetched page: its items plus the source's own exhaustion signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
  pub items: Vec<T>,
  pub has_more: bool,
}

/// Page fetcher, invoked with `(page_index, page_size)`.
pub type PageFetchFn<T> =
  Arc<dyn Fn(usize, usize) -> BoxFuture<'static, Result<PageResult<T>, DataError>> + Send + Sync>;

/// Tuning knobs for an [`InfiniteQueryController`].
pub struct InfiniteQueryOptions {
  pub cache_key: String,
  pub page_size: usize,
  /// Time-to-live for each cached page.
  pub page_ttl: Duration,
}

impl InfiniteQueryOptions {
  pub fn new(cache_key: impl Into<String>, page_size: usize) -> Self {
    Self {
      cache_key: cache_key.into(),
      page_size,
      page_ttl: Duration::from_secs(300),
    }
  }

  pub fn with_page_ttl(mut self, ttl: Duration) -> Self {
    self.page_ttl = ttl;
    self
  }
}

/// Observable state: the accumulated pages plus loading/error.
#[derive(Debug, Clone)]
pub struct InfiniteState<T> {
  pub pages: PageState<T>,
  pub loading: bool,
  pub error: Option<DataError>,
}

/// Accumulates pages of a list resource, caching each page under
/// `"{cache_key}:page:{index}"`.
///
/// Cached pages are not invalidated when the underlying collection
/// changes; until their TTL runs out they are served as-is. `reset()`
/// starting a fresh pagination is the only explicit invalidation.
pub struct InfiniteQueryController<T> {
  cache: Arc<dyn CacheStore>,
  fetch_page: PageFetchFn<T>,
  options: InfiniteQueryOptions,
  state_tx: watch::Sender<InfiniteState<T>>,
  next_page: AtomicUsize,
  // Bumped by reset() so an in-flight page cannot land in the fresh state
  epoch: AtomicU64,
}

impl<T> InfiniteQueryController<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  pub fn new<F, Fut>(cache: Arc<dyn CacheStore>, fetch_page: F, options: InfiniteQueryOptions) -> Self
  where
    F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PageResult<T>, DataError>> + Send + 'static,
  {
    let page_size = options.page_size;
    let (state_tx, _state_rx) = watch::channel(InfiniteState {
      pages: PageState::new(page_size),
      loading: false,
      error: None,
    });

    Self {
      cache,
      fetch_page: Arc::new(move |page, size| Box::pin(fetch_page(page, size))),
      options,
      state_tx,
      next_page: AtomicUsize::new(0),
      epoch: AtomicU64::new(0),
    }
  }

  /// Fetch and append the next page. No-op while a page is loading or
  /// once the source is exhausted.
  pub async fn fetch_next_page(&self) {
    // Epoch is captured inside the closure so it serializes with
    // reset(), which bumps it under the same channel lock
    let mut acquired = None;
    self.state_tx.send_if_modified(|state| {
      if state.loading || !state.pages.has_more {
        return false;
      }
      state.loading = true;
      state.error = None;
      acquired = Some(self.epoch.load(Ordering::SeqCst));
      true
    });
    let Some(epoch) = acquired else {
      return;
    };

    let page_index = self.next_page.load(Ordering::SeqCst);
    let page_size = self.options.page_size;
    let page_key = format!("{}:page:{}", self.options.cache_key, page_index);

    // Cached page short-circuits the fetch
    if let Some(entry) = self.cache.get(&page_key).await {
      if let Ok(page) = serde_json::from_value::<PageResult<T>>(entry.value) {
        debug!(key = %page_key, "serving cached page");
        self.append_page(epoch, page_index, page);
        return;
      }
    }

    match (self.fetch_page)(page_index, page_size).await {
      Ok(page) => {
        match serde_json::to_value(&page) {
          Ok(json) => self.cache.set(&page_key, json, self.options.page_ttl).await,
          Err(error) => debug!(key = %page_key, error = %error, "page not cacheable"),
        }
        self.append_page(epoch, page_index, page);
      }
      Err(error) => {
        // The page counter stays put, so the next call retries this page
        self.state_tx.send_if_modified(|state| {
          if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
          }
          state.loading = false;
          state.error = Some(error.clone());
          true
        });
      }
    }
  }

  /// Clear accumulated items and the page counter, permitting
  /// re-pagination from the start.
  pub fn reset(&self) {
    let page_size = self.options.page_size;
    self.state_tx.send_if_modified(|state| {
      self.epoch.fetch_add(1, Ordering::SeqCst);
      self.next_page.store(0, Ordering::SeqCst);
      state.pages = PageState::new(page_size);
      state.loading = false;
      state.error = None;
      true
    });
  }

  pub fn state(&self) -> InfiniteState<T> {
    self.state_tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<InfiniteState<T>> {
    self.state_tx.subscribe()
  }

  fn append_page(&self, epoch: u64, page_index: usize, page: PageResult<T>) {
    let page_size = self.options.page_size;
    let applied = self.state_tx.send_if_modified(|state| {
      if self.epoch.load(Ordering::SeqCst) != epoch {
        return false;
      }
      let short_page = page.items.len() < page_size;
      state.pages.items.extend(page.items);
      // Either signal ends the pagination: the source saying so, or a
      // short page
      state.pages.has_more = page.has_more && !short_page;
      state.loading = false;
      true
    });
    if applied {
      self.next_page.store(page_index + 1, Ordering::SeqCst);
    }
  }
}
