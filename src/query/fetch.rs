//! Single-resource fetching with cache-first lookup, bounded retry,
//! offline fallback and request supersession.
//!
//! Inspired by TanStack Query: a `FetchController<T>` owns the fetch
//! lifecycle for one logical resource and publishes `FetchState<T>`
//! snapshots through a watch channel.
//!
//! # Example
//!
//! ```ignore
//! let controller = FetchController::new(
//!   cache.clone(),
//!   offline.clone(),
//!   move || {
//!     let remote = remote.clone();
//!     async move { remote.get_document("users", "alice", &ReadOptions::default()).await }
//!   },
//!   FetchOptions::new("users:alice").with_stale_time(Duration::from_secs(30)),
//! );
//!
//! controller.start().await;
//! let state = controller.state();
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::DataError;
use crate::query::state::{DataSource, FetchState};
use crate::signal::FocusSignal;
use crate::store::cache::CacheStore;
use crate::store::offline::OfflineStore;

/// A factory producing one fetch attempt's future.
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, DataError>> + Send + Sync>;

/// Success callback, invoked with the value and where it came from.
pub type SuccessCallback<T> = Arc<dyn Fn(&T, DataSource) + Send + Sync>;

/// Error callback, invoked once local retry/fallback is exhausted.
pub type ErrorCallback = Arc<dyn Fn(&DataError) + Send + Sync>;

/// Tuning knobs for a [`FetchController`].
pub struct FetchOptions<T> {
  /// Suppress all activity when false.
  pub enabled: bool,
  /// Logical identity of the resource; cache and offline entries share it.
  pub cache_key: String,
  /// Time-to-live for the cache write-through.
  pub cache_ttl: Duration,
  /// Age under which cached data is served without a network call.
  /// Zero means cached data is always considered stale.
  pub stale_time: Duration,
  /// Retries after the initial attempt.
  pub retry_count: u32,
  /// Base backoff delay; the n-th retry waits `retry_delay * 2^(n-1)`.
  pub retry_delay: Duration,
  /// Per-attempt bound on the network call.
  pub timeout: Option<Duration>,
  /// Re-fetch cadence, bypassing the freshness check.
  pub refetch_interval: Option<Duration>,
  /// Re-fetch when the host regains foreground attention.
  pub refetch_on_focus: Option<FocusSignal>,
  /// Serve the last known good payload instead of failing while offline.
  pub offline_fallback: bool,
  pub on_success: Option<SuccessCallback<T>>,
  pub on_error: Option<ErrorCallback>,
}

impl<T> FetchOptions<T> {
  pub fn new(cache_key: impl Into<String>) -> Self {
    Self {
      enabled: true,
      cache_key: cache_key.into(),
      cache_ttl: Duration::from_secs(300),
      stale_time: Duration::ZERO,
      retry_count: 3,
      retry_delay: Duration::from_secs(1),
      timeout: None,
      refetch_interval: None,
      refetch_on_focus: None,
      offline_fallback: true,
      on_success: None,
      on_error: None,
    }
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = ttl;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_retry_count(mut self, count: u32) -> Self {
    self.retry_count = count;
    self
  }

  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }

  pub fn with_refetch_on_focus(mut self, signal: FocusSignal) -> Self {
    self.refetch_on_focus = Some(signal);
    self
  }

  pub fn with_offline_fallback(mut self, enabled: bool) -> Self {
    self.offline_fallback = enabled;
    self
  }

  pub fn on_success(mut self, callback: impl Fn(&T, DataSource) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(callback));
    self
  }

  pub fn on_error(mut self, callback: impl Fn(&DataError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(callback));
    self
  }
}

/// Controller for fetching one logical resource.
///
/// Owns the full lifecycle: cache-first lookup, a generation-tagged fetch
/// task with retry and backoff, offline fallback, focus/interval refetch
/// triggers. Dropping the controller disposes it.
pub struct FetchController<T> {
  inner: Arc<FetchInner<T>>,
}

struct FetchInner<T> {
  cache: Arc<dyn CacheStore>,
  offline: Arc<dyn OfflineStore>,
  fetch_fn: FetchFn<T>,
  options: FetchOptions<T>,
  // Tags fetch lineages; completions from a non-current lineage are
  // discarded before they touch state or fire callbacks.
  generation: AtomicU64,
  state_tx: watch::Sender<FetchState<T>>,
  attempt: Mutex<Option<JoinHandle<()>>>,
  triggers: Mutex<Vec<JoinHandle<()>>>,
  started: AtomicBool,
  disposed: AtomicBool,
}

impl<T> FetchController<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Create a controller. Nothing happens until [`start`](Self::start).
  pub fn new<F, Fut>(
    cache: Arc<dyn CacheStore>,
    offline: Arc<dyn OfflineStore>,
    fetcher: F,
    options: FetchOptions<T>,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, DataError>> + Send + 'static,
  {
    let (state_tx, _state_rx) = watch::channel(FetchState::default());

    Self {
      inner: Arc::new(FetchInner {
        cache,
        offline,
        fetch_fn: Arc::new(move || Box::pin(fetcher())),
        options,
        generation: AtomicU64::new(0),
        state_tx,
        attempt: Mutex::new(None),
        triggers: Mutex::new(Vec::new()),
        started: AtomicBool::new(false),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Begin fetching: arms the focus/interval triggers and performs the
  /// initial cache-first load. Subsequent calls behave like a plain
  /// `refetch(false)`.
  pub async fn start(&self) {
    if self.inner.disposed() || !self.inner.options.enabled {
      return;
    }

    if !self.inner.started.swap(true, Ordering::SeqCst) {
      self.inner.clone().arm_triggers();
    }

    self.inner.clone().request_fetch(false).await;
  }

  /// Trigger a fetch. `force` skips the cache freshness check.
  pub async fn refetch(&self, force: bool) {
    self.inner.clone().request_fetch(force).await;
  }

  /// Current state snapshot.
  pub fn state(&self) -> FetchState<T> {
    self.inner.state_tx.borrow().clone()
  }

  /// Watch state changes.
  pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
    self.inner.state_tx.subscribe()
  }

  /// Stop everything: the in-flight attempt, any pending retry sleep and
  /// the refetch triggers. Terminal; the controller stays inert afterwards.
  pub fn dispose(&self) {
    self.inner.shutdown();
  }
}

impl<T> Drop for FetchController<T> {
  fn drop(&mut self) {
    self.inner.shutdown();
  }
}

impl<T> FetchInner<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Spawn the focus and interval listeners. Both trigger forced fetches,
  /// bypassing the freshness check.
  fn arm_triggers(self: Arc<Self>) {
    let mut handles = Vec::new();

    if let Some(signal) = &self.options.refetch_on_focus {
      let mut focus_rx = signal.subscribe();
      let inner = self.clone();
      handles.push(tokio::spawn(async move {
        while focus_rx.recv().await.is_ok() {
          if inner.disposed() {
            break;
          }
          // Focus refetches only once data exists
          if inner.state_tx.borrow().has_data() {
            inner.clone().request_fetch(true).await;
          }
        }
      }));
    }

    if let Some(period) = self.options.refetch_interval {
      let inner = self.clone();
      handles.push(tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.tick().await; // consume the immediate first tick
        loop {
          timer.tick().await;
          if inner.disposed() {
            break;
          }
          inner.clone().request_fetch(true).await;
        }
      }));
    }

    if let Ok(mut triggers) = self.triggers.lock() {
      triggers.extend(handles);
    }
  }

  /// The fetch algorithm entry point: cache check, then a new generation
  /// lineage superseding whatever was in flight.
  async fn request_fetch(self: Arc<Self>, force: bool) {
    if self.disposed() || !self.options.enabled {
      return;
    }

    let key = self.options.cache_key.clone();
    let mut stale_value: Option<T> = None;

    if !force {
      if let Some(entry) = self.cache.get(&key).await {
        let is_stale = entry.is_stale(self.options.stale_time);
        let age = entry.age();
        let stored_at = entry.stored_at;
        match decode::<T>(&key, entry.value) {
          Some(value) if !is_stale => {
            debug!(key = %key, age_ms = age.as_millis() as u64, "cache hit, fresh");
            self.publish_now(|state| {
              state.data = Some(value);
              state.loading = false;
              state.error = None;
              state.last_fetched_at = Some(stored_at);
              state.source = Some(DataSource::CacheFresh);
            });
            return;
          }
          Some(value) => {
            debug!(key = %key, "cache hit, stale; revalidating");
            stale_value = Some(value);
          }
          None => {}
        }
      }
    }

    // New lineage: supersede whatever attempt is still running
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

    self.publish(generation, |state| {
      state.loading = true;
      state.error = None;
      if state.data.is_none() {
        if let Some(value) = stale_value.take() {
          state.data = Some(value);
          state.source = Some(DataSource::CacheStale);
        }
      }
    });

    // Abort-and-replace happens under the lock so racing callers cannot
    // kill a newer lineage's task
    if let Ok(mut attempt) = self.attempt.lock() {
      if self.generation.load(Ordering::SeqCst) != generation {
        return;
      }
      if let Some(previous) = attempt.take() {
        previous.abort();
      }
      let inner = self.clone();
      *attempt = Some(tokio::spawn(async move {
        inner.run_attempts(generation).await;
      }));
    }
  }

  /// One generation lineage: attempt, back off, retry. Living inside a
  /// single aborted-on-supersession task means a superseded lineage can
  /// never fire a stale retry.
  async fn run_attempts(self: Arc<Self>, generation: u64) {
    let key = self.options.cache_key.clone();
    let mut attempt: u32 = 1;

    loop {
      let result = self.bounded_fetch().await;

      if self.is_superseded(generation) {
        trace!(key = %key, generation, "discarding superseded completion");
        return;
      }

      let error = match result {
        Ok(value) => {
          self.complete_success(generation, value).await;
          return;
        }
        Err(error) => error,
      };

      if error.is_cancelled() {
        return;
      }

      // Offline fallback pre-empts the retry budget: retrying a dead link
      // is pointless and the last known good payload is ready to serve.
      if !self.offline.is_online() && self.options.offline_fallback {
        self.complete_offline(generation, &key).await;
        return;
      }

      if error.is_retryable() && attempt <= self.options.retry_count {
        let delay = self
          .options
          .retry_delay
          .saturating_mul(2u32.saturating_pow(attempt - 1));
        warn!(
          key = %key,
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %error,
          "fetch failed, backing off"
        );
        tokio::time::sleep(delay).await;
        if self.is_superseded(generation) {
          return;
        }
        attempt += 1;
        continue;
      }

      self.complete_error(generation, error);
      return;
    }
  }

  /// Apply the per-attempt timeout. Expiry behaves like a transient
  /// network failure.
  async fn bounded_fetch(&self) -> Result<T, DataError> {
    let future = (self.fetch_fn)();
    match self.options.timeout {
      Some(bound) => match tokio::time::timeout(bound, future).await {
        Ok(result) => result,
        Err(_) => Err(DataError::Timeout { elapsed: bound }),
      },
      None => future.await,
    }
  }

  /// Publish success, write through to both stores, fire `on_success`.
  async fn complete_success(&self, generation: u64, value: T) {
    let published = self.publish(generation, |state| {
      state.data = Some(value.clone());
      state.loading = false;
      state.error = None;
      state.last_fetched_at = Some(tokio::time::Instant::now());
      state.source = Some(DataSource::Network);
    });
    if !published {
      return;
    }

    let key = &self.options.cache_key;
    match serde_json::to_value(&value) {
      Ok(json) => {
        self
          .cache
          .set(key, json.clone(), self.options.cache_ttl)
          .await;
        if let Err(error) = self.offline.store(key, &json).await {
          warn!(key = %key, error = %error, "offline write-through failed");
        }
      }
      Err(error) => {
        warn!(key = %key, error = %error, "skipping write-through, value not serializable");
      }
    }

    if !self.is_superseded(generation) {
      if let Some(on_success) = &self.options.on_success {
        on_success(&value, DataSource::Network);
      }
    }
  }

  /// Serve the last known good payload as a success, or surface
  /// `OfflineUnavailable`. Never writes the cache store.
  async fn complete_offline(&self, generation: u64, key: &str) {
    match self.offline.retrieve(key).await {
      Ok(Some(json)) => match decode::<T>(key, json) {
        Some(value) => {
          debug!(key = %key, "offline, serving last known good payload");
          let published = self.publish(generation, |state| {
            state.data = Some(value.clone());
            state.loading = false;
            state.error = None;
            state.last_fetched_at = Some(tokio::time::Instant::now());
            state.source = Some(DataSource::Offline);
          });
          if published {
            if let Some(on_success) = &self.options.on_success {
              on_success(&value, DataSource::Offline);
            }
          }
        }
        None => self.complete_error(
          generation,
          DataError::storage(format!("offline payload for {} is not decodable", key)),
        ),
      },
      Ok(None) => self.complete_error(
        generation,
        DataError::OfflineUnavailable {
          key: key.to_string(),
        },
      ),
      Err(error) => self.complete_error(generation, error),
    }
  }

  /// Settle into the error state and fire `on_error`. Existing data is
  /// kept so consumers can keep rendering the previous value.
  fn complete_error(&self, generation: u64, error: DataError) {
    let published = self.publish(generation, |state| {
      state.loading = false;
      state.error = Some(error.clone());
    });
    if published {
      if let Some(on_error) = &self.options.on_error {
        on_error(&error);
      }
    }
  }

  /// Generation-gated state mutation. Returns false when the lineage was
  /// superseded or the controller disposed.
  fn publish(&self, generation: u64, mutate: impl FnOnce(&mut FetchState<T>)) -> bool {
    if self.disposed() {
      return false;
    }
    self.state_tx.send_if_modified(|state| {
      if self.generation.load(Ordering::SeqCst) != generation {
        return false;
      }
      mutate(state);
      true
    })
  }

  /// Ungated state mutation for the cache-hit path, which starts no
  /// lineage.
  fn publish_now(&self, mutate: impl FnOnce(&mut FetchState<T>)) {
    if self.disposed() {
      return;
    }
    self.state_tx.send_if_modified(|state| {
      mutate(state);
      true
    });
  }

  fn is_superseded(&self, generation: u64) -> bool {
    self.disposed() || self.generation.load(Ordering::SeqCst) != generation
  }

  fn disposed(&self) -> bool {
    self.disposed.load(Ordering::SeqCst)
  }
}

// Unbounded so Drop can reach it for any T
impl<T> FetchInner<T> {
  fn abort_attempt(&self) {
    if let Ok(mut attempt) = self.attempt.lock() {
      if let Some(handle) = attempt.take() {
        handle.abort();
      }
    }
  }

  fn shutdown(&self) {
    if self.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    // Invalidate whatever lineage might still be mid-completion
    self.generation.fetch_add(1, Ordering::SeqCst);
    self.abort_attempt();
    if let Ok(mut triggers) = self.triggers.lock() {
      for handle in triggers.drain(..) {
        handle.abort();
      }
    }
  }
}

/// Decode a stored payload, treating undecodable entries as absent.
fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
  match serde_json::from_value(value) {
    Ok(value) => Some(value),
    Err(error) => {
      debug!(key = %key, error = %error, "stored payload not decodable, ignoring");
      None
    }
  }
}
