//! Periodic background re-fetch with change detection.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::DataError;
use crate::store::cache::CacheStore;
use crate::store::offline::OfflineStore;

/// Source of truth for one synced resource.
pub type SyncFetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, DataError>> + Send + Sync>;

/// Invoked as `(new, old)` when a sync observes a different value.
pub type ChangeCallback<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Cadence and identity of a background sync.
pub struct SyncOptions<T> {
  pub cache_key: String,
  pub sync_interval: Duration,
  on_change: Option<ChangeCallback<T>>,
}

impl<T> SyncOptions<T> {
  pub fn new(cache_key: impl Into<String>, sync_interval: Duration) -> Self {
    Self {
      cache_key: cache_key.into(),
      sync_interval,
      on_change: None,
    }
  }

  pub fn on_change(mut self, callback: impl Fn(&T, &T) + Send + Sync + 'static) -> Self {
    self.on_change = Some(Arc::new(callback));
    self
  }
}

struct Held<T> {
  value: Option<T>,
  last_sync: Option<Instant>,
}

struct SyncInner<T> {
  cache: Arc<dyn CacheStore>,
  offline: Arc<dyn OfflineStore>,
  fetch: SyncFetchFn<T>,
  options: SyncOptions<T>,
  held: Mutex<Held<T>>,
  started: AtomicBool,
  stopped: AtomicBool,
  tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Re-fetches a resource on a fixed interval, diffing each result
/// against the previously held value and announcing real changes.
/// Syncs are skipped silently while offline; coming back online after
/// a gap longer than the interval forces an immediate catch-up sync.
pub struct BackgroundSyncController<T> {
  inner: Arc<SyncInner<T>>,
}

impl<T> BackgroundSyncController<T>
where
  T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
  pub fn new<F, Fut>(
    cache: Arc<dyn CacheStore>,
    offline: Arc<dyn OfflineStore>,
    fetch: F,
    options: SyncOptions<T>,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, DataError>> + Send + 'static,
  {
    Self {
      inner: Arc::new(SyncInner {
        cache,
        offline,
        fetch: Arc::new(move || Box::pin(fetch())),
        options,
        held: Mutex::new(Held {
          value: None,
          last_sync: None,
        }),
        started: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
        tasks: StdMutex::new(Vec::new()),
      }),
    }
  }

  /// Sync immediately, then keep syncing on the configured interval.
  /// Idempotent; a stopped controller stays stopped.
  pub fn start(&self) {
    let inner = &self.inner;
    if inner.stopped.load(Ordering::SeqCst) {
      return;
    }
    if inner.started.swap(true, Ordering::SeqCst) {
      return;
    }

    let interval_inner = inner.clone();
    let interval_task = tokio::spawn(async move {
      interval_inner.run_sync(false).await;
      let mut timer = tokio::time::interval(interval_inner.options.sync_interval);
      // The first tick completes immediately; the sync above covered it
      timer.tick().await;
      loop {
        timer.tick().await;
        interval_inner.run_sync(false).await;
      }
    });

    let reconnect_inner = inner.clone();
    let reconnect_task = tokio::spawn(async move {
      let mut online_rx = reconnect_inner.offline.online_changes();
      let mut was_online = *online_rx.borrow();
      while online_rx.changed().await.is_ok() {
        let is_online = *online_rx.borrow_and_update();
        if is_online && !was_online {
          // Catch up only when the offline gap outlasted the cadence
          reconnect_inner.run_sync(true).await;
        }
        was_online = is_online;
      }
    });

    if let Ok(mut tasks) = inner.tasks.lock() {
      tasks.push(interval_task);
      tasks.push(reconnect_task);
    }
  }

  /// Force a sync outside the cadence.
  pub async fn sync_now(&self) {
    self.inner.run_sync(false).await;
  }

  /// Last successfully synced value, if any.
  pub async fn current(&self) -> Option<T> {
    self.inner.held.lock().await.value.clone()
  }

  /// End the cadence. Terminal.
  pub fn stop(&self) {
    self.inner.shutdown();
  }
}

impl<T> SyncInner<T>
where
  T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
  /// One sync cycle. Holding the `held` lock across the fetch
  /// serializes overlapping cycles (interval, reconnect, manual).
  async fn run_sync(&self, only_if_stale: bool) {
    if self.stopped.load(Ordering::SeqCst) {
      return;
    }
    let mut held = self.held.lock().await;

    if only_if_stale {
      if let Some(last) = held.last_sync {
        if last.elapsed() <= self.options.sync_interval {
          return;
        }
      }
    }

    if !self.offline.is_online() {
      debug!(key = %self.options.cache_key, "skipping sync while offline");
      return;
    }

    match (self.fetch)().await {
      Ok(new_value) => {
        let mut change: Option<(T, T)> = None;
        if self.options.on_change.is_some() {
          if let Some(previous) = &held.value {
            if *previous != new_value {
              change = Some((new_value.clone(), previous.clone()));
            }
          }
        }
        // Double-interval TTL keeps the entry alive across one missed cycle
        match serde_json::to_value(&new_value) {
          Ok(json) => {
            let ttl = self.options.sync_interval.saturating_mul(2);
            self.cache.set(&self.options.cache_key, json, ttl).await;
          }
          Err(error) => {
            warn!(key = %self.options.cache_key, error = %error, "synced value not cacheable");
          }
        }
        held.value = Some(new_value);
        held.last_sync = Some(Instant::now());
        drop(held);

        // The lock is released first so the callback may call back in
        if let Some((new, old)) = change {
          if let Some(on_change) = &self.options.on_change {
            on_change(&new, &old);
          }
        }
      }
      Err(error) => {
        warn!(key = %self.options.cache_key, error = %error, "background sync failed");
      }
    }
  }
}

impl<T> SyncInner<T> {
  fn shutdown(&self) {
    if self.stopped.swap(true, Ordering::SeqCst) {
      return;
    }
    if let Ok(mut tasks) = self.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }
}

impl<T> Drop for BackgroundSyncController<T> {
  fn drop(&mut self) {
    self.inner.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicU32;

  use tokio::time::sleep;

  use super::*;
  use crate::signal::Connectivity;
  use crate::store::cache::MemoryCacheStore;
  use crate::store::offline::MemoryOfflineStore;

  struct Harness {
    cache: Arc<MemoryCacheStore>,
    offline: Arc<MemoryOfflineStore>,
    connectivity: Connectivity,
  }

  fn harness() -> Harness {
    tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init()
      .ok();
    let connectivity = Connectivity::online();
    Harness {
      cache: Arc::new(MemoryCacheStore::new()),
      offline: Arc::new(MemoryOfflineStore::new(connectivity.clone())),
      connectivity,
    }
  }

  /// Fetcher returning 1, 2, 3, ... per call.
  fn counting_fetcher(
    calls: Arc<AtomicU32>,
  ) -> impl Fn() -> BoxFuture<'static, Result<u32, DataError>> + Send + Sync + 'static {
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      Box::pin(async move { Ok(n) })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_immediate_sync_then_interval_cadence() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let controller = BackgroundSyncController::new(
      h.cache.clone(),
      h.offline.clone(),
      counting_fetcher(calls.clone()),
      SyncOptions::new("sync-key", Duration::from_millis(1000)),
    );

    controller.start();
    sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(controller.current().await, Some(1));

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(controller.current().await, Some(3));

    // Synced value lands in the cache
    let entry = h.cache.get("sync-key").await.expect("cached");
    assert_eq!(entry.value, serde_json::json!(3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_on_change_fires_only_on_real_change() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let observed: Arc<StdMutex<Vec<(u32, u32)>>> = Arc::new(StdMutex::new(Vec::new()));
    let observed_in_callback = observed.clone();

    let calls_in_fetcher = calls.clone();
    let controller = BackgroundSyncController::new(
      h.cache.clone(),
      h.offline.clone(),
      // Sequence 7, 7, 9: only the last cycle is a change
      move || {
        let n = calls_in_fetcher.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(if n < 3 { 7u32 } else { 9 }) })
          as BoxFuture<'static, Result<u32, DataError>>
      },
      SyncOptions::new("sync-key", Duration::from_millis(1000)).on_change(move |new, old| {
        observed_in_callback.lock().unwrap().push((*new, *old));
      }),
    );

    controller.start();
    sleep(Duration::from_millis(5)).await;
    // First value: nothing to diff against
    assert!(observed.lock().unwrap().is_empty());

    sleep(Duration::from_millis(1000)).await;
    // Same value: still quiet
    assert!(observed.lock().unwrap().is_empty());

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(observed.lock().unwrap().as_slice(), &[(9, 7)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_syncs_are_skipped_while_offline() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let controller = BackgroundSyncController::new(
      h.cache.clone(),
      h.offline.clone(),
      counting_fetcher(calls.clone()),
      SyncOptions::new("sync-key", Duration::from_millis(1000)),
    );

    h.connectivity.set_online(false);
    controller.start();
    sleep(Duration::from_millis(2500)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.current().await, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_after_long_gap_forces_a_sync() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let controller = BackgroundSyncController::new(
      h.cache.clone(),
      h.offline.clone(),
      counting_fetcher(calls.clone()),
      SyncOptions::new("sync-key", Duration::from_millis(1000)),
    );

    controller.start();
    sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Offline across two whole cycles: ticks fire but sync is skipped
    h.connectivity.set_online(false);
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Reconnect: the gap outlasted the interval, so sync fires at once
    h.connectivity.set_online(true);
    sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_within_the_interval_stays_quiet() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let controller = BackgroundSyncController::new(
      h.cache.clone(),
      h.offline.clone(),
      counting_fetcher(calls.clone()),
      SyncOptions::new("sync-key", Duration::from_millis(1000)),
    );

    controller.start();
    sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A short blip: the held value is still inside its interval
    h.connectivity.set_online(false);
    sleep(Duration::from_millis(300)).await;
    h.connectivity.set_online(true);
    sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The regular cadence picks up at the next tick
    sleep(Duration::from_millis(700)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_ends_the_cadence() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let controller = BackgroundSyncController::new(
      h.cache.clone(),
      h.offline.clone(),
      counting_fetcher(calls.clone()),
      SyncOptions::new("sync-key", Duration::from_millis(1000)),
    );

    controller.start();
    sleep(Duration::from_millis(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    controller.stop();
    sleep(Duration::from_millis(3000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Stopped controllers also refuse manual syncs and restarts
    controller.sync_now().await;
    controller.start();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
