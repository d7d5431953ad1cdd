//! Resilient data access over a remote document store.
//!
//! Inspired by TanStack Query, this crate layers cache-first fetching,
//! stale-while-revalidate, retries with backoff, offline fallback, page
//! accumulation, background sync and optimistic mutation on top of three
//! small store contracts (cache, offline, remote). Controllers publish
//! their state through `tokio::sync::watch`; consumers subscribe instead
//! of polling.
//!
//! # Example
//!
//! ```ignore
//! let connectivity = Connectivity::online();
//! let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
//! let offline: Arc<dyn OfflineStore> =
//!     Arc::new(MemoryOfflineStore::new(connectivity.clone()));
//!
//! let remote = remote_client.clone();
//! let controller = FetchController::new(
//!     cache,
//!     offline,
//!     move || {
//!         let remote = remote.clone();
//!         async move {
//!             remote
//!                 .get_document("profiles", "me", &ReadOptions::default())
//!                 .await?
//!                 .ok_or_else(|| DataError::validation("profile missing"))
//!         }
//!     },
//!     FetchOptions::new("profiles:me")
//!         .with_stale_time(Duration::from_secs(30))
//!         .with_retry_count(3),
//! );
//!
//! controller.start();
//! let mut states = controller.subscribe();
//! while states.changed().await.is_ok() {
//!     let state = states.borrow().clone();
//!     // Render: state.data / state.loading / state.error
//! }
//! ```

pub mod config;
pub mod error;
pub mod key;
pub mod mutate;
pub mod query;
pub mod signal;
pub mod store;

pub use config::Config;
pub use error::DataError;
pub use key::{QueryKey, StoreQueryKey};
pub use mutate::{BatchExecutor, ExecState, OptimisticState, OptimisticUpdateController, TransactionExecutor};
pub use query::{
  BackgroundSyncController, DataSource, FetchController, FetchOptions, FetchState,
  InfiniteQueryController, InfiniteQueryOptions, InfiniteState, PageResult, PageState,
  PagerOptions, PagerState, PrefetchCache, RemoteCollectionPager, SyncOptions,
};
pub use signal::{Connectivity, FocusSignal};
pub use store::{
  CacheEntry, CacheStore, CollectionQuery, CollectionSnapshot, Cursor, Document, DocumentRef,
  DocumentSnapshot, FilterOp, MemoryCacheStore, MemoryOfflineStore, MemoryRemoteStore,
  NoopCacheStore, OfflineStore, Page, PageRequest, QueryConstraint, ReadOptions, RemoteStore,
  SortDirection, SortSpec, SqliteOfflineStore, Subscription, SubscriptionGuard,
  TransactionBackend, TransactionFn, TransactionHandle, WriteOperation,
};
