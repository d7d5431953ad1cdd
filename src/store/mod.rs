//! Store contracts the controllers are built against.
//!
//! Three collaborators, all behind object-safe async traits:
//! - Cache store: fast fresh-value cache with per-entry TTLs
//! - Offline store: durable last-known-good payloads plus the connectivity
//!   signal
//! - Remote store: the networked document database (reads, pagination,
//!   subscriptions, batches, transactions)
//!
//! `MemoryRemoteStore` implements the whole remote contract in-process and
//! doubles as the test harness for everything above it.

pub mod cache;
pub mod memory;
pub mod offline;
pub mod remote;
pub mod sqlite;
pub mod types;

pub use cache::{CacheEntry, CacheStore, MemoryCacheStore, NoopCacheStore};
pub use memory::MemoryRemoteStore;
pub use offline::{MemoryOfflineStore, OfflineStore};
pub use remote::{
  RemoteStore, Subscription, SubscriptionGuard, TransactionBackend, TransactionFn,
  TransactionHandle,
};
pub use sqlite::SqliteOfflineStore;
pub use types::{
  CollectionQuery, CollectionSnapshot, Cursor, Document, DocumentRef, DocumentSnapshot, FilterOp,
  Page, PageRequest, QueryConstraint, ReadOptions, SortDirection, SortSpec, WriteOperation,
};
