//! Remote document store contract.
//!
//! The remote store is an external collaborator: a network-backed document
//! database reached through this trait. Implementations own transport
//! concerns (wire format, connection pooling, server-side retry of
//! transaction functions); the controllers in this crate own caching and
//! retry policy on top.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::DataError;
use crate::store::types::{
  CollectionQuery, CollectionSnapshot, Document, DocumentRef, DocumentSnapshot, Page, PageRequest,
  ReadOptions, WriteOperation,
};

/// The caller's transaction body. Reads and writes go through the handle;
/// the store may invoke the body several times on write conflict, so it
/// must not carry side effects of its own.
pub type TransactionFn =
  Box<dyn for<'a> FnMut(&'a mut TransactionHandle) -> BoxFuture<'a, Result<Value, DataError>> + Send>;

/// Contract for the remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Read a single document. `None` means it does not exist.
  async fn get_document(
    &self,
    collection: &str,
    id: &str,
    opts: &ReadOptions,
  ) -> Result<Option<Value>, DataError>;

  /// Read a constrained collection in full.
  async fn get_collection(
    &self,
    path: &str,
    query: &CollectionQuery,
    opts: &ReadOptions,
  ) -> Result<Vec<Document>, DataError>;

  /// Read one page of a constrained collection.
  async fn get_page(
    &self,
    path: &str,
    query: &CollectionQuery,
    page: &PageRequest,
  ) -> Result<Page, DataError>;

  /// Open a change feed for a single document.
  async fn subscribe_document(
    &self,
    collection: &str,
    id: &str,
  ) -> Result<Subscription<DocumentSnapshot>, DataError>;

  /// Open a change feed for a constrained collection. Every event carries
  /// the full result set as of that point.
  async fn subscribe_collection(
    &self,
    path: &str,
    query: &CollectionQuery,
  ) -> Result<Subscription<CollectionSnapshot>, DataError>;

  /// Apply an ordered list of writes atomically. Either every operation
  /// commits or none does.
  async fn execute_batch(&self, ops: Vec<WriteOperation>) -> Result<(), DataError>;

  /// Run a read-modify-write transaction. The store re-runs `f` on write
  /// conflict; callers add no retry of their own.
  async fn run_transaction(&self, f: TransactionFn) -> Result<Value, DataError>;
}

// ============================================================================
// Subscriptions
// ============================================================================

/// RAII guard that releases a subscription registration on drop.
pub struct SubscriptionGuard {
  on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
  pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
    Self {
      on_drop: Some(Box::new(on_drop)),
    }
  }
}

impl Drop for SubscriptionGuard {
  fn drop(&mut self) {
    if let Some(release) = self.on_drop.take() {
      release();
    }
  }
}

/// Handle to an active change feed.
///
/// Dropping the handle (or calling [`Subscription::dispose`]) releases the
/// registration with the store; no events arrive afterwards. This is the
/// only way a feed is released, so it happens on every exit path including
/// panics and early returns.
pub struct Subscription<E> {
  receiver: mpsc::UnboundedReceiver<Result<E, DataError>>,
  _guard: SubscriptionGuard,
}

impl<E> Subscription<E> {
  pub fn new(receiver: mpsc::UnboundedReceiver<Result<E, DataError>>, guard: SubscriptionGuard) -> Self {
    Self {
      receiver,
      _guard: guard,
    }
  }

  /// Wait for the next event. `None` once the feed has closed.
  pub async fn next(&mut self) -> Option<Result<E, DataError>> {
    self.receiver.recv().await
  }

  /// Take an already-delivered event without waiting.
  pub fn try_next(&mut self) -> Option<Result<E, DataError>> {
    self.receiver.try_recv().ok()
  }

  /// Explicitly release the registration.
  pub fn dispose(self) {}
}

// ============================================================================
// Transactions
// ============================================================================

/// Store-side hooks a transaction handle reads through.
///
/// `read` returns the document value together with its current version so
/// the store can detect conflicting writes at commit time. Missing
/// documents report version 0.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
  async fn read(&self, target: &DocumentRef) -> Result<(Option<Value>, u64), DataError>;
}

/// Read-and-buffer handle passed to a transaction body.
///
/// Reads record the version they observed; writes are buffered and applied
/// by the store only when every observed version is still current.
pub struct TransactionHandle {
  backend: Arc<dyn TransactionBackend>,
  reads: Vec<(DocumentRef, u64)>,
  writes: Vec<WriteOperation>,
}

impl TransactionHandle {
  pub fn new(backend: Arc<dyn TransactionBackend>) -> Self {
    Self {
      backend,
      reads: Vec::new(),
      writes: Vec::new(),
    }
  }

  /// Read a document inside the transaction, recording its version.
  pub async fn get(&mut self, target: &DocumentRef) -> Result<Option<Value>, DataError> {
    let (value, version) = self.backend.read(target).await?;
    self.reads.push((target.clone(), version));
    Ok(value)
  }

  /// Buffer a full-document write.
  pub fn set(&mut self, target: DocumentRef, data: Value) {
    self.writes.push(WriteOperation::set(target, data));
  }

  /// Buffer a field merge into an existing document.
  pub fn update(&mut self, target: DocumentRef, data: Value) {
    self.writes.push(WriteOperation::update(target, data));
  }

  /// Buffer a deletion.
  pub fn delete(&mut self, target: DocumentRef) {
    self.writes.push(WriteOperation::delete(target));
  }

  /// Consume the handle into its recorded reads and buffered writes.
  pub fn into_parts(self) -> (Vec<(DocumentRef, u64)>, Vec<WriteOperation>) {
    (self.reads, self.writes)
  }
}
