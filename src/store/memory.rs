//! In-process implementation of the remote store contract.
//!
//! Honors the full [`RemoteStore`] semantics: constraint evaluation, cursor
//! pagination, push subscriptions, atomic batches and version-checked
//! transactions with transparent re-run on conflict. Used as the test double
//! throughout the crate and as a reference for transport implementations.
//!
//! Extra knobs for tests: read/write counters, a scripted-failure queue and
//! an injectable read delay.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::DataError;
use crate::store::remote::{
  RemoteStore, Subscription, SubscriptionGuard, TransactionBackend, TransactionFn,
  TransactionHandle,
};
use crate::store::types::{
  CollectionQuery, CollectionSnapshot, Cursor, Document, DocumentRef, DocumentSnapshot, FilterOp,
  Page, PageRequest, QueryConstraint, ReadOptions, SortDirection, SortSpec, WriteOperation,
};

/// How many times a conflicting transaction body is re-run before giving up.
const MAX_TRANSACTION_ATTEMPTS: usize = 5;

struct VersionedDoc {
  value: Value,
  version: u64,
}

struct DocSub {
  collection: String,
  id: String,
  tx: mpsc::UnboundedSender<Result<DocumentSnapshot, DataError>>,
}

struct CollSub {
  path: String,
  query: CollectionQuery,
  tx: mpsc::UnboundedSender<Result<CollectionSnapshot, DataError>>,
}

type Collections = BTreeMap<String, BTreeMap<String, VersionedDoc>>;

#[derive(Default)]
struct StoreState {
  collections: Collections,
  // Store-wide version counter so a recreated document never reuses a
  // version a transaction already observed.
  version_counter: u64,
  doc_subs: Vec<DocSub>,
  coll_subs: Vec<CollSub>,
  scripted_failures: VecDeque<DataError>,
  read_delay: Option<Duration>,
}

#[derive(Default)]
struct StoreInner {
  state: Mutex<StoreState>,
  reads: AtomicUsize,
  writes: AtomicUsize,
}

/// In-memory document store. Cloning yields another handle to the same
/// store.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
  inner: Arc<StoreInner>,
}

impl MemoryRemoteStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a document directly, without notifying subscribers.
  /// Test setup helper.
  pub async fn seed(&self, collection: &str, id: &str, value: Value) {
    let mut state = self.inner.state.lock().await;
    state.version_counter += 1;
    let version = state.version_counter;
    state
      .collections
      .entry(collection.to_string())
      .or_default()
      .insert(id.to_string(), VersionedDoc { value, version });
  }

  /// Number of read calls made so far (including scripted failures).
  pub fn read_count(&self) -> usize {
    self.inner.reads.load(Ordering::SeqCst)
  }

  /// Number of write operations committed so far.
  pub fn write_count(&self) -> usize {
    self.inner.writes.load(Ordering::SeqCst)
  }

  /// Queue an error to be returned by the next read call.
  pub async fn push_read_failure(&self, error: DataError) {
    let mut state = self.inner.state.lock().await;
    state.scripted_failures.push_back(error);
  }

  /// Make every read take this long. `ReadOptions::timeout` shorter than
  /// the delay produces a `Timeout` error, as a slow transport would.
  pub async fn set_read_delay(&self, delay: Duration) {
    let mut state = self.inner.state.lock().await;
    state.read_delay = Some(delay);
  }

  /// Live subscription count, after pruning dropped receivers.
  pub async fn subscriber_count(&self) -> usize {
    let mut state = self.inner.state.lock().await;
    state.doc_subs.retain(|s| !s.tx.is_closed());
    state.coll_subs.retain(|s| !s.tx.is_closed());
    state.doc_subs.len() + state.coll_subs.len()
  }

  /// Consume a scripted failure, count the read and simulate latency.
  async fn begin_read(&self, opts: Option<&ReadOptions>) -> Result<(), DataError> {
    self.inner.reads.fetch_add(1, Ordering::SeqCst);

    let (failure, delay) = {
      let mut state = self.inner.state.lock().await;
      (state.scripted_failures.pop_front(), state.read_delay)
    };

    if let Some(error) = failure {
      return Err(error);
    }

    if let Some(delay) = delay {
      match opts.and_then(|o| o.timeout) {
        Some(timeout) if timeout < delay => {
          tokio::time::sleep(timeout).await;
          return Err(DataError::Timeout { elapsed: timeout });
        }
        _ => tokio::time::sleep(delay).await,
      }
    }

    Ok(())
  }

  /// Version-check recorded reads, then apply writes. `Ok(false)` means a
  /// conflict; the transaction body must be re-run.
  async fn try_commit(
    &self,
    reads: &[(DocumentRef, u64)],
    writes: Vec<WriteOperation>,
  ) -> Result<bool, DataError> {
    let mut state = self.inner.state.lock().await;

    for (target, seen) in reads {
      let current = state
        .collections
        .get(&target.collection)
        .and_then(|c| c.get(&target.id))
        .map(|d| d.version)
        .unwrap_or(0);
      if current != *seen {
        debug!(
          collection = %target.collection,
          id = %target.id,
          "transaction conflict, re-running body"
        );
        return Ok(false);
      }
    }

    validate_writes(&state.collections, &writes)?;
    let count = writes.len();
    let affected = apply_writes(&mut state, writes);
    self.inner.writes.fetch_add(count, Ordering::SeqCst);
    notify_writes(&mut state, &affected);

    Ok(true)
  }
}

#[async_trait]
impl TransactionBackend for StoreInner {
  async fn read(&self, target: &DocumentRef) -> Result<(Option<Value>, u64), DataError> {
    let state = self.state.lock().await;
    match state
      .collections
      .get(&target.collection)
      .and_then(|c| c.get(&target.id))
    {
      Some(doc) => Ok((Some(doc.value.clone()), doc.version)),
      None => Ok((None, 0)),
    }
  }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
  async fn get_document(
    &self,
    collection: &str,
    id: &str,
    opts: &ReadOptions,
  ) -> Result<Option<Value>, DataError> {
    self.begin_read(Some(opts)).await?;

    let state = self.inner.state.lock().await;
    Ok(
      state
        .collections
        .get(collection)
        .and_then(|c| c.get(id))
        .map(|d| d.value.clone()),
    )
  }

  async fn get_collection(
    &self,
    path: &str,
    query: &CollectionQuery,
    opts: &ReadOptions,
  ) -> Result<Vec<Document>, DataError> {
    self.begin_read(Some(opts)).await?;

    let state = self.inner.state.lock().await;
    Ok(evaluate(&state.collections, path, query))
  }

  async fn get_page(
    &self,
    path: &str,
    query: &CollectionQuery,
    page: &PageRequest,
  ) -> Result<Page, DataError> {
    self.begin_read(None).await?;

    let state = self.inner.state.lock().await;
    let docs = evaluate(&state.collections, path, query);

    let start = match &page.cursor {
      None => 0,
      Some(cursor) => parse_cursor(cursor)?,
    };

    let end = (start + page.size).min(docs.len());
    let data: Vec<Document> = if start < docs.len() {
      docs[start..end].to_vec()
    } else {
      Vec::new()
    };

    let last_cursor = if data.is_empty() {
      None
    } else {
      Some(Cursor::new(format!("offset:{}", end)))
    };

    Ok(Page {
      has_more: end < docs.len(),
      data,
      last_cursor,
    })
  }

  async fn subscribe_document(
    &self,
    collection: &str,
    id: &str,
  ) -> Result<Subscription<DocumentSnapshot>, DataError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = self.inner.state.lock().await;

    // Initial snapshot reflecting the current state
    let current = state
      .collections
      .get(collection)
      .and_then(|c| c.get(id))
      .map(|d| d.value.clone());
    let _ = tx.send(Ok(DocumentSnapshot {
      id: id.to_string(),
      value: current,
    }));

    state.doc_subs.push(DocSub {
      collection: collection.to_string(),
      id: id.to_string(),
      tx,
    });

    // Dropping the receiver closes the channel; the registration is pruned
    // on the next push.
    Ok(Subscription::new(rx, SubscriptionGuard::new(|| {})))
  }

  async fn subscribe_collection(
    &self,
    path: &str,
    query: &CollectionQuery,
  ) -> Result<Subscription<CollectionSnapshot>, DataError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = self.inner.state.lock().await;

    let docs = evaluate(&state.collections, path, query);
    let _ = tx.send(Ok(CollectionSnapshot { docs }));

    state.coll_subs.push(CollSub {
      path: path.to_string(),
      query: query.clone(),
      tx,
    });

    Ok(Subscription::new(rx, SubscriptionGuard::new(|| {})))
  }

  async fn execute_batch(&self, ops: Vec<WriteOperation>) -> Result<(), DataError> {
    let mut state = self.inner.state.lock().await;

    validate_writes(&state.collections, &ops)?;
    let count = ops.len();
    let affected = apply_writes(&mut state, ops);
    self.inner.writes.fetch_add(count, Ordering::SeqCst);
    notify_writes(&mut state, &affected);

    Ok(())
  }

  async fn run_transaction(&self, mut f: TransactionFn) -> Result<Value, DataError> {
    let backend: Arc<dyn TransactionBackend> = self.inner.clone();

    for _attempt in 0..MAX_TRANSACTION_ATTEMPTS {
      let mut handle = TransactionHandle::new(backend.clone());
      let outcome = f(&mut handle).await?;
      let (reads, writes) = handle.into_parts();

      if self.try_commit(&reads, writes).await? {
        return Ok(outcome);
      }
    }

    Err(DataError::transient(
      "transaction aborted: too many write conflicts",
    ))
  }
}

// ============================================================================
// Query evaluation
// ============================================================================

/// Evaluate a constrained collection read. Without an ordering spec,
/// documents come back in id order.
fn evaluate(collections: &Collections, path: &str, query: &CollectionQuery) -> Vec<Document> {
  let mut docs: Vec<Document> = collections
    .get(path)
    .map(|coll| {
      coll
        .iter()
        .filter(|(_, doc)| query.filters.iter().all(|f| matches_filter(&doc.value, f)))
        .map(|(id, doc)| Document::new(id.clone(), doc.value.clone()))
        .collect()
    })
    .unwrap_or_default();

  if !query.order_by.is_empty() {
    docs.sort_by(|a, b| compare_docs(a, b, &query.order_by));
  }

  if let Some(limit) = query.limit {
    docs.truncate(limit);
  }

  docs
}

fn matches_filter(doc: &Value, constraint: &QueryConstraint) -> bool {
  // Documents without the field never match, whatever the operator
  let field = match field_value(doc, &constraint.field) {
    Some(v) => v,
    None => return false,
  };

  match constraint.op {
    FilterOp::Eq => *field == constraint.value,
    FilterOp::Ne => *field != constraint.value,
    FilterOp::Lt => compare_values(field, &constraint.value) == CmpOrdering::Less,
    FilterOp::Le => compare_values(field, &constraint.value) != CmpOrdering::Greater,
    FilterOp::Gt => compare_values(field, &constraint.value) == CmpOrdering::Greater,
    FilterOp::Ge => compare_values(field, &constraint.value) != CmpOrdering::Less,
    FilterOp::ArrayContains => field
      .as_array()
      .map(|a| a.contains(&constraint.value))
      .unwrap_or(false),
  }
}

/// Resolve a dotted field path inside a document.
fn field_value<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
  let mut current = doc;
  for segment in path.split('.') {
    current = current.get(segment)?;
  }
  Some(current)
}

fn compare_docs(a: &Document, b: &Document, specs: &[SortSpec]) -> CmpOrdering {
  for spec in specs {
    let av = field_value(&a.data, &spec.field);
    let bv = field_value(&b.data, &spec.field);

    // Missing fields sort after present ones
    let ordering = match (av, bv) {
      (Some(av), Some(bv)) => compare_values(av, bv),
      (Some(_), None) => CmpOrdering::Less,
      (None, Some(_)) => CmpOrdering::Greater,
      (None, None) => CmpOrdering::Equal,
    };

    let ordering = match spec.direction {
      SortDirection::Ascending => ordering,
      SortDirection::Descending => ordering.reverse(),
    };

    if ordering != CmpOrdering::Equal {
      return ordering;
    }
  }

  // Stable tie-break on id
  a.id.cmp(&b.id)
}

/// Total order over JSON values: null < bool < number < string < composite.
fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
  fn rank(v: &Value) -> u8 {
    match v {
      Value::Null => 0,
      Value::Bool(_) => 1,
      Value::Number(_) => 2,
      Value::String(_) => 3,
      Value::Array(_) => 4,
      Value::Object(_) => 5,
    }
  }

  match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    (Value::Number(x), Value::Number(y)) => {
      let x = x.as_f64().unwrap_or(0.0);
      let y = y.as_f64().unwrap_or(0.0);
      x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
  }
}

fn parse_cursor(cursor: &Cursor) -> Result<usize, DataError> {
  cursor
    .as_str()
    .strip_prefix("offset:")
    .and_then(|s| s.parse().ok())
    .ok_or_else(|| DataError::validation(format!("invalid cursor: {}", cursor.as_str())))
}

// ============================================================================
// Writes
// ============================================================================

/// Check a write list against the store, simulating in-batch ordering so a
/// later `Update` may target a document an earlier `Set` creates.
fn validate_writes(collections: &Collections, ops: &[WriteOperation]) -> Result<(), DataError> {
  let mut exists: HashSet<(String, String)> = HashSet::new();
  let mut removed: HashSet<(String, String)> = HashSet::new();

  let existed_before = |target: &DocumentRef| {
    collections
      .get(&target.collection)
      .map(|c| c.contains_key(&target.id))
      .unwrap_or(false)
  };

  for op in ops {
    let key = (op.target().collection.clone(), op.target().id.clone());
    match op {
      WriteOperation::Set { .. } => {
        removed.remove(&key);
        exists.insert(key);
      }
      WriteOperation::Update { target, .. } => {
        let present =
          exists.contains(&key) || (!removed.contains(&key) && existed_before(target));
        if !present {
          return Err(DataError::validation(format!(
            "update target {}/{} does not exist",
            target.collection, target.id
          )));
        }
      }
      WriteOperation::Delete { .. } => {
        exists.remove(&key);
        removed.insert(key);
      }
    }
  }

  Ok(())
}

/// Apply a validated write list. Returns the affected documents with their
/// post-write values (`None` for deletions).
fn apply_writes(
  state: &mut StoreState,
  ops: Vec<WriteOperation>,
) -> Vec<(DocumentRef, Option<Value>)> {
  let mut affected = Vec::with_capacity(ops.len());

  for op in ops {
    match op {
      WriteOperation::Set { target, data } => {
        state.version_counter += 1;
        let version = state.version_counter;
        state
          .collections
          .entry(target.collection.clone())
          .or_default()
          .insert(
            target.id.clone(),
            VersionedDoc {
              value: data.clone(),
              version,
            },
          );
        affected.push((target, Some(data)));
      }
      WriteOperation::Update { target, data } => {
        state.version_counter += 1;
        let version = state.version_counter;
        if let Some(doc) = state
          .collections
          .get_mut(&target.collection)
          .and_then(|c| c.get_mut(&target.id))
        {
          merge_fields(&mut doc.value, &data);
          doc.version = version;
          let merged = doc.value.clone();
          affected.push((target, Some(merged)));
        }
      }
      WriteOperation::Delete { target } => {
        if let Some(coll) = state.collections.get_mut(&target.collection) {
          coll.remove(&target.id);
        }
        affected.push((target, None));
      }
    }
  }

  affected
}

/// Shallow field merge, replacing the whole value when either side is not
/// an object.
fn merge_fields(existing: &mut Value, data: &Value) {
  match (existing.as_object_mut(), data.as_object()) {
    (Some(obj), Some(fields)) => {
      for (k, v) in fields {
        obj.insert(k.clone(), v.clone());
      }
    }
    _ => *existing = data.clone(),
  }
}

/// Push snapshots for committed writes, pruning dropped subscribers.
fn notify_writes(state: &mut StoreState, affected: &[(DocumentRef, Option<Value>)]) {
  let StoreState {
    collections,
    doc_subs,
    coll_subs,
    ..
  } = state;

  doc_subs.retain(|sub| {
    for (target, value) in affected {
      if target.collection == sub.collection && target.id == sub.id {
        let snapshot = DocumentSnapshot {
          id: sub.id.clone(),
          value: value.clone(),
        };
        if sub.tx.send(Ok(snapshot)).is_err() {
          return false;
        }
      }
    }
    true
  });

  let touched: HashSet<&str> = affected
    .iter()
    .map(|(target, _)| target.collection.as_str())
    .collect();

  coll_subs.retain(|sub| {
    if !touched.contains(sub.path.as_str()) {
      return !sub.tx.is_closed();
    }
    let docs = evaluate(collections, &sub.path, &sub.query);
    sub.tx.send(Ok(CollectionSnapshot { docs })).is_ok()
  });
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn posts_query() -> CollectionQuery {
    CollectionQuery::new()
  }

  async fn seed_posts(store: &MemoryRemoteStore, count: usize) {
    for i in 0..count {
      store
        .seed("posts", &format!("p{:02}", i), json!({"score": i}))
        .await;
    }
  }

  #[tokio::test]
  async fn test_get_document() {
    let store = MemoryRemoteStore::new();
    store.seed("users", "alice", json!({"name": "Alice"})).await;

    let value = store
      .get_document("users", "alice", &ReadOptions::default())
      .await
      .unwrap();
    assert_eq!(value, Some(json!({"name": "Alice"})));

    let missing = store
      .get_document("users", "bob", &ReadOptions::default())
      .await
      .unwrap();
    assert_eq!(missing, None);
    assert_eq!(store.read_count(), 2);
  }

  #[tokio::test]
  async fn test_filters_sort_and_limit() {
    let store = MemoryRemoteStore::new();
    store
      .seed("posts", "a", json!({"score": 5, "author": "x"}))
      .await;
    store
      .seed("posts", "b", json!({"score": 12, "author": "y"}))
      .await;
    store
      .seed("posts", "c", json!({"score": 8, "author": "x"}))
      .await;

    let query = CollectionQuery::new()
      .filter(QueryConstraint::new(
        "score",
        FilterOp::Gt,
        json!(4),
      ))
      .order_by(SortSpec::desc("score"))
      .with_limit(2);

    let docs = store
      .get_collection("posts", &query, &ReadOptions::default())
      .await
      .unwrap();

    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);
  }

  #[tokio::test]
  async fn test_missing_field_never_matches() {
    let store = MemoryRemoteStore::new();
    store.seed("posts", "a", json!({"score": 5})).await;
    store.seed("posts", "b", json!({"other": 1})).await;

    let query =
      CollectionQuery::new().filter(QueryConstraint::new("score", FilterOp::Ne, json!(99)));
    let docs = store
      .get_collection("posts", &query, &ReadOptions::default())
      .await
      .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, "a");
  }

  #[tokio::test]
  async fn test_dotted_field_path() {
    let store = MemoryRemoteStore::new();
    store
      .seed("posts", "a", json!({"meta": {"tags": ["rust", "db"]}}))
      .await;
    store.seed("posts", "b", json!({"meta": {"tags": []}})).await;

    let query = CollectionQuery::new().filter(QueryConstraint::new(
      "meta.tags",
      FilterOp::ArrayContains,
      json!("rust"),
    ));
    let docs = store
      .get_collection("posts", &query, &ReadOptions::default())
      .await
      .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, "a");
  }

  #[tokio::test]
  async fn test_pagination_walks_the_full_set() {
    let store = MemoryRemoteStore::new();
    seed_posts(&store, 14).await;

    let first = store
      .get_page("posts", &posts_query(), &PageRequest::first(10))
      .await
      .unwrap();
    assert_eq!(first.data.len(), 10);
    assert!(first.has_more);

    let cursor = first.last_cursor.clone().unwrap();
    let second = store
      .get_page("posts", &posts_query(), &PageRequest::after(10, cursor.clone()))
      .await
      .unwrap();
    assert_eq!(second.data.len(), 4);
    assert!(!second.has_more);
    assert_ne!(second.last_cursor, Some(cursor));

    let mut all: Vec<String> = first.data.into_iter().map(|d| d.id).collect();
    all.extend(second.data.into_iter().map(|d| d.id));
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 14);
  }

  #[tokio::test]
  async fn test_exact_page_boundary_reports_exhaustion() {
    let store = MemoryRemoteStore::new();
    seed_posts(&store, 10).await;

    let page = store
      .get_page("posts", &posts_query(), &PageRequest::first(10))
      .await
      .unwrap();
    assert_eq!(page.data.len(), 10);
    assert!(!page.has_more);
  }

  #[tokio::test]
  async fn test_invalid_cursor_is_rejected() {
    let store = MemoryRemoteStore::new();
    seed_posts(&store, 3).await;

    let result = store
      .get_page(
        "posts",
        &posts_query(),
        &PageRequest::after(10, Cursor::new("garbage")),
      )
      .await;
    assert!(matches!(result, Err(DataError::Validation { .. })));
  }

  #[tokio::test]
  async fn test_batch_is_atomic_on_validation_failure() {
    let store = MemoryRemoteStore::new();

    let result = store
      .execute_batch(vec![
        WriteOperation::set(DocumentRef::new("users", "alice"), json!({"n": 1})),
        WriteOperation::update(DocumentRef::new("users", "ghost"), json!({"n": 2})),
      ])
      .await;

    assert!(matches!(result, Err(DataError::Validation { .. })));
    assert_eq!(
      store
        .get_document("users", "alice", &ReadOptions::default())
        .await
        .unwrap(),
      None
    );
    assert_eq!(store.write_count(), 0);
  }

  #[tokio::test]
  async fn test_batch_update_may_follow_set_in_same_batch() {
    let store = MemoryRemoteStore::new();

    store
      .execute_batch(vec![
        WriteOperation::set(DocumentRef::new("users", "alice"), json!({"a": 1})),
        WriteOperation::update(DocumentRef::new("users", "alice"), json!({"b": 2})),
      ])
      .await
      .unwrap();

    assert_eq!(
      store
        .get_document("users", "alice", &ReadOptions::default())
        .await
        .unwrap(),
      Some(json!({"a": 1, "b": 2}))
    );
    assert_eq!(store.write_count(), 2);
  }

  #[tokio::test]
  async fn test_update_after_delete_in_same_batch_is_rejected() {
    let store = MemoryRemoteStore::new();
    store.seed("users", "alice", json!({"a": 1})).await;

    let result = store
      .execute_batch(vec![
        WriteOperation::delete(DocumentRef::new("users", "alice")),
        WriteOperation::update(DocumentRef::new("users", "alice"), json!({"b": 2})),
      ])
      .await;
    assert!(matches!(result, Err(DataError::Validation { .. })));
  }

  #[tokio::test]
  async fn test_document_subscription_pushes_changes() {
    let store = MemoryRemoteStore::new();
    store.seed("users", "alice", json!({"n": 0})).await;

    let mut sub = store.subscribe_document("users", "alice").await.unwrap();

    // Initial snapshot
    let initial = sub.next().await.unwrap().unwrap();
    assert_eq!(initial.value, Some(json!({"n": 0})));

    store
      .execute_batch(vec![WriteOperation::set(
        DocumentRef::new("users", "alice"),
        json!({"n": 1}),
      )])
      .await
      .unwrap();
    let updated = sub.next().await.unwrap().unwrap();
    assert_eq!(updated.value, Some(json!({"n": 1})));

    store
      .execute_batch(vec![WriteOperation::delete(DocumentRef::new(
        "users", "alice",
      ))])
      .await
      .unwrap();
    let deleted = sub.next().await.unwrap().unwrap();
    assert_eq!(deleted.value, None);
  }

  #[tokio::test]
  async fn test_collection_subscription_recomputes_result_set() {
    let store = MemoryRemoteStore::new();
    store.seed("posts", "a", json!({"score": 5})).await;

    let query =
      CollectionQuery::new().filter(QueryConstraint::new("score", FilterOp::Gt, json!(3)));
    let mut sub = store.subscribe_collection("posts", &query).await.unwrap();

    let initial = sub.next().await.unwrap().unwrap();
    assert_eq!(initial.docs.len(), 1);

    // A write that joins the result set
    store
      .execute_batch(vec![WriteOperation::set(
        DocumentRef::new("posts", "b"),
        json!({"score": 9}),
      )])
      .await
      .unwrap();
    let grown = sub.next().await.unwrap().unwrap();
    assert_eq!(grown.docs.len(), 2);

    // A write that misses the filter still pushes the (unchanged) set
    store
      .execute_batch(vec![WriteOperation::set(
        DocumentRef::new("posts", "c"),
        json!({"score": 1}),
      )])
      .await
      .unwrap();
    let same = sub.next().await.unwrap().unwrap();
    assert_eq!(same.docs.len(), 2);
  }

  #[tokio::test]
  async fn test_dropped_subscription_is_pruned() {
    let store = MemoryRemoteStore::new();
    let sub = store.subscribe_document("users", "alice").await.unwrap();
    assert_eq!(store.subscriber_count().await, 1);

    drop(sub);
    assert_eq!(store.subscriber_count().await, 0);

    // Writes after the drop go nowhere and don't error
    store
      .execute_batch(vec![WriteOperation::set(
        DocumentRef::new("users", "alice"),
        json!(1),
      )])
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_transaction_reruns_on_conflict() {
    let store = MemoryRemoteStore::new();
    store.seed("counters", "c", json!({"n": 0})).await;

    let interfering = store.clone();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_body = attempts.clone();

    let body: TransactionFn = Box::new(move |handle| {
      let interfering = interfering.clone();
      let attempts = attempts_in_body.clone();
      Box::pin(async move {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        let doc = handle
          .get(&DocumentRef::new("counters", "c"))
          .await?
          .unwrap_or(json!({"n": 0}));
        let current = doc["n"].as_u64().unwrap_or(0);

        if attempt == 0 {
          // Interleaved write invalidates the version this body observed
          interfering
            .execute_batch(vec![WriteOperation::set(
              DocumentRef::new("counters", "c"),
              json!({"n": 100}),
            )])
            .await?;
        }

        handle.set(DocumentRef::new("counters", "c"), json!({"n": current + 1}));
        Ok(json!(current + 1))
      })
    });

    let result = store.run_transaction(body).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(result, json!(101));
    assert_eq!(
      store
        .get_document("counters", "c", &ReadOptions::default())
        .await
        .unwrap(),
      Some(json!({"n": 101}))
    );
  }

  #[tokio::test]
  async fn test_transaction_body_error_aborts_without_rerun() {
    let store = MemoryRemoteStore::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_body = attempts.clone();

    let body: TransactionFn = Box::new(move |handle| {
      let attempts = attempts_in_body.clone();
      Box::pin(async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        handle.set(DocumentRef::new("users", "alice"), json!(1));
        Err(DataError::validation("rejected by business rule"))
      })
    });

    let result = store.run_transaction(body).await;
    assert!(matches!(result, Err(DataError::Validation { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(store.write_count(), 0);
  }

  #[tokio::test]
  async fn test_scripted_failure_is_consumed_once() {
    let store = MemoryRemoteStore::new();
    store.seed("users", "alice", json!(1)).await;
    store
      .push_read_failure(DataError::transient("connection reset"))
      .await;

    let first = store
      .get_document("users", "alice", &ReadOptions::default())
      .await;
    assert!(matches!(first, Err(DataError::Transient { .. })));

    let second = store
      .get_document("users", "alice", &ReadOptions::default())
      .await
      .unwrap();
    assert_eq!(second, Some(json!(1)));
    assert_eq!(store.read_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_read_timeout_against_slow_transport() {
    let store = MemoryRemoteStore::new();
    store.seed("users", "alice", json!(1)).await;
    store.set_read_delay(Duration::from_millis(500)).await;

    let opts = ReadOptions::with_timeout(Duration::from_millis(100));
    let started = tokio::time::Instant::now();
    let result = store.get_document("users", "alice", &opts).await;

    assert_eq!(
      result,
      Err(DataError::Timeout {
        elapsed: Duration::from_millis(100)
      })
    );
    assert_eq!(started.elapsed(), Duration::from_millis(100));

    // A generous timeout lets the slow read finish
    let opts = ReadOptions::with_timeout(Duration::from_millis(800));
    let value = store.get_document("users", "alice", &opts).await.unwrap();
    assert_eq!(value, Some(json!(1)));
  }
}
