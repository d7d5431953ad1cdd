//! Value objects passed between controllers and the remote document store.
//!
//! Constraints, sort specs and page requests are opaque to this layer: they
//! describe the query shape and the store interprets them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document returned from a collection read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub data: Value,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Value) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }
}

/// Filter operator for a collection constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  ArrayContains,
}

/// A single filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConstraint {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

impl QueryConstraint {
  pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
    Self {
      field: field.into(),
      op,
      value,
    }
  }

  /// Shorthand for the most common predicate.
  pub fn field_eq(field: impl Into<String>, value: Value) -> Self {
    Self::new(field, FilterOp::Eq, value)
  }
}

/// Sort direction for an ordering spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
  Ascending,
  Descending,
}

/// One ordering rule; earlier specs take precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
  pub field: String,
  pub direction: SortDirection,
}

impl SortSpec {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: SortDirection::Ascending,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: SortDirection::Descending,
    }
  }
}

/// Filter/sort/limit constraints for a collection read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionQuery {
  pub filters: Vec<QueryConstraint>,
  pub order_by: Vec<SortSpec>,
  pub limit: Option<usize>,
}

impl CollectionQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn filter(mut self, constraint: QueryConstraint) -> Self {
    self.filters.push(constraint);
    self
  }

  pub fn order_by(mut self, spec: SortSpec) -> Self {
    self.order_by.push(spec);
    self
  }

  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}

/// Opaque pagination token marking the position for the next page.
///
/// Controllers never inspect the token; they hand the last one back to the
/// store unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Page size and position for a paginated collection read.
#[derive(Debug, Clone)]
pub struct PageRequest {
  pub size: usize,
  pub cursor: Option<Cursor>,
}

impl PageRequest {
  /// The first page of a pagination session.
  pub fn first(size: usize) -> Self {
    Self { size, cursor: None }
  }

  pub fn after(size: usize, cursor: Cursor) -> Self {
    Self {
      size,
      cursor: Some(cursor),
    }
  }
}

/// One page returned by the remote store.
#[derive(Debug, Clone)]
pub struct Page {
  pub data: Vec<Document>,
  pub has_more: bool,
  pub last_cursor: Option<Cursor>,
}

/// Reference to a single document inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
  pub collection: String,
  pub id: String,
}

impl DocumentRef {
  pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      id: id.into(),
    }
  }
}

/// One write inside an atomic batch.
///
/// `Set` upserts the full document, `Update` merges fields into an existing
/// document (and fails the whole batch if it does not exist), `Delete`
/// removes it.
#[derive(Debug, Clone)]
pub enum WriteOperation {
  Set { target: DocumentRef, data: Value },
  Update { target: DocumentRef, data: Value },
  Delete { target: DocumentRef },
}

impl WriteOperation {
  pub fn set(target: DocumentRef, data: Value) -> Self {
    Self::Set { target, data }
  }

  pub fn update(target: DocumentRef, data: Value) -> Self {
    Self::Update { target, data }
  }

  pub fn delete(target: DocumentRef) -> Self {
    Self::Delete { target }
  }

  pub fn target(&self) -> &DocumentRef {
    match self {
      Self::Set { target, .. } | Self::Update { target, .. } | Self::Delete { target } => target,
    }
  }
}

/// Transport options for a single remote read.
///
/// Retry and caching policy live in the controllers, not here; the only
/// transport-level knob is the call bound.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
  pub timeout: Option<Duration>,
}

impl ReadOptions {
  pub fn with_timeout(timeout: Duration) -> Self {
    Self {
      timeout: Some(timeout),
    }
  }
}

/// Push payload for a document subscription. `value` is `None` once the
/// document has been deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
  pub id: String,
  pub value: Option<Value>,
}

/// Push payload for a collection subscription: the full constrained result
/// set as of this push.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
  pub docs: Vec<Document>,
}
