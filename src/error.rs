//! Structured failure kinds for the data-access layer.
//!
//! Controllers catch every failure internally; what reaches a caller's
//! `error` state or `on_error` callback is always one of these kinds, never
//! a raw transport fault. Presentation layers can branch on the kind without
//! inspecting messages.

use std::time::Duration;

use derive_more::{Display, Error};

/// Failure taxonomy observed by consumers of the data layer.
///
/// Kinds are clonable, comparable values (message payloads, no source
/// chains) so they can live inside published controller state.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum DataError {
  /// Retryable network failure. Consumes retry budget and triggers backoff.
  #[display("transient network failure: {message}")]
  Transient { message: String },

  /// A network call exceeded its caller-supplied bound. Treated identically
  /// to a transient failure for retry purposes.
  #[display("network call timed out after {elapsed:?}")]
  Timeout { elapsed: Duration },

  /// Produced by supersession or disposal. Never retried, never surfaced
  /// through `on_error`, silently dropped.
  #[display("operation was cancelled")]
  Cancelled,

  /// Rejected by the remote store for semantic reasons. Not retried.
  #[display("remote store rejected the request: {message}")]
  Validation { message: String },

  /// Throttled by the remote store. Retried with backoff like a transient
  /// failure; a longer base delay is a configuration concern.
  #[display("rate limited by remote store: {message}")]
  RateLimited { message: String },

  /// Offline with fallback enabled, but no offline entry exists for the key.
  #[display("offline and no stored payload for key '{key}'")]
  OfflineUnavailable { key: String },

  /// Local cache or offline store fault (serialization, database).
  #[display("local store failure: {message}")]
  Storage { message: String },
}

impl DataError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient {
      message: message.into(),
    }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn rate_limited(message: impl Into<String>) -> Self {
    Self::RateLimited {
      message: message.into(),
    }
  }

  pub fn storage(message: impl Into<String>) -> Self {
    Self::Storage {
      message: message.into(),
    }
  }

  /// Whether retrying the operation might succeed.
  ///
  /// Only these kinds consume retry budget; everything else settles
  /// immediately.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::Transient { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
    )
  }

  /// Whether this failure came from supersession or disposal.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}

impl From<serde_json::Error> for DataError {
  fn from(e: serde_json::Error) -> Self {
    Self::Storage {
      message: format!("serialization failed: {}", e),
    }
  }
}

impl From<rusqlite::Error> for DataError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage {
      message: format!("sqlite failure: {}", e),
    }
  }
}
