//! Thin orchestration for grouped writes and transactions.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::error::DataError;
use crate::store::remote::{RemoteStore, TransactionFn};
use crate::store::types::WriteOperation;

/// Observable progress of a submitted write group.
#[derive(Debug, Clone, Default)]
pub struct ExecState {
  pub loading: bool,
  pub error: Option<DataError>,
}

/// Submits an ordered list of writes as one atomic unit.
///
/// No local retry and no splitting: the store either applies the whole
/// list or none of it, and the outcome is surfaced as-is.
pub struct BatchExecutor {
  remote: Arc<dyn RemoteStore>,
  state_tx: watch::Sender<ExecState>,
}

impl BatchExecutor {
  pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
    let (state_tx, _state_rx) = watch::channel(ExecState::default());
    Self { remote, state_tx }
  }

  pub async fn execute(&self, operations: Vec<WriteOperation>) -> Result<(), DataError> {
    self.state_tx.send_if_modified(|state| {
      state.loading = true;
      state.error = None;
      true
    });

    let result = self.remote.execute_batch(operations).await;

    self.state_tx.send_if_modified(|state| {
      state.loading = false;
      state.error = result.as_ref().err().cloned();
      true
    });
    result
  }

  pub fn state(&self) -> ExecState {
    self.state_tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ExecState> {
    self.state_tx.subscribe()
  }
}

/// Runs a caller-supplied function through the store's transaction
/// machinery and surfaces the final outcome.
///
/// Deliberately no local retry: the store already re-runs the body on
/// write conflicts, and retrying a settled transaction from out here
/// could double-apply its effects.
pub struct TransactionExecutor {
  remote: Arc<dyn RemoteStore>,
  state_tx: watch::Sender<ExecState>,
}

impl TransactionExecutor {
  pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
    let (state_tx, _state_rx) = watch::channel(ExecState::default());
    Self { remote, state_tx }
  }

  pub async fn execute(&self, transaction: TransactionFn) -> Result<Value, DataError> {
    self.state_tx.send_if_modified(|state| {
      state.loading = true;
      state.error = None;
      true
    });

    let result = self.remote.run_transaction(transaction).await;

    self.state_tx.send_if_modified(|state| {
      state.loading = false;
      state.error = result.as_ref().err().cloned();
      true
    });
    result
  }

  pub fn state(&self) -> ExecState {
    self.state_tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ExecState> {
    self.state_tx.subscribe()
  }
}
