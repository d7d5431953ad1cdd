//! Speculative local mutation with confirm-or-rollback.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};

use crate::error::DataError;

/// Confirms a speculative value against the authority, returning the
/// value that actually took effect.
pub type ConfirmFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, DataError>> + Send + Sync>;

/// Exposed view: the current value plus whether it is still speculative.
#[derive(Debug, Clone)]
pub struct OptimisticState<T> {
  pub value: T,
  pub is_pending: bool,
}

struct Record<T> {
  /// Last confirmed value; the rollback target.
  baseline: T,
  version: u64,
}

/// Applies a mutation to the exposed value immediately, then settles it
/// against the confirm function: success promotes the confirmed result
/// to baseline, failure restores the previous baseline verbatim and
/// re-raises the error.
///
/// Updates are version-gated: once a newer update has started, an older
/// one's confirmation (or rollback) no longer touches the exposed state.
pub struct OptimisticUpdateController<T> {
  confirm: ConfirmFn<T>,
  record: Mutex<Record<T>>,
  state_tx: watch::Sender<OptimisticState<T>>,
}

impl<T> OptimisticUpdateController<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new<F, Fut>(initial: T, confirm: F) -> Self
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, DataError>> + Send + 'static,
  {
    let (state_tx, _state_rx) = watch::channel(OptimisticState {
      value: initial.clone(),
      is_pending: false,
    });
    Self {
      confirm: Arc::new(move |value| Box::pin(confirm(value))),
      record: Mutex::new(Record {
        baseline: initial,
        version: 0,
      }),
      state_tx,
    }
  }

  /// Expose `new_value` at once and confirm it in the background of this
  /// call. Returns what the confirm function settled on, or the error
  /// it raised (after rolling the exposed value back).
  pub async fn perform_optimistic_update(&self, new_value: T) -> Result<T, DataError> {
    // Bump-and-publish under the lock so overlapping updates cannot
    // publish out of order
    let version = {
      let mut record = self.record.lock().await;
      record.version += 1;
      let value = new_value.clone();
      self.state_tx.send_if_modified(|state| {
        state.value = value;
        state.is_pending = true;
        true
      });
      record.version
    };

    match (self.confirm)(new_value).await {
      Ok(confirmed) => {
        let mut record = self.record.lock().await;
        if record.version == version {
          record.baseline = confirmed.clone();
          let value = confirmed.clone();
          self.state_tx.send_if_modified(|state| {
            state.value = value;
            state.is_pending = false;
            true
          });
        }
        Ok(confirmed)
      }
      Err(error) => {
        let record = self.record.lock().await;
        if record.version == version {
          let baseline = record.baseline.clone();
          self.state_tx.send_if_modified(|state| {
            state.value = baseline;
            state.is_pending = false;
            true
          });
        }
        Err(error)
      }
    }
  }

  pub fn state(&self) -> OptimisticState<T> {
    self.state_tx.borrow().clone()
  }

  pub fn current(&self) -> T {
    self.state_tx.borrow().value.clone()
  }

  pub fn is_pending(&self) -> bool {
    self.state_tx.borrow().is_pending
  }

  pub fn subscribe(&self) -> watch::Receiver<OptimisticState<T>> {
    self.state_tx.subscribe()
  }
}
