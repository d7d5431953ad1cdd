//! Host signals shared across controller instances.
//!
//! The host application owns one `Connectivity` handle (flipped by its
//! transport layer) and, if it has a notion of foreground attention, one
//! `FocusSignal`. Controllers receive clones and subscribe.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

/// Shared online/offline flag with change notification.
///
/// Receivers are woken only on real transitions, not on redundant writes.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  /// A handle that starts in the online state.
  pub fn online() -> Self {
    Self::new(true)
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Flip the flag. Subscribers are notified only when the value changes.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      if *current != online {
        *current = online;
        true
      } else {
        false
      }
    });
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::online()
  }
}

/// Foreground-attention pulses ("window regained focus").
#[derive(Clone)]
pub struct FocusSignal {
  tx: broadcast::Sender<()>,
}

impl FocusSignal {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(16);
    Self { tx }
  }

  /// Announce that the host regained foreground attention.
  pub fn focused(&self) {
    // No receivers is fine - nothing is listening yet.
    let _ = self.tx.send(());
  }

  pub fn subscribe(&self) -> broadcast::Receiver<()> {
    self.tx.subscribe()
  }
}

impl Default for FocusSignal {
  fn default() -> Self {
    Self::new()
  }
}
