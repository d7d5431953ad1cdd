//! Write-side controllers: optimistic local mutation and grouped writes.

pub mod batch;
pub mod optimistic;

pub use batch::{BatchExecutor, ExecState, TransactionExecutor};
pub use optimistic::{OptimisticState, OptimisticUpdateController};
