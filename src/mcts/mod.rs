pub mod arena;
pub mod batcher;
pub mod cache;
pub mod coordinator;
pub mod dirichlet;
pub mod error;
pub mod hyperparameters;
pub mod mcts_result;
pub mod node;
pub mod record;
pub mod selection;
pub mod strategy;
pub mod walker;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use arena::{NodeId, SearchGraph};
pub use batcher::{EvaluationBatcher, FlushReport};
pub use cache::{EvaluationCache, TerminalOutcome};
pub use coordinator::{SearchCoordinator, SearchReport, StopMode};
pub use error::SearchError;
pub use hyperparameters::SearchHyperparameters;
pub use mcts_result::SearchResult;
pub use node::{NodeState, SearchNode};
pub use record::{EvaluationRecord, RecordKind};
pub use strategy::{SearchConfig, SearchStrategy};
pub use walker::{PlayoutOutcome, SearchWalker};

// A panicking worker already aborts the search; the data it guarded is still
// consistent enough for diagnostics, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
