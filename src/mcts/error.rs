use crate::game::GameError;
use crate::mcts::arena::NodeId;
use crate::neural::EvaluatorError;

/// Fatal search failures. Any of these aborts the running search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("record {key:#018x} is bound to {bound}, refusing to bind it to {requested}")]
    ConflictingBinding {
        key: u64,
        bound: String,
        requested: String,
    },

    #[error("node {node} already has parent {current}, refusing to attach it under {requested}")]
    Reparent {
        node: NodeId,
        current: NodeId,
        requested: NodeId,
    },

    #[error("no evaluation record for key {0:#018x}")]
    CacheMiss(u64),

    #[error("an evaluation record already exists for key {0:#018x}")]
    DuplicateRecord(u64),

    #[error("invalid search configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error("node {0} is no longer part of the search graph")]
    StaleNode(NodeId),

    #[error("the search graph has no root")]
    NoRoot,

    #[error("no legal move in the current position")]
    NoLegalMoves,

    #[error("failed to start the worker pool: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Game(#[from] GameError),
}
