//! # Zero Chess
//!
//! AlphaZero-style best-first tree search for chess.
//!
//! ## Features
//!
//! - **Game**: chess rules, terminal classification and position fingerprints
//! - **Search**: concurrent PUCT search with virtual loss and a shared evaluation cache
//! - **Evaluator**: batched policy/value calls behind the [`Evaluator`] trait
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use zero_chess::{SearchConfig, SearchStrategy, UniformEvaluator};
//!
//! let mut strategy =
//!     SearchStrategy::new(SearchConfig::default(), Arc::new(UniformEvaluator::default()))?;
//! let legal = strategy.context().legal_moves();
//! let mv = strategy.choose_move(None, &legal)?;
//! println!("{}", mv);
//! # Ok::<(), zero_chess::SearchError>(())
//! ```

// ============================================================================
// PUBLIC API MODULES
// ============================================================================

/// Chess rules used by the search
pub mod game;

/// Logger setup shared by the binary and tools
pub mod logging;

/// Concurrent tree search
pub mod mcts;

/// Evaluator interface, input encoding and backends
pub mod neural;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use game::{DrawKind, GameContext, GameError, GameStatus};

pub use mcts::{
    NodeState, SearchConfig, SearchError, SearchHyperparameters, SearchReport, SearchResult,
    SearchStrategy, StopMode,
};

pub use neural::{BiasedEvaluator, Evaluator, EvaluatorError, EvaluatorOutput, UniformEvaluator};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Top-level error of the crate
#[derive(Debug, thiserror::Error)]
pub enum ZeroChessError {
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Game error: {0}")]
    Game(#[from] GameError),

    #[error("Evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ZeroChessError>;

// ============================================================================
// LIBRARY VERSION INFO
// ============================================================================

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
