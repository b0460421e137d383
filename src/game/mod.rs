//! Chess rules as seen by the search: legal moves, move application,
//! terminal classification and position fingerprints.

pub mod game_state;
pub mod status;

pub use game_state::{GameContext, DEFAULT_MOVE_CAP, HISTORY_LEN};
pub use status::{DrawKind, GameStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("invalid FEN '{fen}': {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("illegal move {0}")]
    IllegalMove(String),

    #[error("no legal move matches '{0}'")]
    UnknownMove(String),
}
