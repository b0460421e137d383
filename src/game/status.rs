use chess::Color;

/// Why a game ended in a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawKind {
    Stalemate,
    Repetition,
    FiftyMove,
    InsufficientMaterial,
    MoveCap,
}

/// Outcome classification of a position given its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    InProgress,
    Checkmate(Color),
    Stalemate,
    DrawRepetition,
    DrawFiftyMove,
    DrawInsufficientMaterial,
    DrawMoveCap,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        self != GameStatus::InProgress
    }

    pub fn winner(self) -> Option<Color> {
        match self {
            GameStatus::Checkmate(winner) => Some(winner),
            _ => None,
        }
    }

    pub fn draw_kind(self) -> Option<DrawKind> {
        match self {
            GameStatus::Stalemate => Some(DrawKind::Stalemate),
            GameStatus::DrawRepetition => Some(DrawKind::Repetition),
            GameStatus::DrawFiftyMove => Some(DrawKind::FiftyMove),
            GameStatus::DrawInsufficientMaterial => Some(DrawKind::InsufficientMaterial),
            GameStatus::DrawMoveCap => Some(DrawKind::MoveCap),
            GameStatus::InProgress | GameStatus::Checkmate(_) => None,
        }
    }

    /// Exact reward of a finished game for `side`: +1 win, -1 loss, 0 draw.
    pub fn reward_for(self, side: Color) -> f64 {
        match self {
            GameStatus::Checkmate(winner) if winner == side => 1.0,
            GameStatus::Checkmate(_) => -1.0,
            _ => 0.0,
        }
    }
}
