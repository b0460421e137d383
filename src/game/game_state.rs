//! Game context carried by the search.
//!
//! Wraps a `chess::Board` with the history the rules and the feature encoder
//! need: the last few moves and boards, the halfmove clock, the hashes seen
//! since the last irreversible move (threefold repetition) and a ply cap.
//! Walkers clone this context so move application never touches shared state.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chess::{BitBoard, Board, BoardStatus, ChessMove, Color, MoveGen, Piece};

use crate::game::status::GameStatus;
use crate::game::GameError;

/// Number of recent moves folded into the fingerprint and boards fed to the encoder.
pub const HISTORY_LEN: usize = 8;

/// Default cap on the game length in plies.
pub const DEFAULT_MOVE_CAP: usize = 512;

const FIFTY_MOVE_PLIES: u32 = 100;

/// Mixed into fingerprints that land on one of the cache's reserved keys.
const RESERVED_KEY_REMAP: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone)]
pub struct GameContext {
    board: Board,
    /// Most recent first.
    recent_moves: VecDeque<ChessMove>,
    /// Boards preceding the current one, most recent first.
    recent_boards: VecDeque<Board>,
    /// Board hashes since the last capture or pawn move, current one included.
    reversible_hashes: Vec<u64>,
    halfmove_clock: u32,
    ply: usize,
    move_cap: usize,
}

impl Default for GameContext {
    fn default() -> Self {
        Self::from_board(Board::default())
    }
}

impl GameContext {
    /// Standard starting position.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_board(board: Board) -> Self {
        Self {
            reversible_hashes: vec![board.get_hash()],
            board,
            recent_moves: VecDeque::with_capacity(HISTORY_LEN),
            recent_boards: VecDeque::with_capacity(HISTORY_LEN),
            halfmove_clock: 0,
            ply: 0,
            move_cap: DEFAULT_MOVE_CAP,
        }
    }

    /// Loads a FEN string, keeping its halfmove clock and fullmove number.
    pub fn from_fen(fen: &str) -> Result<Self, GameError> {
        let board = Board::from_str(fen).map_err(|e| GameError::InvalidFen {
            fen: fen.to_string(),
            reason: format!("{:?}", e),
        })?;
        let mut fields = fen.split_whitespace().skip(4);
        let halfmove_clock = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let fullmove: usize = fields.next().and_then(|s| s.parse().ok()).unwrap_or(1);

        let mut context = Self::from_board(board);
        context.halfmove_clock = halfmove_clock;
        context.ply = fullmove.saturating_sub(1) * 2
            + usize::from(board.side_to_move() == Color::Black);
        Ok(context)
    }

    pub fn with_move_cap(mut self, move_cap: usize) -> Self {
        self.move_cap = move_cap;
        self
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    pub fn ply(&self) -> usize {
        self.ply
    }

    pub fn move_cap(&self) -> usize {
        self.move_cap
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }

    pub fn recent_moves(&self) -> &VecDeque<ChessMove> {
        &self.recent_moves
    }

    pub fn recent_boards(&self) -> &VecDeque<Board> {
        &self.recent_boards
    }

    /// Legal moves in move-generator order.
    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    pub fn is_legal(&self, mv: ChessMove) -> bool {
        MoveGen::new_legal(&self.board).any(|candidate| candidate == mv)
    }

    /// Applies a move assumed legal. Use [`GameContext::try_apply_move`] for
    /// moves coming from outside the search.
    pub fn apply_move(&mut self, mv: ChessMove) {
        let irreversible = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn)
            || self.board.piece_on(mv.get_dest()).is_some();

        self.recent_boards.push_front(self.board);
        self.recent_boards.truncate(HISTORY_LEN - 1);
        self.recent_moves.push_front(mv);
        self.recent_moves.truncate(HISTORY_LEN);

        self.board = self.board.make_move_new(mv);
        self.ply += 1;

        if irreversible {
            self.halfmove_clock = 0;
            self.reversible_hashes.clear();
        } else {
            self.halfmove_clock += 1;
        }
        self.reversible_hashes.push(self.board.get_hash());
    }

    pub fn try_apply_move(&mut self, mv: ChessMove) -> Result<(), GameError> {
        if !self.is_legal(mv) {
            return Err(GameError::IllegalMove(mv.to_string()));
        }
        self.apply_move(mv);
        Ok(())
    }

    /// Resolves a move in coordinate notation (`e2e4`, `b2b1q`) against the legal moves.
    pub fn parse_uci(&self, text: &str) -> Result<ChessMove, GameError> {
        let wanted = text.trim().to_ascii_lowercase();
        MoveGen::new_legal(&self.board)
            .find(|mv| mv.to_string() == wanted)
            .ok_or(GameError::UnknownMove(wanted))
    }

    /// How many times the current position occurred since the last irreversible move.
    pub fn repetition_count(&self) -> usize {
        let current = self.board.get_hash();
        self.reversible_hashes
            .iter()
            .filter(|&&hash| hash == current)
            .count()
    }

    pub fn has_insufficient_material(&self) -> bool {
        let heavy = *self.board.pieces(Piece::Pawn)
            | *self.board.pieces(Piece::Rook)
            | *self.board.pieces(Piece::Queen);
        if heavy != BitBoard::new(0) {
            return false;
        }
        let minors = *self.board.pieces(Piece::Knight) | *self.board.pieces(Piece::Bishop);
        minors.popcnt() <= 1
    }

    pub fn status(&self) -> GameStatus {
        match self.board.status() {
            BoardStatus::Checkmate => GameStatus::Checkmate(!self.side_to_move()),
            BoardStatus::Stalemate => GameStatus::Stalemate,
            BoardStatus::Ongoing => {
                if self.repetition_count() >= 3 {
                    GameStatus::DrawRepetition
                } else if self.halfmove_clock >= FIFTY_MOVE_PLIES {
                    GameStatus::DrawFiftyMove
                } else if self.has_insufficient_material() {
                    GameStatus::DrawInsufficientMaterial
                } else if self.ply >= self.move_cap {
                    GameStatus::DrawMoveCap
                } else {
                    GameStatus::InProgress
                }
            }
        }
    }

    /// 64-bit fingerprint of board, last moves and side to move.
    pub fn fingerprint(&self) -> u64 {
        fingerprint_of(&self.board, self.recent_moves.iter())
    }

    /// Fingerprint of the position reached by `mv`, without cloning the context.
    pub fn fingerprint_after(&self, mv: ChessMove) -> u64 {
        let next = self.board.make_move_new(mv);
        let history = std::iter::once(&mv).chain(self.recent_moves.iter().take(HISTORY_LEN - 1));
        fingerprint_of(&next, history)
    }
}

fn fingerprint_of<'a>(board: &Board, moves: impl Iterator<Item = &'a ChessMove>) -> u64 {
    let mut hasher = DefaultHasher::new();
    board.get_hash().hash(&mut hasher);
    for mv in moves {
        mv.hash(&mut hasher);
    }
    (board.side_to_move() == Color::White).hash(&mut hasher);

    let key = hasher.finish();
    // u64::MAX, 0 and 1 are the cache's sentinel keys (-1, 0, +1)
    if key <= 1 || key == u64::MAX {
        key ^ RESERVED_KEY_REMAP
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(context: &mut GameContext, moves: &[&str]) {
        for text in moves {
            let mv = context.parse_uci(text).unwrap();
            context.apply_move(mv);
        }
    }

    #[test]
    fn test_start_position() {
        let context = GameContext::new();
        assert_eq!(context.legal_moves().len(), 20);
        assert_eq!(context.status(), GameStatus::InProgress);
        assert_eq!(context.side_to_move(), Color::White);
        assert_eq!(context.repetition_count(), 1);
    }

    #[test]
    fn test_fools_mate_is_checkmate() {
        let mut context = GameContext::new();
        play(&mut context, &["f2f3", "e7e5", "g2g4", "d8h4"]);
        assert_eq!(context.status(), GameStatus::Checkmate(Color::Black));
        assert!(context.legal_moves().is_empty());
    }

    #[test]
    fn test_knight_shuffle_is_repetition() {
        let mut context = GameContext::new();
        play(
            &mut context,
            &["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8"],
        );
        assert_eq!(context.repetition_count(), 3);
        assert_eq!(context.status(), GameStatus::DrawRepetition);
    }

    #[test]
    fn test_halfmove_clock_resets_on_pawn_move() {
        let mut context = GameContext::new();
        play(&mut context, &["g1f3", "g8f6"]);
        assert_eq!(context.halfmove_clock(), 2);
        play(&mut context, &["e2e4"]);
        assert_eq!(context.halfmove_clock(), 0);
    }

    #[test]
    fn test_fifty_move_rule_from_fen() {
        let context = GameContext::from_fen("8/8/8/4k3/8/8/4K3/4R3 w - - 100 80").unwrap();
        assert_eq!(context.status(), GameStatus::DrawFiftyMove);
    }

    #[test]
    fn test_insufficient_material() {
        let bare = GameContext::from_fen("8/8/8/4k3/8/8/4K3/8 w - - 0 1").unwrap();
        assert_eq!(bare.status(), GameStatus::DrawInsufficientMaterial);
        let knight = GameContext::from_fen("8/8/8/4k3/8/8/4K3/6N1 w - - 0 1").unwrap();
        assert!(knight.has_insufficient_material());
        let rook = GameContext::from_fen("8/8/8/4k3/8/8/4K3/6R1 w - - 0 1").unwrap();
        assert!(!rook.has_insufficient_material());
    }

    #[test]
    fn test_move_cap() {
        let mut context = GameContext::new().with_move_cap(2);
        play(&mut context, &["e2e4"]);
        assert_eq!(context.status(), GameStatus::InProgress);
        play(&mut context, &["e7e5"]);
        assert_eq!(context.status(), GameStatus::DrawMoveCap);
    }

    #[test]
    fn test_fingerprint_after_matches_applied_move() {
        let mut context = GameContext::new();
        play(&mut context, &["e2e4", "c7c5", "g1f3"]);
        let mv = context.parse_uci("d7d6").unwrap();
        let predicted = context.fingerprint_after(mv);
        context.apply_move(mv);
        assert_eq!(predicted, context.fingerprint());
    }

    #[test]
    fn test_fingerprint_depends_on_history() {
        // Same board reached through different move orders
        let mut a = GameContext::new();
        play(&mut a, &["g1f3", "g8f6", "b1c3"]);
        let mut b = GameContext::new();
        play(&mut b, &["b1c3", "g8f6", "g1f3"]);
        assert_eq!(a.board().get_hash(), b.board().get_hash());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_illegal_move_is_rejected() {
        let mut context = GameContext::new();
        let illegal = ChessMove::new(chess::Square::E2, chess::Square::E5, None);
        assert!(matches!(
            context.try_apply_move(illegal),
            Err(GameError::IllegalMove(_))
        ));
        assert!(matches!(context.parse_uci("e2e5"), Err(GameError::UnknownMove(_))));
    }
}
