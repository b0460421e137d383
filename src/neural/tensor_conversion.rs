//! Position to feature planes, and moves to the fixed policy index space.
//!
//! Features are 8x8 planes seen from the side to move (ranks flipped for
//! Black): 12 piece planes for each of the last [`HISTORY_LEN`] boards, then
//! side-to-move, halfmove clock and repetition planes.
//!
//! Moves use the 8x8x73 layout: 56 queen-style planes (8 directions x 7
//! distances), 8 knight planes and 9 underpromotion planes. Queen promotions
//! share the queen-style planes.

use chess::{ChessMove, Color, Piece, Square};

use crate::game::{GameContext, HISTORY_LEN};

pub const BOARD_SQUARES: usize = 64;
pub const PLANES_PER_BOARD: usize = 12;
pub const INPUT_PLANES: usize = HISTORY_LEN * PLANES_PER_BOARD + 3;
pub const FEATURE_LEN: usize = INPUT_PLANES * BOARD_SQUARES;
pub const MOVE_PLANES: usize = 73;
pub const POLICY_SIZE: usize = BOARD_SQUARES * MOVE_PLANES;

/// Flattened `[INPUT_PLANES, 8, 8]` input of one position.
pub type FeatureTensor = Vec<f32>;

const QUEEN_DIRECTIONS: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

const KNIGHT_DELTAS: [(i32, i32); 8] = [
    (2, 1),
    (1, 2),
    (-1, 2),
    (-2, 1),
    (-2, -1),
    (-1, -2),
    (1, -2),
    (2, -1),
];

#[inline]
fn oriented(square: Square, side: Color) -> usize {
    match side {
        Color::White => square.to_index(),
        Color::Black => square.to_index() ^ 56,
    }
}

pub fn encode(context: &GameContext) -> FeatureTensor {
    let side = context.side_to_move();
    let mut planes = vec![0.0f32; FEATURE_LEN];

    let boards = std::iter::once(context.board()).chain(context.recent_boards().iter());
    for (age, board) in boards.take(HISTORY_LEN).enumerate() {
        for square in *board.combined() {
            let (Some(piece), Some(color)) = (board.piece_on(square), board.color_on(square)) else {
                continue;
            };
            let owner = if color == side { 0 } else { 6 };
            let plane = age * PLANES_PER_BOARD + owner + piece.to_index();
            planes[plane * BOARD_SQUARES + oriented(square, side)] = 1.0;
        }
    }

    let scalars = [
        if side == Color::White { 1.0 } else { 0.0 },
        context.halfmove_clock() as f32 / 100.0,
        context.repetition_count().saturating_sub(1) as f32 / 2.0,
    ];
    let base = HISTORY_LEN * PLANES_PER_BOARD;
    for (offset, value) in scalars.into_iter().enumerate() {
        let start = (base + offset) * BOARD_SQUARES;
        planes[start..start + BOARD_SQUARES].fill(value);
    }
    planes
}

/// Index of `mv` in the policy vector, from the point of view of `side` (the mover).
pub fn policy_index(mv: ChessMove, side: Color) -> usize {
    let from = oriented(mv.get_source(), side);
    let to = oriented(mv.get_dest(), side);
    let rank_delta = (to / 8) as i32 - (from / 8) as i32;
    let file_delta = (to % 8) as i32 - (from % 8) as i32;

    let plane = match mv.get_promotion() {
        Some(piece) if piece != Piece::Queen => {
            let slot = match piece {
                Piece::Knight => 0,
                Piece::Bishop => 1,
                _ => 2,
            };
            64 + (file_delta + 1).clamp(0, 2) as usize * 3 + slot
        }
        _ => match KNIGHT_DELTAS
            .iter()
            .position(|&delta| delta == (rank_delta, file_delta))
        {
            Some(knight) => 56 + knight,
            None => {
                let distance = rank_delta.abs().max(file_delta.abs()).clamp(1, 7);
                let direction = QUEEN_DIRECTIONS
                    .iter()
                    .position(|&dir| dir == (rank_delta.signum(), file_delta.signum()))
                    .unwrap_or(0);
                direction * 7 + (distance - 1) as usize
            }
        },
    };
    from * MOVE_PLANES + plane
}

/// Policy indices of every legal move, in move-generator order.
pub fn legal_policy_indices(context: &GameContext) -> Vec<usize> {
    let side = context.side_to_move();
    context
        .legal_moves()
        .into_iter()
        .map(|mv| policy_index(mv, side))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_unique_indices(context: &GameContext) {
        let indices = legal_policy_indices(context);
        let unique: HashSet<usize> = indices.iter().copied().collect();
        assert_eq!(unique.len(), indices.len());
        assert!(indices.iter().all(|&i| i < POLICY_SIZE));
    }

    #[test]
    fn test_indices_are_unique_for_legal_moves() {
        assert_unique_indices(&GameContext::new());
        // Promotions with captures on both sides, castling available
        assert_unique_indices(
            &GameContext::from_fen("r3k2r/1P4P1/8/8/8/8/1p4p1/R3K2R w KQkq - 0 1").unwrap(),
        );
        assert_unique_indices(
            &GameContext::from_fen("r3k2r/1P4P1/8/8/8/8/1p4p1/R3K2R b KQkq - 0 1").unwrap(),
        );
    }

    #[test]
    fn test_mirrored_moves_share_an_index() {
        let white = ChessMove::new(Square::E2, Square::E4, None);
        let black = ChessMove::new(Square::E7, Square::E5, None);
        assert_eq!(policy_index(white, Color::White), policy_index(black, Color::Black));
    }

    #[test]
    fn test_underpromotion_planes() {
        let queen = ChessMove::new(Square::B2, Square::B1, Some(Piece::Queen));
        let rook = ChessMove::new(Square::B2, Square::B1, Some(Piece::Rook));
        let push = ChessMove::new(Square::B2, Square::B1, None);
        assert_eq!(policy_index(queen, Color::Black), policy_index(push, Color::Black));
        assert_ne!(policy_index(queen, Color::Black), policy_index(rook, Color::Black));
        assert_eq!(policy_index(rook, Color::Black) % MOVE_PLANES, 64 + 3 + 2);
    }

    #[test]
    fn test_encode_shapes_and_side_plane() {
        let start = GameContext::new();
        let features = encode(&start);
        assert_eq!(features.len(), FEATURE_LEN);
        // 32 pieces on the current board, nothing in history yet
        let current: f32 = features[..PLANES_PER_BOARD * BOARD_SQUARES].iter().sum();
        assert_eq!(current, 32.0);
        let side_plane = HISTORY_LEN * PLANES_PER_BOARD * BOARD_SQUARES;
        assert_eq!(features[side_plane], 1.0);

        let mut after = start.clone();
        after.apply_move(after.parse_uci("e2e4").unwrap());
        let features = encode(&after);
        assert_eq!(features[side_plane], 0.0);
        let previous: f32 = features[PLANES_PER_BOARD * BOARD_SQUARES..2 * PLANES_PER_BOARD * BOARD_SQUARES]
            .iter()
            .sum();
        assert_eq!(previous, 32.0);
    }
}
