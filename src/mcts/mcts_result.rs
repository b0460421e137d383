use chess::{ChessMove, Color};

use crate::mcts::coordinator::SearchReport;
use crate::mcts::node::NodeState;
use crate::neural::{policy_index, POLICY_SIZE};

/// Statistics of one root move after a search.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSummary {
    pub mv: ChessMove,
    pub visits: u32,
    pub expected_reward: f64,
    pub prior: f32,
    pub state: NodeState,
}

/// Snapshot of a finished search, taken before the graph is re-rooted.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub best_move: ChessMove,
    /// Side to move at the root.
    pub side: Color,
    /// Root value for the side to move.
    pub root_value: f64,
    pub root_visits: u32,
    /// Root moves, most visited first.
    pub children: Vec<ChildSummary>,
    /// The best move was not backed by the search (random legal move).
    pub fallback: bool,
    pub report: SearchReport,
}

impl SearchResult {
    /// Share of root visits per move.
    pub fn visit_distribution(&self) -> Vec<(ChessMove, f64)> {
        let total: u64 = self.children.iter().map(|c| u64::from(c.visits)).sum();
        if total == 0 {
            return Vec::new();
        }
        self.children
            .iter()
            .map(|c| (c.mv, f64::from(c.visits) / total as f64))
            .collect()
    }

    /// Visit distribution laid out over the policy index space, as a training target.
    pub fn policy_target(&self) -> Vec<f32> {
        let mut target = vec![0.0f32; POLICY_SIZE];
        for (mv, share) in self.visit_distribution() {
            target[policy_index(mv, self.side)] = share as f32;
        }
        target
    }

    pub fn best_child(&self) -> Option<&ChildSummary> {
        self.children.iter().find(|c| c.mv == self.best_move)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::Square;

    fn summary(mv: ChessMove, visits: u32) -> ChildSummary {
        ChildSummary {
            mv,
            visits,
            expected_reward: 0.0,
            prior: 0.0,
            state: NodeState::Intermediate,
        }
    }

    #[test]
    fn test_visit_distribution_and_policy_target() {
        let e4 = ChessMove::new(Square::E2, Square::E4, None);
        let d4 = ChessMove::new(Square::D2, Square::D4, None);
        let result = SearchResult {
            best_move: e4,
            side: Color::White,
            root_value: 0.1,
            root_visits: 4,
            children: vec![summary(e4, 3), summary(d4, 1)],
            fallback: false,
            report: SearchReport::default(),
        };
        assert_eq!(result.visit_distribution(), vec![(e4, 0.75), (d4, 0.25)]);
        let target = result.policy_target();
        assert_eq!(target[policy_index(e4, Color::White)], 0.75);
        assert!((target.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(result.best_child().unwrap().visits, 3);
    }
}
