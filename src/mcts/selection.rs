//! PUCT move selection.
//!
//! score = exploitation + prior × cpuct_adaptive × sqrt(N_parent) / (1 + N_child)
//!
//! with cpuct_adaptive = cpuct + ln((ΣN_child + 1 + base) / base). Exploitation
//! is the child's expected reward with virtual loss, or the cached evaluation
//! of a child position that has no node yet, or 0.

use std::collections::HashMap;
use std::sync::Arc;

use chess::ChessMove;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

use crate::game::GameContext;
use crate::mcts::arena::SearchGraph;
use crate::mcts::cache::EvaluationCache;
use crate::mcts::error::SearchError;
use crate::mcts::node::SearchNode;
use crate::neural::policy_index;

pub const CPUCT_BASE: f64 = 19652.0;

const TIE_EPSILON: f64 = 1e-12;

pub fn adaptive_cpuct(cpuct: f64, child_visit_sum: u64) -> f64 {
    cpuct + ((child_visit_sum as f64 + 1.0 + CPUCT_BASE) / CPUCT_BASE).ln()
}

pub fn exploration_bonus(prior: f64, cpuct_adaptive: f64, parent_visits: u32, child_visits: u32) -> f64 {
    if parent_visits == 0 {
        return 0.0;
    }
    prior * cpuct_adaptive * f64::from(parent_visits).sqrt() / (1.0 + f64::from(child_visits))
}

/// Selected move and its node when one already exists.
#[derive(Debug, Clone)]
pub struct Selection {
    pub mv: ChessMove,
    pub child: Option<Arc<SearchNode>>,
    pub score: f64,
}

/// Picks the best legal move below `node` for the side to move in `context`.
/// Ties are broken uniformly at random. `Ok(None)` when there is no legal move.
pub fn select_child(
    node: &SearchNode,
    context: &GameContext,
    graph: &SearchGraph,
    cache: &EvaluationCache,
    cpuct: f64,
    rng: &mut StdRng,
) -> Result<Option<Selection>, SearchError> {
    let legal = context.legal_moves();
    if legal.is_empty() {
        return Ok(None);
    }
    let side = context.side_to_move();
    let existing: HashMap<ChessMove, Arc<SearchNode>> = node
        .children()
        .into_iter()
        .filter_map(|(mv, id)| graph.get(id).map(|child| (mv, child)))
        .collect();

    let child_visit_sum: u64 = existing.values().map(|child| u64::from(child.visits())).sum();
    let cpuct_adaptive = adaptive_cpuct(cpuct, child_visit_sum);
    let parent_visits = node.visits();
    let record = node.record();

    let mut best = f64::NEG_INFINITY;
    let mut ties: Vec<Selection> = Vec::new();
    for mv in legal {
        let child = existing.get(&mv).cloned();
        let (exploitation, child_visits) = match &child {
            Some(child) => (child.expected_reward(true), child.visits()),
            None => {
                let cached = cache
                    .peek(context.fingerprint_after(mv))
                    .filter(|record| record.is_initialized())
                    .map_or(0.0, |record| record.value());
                (cached, 0)
            }
        };
        let prior = f64::from(record.prior(policy_index(mv, side)));
        let score =
            exploitation + exploration_bonus(prior, cpuct_adaptive, parent_visits, child_visits);

        if score > best + TIE_EPSILON {
            best = score;
            ties.clear();
            ties.push(Selection { mv, child, score });
        } else if (score - best).abs() <= TIE_EPSILON {
            ties.push(Selection { mv, child, score });
        }
    }

    Ok(ties.choose(rng).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcts::node::NodeState;
    use crate::mcts::record::{EvaluationRecord, RecordKind};
    use crate::neural::legal_policy_indices;
    use chess::Color;
    use rand::SeedableRng;

    fn root_for(context: &GameContext, graph: &SearchGraph, raw: &[f32]) -> Arc<SearchNode> {
        let record = Arc::new(EvaluationRecord::new(context.fingerprint(), RecordKind::Root));
        record.resolve(0.0, raw, &legal_policy_indices(context));
        let root = graph
            .reset_with_root(|id, order| {
                Ok(SearchNode::new(id, None, Color::Black, order, None, NodeState::Root, record))
            })
            .unwrap();
        root.sync_sum();
        root
    }

    #[test]
    fn test_adaptive_cpuct_grows_slowly() {
        assert!((adaptive_cpuct(2.5, 0) - 2.5).abs() < 1e-3);
        assert!(adaptive_cpuct(2.5, 100_000) > 3.5);
    }

    #[test]
    fn test_no_exploration_without_parent_visits() {
        assert_eq!(exploration_bonus(0.9, 2.5, 0, 0), 0.0);
        assert!((exploration_bonus(0.5, 2.0, 4, 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_prior_drives_selection_once_visited() {
        let context = GameContext::new();
        let graph = SearchGraph::new();
        let cache = EvaluationCache::new(16).unwrap();
        let favoured = context.parse_uci("g1f3").unwrap();
        let mut raw = vec![1.0f32; crate::neural::POLICY_SIZE];
        raw[policy_index(favoured, Color::White)] = 100.0;
        let root = root_for(&context, &graph, &raw);
        root.propagate(0.0);

        let mut rng = StdRng::seed_from_u64(7);
        let selection = select_child(&root, &context, &graph, &cache, 2.5, &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(selection.mv, favoured);
        assert!(selection.child.is_none());
    }

    #[test]
    fn test_cached_value_counts_for_unexpanded_children() {
        let context = GameContext::new();
        let graph = SearchGraph::new();
        let cache = EvaluationCache::new(16).unwrap();
        let root = root_for(&context, &graph, &vec![1.0; crate::neural::POLICY_SIZE]);

        let good = context.parse_uci("d2d4").unwrap();
        let record = cache.get_or_create(context.fingerprint_after(good), RecordKind::Intermediate);
        record.resolve(0.6, &[1.0], &[0]);

        // No visits at the root: exploitation alone decides
        let mut rng = StdRng::seed_from_u64(1);
        let selection = select_child(&root, &context, &graph, &cache, 2.5, &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(selection.mv, good);
    }

    #[test]
    fn test_ties_are_broken_by_the_rng() {
        let context = GameContext::new();
        let graph = SearchGraph::new();
        let cache = EvaluationCache::new(16).unwrap();
        let root = root_for(&context, &graph, &vec![1.0; crate::neural::POLICY_SIZE]);

        let picks: std::collections::HashSet<ChessMove> = (0..40)
            .map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                select_child(&root, &context, &graph, &cache, 2.5, &mut rng)
                    .unwrap()
                    .unwrap()
                    .mv
            })
            .collect();
        assert!(picks.len() > 1);
    }

    #[test]
    fn test_checkmated_side_has_nothing_to_select() {
        let context =
            GameContext::from_fen("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3")
                .unwrap();
        let graph = SearchGraph::new();
        let cache = EvaluationCache::new(16).unwrap();
        let root = root_for(&context, &graph, &[]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(select_child(&root, &context, &graph, &cache, 2.5, &mut rng)
            .unwrap()
            .is_none());
    }
}
