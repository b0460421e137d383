//! End-to-end search scenarios on real chess positions.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chess::{ChessMove, Color};
use zero_chess::mcts::coordinator::PlayoutParams;
use zero_chess::mcts::dirichlet::DirichletNoise;
use zero_chess::mcts::{
    EvaluationBatcher, EvaluationCache, RecordKind, SearchCoordinator, SearchGraph, SearchNode,
};
use zero_chess::neural::{policy_index, FeatureTensor};
use zero_chess::{
    BiasedEvaluator, Evaluator, EvaluatorError, EvaluatorOutput, GameContext, GameStatus,
    NodeState, SearchConfig, SearchError, SearchReport, SearchStrategy, StopMode,
    UniformEvaluator,
};

const PROMOTION_MATE: &str = "8/8/8/8/8/1r4k1/1p6/7K b - - 0 1";
/// White mates in two with Kg6 (or Kf7), never in one.
const ROOK_MATE_IN_TWO: &str = "7k/8/5K2/8/8/8/8/R7 w - - 0 1";

/// Uniform answers, except for the calls numbered in `failing` (first call is 1).
struct FlakyEvaluator {
    failing: Range<usize>,
    calls: AtomicUsize,
}

impl FlakyEvaluator {
    fn new(failing: Range<usize>) -> Self {
        Self {
            failing,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Evaluator for FlakyEvaluator {
    fn evaluate(&self, batch: &[FeatureTensor]) -> Result<Vec<EvaluatorOutput>, EvaluatorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            return Err(EvaluatorError::Backend(format!("call {} lost", call)));
        }
        UniformEvaluator::new(0.0).evaluate(batch)
    }
}

fn batcher_with_root(
    evaluator: Arc<dyn Evaluator>,
    context: &GameContext,
    batch_size: usize,
) -> EvaluationBatcher {
    let batcher = EvaluationBatcher::new(
        evaluator,
        Arc::new(EvaluationCache::new(100_000).unwrap()),
        Arc::new(SearchGraph::new()),
        batch_size,
        DirichletNoise::new(0.3, 0.25).unwrap(),
        11,
    )
    .unwrap();
    let record = batcher
        .cache()
        .get_or_create(context.fingerprint(), RecordKind::Root);
    batcher
        .graph()
        .reset_with_root(|id, order| {
            record.bind(id, None, |_| false)?;
            Ok(SearchNode::new(
                id,
                None,
                !context.side_to_move(),
                order,
                None,
                NodeState::Root,
                record,
            ))
        })
        .unwrap();
    batcher
}

fn params(context: &GameContext) -> PlayoutParams {
    PlayoutParams {
        searching_side: context.side_to_move(),
        cpuct: 2.5,
        dirichlet: false,
        seed: 42,
    }
}

fn run_search(
    batcher: &EvaluationBatcher,
    context: &GameContext,
    workers: usize,
    stop: StopMode,
) -> SearchReport {
    let coordinator = SearchCoordinator::new(workers, stop).unwrap();
    coordinator.run(batcher, context, params(context)).unwrap()
}

/// First moves after which every reply allows a mate.
fn mates_in_two(position: &GameContext) -> Vec<ChessMove> {
    let mates = |answer: &GameContext| {
        answer.legal_moves().into_iter().any(|mv| {
            let mut end = answer.clone();
            end.apply_move(mv);
            matches!(end.status(), GameStatus::Checkmate(_))
        })
    };
    position
        .legal_moves()
        .into_iter()
        .filter(|&first| {
            let mut after = position.clone();
            after.apply_move(first);
            let replies = after.legal_moves();
            !replies.is_empty()
                && replies.iter().all(|&reply| {
                    let mut answer = after.clone();
                    answer.apply_move(reply);
                    mates(&answer)
                })
        })
        .collect()
}

fn assert_no_virtual_loss(graph: &SearchGraph) {
    let root = graph.root().unwrap();
    for id in graph.subtree_ids(root.id()) {
        let node = graph.node(id).unwrap();
        assert_eq!(node.virtual_loss(), 0, "virtual loss left on {}", node);
    }
}

fn small_config(workers: usize, playouts: usize) -> SearchConfig {
    SearchConfig::default()
        .with_workers(workers)
        .with_stop(StopMode::Playouts(playouts))
        .with_batch_size(8)
        .with_cache_capacity(100_000)
        .without_noise()
}

#[test]
fn test_promotion_mate_is_found_and_played() {
    let position = GameContext::from_fen(PROMOTION_MATE).unwrap();
    let push = position.parse_uci("b2b1q").unwrap();
    let rook_push = position.parse_uci("b2b1r").unwrap();
    let evaluator = BiasedEvaluator::new(0.0, [policy_index(push, Color::Black)], 50.0);

    let mut strategy = SearchStrategy::new(small_config(2, 800), Arc::new(evaluator)).unwrap();
    strategy.new_game(position.clone()).unwrap();
    let legal = position.legal_moves();
    let chosen = strategy.choose_move(None, &legal).unwrap();

    assert!(chosen == push || chosen == rook_push, "played {}", chosen);
    let result = strategy.search_result().unwrap();
    assert!(!result.fallback);
    assert_eq!(result.report.playouts, 800);
    let best = result.best_child().unwrap();
    assert_eq!(best.state, NodeState::Win);
    assert_eq!(best.expected_reward, 1.0);
}

#[test]
fn test_mate_in_two_travels_up_the_tree() {
    let position = GameContext::from_fen(ROOK_MATE_IN_TWO).unwrap();
    let winning = mates_in_two(&position);
    assert!(winning.contains(&position.parse_uci("f6g6").unwrap()));

    let mut strategy =
        SearchStrategy::new(small_config(1, 3000), Arc::new(UniformEvaluator::new(0.0))).unwrap();
    strategy.new_game(position.clone()).unwrap();
    let chosen = strategy.choose_move(None, &position.legal_moves()).unwrap();

    assert!(winning.contains(&chosen), "played {}", chosen);
    let result = strategy.search_result().unwrap();
    let best = result.best_child().unwrap();
    assert_eq!(best.state, NodeState::Intermediate);
    assert!(best.expected_reward > 0.5, "q = {}", best.expected_reward);
}

#[test]
fn test_single_worker_search_is_deterministic() {
    let context = GameContext::new();
    let favoured = [
        policy_index(context.parse_uci("e2e4").unwrap(), Color::White),
        policy_index(context.parse_uci("g1f3").unwrap(), Color::White),
    ];
    let run = || {
        let evaluator = BiasedEvaluator::new(0.1, favoured, 3.0);
        let mut strategy =
            SearchStrategy::new(small_config(1, 200).with_seed(99), Arc::new(evaluator)).unwrap();
        let legal = strategy.context().legal_moves();
        let mv = strategy.choose_move(None, &legal).unwrap();
        let result = strategy.search_result().unwrap().clone();
        let visits: Vec<(ChessMove, u32)> =
            result.children.iter().map(|c| (c.mv, c.visits)).collect();
        (mv, visits, result.root_visits)
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert!(first.2 > 0);
}

#[test]
fn test_virtual_loss_is_balanced_after_single_worker_search() {
    let context = GameContext::new();
    let batcher = batcher_with_root(Arc::new(UniformEvaluator::new(0.0)), &context, 4);
    let report = run_search(&batcher, &context, 1, StopMode::Playouts(300));

    assert_eq!(report.playouts, 300);
    assert_no_virtual_loss(batcher.graph());
    let root = batcher.graph().root().unwrap();
    assert!(root.visits() > 0);
    assert!(root.visits() as usize <= report.playouts);
}

#[test]
fn test_multithreaded_search_leaves_a_consistent_graph() {
    let context = GameContext::new();
    let batcher = batcher_with_root(Arc::new(UniformEvaluator::new(0.0)), &context, 8);
    let report = run_search(&batcher, &context, 4, StopMode::Playouts(400));

    assert_eq!(report.playouts, 400);
    assert_eq!(batcher.pending_requests(), 0);
    assert_no_virtual_loss(batcher.graph());
    assert_eq!(
        batcher.graph().live_nodes(),
        batcher.graph().subtree_ids(batcher.graph().root().unwrap().id()).len()
    );
}

#[test]
fn test_forced_flush_resolves_a_partial_batch() {
    let context = GameContext::new();
    let batcher = batcher_with_root(Arc::new(UniformEvaluator::new(0.0)), &context, 64);
    let report = run_search(&batcher, &context, 1, StopMode::Playouts(10));

    // One call to prime the root, one for the final flush
    assert_eq!(report.batches.evaluator_calls, 2);
    assert_eq!(batcher.pending_requests(), 0);
    assert_eq!(batcher.pending_propagations(), 0);
    assert_eq!(batcher.graph().root().unwrap().visits(), 10);
}

#[test]
fn test_time_budget_stops_the_search() {
    let context = GameContext::new();
    let batcher = batcher_with_root(Arc::new(UniformEvaluator::new(0.0)), &context, 8);
    let budget = Duration::from_millis(50);
    let report = run_search(&batcher, &context, 2, StopMode::Time(budget));

    assert!(report.playouts > 0);
    assert!(report.elapsed >= budget);
    assert_no_virtual_loss(batcher.graph());
}

#[test]
fn test_multithreaded_strategy_with_root_noise() {
    let config = SearchConfig::default()
        .with_workers(4)
        .with_stop(StopMode::Playouts(400))
        .with_batch_size(8);
    let mut strategy = SearchStrategy::new(config, Arc::new(UniformEvaluator::new(0.0))).unwrap();
    let legal = strategy.context().legal_moves();
    let mv = strategy.choose_move(None, &legal).unwrap();

    assert!(legal.contains(&mv));
    let result = strategy.search_result().unwrap();
    assert!(!result.fallback);
    assert_eq!(result.report.playouts, 400);
}

#[test]
fn test_evaluator_failure_aborts_every_worker() {
    let context = GameContext::new();
    let evaluator = Arc::new(FlakyEvaluator::new(6..usize::MAX));
    let batcher = batcher_with_root(evaluator.clone(), &context, 4);
    let coordinator = SearchCoordinator::new(4, StopMode::Playouts(2000)).unwrap();

    assert_matches!(
        coordinator.run(&batcher, &context, params(&context)),
        Err(SearchError::Evaluator(EvaluatorError::Backend(_)))
    );
    // The failing call plus at most one more per other worker
    assert!(evaluator.calls() <= 9, "{} evaluator calls", evaluator.calls());
    assert!(batcher.graph().root().unwrap().visits() < 2000);
    assert!(batcher.pending_requests() > 0);
    assert_no_virtual_loss(batcher.graph());
}

#[test]
fn test_conflicting_binding_aborts_the_search() {
    let context = GameContext::new();
    let e4 = context.parse_uci("e2e4").unwrap();
    let d4 = context.parse_uci("d2d4").unwrap();
    let evaluator = BiasedEvaluator::new(0.0, [policy_index(e4, Color::White)], 1000.0);
    let batcher = batcher_with_root(Arc::new(evaluator), &context, 1);

    // d2d4 holds the record of the position after e2e4
    let graph = Arc::clone(batcher.graph());
    let root = graph.root().unwrap();
    let record = batcher
        .cache()
        .get_or_create(context.fingerprint_after(e4), RecordKind::Intermediate);
    graph
        .expand_child(&root, d4, |id, order| {
            record.bind(id, Some(d4), |other| graph.is_live(other))?;
            Ok(SearchNode::new(
                id,
                Some(d4),
                Color::White,
                order,
                Some(root.id()),
                NodeState::Intermediate,
                record,
            ))
        })
        .unwrap();

    let coordinator = SearchCoordinator::new(2, StopMode::Playouts(400)).unwrap();
    assert_matches!(
        coordinator.run(&batcher, &context, params(&context)),
        Err(SearchError::ConflictingBinding { .. })
    );
}

#[test]
fn test_strategy_recovers_after_a_failed_batch() {
    let evaluator = Arc::new(FlakyEvaluator::new(6..7));
    let mut strategy = SearchStrategy::new(small_config(4, 2000), evaluator.clone()).unwrap();
    let legal = strategy.context().legal_moves();

    assert_matches!(
        strategy.choose_move(None, &legal),
        Err(SearchError::Evaluator(_))
    );
    assert_eq!(strategy.context().ply(), 0);

    let mv = strategy.choose_move(None, &legal).unwrap();
    assert!(legal.contains(&mv));
    assert!(evaluator.calls() > 6);
    let graph = strategy.graph();
    for id in graph.subtree_ids(graph.root().unwrap().id()) {
        let node = graph.node(id).unwrap();
        let record = node.record();
        assert!(
            record.is_initialized() || !record.snapshot().submitted,
            "evaluation of {} was lost",
            node
        );
    }
}
