//! Driving API: one search per move, reusing the subtree of the move played.

use std::fmt;
use std::sync::Arc;

use chess::ChessMove;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;

use crate::game::GameContext;
use crate::mcts::arena::SearchGraph;
use crate::mcts::batcher::EvaluationBatcher;
use crate::mcts::cache::EvaluationCache;
use crate::mcts::coordinator::{PlayoutParams, SearchCoordinator, SearchReport, StopMode};
use crate::mcts::dirichlet::DirichletNoise;
use crate::mcts::error::SearchError;
use crate::mcts::hyperparameters::SearchHyperparameters;
use crate::mcts::mcts_result::{ChildSummary, SearchResult};
use crate::mcts::node::{NodeState, SearchNode};
use crate::mcts::record::RecordKind;
use crate::neural::{policy_index, Evaluator};

/// cpuct as a function of the game ply.
pub type CpuctSchedule = Arc<dyn Fn(usize) -> f64 + Send + Sync>;
/// Whether root noise is mixed in at a given game ply.
pub type DirichletSchedule = Arc<dyn Fn(usize) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SearchConfig {
    pub workers: usize,
    pub stop: StopMode,
    pub cpuct: CpuctSchedule,
    pub dirichlet: DirichletSchedule,
    pub batch_size: usize,
    pub cache_capacity: usize,
    pub seed: u64,
    pub dirichlet_alpha: f64,
    pub dirichlet_epsilon: f64,
    pub move_cap: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let params = SearchHyperparameters::default();
        let cpuct_params = params.clone();
        let noise_params = params.clone();
        Self {
            workers: params.workers,
            stop: StopMode::Playouts(params.playouts.unwrap_or(800)),
            cpuct: Arc::new(move |step| cpuct_params.get_c_puct(step)),
            dirichlet: Arc::new(move |step| noise_params.dirichlet_enabled(step)),
            batch_size: params.batch_size,
            cache_capacity: params.cache_capacity,
            seed: params.seed,
            dirichlet_alpha: params.dirichlet_alpha,
            dirichlet_epsilon: params.dirichlet_epsilon,
            move_cap: params.move_cap,
        }
    }
}

impl SearchConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_stop(mut self, stop: StopMode) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Same cpuct at every ply.
    pub fn with_cpuct(mut self, cpuct: f64) -> Self {
        self.cpuct = Arc::new(move |_| cpuct);
        self
    }

    pub fn without_noise(mut self) -> Self {
        self.dirichlet = Arc::new(|_| false);
        self
    }
}

impl fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchConfig")
            .field("workers", &self.workers)
            .field("stop", &self.stop)
            .field("cpuct(0)", &(self.cpuct)(0))
            .field("dirichlet(0)", &(self.dirichlet)(0))
            .field("batch_size", &self.batch_size)
            .field("cache_capacity", &self.cache_capacity)
            .field("seed", &self.seed)
            .field("dirichlet_alpha", &self.dirichlet_alpha)
            .field("dirichlet_epsilon", &self.dirichlet_epsilon)
            .field("move_cap", &self.move_cap)
            .finish()
    }
}

pub struct SearchStrategy {
    config: SearchConfig,
    evaluator: Arc<dyn Evaluator>,
    batcher: EvaluationBatcher,
    coordinator: SearchCoordinator,
    context: GameContext,
    searches: u64,
    last_result: Option<SearchResult>,
    rng: StdRng,
}

impl SearchStrategy {
    pub fn new(config: SearchConfig, evaluator: Arc<dyn Evaluator>) -> Result<Self, SearchError> {
        let coordinator = SearchCoordinator::new(config.workers, config.stop)?;
        let batcher = build_batcher(&config, &evaluator)?;
        let strategy = Self {
            context: GameContext::new().with_move_cap(config.move_cap),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            evaluator,
            batcher,
            coordinator,
            searches: 0,
            last_result: None,
        };
        strategy.install_root(None)?;
        log::info!(
            "♟️ Search strategy ready: {:?} with {} evaluator",
            strategy.config,
            strategy.evaluator.name()
        );
        Ok(strategy)
    }

    /// Replaces the configuration. Caches and graph start over.
    pub fn configure(&mut self, config: SearchConfig) -> Result<(), SearchError> {
        self.coordinator = SearchCoordinator::new(config.workers, config.stop)?;
        self.batcher = build_batcher(&config, &self.evaluator)?;
        self.context = self.context.clone().with_move_cap(config.move_cap);
        self.rng = StdRng::seed_from_u64(config.seed);
        self.config = config;
        self.last_result = None;
        self.install_root(None)?;
        Ok(())
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn context(&self) -> &GameContext {
        &self.context
    }

    pub fn graph(&self) -> &Arc<SearchGraph> {
        self.batcher.graph()
    }

    pub fn cache(&self) -> &Arc<EvaluationCache> {
        self.batcher.cache()
    }

    pub fn search_result(&self) -> Option<&SearchResult> {
        self.last_result.as_ref()
    }

    /// Starts a new game from `start` with empty caches.
    pub fn new_game(&mut self, start: GameContext) -> Result<(), SearchError> {
        self.context = start.with_move_cap(self.config.move_cap);
        self.clear_caches()
    }

    /// Drops every cached evaluation and the whole graph.
    pub fn clear_caches(&mut self) -> Result<(), SearchError> {
        self.batcher = build_batcher(&self.config, &self.evaluator)?;
        self.last_result = None;
        self.install_root(None)?;
        log::debug!("🧹 Caches cleared at ply {}", self.context.ply());
        Ok(())
    }

    /// Applies a move observed on the board and moves the root onto it,
    /// keeping its subtree when the search already explored it.
    pub fn set_root(&mut self, observed: Option<ChessMove>) -> Result<(), SearchError> {
        match observed {
            Some(mv) => {
                self.context.try_apply_move(mv)?;
                self.advance_root(mv)
            }
            None => {
                if self.graph().root().is_err() {
                    self.install_root(None)?;
                }
                Ok(())
            }
        }
    }

    /// Searches the current position after applying the opponent's last move,
    /// plays the chosen move on the internal context and re-roots onto it.
    pub fn choose_move(
        &mut self,
        opponent_last_move: Option<ChessMove>,
        legal_moves: &[ChessMove],
    ) -> Result<ChessMove, SearchError> {
        self.set_root(opponent_last_move)?;
        if legal_moves.is_empty() {
            return Err(SearchError::NoLegalMoves);
        }

        let step = self.context.ply();
        let params = PlayoutParams {
            searching_side: self.context.side_to_move(),
            cpuct: (self.config.cpuct)(step),
            dirichlet: (self.config.dirichlet)(step),
            seed: self
                .config
                .seed
                .wrapping_add(self.searches.wrapping_mul(0xD1B5_4A32_D192_ED03)),
        };
        self.searches += 1;
        let report = self.coordinator.run(&self.batcher, &self.context, params)?;

        let graph = Arc::clone(self.graph());
        let root = graph.root()?;
        let children: Vec<(ChessMove, Arc<SearchNode>)> = root
            .children()
            .into_iter()
            .filter_map(|(mv, id)| graph.get(id).map(|child| (mv, child)))
            .collect();

        let (chosen, fallback) = match final_choice(&children) {
            Some(mv) if legal_moves.contains(&mv) => (mv, false),
            candidate => {
                log::error!(
                    "🚨 No search move matches the {} legal moves (candidate {:?}), playing at random\n{}",
                    legal_moves.len(),
                    candidate.map(|mv| mv.to_string()),
                    graph.dump_subtree(root.id(), 1)
                );
                // Prefer listed moves the searched position can actually play
                let playable: Vec<ChessMove> = legal_moves
                    .iter()
                    .copied()
                    .filter(|&mv| self.context.is_legal(mv))
                    .collect();
                let pool: &[ChessMove] = if playable.is_empty() {
                    legal_moves
                } else {
                    &playable
                };
                let mv = *pool.choose(&mut self.rng).ok_or(SearchError::NoLegalMoves)?;
                (mv, true)
            }
        };

        self.last_result = Some(self.summarize(&root, &children, chosen, fallback, report));
        log::debug!(
            "✅ Ply {}: {} after {} playouts",
            step,
            chosen,
            report.playouts
        );

        if !self.context.is_legal(chosen) {
            log::error!(
                "🚨 {} cannot be played from {}, the caller's position differs; keeping the current root",
                chosen,
                self.context.board()
            );
            return Ok(chosen);
        }
        if fallback && root.child(chosen).is_none() {
            self.create_child(&root, chosen)?;
        }
        self.context.try_apply_move(chosen)?;
        self.advance_root(chosen)?;
        Ok(chosen)
    }

    fn install_root(&self, mv: Option<ChessMove>) -> Result<Arc<SearchNode>, SearchError> {
        let graph = self.graph();
        let record = self
            .cache()
            .get_or_create(self.context.fingerprint(), RecordKind::Root);
        record.set_kind(RecordKind::Root);
        let mover = !self.context.side_to_move();
        graph.reset_with_root(|id, order| {
            record.bind(id, mv, |other| graph.is_live(other))?;
            Ok(SearchNode::new(id, mv, mover, order, None, NodeState::Root, record))
        })
    }

    fn advance_root(&self, mv: ChessMove) -> Result<(), SearchError> {
        let graph = self.graph();
        let root = graph.root()?;
        match root.child(mv).and_then(|id| graph.get(id)) {
            Some(child) => {
                graph.set_as_root(child.id())?;
                if !child.state().is_terminal() {
                    child.set_state(NodeState::Root);
                }
                child.record().set_kind(RecordKind::Root);
                log::debug!(
                    "♻️ Reusing subtree of {} ({} visits, {} live nodes)",
                    mv,
                    child.visits(),
                    graph.live_nodes()
                );
            }
            None => {
                self.install_root(Some(mv))?;
            }
        }
        Ok(())
    }

    /// Creates the child of `root` reached by `mv` outside of a search.
    fn create_child(&self, root: &SearchNode, mv: ChessMove) -> Result<(), SearchError> {
        let graph = self.graph();
        let cache = self.cache();
        let key = self.context.fingerprint_after(mv);
        let mover = self.context.side_to_move();
        graph.expand_child(root, mv, |id, order| {
            let record = cache.get_or_create(key, RecordKind::Intermediate);
            record.bind(id, Some(mv), |other| graph.is_live(other))?;
            Ok(SearchNode::new(
                id,
                Some(mv),
                mover,
                order,
                Some(root.id()),
                NodeState::Intermediate,
                record,
            ))
        })?;
        Ok(())
    }

    fn summarize(
        &self,
        root: &SearchNode,
        children: &[(ChessMove, Arc<SearchNode>)],
        best_move: ChessMove,
        fallback: bool,
        report: SearchReport,
    ) -> SearchResult {
        let side = self.context.side_to_move();
        let mut summaries: Vec<ChildSummary> = children
            .iter()
            .map(|(mv, child)| ChildSummary {
                mv: *mv,
                visits: child.visits(),
                expected_reward: child.expected_reward(false),
                prior: root.record().prior(policy_index(*mv, side)),
                state: child.state(),
            })
            .collect();
        summaries.sort_by_key(|summary| std::cmp::Reverse(summary.visits));
        SearchResult {
            best_move,
            side,
            root_value: -root.expected_reward(false),
            root_visits: root.visits(),
            children: summaries,
            fallback,
            report,
        }
    }
}

/// Final move: a mating child if there is one, otherwise the best
/// `expected_reward + ln(1 + sqrt(visits))`.
fn final_choice(children: &[(ChessMove, Arc<SearchNode>)]) -> Option<ChessMove> {
    let winning = children
        .iter()
        .filter(|(_, child)| child.state() == NodeState::Win)
        .max_by_key(|(_, child)| child.visits());
    if let Some((mv, _)) = winning {
        return Some(*mv);
    }

    let mut best: Option<(ChessMove, f64)> = None;
    for (mv, child) in children {
        let score = child.expected_reward(false) + (1.0 + f64::from(child.visits()).sqrt()).ln();
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((*mv, score));
        }
    }
    best.map(|(mv, _)| mv)
}

fn build_batcher(
    config: &SearchConfig,
    evaluator: &Arc<dyn Evaluator>,
) -> Result<EvaluationBatcher, SearchError> {
    EvaluationBatcher::new(
        Arc::clone(evaluator),
        Arc::new(EvaluationCache::new(config.cache_capacity)?),
        Arc::new(SearchGraph::new()),
        config.batch_size,
        DirichletNoise::new(config.dirichlet_alpha, config.dirichlet_epsilon)?,
        config.seed,
    )
}
