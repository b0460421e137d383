//! One playout through the search graph.
//!
//! The walker descends from the root with a private copy of the game context,
//! choosing moves by PUCT and holding one virtual loss on every child it steps
//! into. A playout ends when it creates a child, reaches an unresolved node
//! (it then waits on that node's evaluation), or hits a terminal position.
//! Value updates are never applied here: they are registered on the records
//! and delivered by the batcher.

use std::sync::Arc;

use chess::{ChessMove, Color};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::game::{GameContext, GameStatus};
use crate::mcts::batcher::EvaluationBatcher;
use crate::mcts::cache::TerminalOutcome;
use crate::mcts::error::SearchError;
use crate::mcts::node::{NodeState, SearchNode};
use crate::mcts::record::RecordKind;
use crate::mcts::selection::select_child;

/// How a playout ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutOutcome {
    /// Created a new child.
    Expanded,
    /// Reached a node still waiting for the evaluator.
    Coalesced,
    /// Found a new terminal position.
    Terminal,
    /// Reached a node already pinned to an exact value.
    Rediscovered,
}

/// Maps a finished game onto a node state relative to `searching_side`.
pub fn terminal_state(status: GameStatus, searching_side: Color) -> NodeState {
    match (status.winner(), status.draw_kind()) {
        (Some(winner), _) if winner == searching_side => NodeState::Win,
        (Some(_), _) => NodeState::Lose,
        (None, Some(kind)) => NodeState::Draw(kind),
        (None, None) => NodeState::Intermediate,
    }
}

pub struct SearchWalker<'a> {
    batcher: &'a EvaluationBatcher,
    searching_side: Color,
    cpuct: f64,
    dirichlet: bool,
    rng: StdRng,
}

impl<'a> SearchWalker<'a> {
    pub fn new(
        batcher: &'a EvaluationBatcher,
        searching_side: Color,
        cpuct: f64,
        dirichlet: bool,
        seed: u64,
    ) -> Self {
        Self {
            batcher,
            searching_side,
            cpuct,
            dirichlet,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Runs one playout from `root`, whose position is `context`.
    pub fn run(
        &mut self,
        root: &Arc<SearchNode>,
        context: &GameContext,
    ) -> Result<PlayoutOutcome, SearchError> {
        let mut context = context.clone();
        self.descend(root, &mut context, 0)
    }

    fn descend(
        &mut self,
        node: &Arc<SearchNode>,
        context: &mut GameContext,
        depth: usize,
    ) -> Result<PlayoutOutcome, SearchError> {
        self.batcher.flush(false)?;

        let record = node.record();
        if node.is_pinned() {
            self.batcher.enqueue_propagation(record, 1);
            return Ok(PlayoutOutcome::Rediscovered);
        }
        if !record.is_initialized() {
            self.batcher
                .submit_record(record, context, depth == 0 && self.dirichlet);
            self.batcher.enqueue_propagation(record, 1);
            return Ok(PlayoutOutcome::Coalesced);
        }
        node.sync_sum();

        let selection = select_child(
            node,
            context,
            self.batcher.graph(),
            self.batcher.cache(),
            self.cpuct,
            &mut self.rng,
        )?;
        let Some(selection) = selection else {
            // Resolved as a regular position but nothing is playable
            let status = context.status();
            self.pin_terminal(node, status)?;
            return Ok(PlayoutOutcome::Terminal);
        };

        log::trace!(
            "🔎 depth {} {} -> {} (score {:.4})",
            depth,
            node.id(),
            selection.mv,
            selection.score
        );

        match selection.child {
            Some(child) => self.step_into(&child, selection.mv, context, depth),
            None => self.expand(node, selection.mv, context, depth),
        }
    }

    fn step_into(
        &mut self,
        child: &Arc<SearchNode>,
        mv: ChessMove,
        context: &mut GameContext,
        depth: usize,
    ) -> Result<PlayoutOutcome, SearchError> {
        child.add_virtual_loss();
        context.apply_move(mv);
        let result = self.visit(child, context, depth + 1);
        child.remove_virtual_loss();
        result
    }

    fn visit(
        &mut self,
        child: &Arc<SearchNode>,
        context: &mut GameContext,
        depth: usize,
    ) -> Result<PlayoutOutcome, SearchError> {
        if child.is_pinned() {
            self.batcher.enqueue_propagation(child.record(), 1);
            return Ok(PlayoutOutcome::Rediscovered);
        }
        let status = context.status();
        if status.is_terminal() {
            self.pin_terminal(child, status)?;
            return Ok(PlayoutOutcome::Terminal);
        }
        self.descend(child, context, depth)
    }

    fn expand(
        &mut self,
        node: &Arc<SearchNode>,
        mv: ChessMove,
        context: &mut GameContext,
        depth: usize,
    ) -> Result<PlayoutOutcome, SearchError> {
        let mover = context.side_to_move();
        let key = context.fingerprint_after(mv);
        let graph = self.batcher.graph();
        let cache = self.batcher.cache();

        let (child, created) = graph.expand_child(node, mv, |id, order| {
            let record = cache.get_or_create(key, RecordKind::Intermediate);
            record.bind(id, Some(mv), |other| graph.is_live(other))?;
            Ok(SearchNode::new(
                id,
                Some(mv),
                mover,
                order,
                Some(node.id()),
                NodeState::Intermediate,
                record,
            ))
        })?;
        if !created {
            // Another walker expanded the same move first
            return self.step_into(&child, mv, context, depth);
        }

        context.apply_move(mv);
        let status = context.status();
        if status.is_terminal() {
            let exact = cache
                .sentinel(TerminalOutcome::from_reward(status.reward_for(mover)))
                .value();
            child.create_leaf(terminal_state(status, self.searching_side));
            child.reset_expected_reward(exact);
            self.batcher.enqueue_propagation(child.record(), 1);
            log::trace!("🏁 {} reached {:?} at depth {}", mv, status, depth + 1);
            return Ok(PlayoutOutcome::Terminal);
        }

        let record = child.record();
        if !record.is_initialized() {
            self.batcher.submit_record(record, context, false);
        }
        child.sync_sum();
        self.batcher.enqueue_propagation(record, 1);
        Ok(PlayoutOutcome::Expanded)
    }

    fn pin_terminal(&self, node: &Arc<SearchNode>, status: GameStatus) -> Result<(), SearchError> {
        let exact = status.reward_for(node.mover());
        self.batcher
            .retract_and_pin(node, exact, terminal_state(status, self.searching_side))
    }
}
