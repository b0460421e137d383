//! Search graph nodes.
//!
//! A node is one position reached by a specific move sequence from the root.
//! It owns its visit/value accumulators and virtual-loss counter and refers to
//! the shared [`EvaluationRecord`] of its position. Values are always expressed
//! from the point of view of the node's mover (the player who made `mv`).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chess::{ChessMove, Color};

use crate::game::DrawKind;
use crate::mcts::arena::NodeId;
use crate::mcts::error::SearchError;
use crate::mcts::lock;
use crate::mcts::record::EvaluationRecord;

/// Node state. WIN and LOSE are relative to the searching side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Root,
    Intermediate,
    Win,
    Lose,
    Draw(DrawKind),
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Win | NodeState::Lose | NodeState::Draw(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeStats {
    visits: u32,
    value_sum: f64,
    virtual_loss: u32,
    synced: bool,
    state: NodeState,
}

#[derive(Debug)]
pub struct SearchNode {
    id: NodeId,
    mv: Option<ChessMove>,
    mover: Color,
    fingerprint: u64,
    creation_order: u64,
    parent: Mutex<Option<NodeId>>,
    children: Mutex<Vec<(ChessMove, NodeId)>>,
    stats: Mutex<NodeStats>,
    record: Arc<EvaluationRecord>,
}

impl SearchNode {
    pub fn new(
        id: NodeId,
        mv: Option<ChessMove>,
        mover: Color,
        creation_order: u64,
        parent: Option<NodeId>,
        state: NodeState,
        record: Arc<EvaluationRecord>,
    ) -> Self {
        Self {
            id,
            mv,
            mover,
            fingerprint: record.key(),
            creation_order,
            parent: Mutex::new(parent),
            children: Mutex::new(Vec::new()),
            stats: Mutex::new(NodeStats {
                visits: 0,
                value_sum: 0.0,
                virtual_loss: 0,
                synced: false,
                state,
            }),
            record,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Move leading into this node, `None` for a root.
    pub fn mv(&self) -> Option<ChessMove> {
        self.mv
    }

    pub fn mover(&self) -> Color {
        self.mover
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn creation_order(&self) -> u64 {
        self.creation_order
    }

    pub fn record(&self) -> &Arc<EvaluationRecord> {
        &self.record
    }

    pub fn parent(&self) -> Option<NodeId> {
        *lock(&self.parent)
    }

    /// Attaches the node under `parent`. Moving a node under a different live
    /// parent would break the tree shape and is refused.
    pub fn set_parent(
        &self,
        parent: NodeId,
        is_live: impl Fn(NodeId) -> bool,
    ) -> Result<(), SearchError> {
        let mut current = lock(&self.parent);
        match *current {
            Some(existing) if existing != parent && is_live(existing) => {
                Err(SearchError::Reparent {
                    node: self.id,
                    current: existing,
                    requested: parent,
                })
            }
            _ => {
                *current = Some(parent);
                Ok(())
            }
        }
    }

    pub fn clear_parent(&self) {
        *lock(&self.parent) = None;
    }

    pub fn children(&self) -> Vec<(ChessMove, NodeId)> {
        lock(&self.children).clone()
    }

    pub fn child(&self, mv: ChessMove) -> Option<NodeId> {
        lock(&self.children)
            .iter()
            .find(|(child_move, _)| *child_move == mv)
            .map(|&(_, id)| id)
    }

    pub fn has_children(&self) -> bool {
        !lock(&self.children).is_empty()
    }

    /// Held while a child is created so two playouts cannot expand the same move.
    pub(crate) fn children_guard(&self) -> MutexGuard<'_, Vec<(ChessMove, NodeId)>> {
        lock(&self.children)
    }

    pub fn visits(&self) -> u32 {
        lock(&self.stats).visits
    }

    pub fn value_sum(&self) -> f64 {
        lock(&self.stats).value_sum
    }

    pub fn virtual_loss(&self) -> u32 {
        lock(&self.stats).virtual_loss
    }

    pub fn state(&self) -> NodeState {
        lock(&self.stats).state
    }

    pub fn set_state(&self, state: NodeState) {
        lock(&self.stats).state = state;
    }

    pub fn is_synced(&self) -> bool {
        lock(&self.stats).synced
    }

    pub fn is_pinned(&self) -> bool {
        self.record.is_pinned()
    }

    /// Starts the node's accumulators for this search once its record is
    /// resolved. Returns whether the node is synchronized.
    pub fn sync_sum(&self) -> bool {
        let initialized = self.record.is_initialized();
        let mut stats = lock(&self.stats);
        if stats.synced {
            return true;
        }
        if !initialized {
            return false;
        }
        stats.visits = 0;
        stats.value_sum = 0.0;
        stats.synced = true;
        true
    }

    pub fn reset_sync(&self) {
        lock(&self.stats).synced = false;
    }

    pub fn propagate(&self, value: f64) {
        let mut stats = lock(&self.stats);
        stats.value_sum += value;
        stats.visits += 1;
    }

    pub fn un_propagate(&self, value: f64) {
        let mut stats = lock(&self.stats);
        if stats.visits == 0 {
            log::warn!("⚠️ un_propagate on node {} with no visits", self.id);
            return;
        }
        stats.value_sum -= value;
        stats.visits -= 1;
    }

    pub fn add_virtual_loss(&self) {
        lock(&self.stats).virtual_loss += 1;
    }

    pub fn remove_virtual_loss(&self) {
        let mut stats = lock(&self.stats);
        debug_assert!(stats.virtual_loss > 0, "unpaired virtual loss on {}", self.id);
        stats.virtual_loss = stats.virtual_loss.saturating_sub(1);
    }

    /// Mean value for the mover. With virtual loss, every in-flight playout
    /// counts as one lost visit.
    pub fn expected_reward(&self, with_virtual_loss: bool) -> f64 {
        let prior_value = self.record.value();
        let stats = *lock(&self.stats);
        let virtual_loss = if with_virtual_loss {
            f64::from(stats.virtual_loss)
        } else {
            0.0
        };
        if stats.visits == 0 {
            (prior_value - virtual_loss) / (1.0 + virtual_loss)
        } else {
            (stats.value_sum - virtual_loss) / (f64::from(stats.visits) + virtual_loss)
        }
    }

    /// Detaches every child and tags the node terminal. Returns the detached
    /// children so the caller can free them.
    pub fn create_leaf(&self, state: NodeState) -> Vec<NodeId> {
        let detached = std::mem::take(&mut *lock(&self.children));
        lock(&self.stats).state = state;
        detached.into_iter().map(|(_, id)| id).collect()
    }

    /// Pins the record to the exact value and restarts the accumulators.
    pub fn reset_expected_reward(&self, exact: f64) {
        self.record.pin(exact);
        let mut stats = lock(&self.stats);
        stats.visits = 0;
        stats.value_sum = 0.0;
        stats.synced = true;
    }
}

impl fmt::Display for SearchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = *lock(&self.stats);
        write!(
            f,
            "{} {} visits={} q={:.3} vl={} {:?} synced={} [{}]",
            self.id,
            self.mv.map(|m| m.to_string()).unwrap_or_else(|| "root".to_string()),
            stats.visits,
            if stats.visits > 0 {
                stats.value_sum / f64::from(stats.visits)
            } else {
                self.record.value()
            },
            stats.virtual_loss,
            stats.state,
            stats.synced,
            self.record
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcts::record::RecordKind;
    use assert_matches::assert_matches;

    fn node_with_value(value: f64) -> SearchNode {
        let record = Arc::new(EvaluationRecord::new(99, RecordKind::Intermediate));
        record.resolve(value, &[1.0, 1.0], &[0, 1]);
        SearchNode::new(
            NodeId::new(3, 0),
            None,
            Color::White,
            0,
            None,
            NodeState::Intermediate,
            record,
        )
    }

    #[test]
    fn test_expected_reward_falls_back_to_record() {
        let node = node_with_value(0.4);
        assert!(node.sync_sum());
        assert!((node.expected_reward(false) - 0.4).abs() < 1e-12);

        node.propagate(1.0);
        node.propagate(0.0);
        assert!((node.expected_reward(false) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_virtual_loss_lowers_the_estimate() {
        let node = node_with_value(0.0);
        node.sync_sum();
        node.propagate(1.0);
        node.add_virtual_loss();
        // (1 - 1) / (1 + 1)
        assert_eq!(node.expected_reward(true), 0.0);
        assert_eq!(node.expected_reward(false), 1.0);
        node.remove_virtual_loss();
        assert_eq!(node.virtual_loss(), 0);
    }

    #[test]
    fn test_unresolved_node_does_not_sync() {
        let record = Arc::new(EvaluationRecord::new(5, RecordKind::Intermediate));
        let node = SearchNode::new(
            NodeId::new(0, 0),
            None,
            Color::White,
            0,
            None,
            NodeState::Root,
            Arc::clone(&record),
        );
        assert!(!node.sync_sum());
        record.resolve(0.0, &[1.0], &[0]);
        assert!(node.sync_sum());
        assert!(node.is_synced());
    }

    #[test]
    fn test_propagate_and_retract_cancel() {
        let node = node_with_value(0.0);
        node.sync_sum();
        node.propagate(0.25);
        node.propagate(-0.75);
        node.un_propagate(-0.75);
        assert_eq!(node.visits(), 1);
        assert_eq!(node.value_sum(), 0.25);
    }

    #[test]
    fn test_reparent_under_live_parent_fails() {
        let node = node_with_value(0.0);
        node.set_parent(NodeId::new(1, 0), |_| true).unwrap();
        node.set_parent(NodeId::new(1, 0), |_| true).unwrap();
        assert_matches!(
            node.set_parent(NodeId::new(2, 0), |_| true),
            Err(SearchError::Reparent { .. })
        );
        node.set_parent(NodeId::new(2, 0), |_| false).unwrap();
        assert_eq!(node.parent(), Some(NodeId::new(2, 0)));
    }

    #[test]
    fn test_create_leaf_pins_the_value() {
        let node = node_with_value(0.3);
        node.sync_sum();
        node.propagate(0.5);
        let detached = node.create_leaf(NodeState::Win);
        assert!(detached.is_empty());
        node.reset_expected_reward(1.0);

        assert_eq!(node.state(), NodeState::Win);
        assert_eq!(node.visits(), 0);
        assert_eq!(node.expected_reward(false), 1.0);
        assert!(node.is_pinned());
    }
}
