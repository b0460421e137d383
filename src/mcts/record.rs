//! Evaluation records: one evaluator result per position fingerprint.
//!
//! A record holds the value of a position from the mover's point of view and
//! the move priors restricted to the legal policy indices. Records are shared
//! through the cache, so several search paths (transpositions, later searches
//! after a re-root) can reuse one evaluation. At most one live node is bound to
//! a record at a time; propagations registered on the record are delivered
//! through that node.

use std::fmt;
use std::sync::Mutex;

use chess::ChessMove;

use crate::mcts::arena::NodeId;
use crate::mcts::error::SearchError;
use crate::mcts::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Root,
    Intermediate,
    Leaf,
}

#[derive(Debug, Clone)]
pub struct RecordState {
    pub value: f64,
    /// `(policy index, probability)` sorted by index.
    pub priors: Vec<(usize, f32)>,
    pub initialized: bool,
    pub normalized: bool,
    pub propagated: bool,
    /// How many times this record's value went up the tree through `propagated_via`.
    pub propagated_count: u32,
    /// The part of `propagated_count` delivered during `propagated_epoch`.
    pub epoch_count: u32,
    pub propagated_epoch: u64,
    pub propagated_via: Option<NodeId>,
    pub kind: RecordKind,
    pub bound_node: Option<NodeId>,
    pub bound_move: Option<ChessMove>,
    pub pending_propagations: u32,
    pub submitted: bool,
    /// Sitting in the batcher's propagation queue.
    pub queued: bool,
    /// Exact terminal value, never overwritten by the evaluator.
    pub pinned: bool,
    pub noised: bool,
}

impl RecordState {
    fn new(kind: RecordKind) -> Self {
        Self {
            value: 0.0,
            priors: Vec::new(),
            initialized: false,
            normalized: false,
            propagated: false,
            propagated_count: 0,
            epoch_count: 0,
            propagated_epoch: 0,
            propagated_via: None,
            kind,
            bound_node: None,
            bound_move: None,
            pending_propagations: 0,
            submitted: false,
            queued: false,
            pinned: false,
            noised: false,
        }
    }
}

#[derive(Debug)]
pub struct EvaluationRecord {
    key: u64,
    state: Mutex<RecordState>,
}

impl EvaluationRecord {
    pub fn new(key: u64, kind: RecordKind) -> Self {
        Self {
            key,
            state: Mutex::new(RecordState::new(kind)),
        }
    }

    /// A resolved, pinned record carrying an exact outcome.
    pub fn exact(key: u64, value: f64) -> Self {
        let record = Self::new(key, RecordKind::Leaf);
        record.pin(value);
        record
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn is_pinned(&self) -> bool {
        lock(&self.state).pinned
    }

    pub fn value(&self) -> f64 {
        lock(&self.state).value
    }

    pub fn kind(&self) -> RecordKind {
        lock(&self.state).kind
    }

    pub fn set_kind(&self, kind: RecordKind) {
        let mut state = lock(&self.state);
        if !state.pinned {
            state.kind = kind;
        }
    }

    pub fn bound_node(&self) -> Option<NodeId> {
        lock(&self.state).bound_node
    }

    pub fn pending_propagations(&self) -> u32 {
        lock(&self.state).pending_propagations
    }

    pub fn propagated_count(&self) -> u32 {
        lock(&self.state).propagated_count
    }

    /// Writes an evaluator answer: `raw` is indexed by policy index and is
    /// masked to `legal`, then divided by its own sum (uniform when it sums to 0).
    pub fn resolve(&self, value: f64, raw: &[f32], legal: &[usize]) {
        let mut state = lock(&self.state);
        if state.pinned {
            return;
        }
        let priors = legal
            .iter()
            .map(|&index| (index, raw.get(index).copied().unwrap_or(0.0).max(0.0)))
            .collect();
        state.value = value.clamp(-1.0, 1.0);
        state.priors = normalize(priors);
        state.initialized = true;
        state.normalized = true;
    }

    /// Overwrites value and priors with externally computed ones.
    pub fn set_value_and_priors(&self, value: f64, priors: Vec<(usize, f32)>) {
        let mut state = lock(&self.state);
        if state.pinned {
            return;
        }
        state.value = value.clamp(-1.0, 1.0);
        state.priors = normalize(priors);
        state.initialized = true;
        state.normalized = true;
    }

    /// `p = (1 - epsilon) p + epsilon noise`, one noise entry per legal move.
    pub fn mix_noise(&self, noise: &[f64], epsilon: f64) {
        let mut state = lock(&self.state);
        if state.pinned || state.noised || noise.len() != state.priors.len() {
            return;
        }
        for ((_, prior), eta) in state.priors.iter_mut().zip(noise) {
            *prior = ((1.0 - epsilon) * f64::from(*prior) + epsilon * eta) as f32;
        }
        let priors = std::mem::take(&mut state.priors);
        state.priors = normalize(priors);
        state.noised = true;
    }

    pub fn is_noised(&self) -> bool {
        lock(&self.state).noised
    }

    /// Binds the record to `node` reached by `mv`. Fails when it is still bound
    /// to another live node reached by a different move (fingerprint collision).
    pub fn bind(
        &self,
        node: NodeId,
        mv: Option<ChessMove>,
        is_live: impl Fn(NodeId) -> bool,
    ) -> Result<(), SearchError> {
        let mut state = lock(&self.state);
        if let Some(bound) = state.bound_node {
            if bound != node && is_live(bound) && state.bound_move != mv {
                return Err(SearchError::ConflictingBinding {
                    key: self.key,
                    bound: format!("{} via {}", bound, move_text(state.bound_move)),
                    requested: format!("{} via {}", node, move_text(mv)),
                });
            }
            if bound != node && is_live(bound) {
                log::debug!(
                    "🔀 Transposition: record {:#018x} moves from {} to {}",
                    self.key,
                    bound,
                    node
                );
            }
        }
        state.bound_node = Some(node);
        state.bound_move = mv;
        Ok(())
    }

    /// Marks the record as requested from the evaluator. False when it already
    /// was or when it is already resolved.
    pub fn try_mark_submitted(&self) -> bool {
        let mut state = lock(&self.state);
        if state.initialized || state.submitted {
            return false;
        }
        state.submitted = true;
        true
    }

    /// Adds `count` pending propagations. True when the caller must put the
    /// record in the propagation queue.
    pub fn add_pending_and_mark_queued(&self, count: u32) -> bool {
        let mut state = lock(&self.state);
        state.pending_propagations += count;
        if state.queued {
            false
        } else {
            state.queued = true;
            true
        }
    }

    pub fn take_pending_and_dequeue(&self) -> u32 {
        let mut state = lock(&self.state);
        state.queued = false;
        std::mem::take(&mut state.pending_propagations)
    }

    /// Counts `count` deliveries through `node` during search `epoch`. Counts
    /// kept for another node start over.
    pub fn mark_propagated(&self, count: u32, node: NodeId, epoch: u64) {
        let mut state = lock(&self.state);
        if state.propagated_via != Some(node) {
            state.propagated_via = Some(node);
            state.propagated_count = 0;
            state.epoch_count = 0;
        }
        if state.propagated_epoch != epoch {
            state.propagated_epoch = epoch;
            state.epoch_count = 0;
        }
        state.propagated = true;
        state.propagated_count += count;
        state.epoch_count += count;
    }

    /// `(all deliveries, deliveries this epoch)` made through `node`.
    pub fn propagation_counts(&self, node: NodeId, epoch: u64) -> (u32, u32) {
        let state = lock(&self.state);
        if state.propagated_via != Some(node) {
            return (0, 0);
        }
        let current = if state.propagated_epoch == epoch {
            state.epoch_count
        } else {
            0
        };
        (state.propagated_count, current)
    }

    /// Turns the record into an exact leaf. Propagation counts are kept: the
    /// caller rewrites what was already delivered with the exact value.
    pub fn pin(&self, exact: f64) {
        let mut state = lock(&self.state);
        state.value = exact;
        state.priors.clear();
        state.initialized = true;
        state.normalized = true;
        state.kind = RecordKind::Leaf;
        state.pinned = true;
    }

    pub fn prior(&self, index: usize) -> f32 {
        let state = lock(&self.state);
        state
            .priors
            .binary_search_by_key(&index, |&(i, _)| i)
            .map(|position| state.priors[position].1)
            .unwrap_or(0.0)
    }

    pub fn priors(&self) -> Vec<(usize, f32)> {
        lock(&self.state).priors.clone()
    }

    pub fn snapshot(&self) -> RecordState {
        lock(&self.state).clone()
    }
}

impl fmt::Display for EvaluationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.snapshot();
        write!(
            f,
            "record {:#018x} {:?} value={:.3} init={} pinned={} pending={} propagated={}",
            self.key,
            state.kind,
            state.value,
            state.initialized,
            state.pinned,
            state.pending_propagations,
            state.propagated_count
        )
    }
}

fn normalize(mut priors: Vec<(usize, f32)>) -> Vec<(usize, f32)> {
    priors.sort_unstable_by_key(|&(index, _)| index);
    let sum: f32 = priors.iter().map(|&(_, p)| p).sum();
    if sum > 0.0 && sum.is_finite() {
        for (_, p) in priors.iter_mut() {
            *p /= sum;
        }
    } else if !priors.is_empty() {
        let uniform = 1.0 / priors.len() as f32;
        for (_, p) in priors.iter_mut() {
            *p = uniform;
        }
    }
    priors
}

fn move_text(mv: Option<ChessMove>) -> String {
    mv.map(|m| m.to_string()).unwrap_or_else(|| "root".to_string())
}
