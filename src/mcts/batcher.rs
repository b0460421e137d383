//! Batched evaluator calls and deferred backpropagation.
//!
//! Walkers never call the evaluator directly. They submit unresolved records
//! (with features encoded on their own thread) and register pending
//! propagations. Whoever flushes runs one evaluator call over the queued
//! requests, writes the results into the records, then pushes every resolvable
//! pending value from its node up to the root, flipping the sign at each ply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::game::GameContext;
use crate::mcts::arena::SearchGraph;
use crate::mcts::cache::EvaluationCache;
use crate::mcts::dirichlet::DirichletNoise;
use crate::mcts::error::SearchError;
use crate::mcts::lock;
use crate::mcts::node::{NodeState, SearchNode};
use crate::mcts::record::{EvaluationRecord, RecordKind};
use crate::neural::{
    encode, legal_policy_indices, Evaluator, EvaluatorError, EvaluatorOutput, FeatureTensor,
    POLICY_SIZE,
};

struct PendingRequest {
    record: Arc<EvaluationRecord>,
    features: FeatureTensor,
    legal: Vec<usize>,
    dirichlet: bool,
}

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub evaluated: usize,
    pub applied: usize,
    pub deferred: usize,
    pub dropped: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.batches += other.batches;
        self.evaluated += other.evaluated;
        self.applied += other.applied;
        self.deferred += other.deferred;
        self.dropped += other.dropped;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub evaluator_calls: u64,
    pub positions_evaluated: u64,
    pub largest_batch: u64,
    pub propagations_applied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropagationOutcome {
    Applied,
    Deferred,
    Dropped,
}

pub struct EvaluationBatcher {
    evaluator: Arc<dyn Evaluator>,
    cache: Arc<EvaluationCache>,
    graph: Arc<SearchGraph>,
    batch_size: usize,
    requests: Mutex<Vec<PendingRequest>>,
    propagations: Mutex<Vec<Arc<EvaluationRecord>>>,
    flush_lock: Mutex<()>,
    noise: DirichletNoise,
    rng: Mutex<StdRng>,
    evaluator_calls: AtomicU64,
    positions_evaluated: AtomicU64,
    largest_batch: AtomicU64,
    propagations_applied: AtomicU64,
}

impl EvaluationBatcher {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        cache: Arc<EvaluationCache>,
        graph: Arc<SearchGraph>,
        batch_size: usize,
        noise: DirichletNoise,
        seed: u64,
    ) -> Result<Self, SearchError> {
        if batch_size == 0 {
            return Err(SearchError::Config("batch size must be positive".to_string()));
        }
        Ok(Self {
            evaluator,
            cache,
            graph,
            batch_size,
            requests: Mutex::new(Vec::with_capacity(batch_size)),
            propagations: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            noise,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            evaluator_calls: AtomicU64::new(0),
            positions_evaluated: AtomicU64::new(0),
            largest_batch: AtomicU64::new(0),
            propagations_applied: AtomicU64::new(0),
        })
    }

    pub fn cache(&self) -> &Arc<EvaluationCache> {
        &self.cache
    }

    pub fn graph(&self) -> &Arc<SearchGraph> {
        &self.graph
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn pending_propagations(&self) -> usize {
        lock(&self.propagations).len()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            evaluator_calls: self.evaluator_calls.load(Ordering::Relaxed),
            positions_evaluated: self.positions_evaluated.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
            propagations_applied: self.propagations_applied.load(Ordering::Relaxed),
        }
    }

    /// Requests an evaluation of the position `context` keyed by `key`.
    /// Returns whether a request was queued: false when the record is already
    /// resolved or already waiting for the evaluator.
    pub fn submit(
        &self,
        key: u64,
        context: &GameContext,
        is_dirichlet_root: bool,
        is_root: bool,
    ) -> Result<bool, SearchError> {
        let kind = if is_root {
            RecordKind::Root
        } else {
            RecordKind::Intermediate
        };
        let record = self.cache.get_or_create(key, kind);
        Ok(self.submit_record(&record, context, is_dirichlet_root))
    }

    pub fn submit_record(
        &self,
        record: &Arc<EvaluationRecord>,
        context: &GameContext,
        is_dirichlet_root: bool,
    ) -> bool {
        if !record.try_mark_submitted() {
            return false;
        }
        let request = PendingRequest {
            record: Arc::clone(record),
            features: encode(context),
            legal: legal_policy_indices(context),
            dirichlet: is_dirichlet_root,
        };
        lock(&self.requests).push(request);
        log::trace!(
            "📨 Queued evaluation of {:#018x} at ply {}",
            record.key(),
            context.ply()
        );
        true
    }

    /// Registers `count` more propagations of `record`, queueing it once.
    pub fn enqueue_propagation(&self, record: &Arc<EvaluationRecord>, count: u32) {
        if record.add_pending_and_mark_queued(count) {
            lock(&self.propagations).push(Arc::clone(record));
        }
    }

    /// Runs the queued requests when a batch is full (or always when forced),
    /// then delivers every propagation that can be delivered. A non-forced call
    /// returns at once when another thread is flushing.
    pub fn flush(&self, force: bool) -> Result<FlushReport, SearchError> {
        let _guard = if force {
            lock(&self.flush_lock)
        } else {
            match self.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Ok(FlushReport::default()),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            }
        };

        let mut report = FlushReport::default();
        loop {
            let batch = {
                let mut requests = lock(&self.requests);
                if force || requests.len() >= self.batch_size {
                    std::mem::take(&mut *requests)
                } else {
                    Vec::new()
                }
            };
            if !batch.is_empty() {
                report.evaluated += self.run_batch(batch)?;
                report.batches += 1;
            }
            report.absorb(self.propagation_pass());

            if !force || lock(&self.requests).is_empty() {
                break;
            }
        }
        Ok(report)
    }

    fn run_batch(&self, batch: Vec<PendingRequest>) -> Result<usize, SearchError> {
        let size = batch.len();
        let (features, targets): (Vec<FeatureTensor>, Vec<_>) = batch
            .into_iter()
            .map(|request| (request.features, (request.record, request.legal, request.dirichlet)))
            .unzip();

        let outputs = match self.checked_evaluate(&features) {
            Ok(outputs) => outputs,
            Err(error) => {
                // Nothing was written: the positions go back to the front of the queue
                let failed: Vec<PendingRequest> = features
                    .into_iter()
                    .zip(targets)
                    .map(|(features, (record, legal, dirichlet))| PendingRequest {
                        record,
                        features,
                        legal,
                        dirichlet,
                    })
                    .collect();
                let mut requests = lock(&self.requests);
                let later = std::mem::replace(&mut *requests, failed);
                requests.extend(later);
                log::warn!(
                    "⚠️ Batch of {} positions failed and stays queued: {}",
                    size,
                    error
                );
                return Err(error);
            }
        };

        for (output, (record, legal, dirichlet)) in outputs.into_iter().zip(targets) {
            // Evaluator speaks for the side to move, records for the mover
            let value = -f64::from(output.value).clamp(-1.0, 1.0);
            record.resolve(value, &output.priors, &legal);
            if dirichlet {
                self.apply_root_noise(&record);
            }
        }

        self.evaluator_calls.fetch_add(1, Ordering::Relaxed);
        self.positions_evaluated.fetch_add(size as u64, Ordering::Relaxed);
        self.largest_batch.fetch_max(size as u64, Ordering::Relaxed);
        log::debug!("🧠 Evaluated batch of {} positions", size);
        Ok(size)
    }

    fn checked_evaluate(
        &self,
        features: &[FeatureTensor],
    ) -> Result<Vec<EvaluatorOutput>, SearchError> {
        let outputs = self.evaluator.evaluate(features)?;
        if outputs.len() != features.len() {
            return Err(EvaluatorError::BatchMismatch {
                expected: features.len(),
                got: outputs.len(),
            }
            .into());
        }
        if let Some(output) = outputs.iter().find(|o| o.priors.len() != POLICY_SIZE) {
            return Err(EvaluatorError::PriorLength {
                expected: POLICY_SIZE,
                got: output.priors.len(),
            }
            .into());
        }
        Ok(outputs)
    }

    /// Mixes Dirichlet noise into a resolved root record, once.
    pub fn apply_root_noise(&self, record: &EvaluationRecord) -> bool {
        if !record.is_initialized() || record.is_noised() || record.is_pinned() {
            return false;
        }
        let moves = record.priors().len();
        if moves == 0 {
            return false;
        }
        let noise = self.noise.sample(moves, &mut *lock(&self.rng));
        record.mix_noise(&noise, self.noise.epsilon());
        true
    }

    fn propagation_pass(&self) -> FlushReport {
        let queued = std::mem::take(&mut *lock(&self.propagations));
        let mut report = FlushReport::default();
        let mut retry = Vec::new();

        for record in queued {
            let count = record.take_pending_and_dequeue();
            match self.propagate_record(&record, count) {
                PropagationOutcome::Applied => {
                    report.applied += 1;
                    self.propagations_applied
                        .fetch_add(u64::from(count), Ordering::Relaxed);
                }
                PropagationOutcome::Deferred => {
                    report.deferred += 1;
                    if record.add_pending_and_mark_queued(count) {
                        retry.push(record);
                    }
                }
                PropagationOutcome::Dropped => {
                    report.dropped += 1;
                    log::trace!("🗑️ Dropped {} propagation(s) of {:#018x}", count, record.key());
                }
            }
        }
        if !retry.is_empty() {
            lock(&self.propagations).extend(retry);
        }
        report
    }

    fn propagate_record(&self, record: &Arc<EvaluationRecord>, count: u32) -> PropagationOutcome {
        if count == 0 {
            return PropagationOutcome::Applied;
        }
        if !record.is_initialized() {
            return PropagationOutcome::Deferred;
        }
        let Some(node) = record.bound_node().and_then(|id| self.graph.get(id)) else {
            return PropagationOutcome::Dropped;
        };
        let Some(chain) = self.graph.ancestor_chain(node.id()) else {
            return PropagationOutcome::Dropped;
        };
        if !node.sync_sum() || !chain.iter().all(|ancestor| ancestor.sync_sum()) {
            return PropagationOutcome::Deferred;
        }

        let value = record.value();
        for _ in 0..count {
            propagate_chain(&chain, value);
        }
        record.mark_propagated(count, node.id(), self.graph.search_epoch());
        PropagationOutcome::Applied
    }

    /// Turns `node` into an exact leaf. Contributions it already sent up the
    /// tree are rewritten with the exact value, then one more is queued for the
    /// playout that discovered it. Runs under the flush lock.
    pub fn retract_and_pin(
        &self,
        node: &Arc<SearchNode>,
        exact: f64,
        state: NodeState,
    ) -> Result<(), SearchError> {
        let _guard = lock(&self.flush_lock);
        let record = node.record();
        if record.is_pinned() {
            self.enqueue_propagation(record, 1);
            return Ok(());
        }

        let (previous, current) =
            record.propagation_counts(node.id(), self.graph.search_epoch());
        if previous > 0 {
            if let Some(chain) = self.graph.ancestor_chain(node.id()) {
                rewrite_chain(&chain, record.value(), exact, previous, current);
            }
        }

        let detached = node.create_leaf(state);
        let freed = self.graph.free_subtrees(&detached);
        node.reset_expected_reward(exact);
        self.enqueue_propagation(record, 1);
        log::trace!(
            "📌 Pinned {} to {:+.1} ({:?}), rewrote {} propagation(s), freed {} node(s)",
            node.id(),
            exact,
            state,
            previous,
            freed
        );
        Ok(())
    }
}

/// Sends a node value up the chain of its ancestors (parent first). Each ply
/// flips the point of view.
pub fn propagate_chain(chain: &[Arc<SearchNode>], leaf_value: f64) {
    let mut value = -leaf_value;
    for ancestor in chain {
        ancestor.propagate(value);
        value = -value;
    }
}

pub fn retract_chain(chain: &[Arc<SearchNode>], leaf_value: f64) {
    let mut value = -leaf_value;
    for ancestor in chain {
        ancestor.un_propagate(value);
        value = -value;
    }
}

/// Replaces earlier deliveries of `from` by `to`. Ancestors below the root
/// hold all `total` of them; the root restarts every search and holds only the
/// `current` ones.
fn rewrite_chain(chain: &[Arc<SearchNode>], from: f64, to: f64, total: u32, current: u32) {
    let (mut old, mut new) = (-from, -to);
    let root = chain.len().saturating_sub(1);
    for (depth, ancestor) in chain.iter().enumerate() {
        let times = if depth == root { current } else { total };
        for _ in 0..times {
            ancestor.un_propagate(old);
            ancestor.propagate(new);
        }
        old = -old;
        new = -new;
    }
}
