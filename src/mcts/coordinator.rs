//! Worker pool running playouts until the stop condition.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chess::Color;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::game::GameContext;
use crate::mcts::batcher::{BatcherStats, EvaluationBatcher};
use crate::mcts::cache::CacheStats;
use crate::mcts::error::SearchError;
use crate::mcts::lock;
use crate::mcts::walker::{PlayoutOutcome, SearchWalker};

/// When a search stops. Exactly one of a time budget or a playout count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Time(Duration),
    Playouts(usize),
}

impl StopMode {
    pub fn new(time: Option<Duration>, playouts: Option<usize>) -> Result<Self, SearchError> {
        match (time, playouts) {
            (Some(budget), None) => Ok(StopMode::Time(budget)),
            (None, Some(count)) => Ok(StopMode::Playouts(count)),
            (Some(_), Some(_)) => Err(SearchError::Config(
                "set either a time budget or a playout count, not both".to_string(),
            )),
            (None, None) => Err(SearchError::Config(
                "a time budget or a playout count is required".to_string(),
            )),
        }
    }
}

/// Per-search knobs handed to every walker.
#[derive(Debug, Clone, Copy)]
pub struct PlayoutParams {
    pub searching_side: Color,
    pub cpuct: f64,
    pub dirichlet: bool,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SearchReport {
    pub playouts: usize,
    pub expanded: usize,
    pub coalesced: usize,
    pub terminal: usize,
    pub rediscovered: usize,
    pub elapsed: Duration,
    pub nodes_created: u64,
    pub live_nodes: usize,
    pub batches: BatcherStats,
    pub cache: CacheStats,
}

impl SearchReport {
    pub fn playouts_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.playouts as f64 / seconds
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct OutcomeCounters {
    expanded: AtomicUsize,
    coalesced: AtomicUsize,
    terminal: AtomicUsize,
    rediscovered: AtomicUsize,
}

impl OutcomeCounters {
    fn record(&self, outcome: PlayoutOutcome) {
        let counter = match outcome {
            PlayoutOutcome::Expanded => &self.expanded,
            PlayoutOutcome::Coalesced => &self.coalesced,
            PlayoutOutcome::Terminal => &self.terminal,
            PlayoutOutcome::Rediscovered => &self.rediscovered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct SearchCoordinator {
    workers: usize,
    stop: StopMode,
    pool: ThreadPool,
}

impl SearchCoordinator {
    pub fn new(workers: usize, stop: StopMode) -> Result<Self, SearchError> {
        if workers == 0 {
            return Err(SearchError::Config("at least one worker is required".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("search-worker-{}", i))
            .build()
            .map_err(|e| SearchError::ThreadPool(e.to_string()))?;
        Ok(Self {
            workers,
            stop,
            pool,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stop_mode(&self) -> StopMode {
        self.stop
    }

    /// Searches from the graph's current root, whose position is `context`.
    pub fn run(
        &self,
        batcher: &EvaluationBatcher,
        context: &GameContext,
        params: PlayoutParams,
    ) -> Result<SearchReport, SearchError> {
        let graph = batcher.graph();
        let root = graph.root()?;
        if context.legal_moves().is_empty() {
            return Err(SearchError::NoLegalMoves);
        }

        root.reset_sync();
        let epoch = graph.begin_search();
        let record = root.record();
        batcher.submit_record(record, context, params.dirichlet);
        batcher.flush(true)?;
        if params.dirichlet {
            batcher.apply_root_noise(record);
        }
        if !root.sync_sum() {
            return Err(SearchError::Config(format!(
                "root record {:#018x} is unresolved after priming",
                record.key()
            )));
        }

        log::debug!(
            "🚀 Search #{} from {} ({} to move) with {} workers, {:?}, cpuct={:.2}, noise={}",
            epoch,
            root.id(),
            if context.side_to_move() == Color::White { "white" } else { "black" },
            self.workers,
            self.stop,
            params.cpuct,
            params.dirichlet
        );

        let start = Instant::now();
        let started = AtomicUsize::new(0);
        let finished = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<SearchError>> = Mutex::new(None);
        let counters = OutcomeCounters::default();

        self.pool.scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|_| loop {
                    if abort.load(Ordering::Acquire) {
                        break;
                    }
                    let index = started.fetch_add(1, Ordering::Relaxed);
                    let keep_going = match self.stop {
                        StopMode::Time(budget) => start.elapsed() < budget,
                        StopMode::Playouts(count) => index < count,
                    };
                    if !keep_going {
                        break;
                    }

                    let seed = params
                        .seed
                        .wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                    let mut walker = SearchWalker::new(
                        batcher,
                        params.searching_side,
                        params.cpuct,
                        params.dirichlet,
                        seed,
                    );
                    match walker.run(&root, context) {
                        Ok(outcome) => {
                            counters.record(outcome);
                            finished.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            abort.store(true, Ordering::Release);
                            lock(&first_error).get_or_insert(e);
                            break;
                        }
                    }
                });
            }
        });

        if let Some(error) = lock(&first_error).take() {
            log::error!(
                "❌ Search aborted: {}\n{}",
                error,
                graph.dump_subtree(root.id(), 2)
            );
            return Err(error);
        }

        batcher.flush(true)?;

        let report = SearchReport {
            playouts: finished.load(Ordering::Relaxed),
            expanded: counters.expanded.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            terminal: counters.terminal.load(Ordering::Relaxed),
            rediscovered: counters.rediscovered.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
            nodes_created: graph.created_nodes(),
            live_nodes: graph.live_nodes(),
            batches: batcher.stats(),
            cache: batcher.cache().stats(),
        };
        log::info!(
            "🌲 {} playouts in {:.2}s ({:.0}/s), {} new nodes, {} evaluator calls",
            report.playouts,
            report.elapsed.as_secs_f64(),
            report.playouts_per_second(),
            report.nodes_created,
            report.batches.evaluator_calls
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_stop_mode_needs_exactly_one_limit() {
        assert_matches!(
            StopMode::new(Some(Duration::from_millis(10)), Some(10)),
            Err(SearchError::Config(_))
        );
        assert_matches!(StopMode::new(None, None), Err(SearchError::Config(_)));
        assert_eq!(StopMode::new(None, Some(5)).unwrap(), StopMode::Playouts(5));
        assert_eq!(
            StopMode::new(Some(Duration::from_secs(1)), None).unwrap(),
            StopMode::Time(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        assert_matches!(
            SearchCoordinator::new(0, StopMode::Playouts(1)),
            Err(SearchError::Config(_))
        );
    }

    #[test]
    fn test_playouts_per_second() {
        let report = SearchReport {
            playouts: 100,
            elapsed: Duration::from_secs(2),
            ..SearchReport::default()
        };
        assert_eq!(report.playouts_per_second(), 50.0);
    }
}
