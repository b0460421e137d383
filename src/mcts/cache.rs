//! Bounded LRU cache of evaluation records keyed by position fingerprint.
//!
//! Three sentinel records for exact outcomes live outside the LRU and are never
//! evicted. Their keys are reserved; fingerprints never land on them.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::mcts::error::SearchError;
use crate::mcts::lock;
use crate::mcts::record::{EvaluationRecord, RecordKind};

pub const LOSS_KEY: u64 = u64::MAX;
pub const DRAW_KEY: u64 = 0;
pub const WIN_KEY: u64 = 1;

pub const DEFAULT_CACHE_CAPACITY: usize = 50_000;

/// Exact outcome of a finished game, from the mover's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Win,
    Loss,
    Draw,
}

impl TerminalOutcome {
    pub fn key(self) -> u64 {
        match self {
            TerminalOutcome::Win => WIN_KEY,
            TerminalOutcome::Loss => LOSS_KEY,
            TerminalOutcome::Draw => DRAW_KEY,
        }
    }

    pub fn value(self) -> f64 {
        match self {
            TerminalOutcome::Win => 1.0,
            TerminalOutcome::Loss => -1.0,
            TerminalOutcome::Draw => 0.0,
        }
    }

    pub fn from_reward(reward: f64) -> Self {
        if reward > 0.0 {
            TerminalOutcome::Win
        } else if reward < 0.0 {
            TerminalOutcome::Loss
        } else {
            TerminalOutcome::Draw
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct EvaluationCache {
    entries: Mutex<LruCache<u64, Arc<EvaluationRecord>>>,
    win: Arc<EvaluationRecord>,
    loss: Arc<EvaluationRecord>,
    draw: Arc<EvaluationRecord>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EvaluationCache {
    pub fn new(capacity: usize) -> Result<Self, SearchError> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| SearchError::Config("cache capacity must be positive".to_string()))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            win: Arc::new(EvaluationRecord::exact(WIN_KEY, 1.0)),
            loss: Arc::new(EvaluationRecord::exact(LOSS_KEY, -1.0)),
            draw: Arc::new(EvaluationRecord::exact(DRAW_KEY, 0.0)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn is_sentinel(key: u64) -> bool {
        key == WIN_KEY || key == LOSS_KEY || key == DRAW_KEY
    }

    pub fn sentinel(&self, outcome: TerminalOutcome) -> Arc<EvaluationRecord> {
        match outcome {
            TerminalOutcome::Win => Arc::clone(&self.win),
            TerminalOutcome::Loss => Arc::clone(&self.loss),
            TerminalOutcome::Draw => Arc::clone(&self.draw),
        }
    }

    fn sentinel_for_key(&self, key: u64) -> Option<Arc<EvaluationRecord>> {
        match key {
            WIN_KEY => Some(self.sentinel(TerminalOutcome::Win)),
            LOSS_KEY => Some(self.sentinel(TerminalOutcome::Loss)),
            DRAW_KEY => Some(self.sentinel(TerminalOutcome::Draw)),
            _ => None,
        }
    }

    /// Looks up a record that must exist. Refreshes its recency.
    pub fn get(&self, key: u64) -> Result<Arc<EvaluationRecord>, SearchError> {
        if let Some(sentinel) = self.sentinel_for_key(key) {
            return Ok(sentinel);
        }
        match lock(&self.entries).get(&key) {
            Some(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::clone(record))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(SearchError::CacheMiss(key))
            }
        }
    }

    pub fn contains_key(&self, key: u64) -> bool {
        Self::is_sentinel(key) || lock(&self.entries).contains(&key)
    }

    /// Optional lookup that leaves recency untouched.
    pub fn peek(&self, key: u64) -> Option<Arc<EvaluationRecord>> {
        self.sentinel_for_key(key)
            .or_else(|| lock(&self.entries).peek(&key).cloned())
    }

    pub fn create(&self, key: u64, kind: RecordKind) -> Result<Arc<EvaluationRecord>, SearchError> {
        if Self::is_sentinel(key) {
            return Err(SearchError::DuplicateRecord(key));
        }
        let mut entries = lock(&self.entries);
        if entries.contains(&key) {
            return Err(SearchError::DuplicateRecord(key));
        }
        Ok(self.insert_locked(&mut entries, key, kind))
    }

    pub fn get_or_create(&self, key: u64, kind: RecordKind) -> Arc<EvaluationRecord> {
        if let Some(sentinel) = self.sentinel_for_key(key) {
            return sentinel;
        }
        let mut entries = lock(&self.entries);
        if let Some(record) = entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(record);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.insert_locked(&mut entries, key, kind)
    }

    fn insert_locked(
        &self,
        entries: &mut LruCache<u64, Arc<EvaluationRecord>>,
        key: u64,
        kind: RecordKind,
    ) -> Arc<EvaluationRecord> {
        let record = Arc::new(EvaluationRecord::new(key, kind));
        if let Some((evicted_key, evicted)) = entries.push(key, Arc::clone(&record)) {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(node) = evicted.bound_node() {
                    log::warn!(
                        "⚠️ Evicting record {:#018x} still bound to node {}",
                        evicted_key,
                        node
                    );
                }
            }
        }
        record
    }

    pub fn update_value_and_priors(
        &self,
        key: u64,
        value: f64,
        priors: Vec<(usize, f32)>,
    ) -> Result<(), SearchError> {
        self.get(key)?.set_value_and_priors(value, priors);
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.entries).cap().get()
    }

    /// Drops every record except the sentinels.
    pub fn clear(&self) {
        lock(&self.entries).clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let entries = lock(&self.entries);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: entries.len(),
            capacity: entries.cap().get(),
        }
    }
}
