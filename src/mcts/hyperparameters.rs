//! Search hyperparameters.
//!
//! Serializable knob set for the search, loadable from JSON. Missing fields
//! take their default. [`SearchHyperparameters::to_search_config`] turns the
//! step-dependent knobs into the schedule closures used by the strategy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::game::DEFAULT_MOVE_CAP;
use crate::mcts::cache::DEFAULT_CACHE_CAPACITY;
use crate::mcts::coordinator::StopMode;
use crate::mcts::error::SearchError;
use crate::mcts::strategy::SearchConfig;
use crate::ZeroChessError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchHyperparameters {
    // ========== Workers & batching ==========
    /// Worker threads, each running one playout at a time
    /// Default: 4
    pub workers: usize,

    /// Positions per evaluator call
    /// Default: 16
    pub batch_size: usize,

    /// Evaluation records kept in the LRU cache
    /// Default: 50 000
    pub cache_capacity: usize,

    // ========== Stop condition (exactly one) ==========
    /// Playouts per move
    /// Default: 800
    pub playouts: Option<usize>,

    /// Wall-clock budget per move in milliseconds
    /// Default: none
    pub time_budget_ms: Option<u64>,

    // ========== c_puct (Exploration Constant) ==========
    /// c_puct before `c_puct_switch_step`
    /// Default: 2.5
    pub c_puct_early: f64,

    /// c_puct from `c_puct_switch_step` on
    /// Default: 1.5
    pub c_puct_late: f64,

    /// Game ply at which c_puct switches
    /// Default: 30
    pub c_puct_switch_step: usize,

    // ========== Root noise ==========
    /// Default: 0.3
    pub dirichlet_alpha: f64,

    /// Share of noise in the root priors
    /// Default: 0.25
    pub dirichlet_epsilon: f64,

    /// Noise is mixed at the root for plies strictly below this
    /// Default: 30
    pub dirichlet_until_step: usize,

    // ========== Misc ==========
    /// Default: 2025
    pub seed: u64,

    /// Games are drawn at this ply
    /// Default: 512
    pub move_cap: usize,
}

impl Default for SearchHyperparameters {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 16,
            cache_capacity: DEFAULT_CACHE_CAPACITY,

            playouts: Some(800),
            time_budget_ms: None,

            c_puct_early: 2.5,
            c_puct_late: 1.5,
            c_puct_switch_step: 30,

            dirichlet_alpha: 0.3,
            dirichlet_epsilon: 0.25,
            dirichlet_until_step: 30,

            seed: 2025,
            move_cap: DEFAULT_MOVE_CAP,
        }
    }
}

impl SearchHyperparameters {
    /// Reads a JSON file. Fields absent from the file keep their default.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ZeroChessError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        log::info!(
            "⚙️ Loaded search parameters from {}: {}",
            path.as_ref().display(),
            params.to_config_string()
        );
        Ok(params)
    }

    pub fn get_c_puct(&self, step: usize) -> f64 {
        if step < self.c_puct_switch_step {
            self.c_puct_early
        } else {
            self.c_puct_late
        }
    }

    pub fn dirichlet_enabled(&self, step: usize) -> bool {
        self.dirichlet_epsilon > 0.0 && step < self.dirichlet_until_step
    }

    pub fn stop_mode(&self) -> Result<StopMode, SearchError> {
        StopMode::new(self.time_budget_ms.map(Duration::from_millis), self.playouts)
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        self.stop_mode()?;
        if self.workers == 0 {
            return Err(SearchError::Config("workers must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SearchError::Config("batch_size must be at least 1".to_string()));
        }
        if self.cache_capacity == 0 {
            return Err(SearchError::Config("cache_capacity must be at least 1".to_string()));
        }
        if self.c_puct_early <= 0.0 || self.c_puct_late <= 0.0 {
            return Err(SearchError::Config(format!(
                "c_puct must be positive, got {} / {}",
                self.c_puct_early, self.c_puct_late
            )));
        }
        if self.dirichlet_alpha <= 0.0 || !(0.0..=1.0).contains(&self.dirichlet_epsilon) {
            return Err(SearchError::Config(format!(
                "dirichlet alpha must be positive and epsilon within [0, 1], got {} / {}",
                self.dirichlet_alpha, self.dirichlet_epsilon
            )));
        }
        Ok(())
    }

    /// Create a configuration string for logging
    pub fn to_config_string(&self) -> String {
        let stop = match (self.playouts, self.time_budget_ms) {
            (Some(n), _) => format!("{}po", n),
            (None, Some(ms)) => format!("{}ms", ms),
            (None, None) => "unbounded".to_string(),
        };
        format!(
            "w{}_b{}_cache{}_{}_c_puct[{:.2},{:.2}@{}]_dir[{:.2},{:.2}<{}]_seed{}",
            self.workers,
            self.batch_size,
            self.cache_capacity,
            stop,
            self.c_puct_early,
            self.c_puct_late,
            self.c_puct_switch_step,
            self.dirichlet_alpha,
            self.dirichlet_epsilon,
            self.dirichlet_until_step,
            self.seed
        )
    }

    pub fn to_search_config(&self) -> Result<SearchConfig, SearchError> {
        self.validate()?;
        let cpuct_params = self.clone();
        let noise_params = self.clone();
        Ok(SearchConfig {
            workers: self.workers,
            stop: self.stop_mode()?,
            cpuct: Arc::new(move |step| cpuct_params.get_c_puct(step)),
            dirichlet: Arc::new(move |step| noise_params.dirichlet_enabled(step)),
            batch_size: self.batch_size,
            cache_capacity: self.cache_capacity,
            seed: self.seed,
            dirichlet_alpha: self.dirichlet_alpha,
            dirichlet_epsilon: self.dirichlet_epsilon,
            move_cap: self.move_cap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let params = SearchHyperparameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.stop_mode().unwrap(), StopMode::Playouts(800));
    }

    #[test]
    fn test_get_c_puct_by_step() {
        let params = SearchHyperparameters::default();
        assert_eq!(params.get_c_puct(0), 2.5);
        assert_eq!(params.get_c_puct(29), 2.5);
        assert_eq!(params.get_c_puct(30), 1.5);
    }

    #[test]
    fn test_dirichlet_schedule() {
        let mut params = SearchHyperparameters::default();
        assert!(params.dirichlet_enabled(0));
        assert!(!params.dirichlet_enabled(30));
        params.dirichlet_epsilon = 0.0;
        assert!(!params.dirichlet_enabled(0));
    }

    #[test]
    fn test_both_stop_limits_are_rejected() {
        let params = SearchHyperparameters {
            time_budget_ms: Some(100),
            ..SearchHyperparameters::default()
        };
        assert_matches!(params.validate(), Err(SearchError::Config(_)));

        let params = SearchHyperparameters {
            playouts: None,
            ..SearchHyperparameters::default()
        };
        assert_matches!(params.validate(), Err(SearchError::Config(_)));
    }

    #[test]
    fn test_search_config_carries_schedules() {
        let config = SearchHyperparameters::default().to_search_config().unwrap();
        assert_eq!((config.cpuct)(3), 2.5);
        assert_eq!((config.cpuct)(40), 1.5);
        assert!((config.dirichlet)(0));
        assert!(!(config.dirichlet)(31));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let params: SearchHyperparameters =
            serde_json::from_str(r#"{"workers": 2, "playouts": null, "time_budget_ms": 250}"#)
                .unwrap();
        assert_eq!(params.workers, 2);
        assert_eq!(params.batch_size, 16);
        assert_eq!(params.stop_mode().unwrap(), StopMode::Time(Duration::from_millis(250)));
    }

    #[test]
    fn test_config_string() {
        let config = SearchHyperparameters::default().to_config_string();
        assert!(config.contains("800po"));
        assert!(config.contains("c_puct[2.50,1.50@30]"));
    }
}
