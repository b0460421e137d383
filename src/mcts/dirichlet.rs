//! Root exploration noise.
//!
//! Dirichlet(α) samples are drawn as normalized Gamma(α, 1) draws and mixed
//! into the root priors: p = (1 - ε) p + ε η.

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::mcts::error::SearchError;

#[derive(Debug, Clone)]
pub struct DirichletNoise {
    gamma: Gamma<f64>,
    alpha: f64,
    epsilon: f64,
}

impl DirichletNoise {
    pub fn new(alpha: f64, epsilon: f64) -> Result<Self, SearchError> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(SearchError::Config(format!(
                "dirichlet epsilon must be within [0, 1], got {}",
                epsilon
            )));
        }
        let gamma = Gamma::new(alpha, 1.0).map_err(|e| {
            SearchError::Config(format!("invalid dirichlet alpha {}: {}", alpha, e))
        })?;
        Ok(Self {
            gamma,
            alpha,
            epsilon,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// One Dirichlet draw over `n` moves.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<f64> {
        let mut noise: Vec<f64> = (0..n).map(|_| self.gamma.sample(rng)).collect();
        let sum: f64 = noise.iter().sum();
        if sum > 0.0 {
            for value in &mut noise {
                *value /= sum;
            }
        } else if n > 0 {
            noise.fill(1.0 / n as f64);
        }
        noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sample_is_a_distribution() {
        let noise = DirichletNoise::new(0.3, 0.25).unwrap();
        let mut rng = StdRng::seed_from_u64(2025);
        let draw = noise.sample(20, &mut rng);
        assert_eq!(draw.len(), 20);
        assert!(draw.iter().all(|&p| p >= 0.0));
        assert!((draw.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_parameters() {
        assert_matches!(DirichletNoise::new(0.0, 0.25), Err(SearchError::Config(_)));
        assert_matches!(DirichletNoise::new(0.3, 1.5), Err(SearchError::Config(_)));
    }
}
