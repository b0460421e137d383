//! Policy/value evaluator seam used by the batcher.
//!
//! An evaluator receives a batch of encoded positions and returns, for each,
//! a value in [-1, 1] from the side to move's point of view and a raw prior
//! vector over the full [`POLICY_SIZE`] move space. Masking to legal moves and
//! normalization happen on the search side.

use std::collections::HashSet;

use crate::neural::tensor_conversion::{FeatureTensor, POLICY_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("evaluator backend failed: {0}")]
    Backend(String),

    #[error("evaluator returned {got} outputs for a batch of {expected}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("prior vector has {got} entries, expected {expected}")]
    PriorLength { expected: usize, got: usize },

    #[cfg(feature = "torch")]
    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),
}

/// One evaluated position.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorOutput {
    /// Expected outcome for the side to move.
    pub value: f32,
    /// Non-negative weights indexed by policy index, `POLICY_SIZE` long.
    pub priors: Vec<f32>,
}

/// Batched position evaluator. Implementations must be callable from any worker thread.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, batch: &[FeatureTensor]) -> Result<Vec<EvaluatorOutput>, EvaluatorError>;

    fn name(&self) -> &str {
        "evaluator"
    }
}

/// Constant value and flat priors. Search then behaves like plain visit-count MCTS.
#[derive(Debug, Clone)]
pub struct UniformEvaluator {
    value: f32,
}

impl UniformEvaluator {
    pub fn new(value: f32) -> Self {
        Self {
            value: value.clamp(-1.0, 1.0),
        }
    }
}

impl Default for UniformEvaluator {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Evaluator for UniformEvaluator {
    fn evaluate(&self, batch: &[FeatureTensor]) -> Result<Vec<EvaluatorOutput>, EvaluatorError> {
        Ok(batch
            .iter()
            .map(|_| EvaluatorOutput {
                value: self.value,
                priors: vec![1.0; POLICY_SIZE],
            })
            .collect())
    }

    fn name(&self) -> &str {
        "uniform"
    }
}

/// Flat priors except for a set of favoured policy indices, which get `weight`
/// times the mass of any other move. Handy for steering search in tests and demos.
#[derive(Debug, Clone)]
pub struct BiasedEvaluator {
    value: f32,
    favoured: HashSet<usize>,
    weight: f32,
}

impl BiasedEvaluator {
    pub fn new(value: f32, favoured: impl IntoIterator<Item = usize>, weight: f32) -> Self {
        Self {
            value: value.clamp(-1.0, 1.0),
            favoured: favoured.into_iter().filter(|&i| i < POLICY_SIZE).collect(),
            weight: weight.max(0.0),
        }
    }
}

impl Evaluator for BiasedEvaluator {
    fn evaluate(&self, batch: &[FeatureTensor]) -> Result<Vec<EvaluatorOutput>, EvaluatorError> {
        let mut priors = vec![1.0; POLICY_SIZE];
        for &index in &self.favoured {
            priors[index] = self.weight;
        }
        Ok(batch
            .iter()
            .map(|_| EvaluatorOutput {
                value: self.value,
                priors: priors.clone(),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "biased"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::tensor_conversion::FEATURE_LEN;

    #[test]
    fn test_uniform_evaluator_answers_every_position() {
        let evaluator = UniformEvaluator::new(0.5);
        let batch = vec![vec![0.0; FEATURE_LEN]; 3];
        let outputs = evaluator.evaluate(&batch).unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| o.value == 0.5 && o.priors.len() == POLICY_SIZE));
    }

    #[test]
    fn test_values_are_clamped() {
        let evaluator = UniformEvaluator::new(4.0);
        let outputs = evaluator.evaluate(&[vec![0.0; FEATURE_LEN]]).unwrap();
        assert_eq!(outputs[0].value, 1.0);
    }

    #[test]
    fn test_biased_evaluator_weights_favoured_indices() {
        let evaluator = BiasedEvaluator::new(0.0, [7, POLICY_SIZE + 3], 50.0);
        let outputs = evaluator.evaluate(&[vec![0.0; FEATURE_LEN]]).unwrap();
        assert_eq!(outputs[0].priors[7], 50.0);
        assert_eq!(outputs[0].priors[8], 1.0);
        assert_eq!(evaluator.name(), "biased");
    }
}
