#[cfg(feature = "torch")]
pub mod manager;
pub mod policy_value_net;
pub mod tensor_conversion;

// Re-export key components for convenience
#[cfg(feature = "torch")]
pub use manager::TorchEvaluator;
pub use policy_value_net::{
    BiasedEvaluator, Evaluator, EvaluatorError, EvaluatorOutput, UniformEvaluator,
};
pub use tensor_conversion::{
    encode, legal_policy_indices, policy_index, FeatureTensor, FEATURE_LEN, INPUT_PLANES,
    POLICY_SIZE,
};
