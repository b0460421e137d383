//! TorchScript evaluator.
//!
//! Loads a scripted policy/value network exported from training. The module
//! takes a `[N, INPUT_PLANES, 8, 8]` float tensor and returns a tuple
//! `(policy_logits [N, POLICY_SIZE], value [N, 1])`.

use std::path::Path;
use std::sync::Mutex;

use tch::{CModule, Device, IValue, Kind, Tensor};

use crate::neural::policy_value_net::{Evaluator, EvaluatorError, EvaluatorOutput};
use crate::neural::tensor_conversion::{FeatureTensor, INPUT_PLANES, POLICY_SIZE};

pub struct TorchEvaluator {
    // CModule is not Sync; forward passes are serialized here
    module: Mutex<CModule>,
    device: Device,
    path: String,
}

impl TorchEvaluator {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvaluatorError> {
        let device = Device::cuda_if_available();
        let path_ref = path.as_ref();
        log::info!("🧠 Loading TorchScript model from {} on {:?}", path_ref.display(), device);

        let mut module = CModule::load_on_device(path_ref, device)?;
        module.set_eval();
        log::info!("✅ Model loaded");

        Ok(Self {
            module: Mutex::new(module),
            device,
            path: path_ref.display().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn forward(&self, input: Tensor) -> Result<(Tensor, Tensor), EvaluatorError> {
        let module = self
            .module
            .lock()
            .map_err(|_| EvaluatorError::Backend("model mutex poisoned".to_string()))?;
        match module.forward_is(&[IValue::Tensor(input)])? {
            IValue::Tuple(mut outputs) if outputs.len() == 2 => {
                let value = outputs.pop();
                let policy = outputs.pop();
                match (policy, value) {
                    (Some(IValue::Tensor(policy)), Some(IValue::Tensor(value))) => {
                        Ok((policy, value))
                    }
                    _ => Err(EvaluatorError::Backend(
                        "model outputs are not tensors".to_string(),
                    )),
                }
            }
            other => Err(EvaluatorError::Backend(format!(
                "expected (policy, value) tuple, got {:?}",
                other
            ))),
        }
    }
}

impl Evaluator for TorchEvaluator {
    fn evaluate(&self, batch: &[FeatureTensor]) -> Result<Vec<EvaluatorOutput>, EvaluatorError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let flat: Vec<f32> = batch.iter().flatten().copied().collect();
        let input = Tensor::from_slice(&flat)
            .view([batch.len() as i64, INPUT_PLANES as i64, 8, 8])
            .to_device(self.device);

        let (policy, value) = tch::no_grad(|| self.forward(input))?;
        let policy = policy
            .softmax(-1, Kind::Float)
            .to_device(Device::Cpu)
            .view([-1]);
        let value = value.to_device(Device::Cpu).view([-1]);

        let priors = Vec::<f32>::try_from(&policy)?;
        let values = Vec::<f32>::try_from(&value)?;
        if values.len() != batch.len() {
            return Err(EvaluatorError::BatchMismatch {
                expected: batch.len(),
                got: values.len(),
            });
        }
        if priors.len() != batch.len() * POLICY_SIZE {
            return Err(EvaluatorError::PriorLength {
                expected: POLICY_SIZE,
                got: priors.len() / batch.len(),
            });
        }

        Ok(values
            .into_iter()
            .zip(priors.chunks(POLICY_SIZE))
            .map(|(value, priors)| EvaluatorOutput {
                value: value.clamp(-1.0, 1.0),
                priors: priors.to_vec(),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "torchscript"
    }
}
