//! AdamW Optimizer
//!
//! Adam with decoupled weight decay.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (selected tensors only)
//! m = β₁ * m + (1 - β₁) * g        # First moment
//! v = β₂ * v + (1 - β₂) * g²       # Second moment
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! Defaults: β₁ = 0.9, β₂ = 0.95, ε = 1e-8.
//!
//! ## Selective Weight Decay
//!
//! Decay applies only to 2D weight matrices. Biases, layer-norm scales and
//! shifts, and the embedding tables are never decayed.
//!
//! ## State Layout
//!
//! Moment estimates are stored as flat lists aligned with the model's
//! canonical parameter order, so one loop updates every parameter. The
//! optimizer must be created after the final
//! [`resize_vocab`](crate::LanguageModel::resize_vocab) call; a shape change
//! afterwards is reported as [`QuillError::ShapeMismatch`].
//!
//! ## References
//!
//! - Loshchilov & Hutter (2019): "Decoupled Weight Decay Regularization"
//! - Kingma & Ba (2014): "Adam: A Method for Stochastic Optimization"

use crate::error::{QuillError, Result};
use crate::gradients::ModelGradients;
use crate::model::LanguageModel;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// AdamW optimizer state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdamWOptimizer {
    /// First moment per parameter
    pub m: Vec<Tensor>,
    /// Second moment per parameter
    pub v: Vec<Tensor>,
    /// Whether weight decay applies to each parameter
    pub decay: Vec<bool>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Number of updates applied so far
    pub step: usize,
}

impl AdamWOptimizer {
    /// Create zeroed optimizer state for `model`
    pub fn new(model: &LanguageModel) -> Self {
        let params = model.named_parameters();
        let zeros = || -> Vec<Tensor> {
            params
                .iter()
                .map(|(_, t)| Tensor::zeros(t.shape.clone()))
                .collect()
        };
        let decay = params
            .iter()
            .map(|(name, t)| t.shape.len() == 2 && !name.ends_with("embedding"))
            .collect();

        Self {
            m: zeros(),
            v: zeros(),
            decay,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            step: 0,
        }
    }

    /// Apply one AdamW update
    ///
    /// # Arguments
    ///
    /// * `model` - Parameters to update in place
    /// * `grads` - Gradients from [`LanguageModel::backward`]
    /// * `lr` - Learning rate for this step
    /// * `weight_decay` - Decoupled decay coefficient λ
    ///
    /// # Errors
    ///
    /// [`QuillError::ShapeMismatch`] if the model or gradients no longer match
    /// the optimizer state (for example after a vocabulary resize)
    pub fn step(
        &mut self,
        model: &mut LanguageModel,
        grads: &ModelGradients,
        lr: f32,
        weight_decay: f32,
    ) -> Result<()> {
        let mut params = model.parameters_mut();
        if params.len() != self.m.len() || grads.tensors.len() != self.m.len() {
            return Err(QuillError::shape(format!(
                "optimizer tracks {} parameters, model has {} and gradients {}",
                self.m.len(),
                params.len(),
                grads.tensors.len()
            )));
        }
        for ((p, g), m) in params.iter().zip(&grads.tensors).zip(&self.m) {
            if p.shape != g.shape || p.shape != m.shape {
                return Err(QuillError::shape(format!(
                    "parameter shape {:?} does not match gradient {:?} / optimizer state {:?}",
                    p.shape, g.shape, m.shape
                )));
            }
        }

        self.step += 1;
        let t = self.step as i32;
        let hp = Hyper {
            lr,
            weight_decay,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            bias_correction1: 1.0 - self.beta1.powi(t),
            bias_correction2: 1.0 - self.beta2.powi(t),
        };

        for (i, param) in params.iter_mut().enumerate() {
            let decay = self.decay[i];
            adamw_update_tensor(
                &mut param.data,
                &grads.tensors[i].data,
                &mut self.m[i].data,
                &mut self.v[i].data,
                decay,
                &hp,
            );
        }
        Ok(())
    }
}

struct Hyper {
    lr: f32,
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

impl Hyper {
    #[inline(always)]
    fn update(&self, param: &mut f32, grad: f32, m: &mut f32, v: &mut f32, decay: bool) {
        if decay {
            *param *= 1.0 - self.lr * self.weight_decay;
        }
        *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
        *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
        let m_hat = *m / self.bias_correction1;
        let v_hat = *v / self.bias_correction2;
        *param -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
    }
}

/// Update one parameter tensor, in parallel above 1000 elements
fn adamw_update_tensor(
    param: &mut [f32],
    grad: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    decay: bool,
    hp: &Hyper,
) {
    if param.len() > 1000 {
        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(m.par_iter_mut().zip(v.par_iter_mut()))
            .for_each(|((p, &g), (m, v))| hp.update(p, g, m, v, decay));
    } else {
        for i in 0..param.len() {
            hp.update(&mut param[i], grad[i], &mut m[i], &mut v[i], decay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model() -> LanguageModel {
        LanguageModel::new(&ModelConfig {
            num_layers: 1,
            ..ModelConfig::tiny(12)
        })
        .unwrap()
    }

    #[test]
    fn test_decay_mask_selects_weight_matrices() {
        let model = model();
        let opt = AdamWOptimizer::new(&model);
        for ((name, _), decay) in model.named_parameters().iter().zip(&opt.decay) {
            let expected = name.ends_with(".weight");
            assert_eq!(*decay, expected, "{name}");
        }
    }

    #[test]
    fn test_first_step_moves_against_gradient() {
        let mut model = model();
        let mut opt = AdamWOptimizer::new(&model);
        let before = model.state_dict();

        let grads = ModelGradients {
            tensors: model
                .named_parameters()
                .iter()
                .map(|(_, t)| Tensor::full(t.shape.clone(), 1.0))
                .collect(),
        };

        opt.step(&mut model, &grads, 0.01, 0.0).unwrap();
        assert_eq!(opt.step, 1);

        // With bias correction the first Adam step is ≈ lr * sign(g)
        for (name, after) in model.named_parameters() {
            let b = &before[&name];
            for (x, y) in b.data.iter().zip(&after.data) {
                assert!((x - y - 0.01).abs() < 1e-5, "{name}");
            }
        }
    }

    #[test]
    fn test_step_rejects_stale_state() {
        let mut model = model();
        let mut opt = AdamWOptimizer::new(&model);
        model.resize_vocab(13).unwrap();
        let grads = ModelGradients::zeros_like(model.named_parameters().iter().map(|(_, t)| *t));
        assert!(matches!(
            opt.step(&mut model, &grads, 0.01, 0.0),
            Err(QuillError::ShapeMismatch(_))
        ));
    }
}
