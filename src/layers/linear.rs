//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b`.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [seq_len, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y = x @ W + b [seq_len, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! ## Initialization
//!
//! Weights are drawn from `N(0, init_std²)` through the model's seeded
//! [`Initializer`].
//! Biases start at zero.

use crate::error::{QuillError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Seeded source of initial parameter values
///
/// Every layer draws from one shared initializer, so a model built twice
/// from the same [`ModelConfig`](crate::ModelConfig) has identical weights.
#[derive(Clone, Debug)]
pub struct Initializer {
    rng: StdRng,
    normal: Normal<f32>,
}

impl Initializer {
    /// Create an initializer drawing from `N(0, std²)`
    pub fn new(std: f32, seed: u64) -> Result<Self> {
        let normal = Normal::new(0.0, std)
            .map_err(|e| QuillError::param(format!("invalid init std {std}: {e}")))?;
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            normal,
        })
    }

    /// Draw `size` values
    pub fn normal(&mut self, size: usize) -> Vec<f32> {
        (0..size).map(|_| self.normal.sample(&mut self.rng)).collect()
    }
}

/// Fully connected layer
#[derive(Clone, Debug)]
pub struct Linear {
    /// `[in_features, out_features]`
    pub weight: Tensor,
    /// `[out_features]`
    pub bias: Tensor,
}

impl Linear {
    /// Create a new linear layer
    ///
    /// # Arguments
    ///
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `init` - Seeded initializer shared across the model
    pub fn new(in_features: usize, out_features: usize, init: &mut Initializer) -> Self {
        Self {
            weight: Tensor::new(
                init.normal(in_features * out_features),
                vec![in_features, out_features],
            ),
            bias: Tensor::zeros(vec![out_features]),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [seq_len, in_features]
    ///
    /// # Returns
    ///
    /// Tuple of (output [seq_len, out_features], cache holding x)
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = x.matmul(&self.weight).add(&self.bias);
        (y, LinearCache { x: x.clone() })
    }

    /// Backward pass
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient from next layer [seq_len, out_features]
    /// * `cache` - Cached values from forward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        LinearGradients {
            weight: cache.x.transpose().matmul(grad_out),
            bias: grad_out.sum_rows(),
            x: grad_out.matmul(&self.weight.transpose()),
        }
    }

    pub(crate) fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((format!("{prefix}.weight"), &self.weight));
        out.push((format!("{prefix}.bias"), &self.bias));
    }

    pub(crate) fn parameters_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Tensor>) {
        out.push(&mut self.weight);
        out.push(&mut self.bias);
    }
}

/// Cache for linear layer backward pass
#[derive(Clone, Debug)]
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for linear layer
#[derive(Clone, Debug)]
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Tensor,
    /// Gradient to pass to previous layer
    pub x: Tensor,
}

impl LinearGradients {
    /// Move parameter gradients into `out`, in parameter order
    pub(crate) fn flatten_into(self, out: &mut Vec<Tensor>) {
        out.push(self.weight);
        out.push(self.bias);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape_and_bias() {
        let mut init = Initializer::new(0.02, 0).unwrap();
        let mut layer = Linear::new(3, 2, &mut init);
        layer.weight = Tensor::zeros(vec![3, 2]);
        layer.bias = Tensor::new(vec![1.0, -1.0], vec![2]);

        let x = Tensor::new(vec![1.0; 12], vec![4, 3]);
        let (y, _) = layer.forward(&x);
        assert_eq!(y.shape, vec![4, 2]);
        assert_eq!(y.row(3), &[1.0, -1.0]);
    }

    #[test]
    fn test_backward_matches_formulas() {
        let layer = Linear {
            weight: Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]),
            bias: Tensor::zeros(vec![2]),
        };
        let x = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        let (_, cache) = layer.forward(&x);
        let grad_out = Tensor::new(vec![1.0, 1.0, 2.0, 0.0], vec![2, 2]);
        let grads = layer.backward(&grad_out, &cache);

        assert_eq!(grads.weight.data, vec![1.0, 1.0, 2.0, 0.0]);
        assert_eq!(grads.bias.data, vec![3.0, 1.0]);
        // grad_x = grad_out @ W^T
        assert_eq!(grads.x.data, vec![3.0, 7.0, 2.0, 6.0]);
    }

    #[test]
    fn test_init_is_seeded() {
        let a = Linear::new(4, 4, &mut Initializer::new(0.02, 7).unwrap());
        let b = Linear::new(4, 4, &mut Initializer::new(0.02, 7).unwrap());
        assert_eq!(a.weight, b.weight);
        assert!(a.bias.data.iter().all(|&v| v == 0.0));
    }
}
