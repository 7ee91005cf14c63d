//! Position-wise Feed-Forward Sublayer
//!
//! ```text
//! x [L, embed_dim] → Linear1 → ReLU → Linear2 → y [L, embed_dim]
//!                    (→ ff_dim)       (→ embed_dim)
//! ```
//!
//! Applied to every position independently. The hidden width `ff_dim` is a
//! model hyperparameter (commonly 4 × `embed_dim`).

use super::activation::{relu_backward, relu_forward};
use super::linear::{Initializer, Linear, LinearCache, LinearGradients};
use crate::tensor::Tensor;

/// Two-layer feed-forward network with ReLU activation
#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl FeedForward {
    /// # Arguments
    ///
    /// * `embed_dim` - Input and output width
    /// * `ff_dim` - Hidden width
    /// * `init` - Seeded initializer
    pub fn new(embed_dim: usize, ff_dim: usize, init: &mut Initializer) -> Self {
        Self {
            fc1: Linear::new(embed_dim, ff_dim, init),
            fc2: Linear::new(ff_dim, embed_dim, init),
        }
    }

    /// Forward pass: x → fc1 → ReLU → fc2
    pub fn forward(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let h_activated = relu_forward(&h);
        let (y, fc2_cache) = self.fc2.forward(&h_activated);

        let cache = FeedForwardCache {
            fc1_cache,
            h,
            fc2_cache,
        };
        (y, cache)
    }

    /// Backward pass through fc2, ReLU and fc1
    pub fn backward(&self, grad_out: &Tensor, cache: &FeedForwardCache) -> FeedForwardGradients {
        let fc2_grads = self.fc2.backward(grad_out, &cache.fc2_cache);
        let grad_h = relu_backward(&fc2_grads.x, &cache.h);
        let fc1_grads = self.fc1.backward(&grad_h, &cache.fc1_cache);

        FeedForwardGradients {
            x: fc1_grads.x.clone(),
            fc1: fc1_grads,
            fc2: fc2_grads,
        }
    }

    pub(crate) fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.fc1.named_parameters(&format!("{prefix}.fc1"), out);
        self.fc2.named_parameters(&format!("{prefix}.fc2"), out);
    }

    pub(crate) fn parameters_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Tensor>) {
        self.fc1.parameters_mut(out);
        self.fc2.parameters_mut(out);
    }
}

/// Cache for feed-forward backward pass
#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    /// Pre-activation, needed for the ReLU backward
    pub h: Tensor,
    pub fc2_cache: LinearCache,
}

/// Gradients for the feed-forward sublayer
#[derive(Clone, Debug)]
pub struct FeedForwardGradients {
    pub fc1: LinearGradients,
    pub fc2: LinearGradients,
    pub x: Tensor,
}

impl FeedForwardGradients {
    pub(crate) fn flatten_into(self, out: &mut Vec<Tensor>) {
        self.fc1.flatten_into(out);
        self.fc2.flatten_into(out);
    }
}
