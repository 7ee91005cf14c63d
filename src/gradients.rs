//! Gradient Utilities
//!
//! [`ModelGradients`] holds one gradient tensor per model parameter, in the
//! order of [`LanguageModel::named_parameters`](crate::LanguageModel::named_parameters).
//! Because the list is flat, accumulation over a batch, norm computation and
//! clipping are plain loops over tensors.
//!
//! ## Gradient Clipping
//!
//! ```text
//! norm = √(Σ g²)                      // global L2 norm over every parameter
//! if norm > max_norm:
//!     g *= max_norm / norm            // same factor for every tensor
//! ```
//!
//! Scaling every tensor by one factor keeps the update direction and bounds
//! its magnitude.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Gradients for every model parameter, in canonical parameter order
#[derive(Clone, Debug)]
pub struct ModelGradients {
    pub tensors: Vec<Tensor>,
}

impl ModelGradients {
    /// All-zero gradients with the given shapes
    pub fn zeros_like<'a>(shapes: impl IntoIterator<Item = &'a Tensor>) -> Self {
        Self {
            tensors: shapes
                .into_iter()
                .map(|t| Tensor::zeros(t.shape.clone()))
                .collect(),
        }
    }

    /// Element-wise `self += other`
    pub fn accumulate(&mut self, other: &ModelGradients) {
        assert_eq!(
            self.tensors.len(),
            other.tensors.len(),
            "gradient sets describe different models"
        );
        self.tensors
            .par_iter_mut()
            .zip(&other.tensors)
            .for_each(|(a, b)| a.add_assign(b));
    }

    /// Multiply every gradient by `factor`
    pub fn scale(&mut self, factor: f32) {
        for t in &mut self.tensors {
            t.scale_in_place(factor);
        }
    }

    /// `true` if every gradient value is finite
    pub fn is_finite(&self) -> bool {
        self.tensors.iter().all(Tensor::is_finite)
    }
}

/// Compute the global L2 norm of all gradients
///
/// # Returns
///
/// `√(Σ g²)` over every value of every gradient tensor
pub fn compute_grad_norm(grads: &ModelGradients) -> f32 {
    grads
        .tensors
        .par_iter()
        .map(Tensor::sum_squares)
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients to a maximum global norm
///
/// # Arguments
///
/// * `grads` - Gradients to clip (modified in place)
/// * `max_norm` - Maximum allowed norm (typically 1.0)
///
/// # Returns
///
/// The norm before clipping
pub fn clip_gradients(grads: &mut ModelGradients, max_norm: f32) -> f32 {
    let norm = compute_grad_norm(grads);
    if norm > max_norm && norm > 0.0 {
        grads.scale(max_norm / norm);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grads() -> ModelGradients {
        ModelGradients {
            tensors: vec![
                Tensor::new(vec![3.0, 0.0], vec![2]),
                Tensor::new(vec![0.0, 4.0, 0.0, 0.0], vec![2, 2]),
            ],
        }
    }

    #[test]
    fn test_grad_norm() {
        assert!((compute_grad_norm(&grads()) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut g = grads();
        let before = clip_gradients(&mut g, 1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((compute_grad_norm(&g) - 1.0).abs() < 1e-5);
        // Direction is preserved
        assert!((g.tensors[0].data[0] - 0.6).abs() < 1e-6);
        assert!((g.tensors[1].data[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let mut g = grads();
        clip_gradients(&mut g, 10.0);
        assert_eq!(g.tensors[0].data, vec![3.0, 0.0]);
    }

    #[test]
    fn test_accumulate_and_scale() {
        let mut total = ModelGradients::zeros_like(&grads().tensors);
        total.accumulate(&grads());
        total.accumulate(&grads());
        total.scale(0.5);
        assert_eq!(total.tensors[1].data, vec![0.0, 4.0, 0.0, 0.0]);
        assert!(total.is_finite());
    }
}
