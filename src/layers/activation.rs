//! Activation Functions
//!
//! ## ReLU
//!
//! ```text
//! ReLU(x)  = max(0, x)
//! ReLU'(x) = 1 if x > 0 else 0
//! ```
//!
//! The feed-forward sublayer applies ReLU between its two projections. The
//! backward pass needs the pre-activation input to know which units were on.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// ReLU activation (forward pass)
pub fn relu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::new(result, x.shape.clone())
}

/// ReLU activation derivative (backward pass)
///
/// # Arguments
///
/// * `grad_out` - Gradient from next layer
/// * `x` - Original input to ReLU (from forward pass)
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let result = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&v, &g)| if v > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::new(result, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Tensor::new(vec![-1.0, 0.0, 2.5], vec![3]);
        assert_eq!(relu_forward(&x).data, vec![0.0, 0.0, 2.5]);

        let g = Tensor::new(vec![5.0, 5.0, 5.0], vec![3]);
        assert_eq!(relu_backward(&g, &x).data, vec![0.0, 0.0, 5.0]);
    }
}
