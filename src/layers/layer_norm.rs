//! Layer Normalization
//!
//! Normalizes each position's feature vector to zero mean and unit variance,
//! then applies a learned scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = sum(x) / N
//! 2. var  = sum((x - mean)²) / N
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum over positions (grad_y * x_norm)
//! grad_β = sum over positions (grad_y)
//! g      = grad_y * γ
//! grad_x = (g - mean(g) - x_norm * mean(g * x_norm)) / √(var + ε)
//! ```
//!
//! The two mean terms account for every element of a row feeding into that
//! row's mean and variance.

use crate::tensor::Tensor;

/// Layer normalization over the last dimension
#[derive(Clone, Debug)]
pub struct LayerNorm {
    /// Scale parameter `[dim]`
    pub gamma: Tensor,
    /// Shift parameter `[dim]`
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1, beta = 0 and ε = 1e-5
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![dim], 1.0),
            beta: Tensor::zeros(vec![dim]),
            eps: 1e-5,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [seq_len, dim]
    ///
    /// # Returns
    ///
    /// Tuple of (normalized output, cache)
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let dim = self.gamma.len();
        let rows = x.rows();

        let mut x_norm = Vec::with_capacity(x.len());
        let mut inv_std = Vec::with_capacity(rows);
        for i in 0..rows {
            let row = x.row(i);
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let r = 1.0 / (var + self.eps).sqrt();
            x_norm.extend(row.iter().map(|&v| (v - mean) * r));
            inv_std.push(r);
        }
        let x_norm = Tensor::new(x_norm, x.shape.clone());
        let y = x_norm.mul(&self.gamma).add(&self.beta);

        (y, LayerNormCache { x_norm, inv_std })
    }

    /// Backward pass
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient from next layer [seq_len, dim]
    /// * `cache` - Cached values from forward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let dim = self.gamma.len();
        let rows = grad_out.rows();

        let mut grad_gamma = vec![0.0; dim];
        let mut grad_beta = vec![0.0; dim];
        let mut grad_x = Vec::with_capacity(grad_out.len());

        for i in 0..rows {
            let g_row = grad_out.row(i);
            let xn_row = cache.x_norm.row(i);

            for j in 0..dim {
                grad_gamma[j] += g_row[j] * xn_row[j];
                grad_beta[j] += g_row[j];
            }

            let g: Vec<f32> = g_row
                .iter()
                .zip(&self.gamma.data)
                .map(|(gy, gamma)| gy * gamma)
                .collect();
            let mean_g = g.iter().sum::<f32>() / dim as f32;
            let mean_g_xn = g.iter().zip(xn_row).map(|(a, b)| a * b).sum::<f32>() / dim as f32;

            let r = cache.inv_std[i];
            grad_x.extend(
                g.iter()
                    .zip(xn_row)
                    .map(|(&gj, &xn)| (gj - mean_g - xn * mean_g_xn) * r),
            );
        }

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![dim]),
            beta: Tensor::new(grad_beta, vec![dim]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }

    pub(crate) fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((format!("{prefix}.gamma"), &self.gamma));
        out.push((format!("{prefix}.beta"), &self.beta));
    }

    pub(crate) fn parameters_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Tensor>) {
        out.push(&mut self.gamma);
        out.push(&mut self.beta);
    }
}

/// Cache for layer norm backward pass
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// `1 / √(var + ε)` per row
    pub inv_std: Vec<f32>,
}

/// Gradients for layer norm
#[derive(Clone, Debug)]
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl LayerNormGradients {
    pub(crate) fn flatten_into(self, out: &mut Vec<Tensor>) {
        out.push(self.gamma);
        out.push(self.beta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_normalizes_rows() {
        let ln = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 14.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for i in 0..2 {
            let row = y.row(i);
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut ln = LayerNorm::new(3);
        ln.gamma = Tensor::new(vec![0.5, 1.5, -1.0], vec![3]);
        let x = Tensor::new(vec![0.3, -1.2, 2.0, 0.7, 0.1, -0.4], vec![2, 3]);
        let weights = Tensor::new(vec![1.0, -2.0, 0.5, 0.3, 0.8, -1.1], vec![2, 3]);

        // loss = sum(y * weights), so grad_out = weights
        let loss = |input: &Tensor| -> f32 {
            let (y, _) = ln.forward(input);
            y.data.iter().zip(&weights.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&weights, &cache);

        let h = 1e-3;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - grads.x.data[i]).abs() < 1e-2,
                "index {i}: numeric {numeric} vs analytic {}",
                grads.x.data[i]
            );
        }
        // grad_beta is the column sum of grad_out
        assert!((grads.beta.data[0] - 1.3).abs() < 1e-6);
    }
}
