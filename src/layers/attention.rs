//! Multi-Head Self-Attention
//!
//! Lets every position mix in information from the other positions of the
//! sequence, weighted by learned query/key similarity.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V  = x @ W_q + b_q, x @ W_k + b_k, x @ W_v + b_v      [L, E]
//! per head h (columns h·d .. (h+1)·d, d = E / H):
//!     scores_h = (Q_h @ K_h^T) / √d                           [L, L]
//!     probs_h  = softmax(mask(scores_h))
//!     out_h    = probs_h @ V_h                                [L, d]
//! y = concat(out_0 .. out_{H-1}) @ W_o + b_o                  [L, E]
//! ```
//!
//! ## Causal Masking
//!
//! Position `i` may only attend to positions `j ≤ i`. The strictly-upper
//! triangular mask is built once at construction for the full context
//! window, and each forward pass reads its top-left `L × L` block. Masked
//! scores become `-inf`, so their probability is exactly zero.
//!
//! ## Backward Pass
//!
//! 1. Backprop through the output projection
//! 2. Per head, backprop through `probs @ V`
//! 3. Per head, backprop through the row softmax:
//!    `grad_s = p * (grad_p - Σ_j p_j grad_p_j)`
//! 4. Per head, backprop through the scaled `Q @ K^T`
//! 5. Backprop through the Q, K, V projections and sum the three input
//!    gradients
//!
//! Heads are independent, so steps 2-4 run across heads in parallel.

use super::linear::{Initializer, Linear, LinearCache, LinearGradients};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Multi-head self-attention with an optional causal mask
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    pub num_heads: usize,
    /// `[max_seq_len, max_seq_len]`, 1.0 where attention is forbidden
    causal_mask: Option<Tensor>,
}

impl MultiHeadAttention {
    /// Create a new attention unit
    ///
    /// # Arguments
    ///
    /// * `embed_dim` - Model width, must be divisible by `num_heads`
    /// * `num_heads` - Number of heads
    /// * `max_seq_len` - Context window the mask is built for
    /// * `causal` - Whether to mask future positions
    /// * `init` - Seeded initializer
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        max_seq_len: usize,
        causal: bool,
        init: &mut Initializer,
    ) -> Self {
        let causal_mask = causal.then(|| causal_mask(max_seq_len));
        Self {
            q_proj: Linear::new(embed_dim, embed_dim, init),
            k_proj: Linear::new(embed_dim, embed_dim, init),
            v_proj: Linear::new(embed_dim, embed_dim, init),
            out_proj: Linear::new(embed_dim, embed_dim, init),
            num_heads,
            causal_mask,
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.q_proj.in_features()
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim() / self.num_heads
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [seq_len, embed_dim], `seq_len ≤ max_seq_len`
    ///
    /// # Returns
    ///
    /// Tuple of (output [seq_len, embed_dim], cache)
    pub fn forward(&self, x: &Tensor) -> (Tensor, AttentionCache) {
        let seq_len = x.shape[0];
        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let (q, q_cache) = self.q_proj.forward(x);
        let (k, k_cache) = self.k_proj.forward(x);
        let (v, v_cache) = self.v_proj.forward(x);

        let mask = self
            .causal_mask
            .as_ref()
            .map(|m| m.top_left(seq_len, seq_len));

        let per_head: Vec<(Tensor, Tensor)> = (0..self.num_heads)
            .into_par_iter()
            .map(|h| {
                let (start, end) = (h * head_dim, (h + 1) * head_dim);
                let qh = q.columns(start, end);
                let kh = k.columns(start, end);
                let vh = v.columns(start, end);

                let mut scores = qh.matmul(&kh.transpose()).mul_scalar(scale);
                if let Some(mask) = &mask {
                    scores = scores.masked_fill(mask, f32::NEG_INFINITY);
                }
                let probs = scores.softmax();
                let out = probs.matmul(&vh);
                (probs, out)
            })
            .collect();

        let mut concat = Tensor::zeros(vec![seq_len, self.embed_dim()]);
        let mut probs = Vec::with_capacity(self.num_heads);
        for (h, (p, out)) in per_head.into_iter().enumerate() {
            concat.set_columns(h * head_dim, &out);
            probs.push(p);
        }

        let (y, out_cache) = self.out_proj.forward(&concat);

        let cache = AttentionCache {
            q,
            k,
            v,
            probs,
            q_cache,
            k_cache,
            v_cache,
            out_cache,
        };
        (y, cache)
    }

    /// Backward pass through attention
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient from next layer [seq_len, embed_dim]
    /// * `cache` - Cached values from forward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let seq_len = grad_out.shape[0];
        let embed_dim = self.embed_dim();
        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let out_grads = self.out_proj.backward(grad_out, &cache.out_cache);
        let grad_concat = &out_grads.x;

        let per_head: Vec<(Tensor, Tensor, Tensor)> = (0..self.num_heads)
            .into_par_iter()
            .map(|h| {
                let (start, end) = (h * head_dim, (h + 1) * head_dim);
                let grad_out_h = grad_concat.columns(start, end);
                let probs = &cache.probs[h];
                let qh = cache.q.columns(start, end);
                let kh = cache.k.columns(start, end);
                let vh = cache.v.columns(start, end);

                // out_h = probs @ V_h
                let grad_vh = probs.transpose().matmul(&grad_out_h);
                let grad_probs = grad_out_h.matmul(&vh.transpose());

                // Softmax couples every entry of a row
                let mut grad_scores = Tensor::zeros(vec![seq_len, seq_len]);
                for i in 0..seq_len {
                    let p_row = probs.row(i);
                    let g_row = grad_probs.row(i);
                    let dot: f32 = p_row.iter().zip(g_row).map(|(p, g)| p * g).sum();
                    for (s, (&p, &g)) in grad_scores.row_mut(i).iter_mut().zip(p_row.iter().zip(g_row)) {
                        *s = p * (g - dot);
                    }
                }

                let grad_qh = grad_scores.matmul(&kh).mul_scalar(scale);
                let grad_kh = grad_scores.transpose().matmul(&qh).mul_scalar(scale);
                (grad_qh, grad_kh, grad_vh)
            })
            .collect();

        let mut grad_q = Tensor::zeros(vec![seq_len, embed_dim]);
        let mut grad_k = Tensor::zeros(vec![seq_len, embed_dim]);
        let mut grad_v = Tensor::zeros(vec![seq_len, embed_dim]);
        for (h, (gq, gk, gv)) in per_head.into_iter().enumerate() {
            grad_q.set_columns(h * head_dim, &gq);
            grad_k.set_columns(h * head_dim, &gk);
            grad_v.set_columns(h * head_dim, &gv);
        }

        let q_grads = self.q_proj.backward(&grad_q, &cache.q_cache);
        let k_grads = self.k_proj.backward(&grad_k, &cache.k_cache);
        let v_grads = self.v_proj.backward(&grad_v, &cache.v_cache);

        // Q, K and V all read the same input
        let mut grad_x = q_grads.x.clone();
        grad_x.add_assign(&k_grads.x);
        grad_x.add_assign(&v_grads.x);

        AttentionGradients {
            q_proj: q_grads,
            k_proj: k_grads,
            v_proj: v_grads,
            out_proj: out_grads,
            x: grad_x,
        }
    }

    pub(crate) fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.q_proj.named_parameters(&format!("{prefix}.q_proj"), out);
        self.k_proj.named_parameters(&format!("{prefix}.k_proj"), out);
        self.v_proj.named_parameters(&format!("{prefix}.v_proj"), out);
        self.out_proj.named_parameters(&format!("{prefix}.out_proj"), out);
    }

    pub(crate) fn parameters_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Tensor>) {
        self.q_proj.parameters_mut(out);
        self.k_proj.parameters_mut(out);
        self.v_proj.parameters_mut(out);
        self.out_proj.parameters_mut(out);
    }
}

/// Strictly-upper triangular `[n, n]` mask: 1.0 at `(i, j)` when `j > i`
pub fn causal_mask(n: usize) -> Tensor {
    let mut mask = vec![0.0; n * n];
    for i in 0..n {
        for j in i + 1..n {
            mask[i * n + j] = 1.0;
        }
    }
    Tensor::new(mask, vec![n, n])
}

/// Cache for attention backward pass
#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Attention probabilities, one `[seq_len, seq_len]` matrix per head
    pub probs: Vec<Tensor>,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub out_cache: LinearCache,
}

/// Gradients for attention
#[derive(Clone, Debug)]
pub struct AttentionGradients {
    pub q_proj: LinearGradients,
    pub k_proj: LinearGradients,
    pub v_proj: LinearGradients,
    pub out_proj: LinearGradients,
    pub x: Tensor,
}

impl AttentionGradients {
    pub(crate) fn flatten_into(self, out: &mut Vec<Tensor>) {
        self.q_proj.flatten_into(out);
        self.k_proj.flatten_into(out);
        self.v_proj.flatten_into(out);
        self.out_proj.flatten_into(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attention(num_heads: usize, causal: bool) -> MultiHeadAttention {
        let mut init = Initializer::new(0.3, 11).unwrap();
        MultiHeadAttention::new(8, num_heads, 6, causal, &mut init)
    }

    fn input(seq_len: usize) -> Tensor {
        Tensor::new(
            (0..seq_len * 8).map(|i| ((i * 7) % 11) as f32 * 0.1 - 0.5).collect(),
            vec![seq_len, 8],
        )
    }

    #[test]
    fn test_causal_mask_layout() {
        let m = causal_mask(3);
        assert_eq!(m.data, vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_causal_probs_ignore_future() {
        let attn = attention(2, true);
        let (y, cache) = attn.forward(&input(5));
        assert_eq!(y.shape, vec![5, 8]);
        for probs in &cache.probs {
            for i in 0..5 {
                let row = probs.row(i);
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
                assert!(row[i + 1..].iter().all(|&p| p == 0.0));
            }
        }
    }

    #[test]
    fn test_causal_prefix_is_stable() {
        // Appending tokens must not change earlier outputs under a causal mask
        let attn = attention(4, true);
        let long = input(5);
        let short = long.top_left(3, 8);
        let (y_long, _) = attn.forward(&long);
        let (y_short, _) = attn.forward(&short);
        for (a, b) in y_short.data.iter().zip(&y_long.data[..3 * 8]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        for &(heads, causal) in &[(1, true), (2, false), (4, true)] {
            let attn = attention(heads, causal);
            let x = input(4);
            let weights: Vec<f32> = (0..x.len()).map(|i| ((i % 5) as f32 - 2.0) * 0.3).collect();
            let loss = |inp: &Tensor| -> f32 {
                let (y, _) = attn.forward(inp);
                y.data.iter().zip(&weights).map(|(a, b)| a * b).sum()
            };

            let (_, cache) = attn.forward(&x);
            let grads = attn.backward(&Tensor::new(weights.clone(), x.shape.clone()), &cache);

            let h = 1e-2;
            for i in (0..x.len()).step_by(3) {
                let mut plus = x.clone();
                plus.data[i] += h;
                let mut minus = x.clone();
                minus.data[i] -= h;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
                assert!(
                    (numeric - grads.x.data[i]).abs() < 2e-3,
                    "heads={heads} causal={causal} index {i}: numeric {numeric} vs analytic {}",
                    grads.x.data[i]
                );
            }
        }
    }
}
