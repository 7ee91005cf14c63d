//! Transformer Block
//!
//! Attention and feed-forward sublayers, each wrapped in a residual
//! connection followed by layer normalization (post-norm).
//!
//! ## Architecture
//!
//! ```text
//! x ──→ Attention ──→ (+) ──→ LayerNorm1 ──┬──→ FeedForward ──→ (+) ──→ LayerNorm2 ──→ y
//! │                    ↑                    │                    ↑
//! └────────────────────┘                    └────────────────────┘
//! ```
//!
//! Output shape always equals input shape, `[seq_len, embed_dim]`.
//!
//! ## Backward Pass
//!
//! At each residual the gradient splits into the sublayer path and the skip
//! path, and the two contributions are summed.

use super::attention::{AttentionCache, AttentionGradients, MultiHeadAttention};
use super::feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
use super::layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
use super::linear::Initializer;
use crate::config::ModelConfig;
use crate::tensor::Tensor;

/// Post-norm transformer block
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub attn: MultiHeadAttention,
    pub ln1: LayerNorm,
    pub ff: FeedForward,
    pub ln2: LayerNorm,
}

impl TransformerBlock {
    /// Create a block sized by `config`
    pub fn new(config: &ModelConfig, init: &mut Initializer) -> Self {
        Self {
            attn: MultiHeadAttention::new(
                config.embed_dim,
                config.num_heads,
                config.max_seq_len,
                config.causal,
                init,
            ),
            ln1: LayerNorm::new(config.embed_dim),
            ff: FeedForward::new(config.embed_dim, config.ff_dim, init),
            ln2: LayerNorm::new(config.embed_dim),
        }
    }

    /// Forward pass
    ///
    /// ```text
    /// h = LN1(x + Attention(x))
    /// y = LN2(h + FeedForward(h))
    /// ```
    pub fn forward(&self, x: &Tensor) -> (Tensor, BlockCache) {
        let (attn_out, attn_cache) = self.attn.forward(x);
        let (h, ln1_cache) = self.ln1.forward(&x.add(&attn_out));

        let (ff_out, ff_cache) = self.ff.forward(&h);
        let (y, ln2_cache) = self.ln2.forward(&h.add(&ff_out));

        let cache = BlockCache {
            attn_cache,
            ln1_cache,
            ff_cache,
            ln2_cache,
        };
        (y, cache)
    }

    /// Backward pass through the block
    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        let ln2_grads = self.ln2.backward(grad_out, &cache.ln2_cache);

        // Second residual: feed-forward path + skip path
        let ff_grads = self.ff.backward(&ln2_grads.x, &cache.ff_cache);
        let mut grad_h = ln2_grads.x.clone();
        grad_h.add_assign(&ff_grads.x);

        let ln1_grads = self.ln1.backward(&grad_h, &cache.ln1_cache);

        // First residual: attention path + skip path
        let attn_grads = self.attn.backward(&ln1_grads.x, &cache.attn_cache);
        let mut grad_x = ln1_grads.x.clone();
        grad_x.add_assign(&attn_grads.x);

        BlockGradients {
            attn: attn_grads,
            ln1: ln1_grads,
            ff: ff_grads,
            ln2: ln2_grads,
            x: grad_x,
        }
    }

    pub(crate) fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.attn.named_parameters(&format!("{prefix}.attn"), out);
        self.ln1.named_parameters(&format!("{prefix}.ln1"), out);
        self.ff.named_parameters(&format!("{prefix}.ff"), out);
        self.ln2.named_parameters(&format!("{prefix}.ln2"), out);
    }

    pub(crate) fn parameters_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Tensor>) {
        self.attn.parameters_mut(out);
        self.ln1.parameters_mut(out);
        self.ff.parameters_mut(out);
        self.ln2.parameters_mut(out);
    }
}

/// Cache for transformer block backward pass
#[derive(Clone, Debug)]
pub struct BlockCache {
    pub attn_cache: AttentionCache,
    pub ln1_cache: LayerNormCache,
    pub ff_cache: FeedForwardCache,
    pub ln2_cache: LayerNormCache,
}

/// Gradients for transformer block
#[derive(Clone, Debug)]
pub struct BlockGradients {
    pub attn: AttentionGradients,
    pub ln1: LayerNormGradients,
    pub ff: FeedForwardGradients,
    pub ln2: LayerNormGradients,
    pub x: Tensor,
}

impl BlockGradients {
    pub(crate) fn flatten_into(self, out: &mut Vec<Tensor>) {
        self.attn.flatten_into(out);
        self.ln1.flatten_into(out);
        self.ff.flatten_into(out);
        self.ln2.flatten_into(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> TransformerBlock {
        let config = ModelConfig {
            embed_dim: 8,
            num_heads: 2,
            ff_dim: 16,
            max_seq_len: 8,
            init_std: 0.2,
            ..ModelConfig::default()
        };
        let mut init = Initializer::new(config.init_std, 5).unwrap();
        TransformerBlock::new(&config, &mut init)
    }

    #[test]
    fn test_output_shape_matches_input() {
        let b = block();
        for seq_len in [1, 3, 8] {
            let x = Tensor::new((0..seq_len * 8).map(|i| i as f32 * 0.01).collect(), vec![seq_len, 8]);
            let (y, _) = b.forward(&x);
            assert_eq!(y.shape, x.shape);
            assert!(y.is_finite());
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let b = block();
        let x = Tensor::new(
            (0..4 * 8).map(|i| ((i * 5) % 9) as f32 * 0.2 - 0.8).collect(),
            vec![4, 8],
        );
        let weights: Vec<f32> = (0..x.len()).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect();
        let loss = |inp: &Tensor| -> f32 {
            let (y, _) = b.forward(inp);
            y.data.iter().zip(&weights).map(|(a, w)| a * w).sum()
        };

        let (_, cache) = b.forward(&x);
        let grads = b.backward(&Tensor::new(weights.clone(), x.shape.clone()), &cache);

        let h = 1e-2;
        for i in (0..x.len()).step_by(5) {
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
    }
}
