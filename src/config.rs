//! Configuration
//!
//! Three plain structs describe a run:
//!
//! - [`ModelConfig`]: architecture hyperparameters, fixed once the model is built
//!   (except `vocab_size`, which only changes through
//!   [`LanguageModel::resize_vocab`](crate::LanguageModel::resize_vocab))
//! - [`TrainingConfig`]: optimizer and loop settings
//! - [`GenerationConfig`]: sampling settings for the generator
//!
//! Each has a `validate()` that returns [`QuillError::InvalidParameter`] for
//! out-of-range values. Constructors that consume a config call it, so a
//! config that fails validation never reaches the numeric code.
//!
//! ## Parameter Count
//!
//! ```text
//! embeddings ≈ vocab_size × embed_dim (+ max_seq_len × embed_dim if learned)
//! per_layer  ≈ 4 × embed_dim² + 2 × embed_dim × ff_dim
//! lm_head    ≈ embed_dim × vocab_size + vocab_size
//! ```

use crate::error::{QuillError, Result};
use serde::{Deserialize, Serialize};

/// How position information is injected into the token embeddings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionalEncoding {
    /// Trainable `[max_seq_len, embed_dim]` table
    Learned,
    /// Fixed sine/cosine table, not trained
    Sinusoidal,
    /// No position information. The model is then order-blind
    None,
}

/// Model architecture configuration
///
/// # Fields
///
/// - `vocab_size`: Number of token ids the model accepts and predicts
/// - `embed_dim`: Width of every hidden representation
/// - `num_layers`: Number of transformer blocks (0 is allowed)
/// - `num_heads`: Attention heads per block, must divide `embed_dim`
/// - `ff_dim`: Hidden width of the feed-forward sublayer
/// - `max_seq_len`: Context window
/// - `positional`: Positional encoding mode
/// - `causal`: Mask future positions in attention
/// - `init_std`: Standard deviation of the normal weight initialization
/// - `seed`: Seed for parameter initialization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub ff_dim: usize,
    pub max_seq_len: usize,
    pub positional: PositionalEncoding,
    pub causal: bool,
    pub init_std: f32,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 257, // byte tokenizer + end-of-text
            embed_dim: 128,
            num_layers: 4,
            num_heads: 4,
            ff_dim: 512,
            max_seq_len: 128,
            positional: PositionalEncoding::Learned,
            causal: true,
            init_std: 0.02,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Tiny config for tests and quick experiments
    ///
    /// **~60K parameters** with a byte-level vocabulary
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            embed_dim: 32,
            num_layers: 2,
            num_heads: 4,
            ff_dim: 128,
            max_seq_len: 64,
            ..Self::default()
        }
    }

    /// Small config for short training runs on a laptop
    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            embed_dim: 128,
            num_layers: 3,
            num_heads: 4,
            ff_dim: 512,
            max_seq_len: 128,
            ..Self::default()
        }
    }

    /// Width of a single attention head
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Check that every dimension is usable
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(QuillError::param("vocab_size must be greater than 0"));
        }
        if self.embed_dim == 0 {
            return Err(QuillError::param("embed_dim must be greater than 0"));
        }
        if self.num_heads == 0 {
            return Err(QuillError::param("num_heads must be greater than 0"));
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(QuillError::param(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim, self.num_heads
            )));
        }
        if self.ff_dim == 0 {
            return Err(QuillError::param("ff_dim must be greater than 0"));
        }
        if self.max_seq_len == 0 {
            return Err(QuillError::param("max_seq_len must be greater than 0"));
        }
        if !(self.init_std.is_finite() && self.init_std > 0.0) {
            return Err(QuillError::param("init_std must be positive and finite"));
        }
        Ok(())
    }
}

/// Training configuration
///
/// `grad_clip` of 0 disables clipping. `warmup_fraction` is the share of
/// total steps spent ramping the learning rate linearly from zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Peak learning rate
    pub learning_rate: f32,
    /// Number of passes through the dataset
    pub num_epochs: usize,
    /// Number of sequences per batch
    pub batch_size: usize,
    /// Decoupled weight decay applied to 2D weight matrices
    pub weight_decay: f32,
    /// Maximum global gradient norm (0 = disabled)
    pub grad_clip: f32,
    /// Fraction of steps used for linear warmup
    pub warmup_fraction: f32,
    /// Print metrics every N steps
    pub log_every: usize,
    /// Shuffle batches each epoch
    pub shuffle: bool,
    /// Seed for batch shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            num_epochs: 1,
            batch_size: 4,
            weight_decay: 0.01,
            grad_clip: 1.0,
            warmup_fraction: 0.0,
            log_every: 100,
            shuffle: true,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Quick-experiment settings
    pub fn tiny() -> Self {
        Self {
            learning_rate: 3e-3,
            num_epochs: 3,
            batch_size: 8,
            warmup_fraction: 0.1,
            log_every: 10,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(QuillError::param("learning_rate must be positive and finite"));
        }
        if self.batch_size == 0 {
            return Err(QuillError::param("batch_size must be greater than 0"));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(QuillError::param("weight_decay must be non-negative"));
        }
        if !(self.grad_clip.is_finite() && self.grad_clip >= 0.0) {
            return Err(QuillError::param("grad_clip must be non-negative (0 disables clipping)"));
        }
        if !(0.0..1.0).contains(&self.warmup_fraction) {
            return Err(QuillError::param("warmup_fraction must be in [0, 1)"));
        }
        Ok(())
    }

    /// Learning rate for a given step
    ///
    /// Linear warmup over the first `warmup_fraction × total_steps` steps,
    /// then cosine decay down to 10% of the peak.
    ///
    /// ```text
    /// lr
    ///  │   ╭──╮
    ///  │  ╱    ╲___
    ///  │ ╱         ╲____
    ///  └──────────────────> step
    /// ```
    pub fn learning_rate_at(&self, step: usize, total_steps: usize) -> f32 {
        let peak = self.learning_rate;
        if total_steps == 0 {
            return peak;
        }
        let warmup_steps = (self.warmup_fraction * total_steps as f32) as usize;
        if step < warmup_steps {
            return peak * (step + 1) as f32 / warmup_steps as f32;
        }

        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = ((step - warmup_steps) as f32 / decay_steps as f32).min(1.0);
        let min_lr = peak * 0.1;
        min_lr + 0.5 * (peak - min_lr) * (1.0 + (std::f32::consts::PI * progress).cos())
    }
}

/// Sampling configuration for [`Generator`](crate::Generator)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens appended to the prompt
    pub max_new_tokens: usize,
    /// Logit divisor, must be > 0
    pub temperature: f32,
    /// Nucleus threshold in (0, 1]
    pub top_p: f32,
    /// Stop as soon as this token is produced
    pub eos_token_id: Option<usize>,
    /// Seed for the sampling RNG
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            temperature: 1.0,
            top_p: 0.9,
            eos_token_id: None,
            seed: 42,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(QuillError::param(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(QuillError::param(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}
