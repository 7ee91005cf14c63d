//! Quill: A Minimal Decoder-Only Language Model
//!
//! A small transformer language model written from scratch in Rust: token
//! and position embeddings, a stack of post-norm attention blocks, a linear
//! output head, a hand-written backward pass, AdamW training on a padded
//! causal language-modeling loss, and nucleus (top-p) sampling.
//!
//! # Modules
//!
//! - [`tensor`] - Row-major `f32` tensors with parallel matmul and softmax
//! - [`layers`] - Linear, layer norm, ReLU, attention, feed-forward, block
//! - [`model`] - The language model, its backward pass and named parameters
//! - [`loss`] - Shifted, padding-masked cross-entropy
//! - [`gradients`] - Gradient lists, global norm and clipping
//! - [`optimizer`] - AdamW with selective weight decay
//! - [`data`] - Tokenized datasets and batch loading
//! - [`train`] - The training loop
//! - [`generate`] - Autoregressive generation with top-p sampling
//! - [`tokenizer`] - Tokenizer trait and a byte-level tokenizer
//! - [`checkpoint`] - Saving and loading parameters and optimizer state
//! - [`training_logger`] - CSV and console metrics
//! - [`config`] - Model, training and generation settings
//! - [`error`] - The crate's error type
//!
//! # Example
//!
//! ```rust
//! use quill::{ByteTokenizer, GenerationConfig, Generator, LanguageModel, ModelConfig, Tokenizer};
//!
//! let tokenizer = ByteTokenizer::new();
//! let model = LanguageModel::new(&ModelConfig {
//!     num_layers: 1,
//!     ..ModelConfig::tiny(tokenizer.vocab_size())
//! })?;
//!
//! let generator = Generator::new(&model, GenerationConfig {
//!     max_new_tokens: 8,
//!     top_p: 0.9,
//!     eos_token_id: Some(tokenizer.eos_token_id()),
//!     ..GenerationConfig::default()
//! })?;
//! let output = generator.generate(&tokenizer.encode("To be"))?;
//! println!("{}", tokenizer.decode(&output.tokens));
//! # Ok::<(), quill::QuillError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod tokenizer;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::Checkpoint;
pub use config::{GenerationConfig, ModelConfig, PositionalEncoding, TrainingConfig};
pub use data::{Batch, BatchLoader, TokenizedDataset};
pub use error::{QuillError, Result};
pub use generate::{sample_from_logits, top_p_filter, Generation, Generator, StopReason};
pub use gradients::{clip_gradients, compute_grad_norm, ModelGradients};
pub use loss::{causal_lm_loss, causal_lm_loss_sum};
pub use model::{ForwardCache, LanguageModel};
pub use optimizer::AdamWOptimizer;
pub use tensor::Tensor;
pub use tokenizer::{ensure_vocab_matches, ByteTokenizer, Tokenizer};
pub use train::{Evaluation, StepOutput, Trainer, TrainingReport};
pub use training_logger::{StepMetrics, TrainingLogger};
