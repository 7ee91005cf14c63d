//! Neural Network Layers
//!
//! Every layer of the language model, each with an explicit forward and
//! backward pass.
//!
//! ## Layers
//!
//! - **activation**: ReLU (forward and backward)
//! - **linear**: Fully connected layer and the seeded [`Initializer`]
//! - **layer_norm**: Layer normalization
//! - **attention**: Multi-head self-attention with a precomputed causal mask
//! - **feed_forward**: Linear → ReLU → Linear
//! - **block**: Post-norm transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache) -> Gradients { }
//! }
//! ```
//!
//! `Cache` holds what the backward pass needs from the forward pass.
//! `Gradients` holds one tensor per parameter plus `x`, the gradient for the
//! layer below. Parameters and their gradients are always listed in the same
//! order, which lets the model flatten both into parallel lists for the
//! optimizer.

pub mod activation;
pub mod attention;
pub mod block;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;

pub use activation::{relu_backward, relu_forward};
pub use attention::{causal_mask, AttentionCache, AttentionGradients, MultiHeadAttention};
pub use block::{BlockCache, BlockGradients, TransformerBlock};
pub use feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{Initializer, Linear, LinearCache, LinearGradients};
