//! Decoder-Only Language Model
//!
//! Token ids in, next-token logits out.
//!
//! ## Architecture
//!
//! ```text
//! Token IDs [L]
//!     ↓
//! Token Embedding [L, E]  +  Positional Encoding [L, E]
//!     ↓
//! Transformer Block × num_layers      (post-norm, see layers::block)
//!     ↓
//! lm_head: Linear(E → vocab_size)
//!     ↓
//! Logits [L, vocab_size]
//! ```
//!
//! ## Positional Encoding
//!
//! - **Learned**: trainable `[max_seq_len, E]` table, part of the parameters
//! - **Sinusoidal**: fixed table, `pe[p, 2i] = sin(p / 10000^(2i/E))`,
//!   `pe[p, 2i+1] = cos(p / 10000^(2i/E))`
//! - **None**: no position signal; with `causal = false` the model is then
//!   permutation-equivariant, which is only useful for tests
//!
//! ## Parameter Naming
//!
//! Parameters are exposed as a flat, ordered list of `(name, tensor)` pairs:
//!
//! ```text
//! token_embedding                 [vocab_size, E]
//! position_embedding              [max_seq_len, E]     (learned only)
//! blocks.{i}.attn.q_proj.weight   [E, E]
//! blocks.{i}.attn.q_proj.bias     [E]
//! ...                             k_proj, v_proj, out_proj
//! blocks.{i}.ln1.gamma / beta     [E]
//! blocks.{i}.ff.fc1.weight        [E, ff_dim]
//! ...                             fc1.bias, fc2.weight, fc2.bias
//! blocks.{i}.ln2.gamma / beta     [E]
//! lm_head.weight                  [E, vocab_size]
//! lm_head.bias                    [vocab_size]
//! ```
//!
//! The same order is used for gradients ([`ModelGradients`]) and optimizer
//! state, and the names key the checkpoint format.

use crate::config::{ModelConfig, PositionalEncoding};
use crate::error::{QuillError, Result};
use crate::gradients::ModelGradients;
use crate::layers::{BlockCache, Initializer, Linear, LinearCache, TransformerBlock};
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Decoder-only transformer language model
///
/// Built only through [`LanguageModel::new`]; there is no shared global
/// instance. Generation borrows the model immutably and training borrows it
/// mutably, so the two cannot overlap on the same parameters.
#[derive(Clone, Debug)]
pub struct LanguageModel {
    config: ModelConfig,
    token_embedding: Tensor,
    /// Learned or sinusoidal table, `None` when positions are disabled
    position_table: Option<Tensor>,
    blocks: Vec<TransformerBlock>,
    lm_head: Linear,
}

impl LanguageModel {
    /// Build a model with freshly initialized parameters
    ///
    /// Weights are drawn from `N(0, init_std²)` with a generator seeded
    /// by `config.seed`, so two models built from equal configs are identical.
    ///
    /// # Errors
    ///
    /// [`QuillError::InvalidParameter`] if the config fails validation
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut init = Initializer::new(config.init_std, config.seed)?;

        let embed_dim = config.embed_dim;
        let token_embedding = Tensor::new(
            init.normal(config.vocab_size * embed_dim),
            vec![config.vocab_size, embed_dim],
        );
        let position_table = match config.positional {
            PositionalEncoding::Learned => Some(Tensor::new(
                init.normal(config.max_seq_len * embed_dim),
                vec![config.max_seq_len, embed_dim],
            )),
            PositionalEncoding::Sinusoidal => {
                Some(sinusoidal_table(config.max_seq_len, embed_dim))
            }
            PositionalEncoding::None => None,
        };

        let blocks = (0..config.num_layers)
            .map(|_| TransformerBlock::new(config, &mut init))
            .collect();
        let lm_head = Linear::new(embed_dim, config.vocab_size, &mut init);

        Ok(Self {
            config: config.clone(),
            token_embedding,
            position_table,
            blocks,
            lm_head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    /// Check a single sequence against the model's bounds
    ///
    /// # Errors
    ///
    /// [`QuillError::ShapeMismatch`] if the sequence is empty, longer than
    /// `max_seq_len`, or contains an id ≥ `vocab_size`
    pub fn validate_sequence(&self, ids: &[usize]) -> Result<()> {
        if ids.is_empty() {
            return Err(QuillError::shape("sequence must contain at least one token"));
        }
        if ids.len() > self.config.max_seq_len {
            return Err(QuillError::shape(format!(
                "sequence length {} exceeds max_seq_len {}",
                ids.len(),
                self.config.max_seq_len
            )));
        }
        if let Some((pos, &id)) = ids
            .iter()
            .enumerate()
            .find(|&(_, &id)| id >= self.config.vocab_size)
        {
            return Err(QuillError::shape(format!(
                "token id {} at position {} is out of range for vocab size {}",
                id, pos, self.config.vocab_size
            )));
        }
        Ok(())
    }

    /// Logits for a batch of equal-length sequences
    ///
    /// # Returns
    ///
    /// Tensor of shape `[batch, seq_len, vocab_size]`
    ///
    /// # Errors
    ///
    /// [`QuillError::ShapeMismatch`] for an empty batch, sequences of
    /// different lengths, or any sequence rejected by
    /// [`validate_sequence`](Self::validate_sequence)
    pub fn forward<S: AsRef<[usize]> + Sync>(&self, batch: &[S]) -> Result<Tensor> {
        let seq_len = check_batch(batch)?;
        for seq in batch {
            self.validate_sequence(seq.as_ref())?;
        }

        let per_sequence: Vec<Tensor> = batch
            .par_iter()
            .map(|seq| self.forward_unchecked(seq.as_ref()).0)
            .collect();

        let vocab_size = self.config.vocab_size;
        let mut data = Vec::with_capacity(batch.len() * seq_len * vocab_size);
        for logits in per_sequence {
            data.extend(logits.data);
        }
        Ok(Tensor::new(data, vec![batch.len(), seq_len, vocab_size]))
    }

    /// Logits `[seq_len, vocab_size]` for one sequence
    pub fn forward_sequence(&self, ids: &[usize]) -> Result<Tensor> {
        self.validate_sequence(ids)?;
        Ok(self.forward_unchecked(ids).0)
    }

    /// Logits for one sequence plus everything the backward pass needs
    pub fn forward_with_cache(&self, ids: &[usize]) -> Result<(Tensor, ForwardCache)> {
        self.validate_sequence(ids)?;
        Ok(self.forward_unchecked(ids))
    }

    fn forward_unchecked(&self, ids: &[usize]) -> (Tensor, ForwardCache) {
        let mut x = self.embed(ids);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, cache) = block.forward(&x);
            block_caches.push(cache);
            x = next;
        }

        let (logits, lm_head_cache) = self.lm_head.forward(&x);
        let cache = ForwardCache {
            input_ids: ids.to_vec(),
            block_caches,
            lm_head_cache,
        };
        (logits, cache)
    }

    /// Token embedding plus positional vector for every position
    fn embed(&self, ids: &[usize]) -> Tensor {
        let embed_dim = self.config.embed_dim;
        let mut embedded = Vec::with_capacity(ids.len() * embed_dim);
        for (pos, &id) in ids.iter().enumerate() {
            let token = self.token_embedding.row(id);
            match &self.position_table {
                Some(table) => {
                    embedded.extend(token.iter().zip(table.row(pos)).map(|(t, p)| t + p))
                }
                None => embedded.extend_from_slice(token),
            }
        }
        Tensor::new(embedded, vec![ids.len(), embed_dim])
    }

    /// Backpropagate `grad_logits` (`[seq_len, vocab_size]`) through the model
    ///
    /// # Returns
    ///
    /// Gradients for every parameter, in [`named_parameters`](Self::named_parameters) order
    pub fn backward(&self, grad_logits: &Tensor, cache: &ForwardCache) -> ModelGradients {
        let embed_dim = self.config.embed_dim;

        let lm_head_grads = self.lm_head.backward(grad_logits, &cache.lm_head_cache);
        let mut grad_x = lm_head_grads.x.clone();

        let mut block_grads = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.block_caches).rev() {
            let grads = block.backward(&grad_x, block_cache);
            grad_x = grads.x.clone();
            block_grads.push(grads);
        }
        block_grads.reverse();

        let mut grad_token_embedding = Tensor::zeros(self.token_embedding.shape.clone());
        let mut grad_position = self
            .learned_positions()
            .map(|table| Tensor::zeros(table.shape.clone()));

        for (pos, &id) in cache.input_ids.iter().enumerate() {
            let g = &grad_x.data[pos * embed_dim..(pos + 1) * embed_dim];
            for (acc, &v) in grad_token_embedding.row_mut(id).iter_mut().zip(g) {
                *acc += v;
            }
            if let Some(grad_pos) = grad_position.as_mut() {
                for (acc, &v) in grad_pos.row_mut(pos).iter_mut().zip(g) {
                    *acc += v;
                }
            }
        }

        let mut tensors = Vec::with_capacity(self.num_parameter_tensors());
        tensors.push(grad_token_embedding);
        if let Some(grad_pos) = grad_position {
            tensors.push(grad_pos);
        }
        for grads in block_grads {
            grads.flatten_into(&mut tensors);
        }
        lm_head_grads.flatten_into(&mut tensors);

        ModelGradients { tensors }
    }

    fn learned_positions(&self) -> Option<&Tensor> {
        match self.config.positional {
            PositionalEncoding::Learned => self.position_table.as_ref(),
            _ => None,
        }
    }

    /// All trainable parameters with their names, in canonical order
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::with_capacity(self.num_parameter_tensors());
        out.push(("token_embedding".to_string(), &self.token_embedding));
        if let Some(table) = self.learned_positions() {
            out.push(("position_embedding".to_string(), table));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.named_parameters(&format!("blocks.{i}"), &mut out);
        }
        self.lm_head.named_parameters("lm_head", &mut out);
        out
    }

    /// Mutable access to all trainable parameters, in canonical order
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = Vec::new();
        out.push(&mut self.token_embedding);
        if self.config.positional == PositionalEncoding::Learned {
            if let Some(table) = self.position_table.as_mut() {
                out.push(table);
            }
        }
        for block in &mut self.blocks {
            block.parameters_mut(&mut out);
        }
        self.lm_head.parameters_mut(&mut out);
        out
    }

    fn num_parameter_tensors(&self) -> usize {
        // 8 attention + 4 layer norm + 4 feed-forward tensors per block
        let positions = usize::from(self.config.positional == PositionalEncoding::Learned);
        1 + positions + 16 * self.blocks.len() + 2
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.len()).sum()
    }

    /// Copy of every trainable parameter keyed by name
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.clone()))
            .collect()
    }

    /// Overwrite parameters from a name → tensor mapping
    ///
    /// The mapping must contain exactly the model's parameter names, each with
    /// the matching shape. Nothing is modified if any check fails.
    ///
    /// # Errors
    ///
    /// [`QuillError::ShapeMismatch`] for a missing, unexpected or
    /// wrongly-shaped entry
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> Result<()> {
        let expected = self.named_parameters();
        for (name, tensor) in &expected {
            match state.get(name) {
                None => return Err(QuillError::shape(format!("missing parameter '{name}'"))),
                Some(t) if t.shape != tensor.shape => {
                    return Err(QuillError::shape(format!(
                        "parameter '{}' has shape {:?}, expected {:?}",
                        name, t.shape, tensor.shape
                    )))
                }
                Some(t) if t.data.len() != t.shape.iter().product::<usize>() => {
                    return Err(QuillError::shape(format!(
                        "parameter '{name}' data does not match its shape"
                    )))
                }
                Some(_) => {}
            }
        }
        if state.len() != expected.len() {
            let known: std::collections::HashSet<&str> =
                expected.iter().map(|(n, _)| n.as_str()).collect();
            let extra: Vec<&String> = state.keys().filter(|k| !known.contains(k.as_str())).collect();
            return Err(QuillError::shape(format!("unexpected parameters {extra:?}")));
        }

        let names: Vec<String> = expected.into_iter().map(|(n, _)| n).collect();
        for (name, param) in names.iter().zip(self.parameters_mut()) {
            if let Some(t) = state.get(name) {
                param.data.copy_from_slice(&t.data);
            }
        }
        Ok(())
    }

    /// Change the vocabulary size
    ///
    /// Resizes the token embedding rows and the `lm_head` output columns.
    /// Existing ids keep their parameters; new ids get fresh `N(0, init_std²)`
    /// embeddings, zero-bias and freshly drawn output weights. Shrinking drops
    /// the highest ids.
    ///
    /// Call this after adding special tokens to the tokenizer and before
    /// creating an optimizer, since optimizer state is sized per parameter.
    pub fn resize_vocab(&mut self, new_vocab_size: usize) -> Result<()> {
        if new_vocab_size == 0 {
            return Err(QuillError::param("vocab size must be greater than 0"));
        }
        let old_vocab_size = self.config.vocab_size;
        if new_vocab_size == old_vocab_size {
            return Ok(());
        }

        let embed_dim = self.config.embed_dim;
        let added = new_vocab_size.saturating_sub(old_vocab_size);
        let mut init = Initializer::new(
            self.config.init_std,
            self.config.seed ^ (new_vocab_size as u64).rotate_left(32),
        )?;

        // Token embedding: keep the first rows, append fresh ones
        let kept = old_vocab_size.min(new_vocab_size);
        let mut embedding = self.token_embedding.data[..kept * embed_dim].to_vec();
        embedding.extend(init.normal(added * embed_dim));
        self.token_embedding = Tensor::new(embedding, vec![new_vocab_size, embed_dim]);

        // lm_head weight is [E, vocab]: resize every row
        let fresh = init.normal(embed_dim * added);
        let mut weight = Vec::with_capacity(embed_dim * new_vocab_size);
        for i in 0..embed_dim {
            weight.extend_from_slice(&self.lm_head.weight.row(i)[..kept]);
            weight.extend_from_slice(&fresh[i * added..(i + 1) * added]);
        }
        self.lm_head.weight = Tensor::new(weight, vec![embed_dim, new_vocab_size]);

        let mut bias = self.lm_head.bias.data[..kept].to_vec();
        bias.resize(new_vocab_size, 0.0);
        self.lm_head.bias = Tensor::new(bias, vec![new_vocab_size]);

        self.config.vocab_size = new_vocab_size;
        Ok(())
    }
}

/// Values saved by [`LanguageModel::forward_with_cache`] for the backward pass
#[derive(Clone, Debug)]
pub struct ForwardCache {
    input_ids: Vec<usize>,
    block_caches: Vec<BlockCache>,
    lm_head_cache: LinearCache,
}

/// Shared length of a non-empty, non-ragged batch
fn check_batch<S: AsRef<[usize]>>(batch: &[S]) -> Result<usize> {
    let first = batch
        .first()
        .ok_or_else(|| QuillError::shape("batch must contain at least one sequence"))?;
    let seq_len = first.as_ref().len();
    if let Some((i, seq)) = batch
        .iter()
        .enumerate()
        .find(|(_, s)| s.as_ref().len() != seq_len)
    {
        return Err(QuillError::shape(format!(
            "sequence {} has length {}, expected {} like the first sequence",
            i,
            seq.as_ref().len(),
            seq_len
        )));
    }
    Ok(seq_len)
}

/// Fixed sine/cosine position table `[max_seq_len, embed_dim]`
pub fn sinusoidal_table(max_seq_len: usize, embed_dim: usize) -> Tensor {
    let mut data = vec![0.0; max_seq_len * embed_dim];
    for pos in 0..max_seq_len {
        for i in 0..embed_dim {
            let pair = (i / 2) as f32;
            let angle = pos as f32 / 10000f32.powf(2.0 * pair / embed_dim as f32);
            data[pos * embed_dim + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    Tensor::new(data, vec![max_seq_len, embed_dim])
}
