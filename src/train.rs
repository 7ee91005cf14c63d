//! Training Loop
//!
//! [`Trainer`] owns the optimizer state and drives a mutably borrowed
//! [`LanguageModel`] through batches.
//!
//! ## One Step
//!
//! ```text
//! batch {input_ids, attention_mask}
//!     ↓  (parallel over sequences)
//! forward_with_cache → causal_lm_loss_sum → backward
//!     ↓
//! sum gradients, divide by real label count
//!     ↓
//! clip global norm (optional)
//!     ↓
//! AdamW update with the scheduled learning rate
//! ```
//!
//! Each sequence's forward and backward pass is independent, so they run on
//! the rayon thread pool and only the summed gradients are kept. Dividing by
//! the batch-wide token count (rather than averaging per-sequence means)
//! weights every real token equally regardless of padding.
//!
//! A batch whose masks leave no label positions is skipped without touching
//! the parameters or the step counter.
//!
//! ## Example
//!
//! ```rust
//! use quill::{BatchLoader, ByteTokenizer, LanguageModel, ModelConfig, TokenizedDataset,
//!             Tokenizer, Trainer, TrainingConfig};
//!
//! let tokenizer = ByteTokenizer::new();
//! let mut model = LanguageModel::new(&ModelConfig {
//!     num_layers: 1,
//!     ..ModelConfig::tiny(tokenizer.vocab_size())
//! })?;
//! let dataset = TokenizedDataset::from_texts(&["abcabc", "cbacba"], &tokenizer, 8)?;
//! let mut loader = BatchLoader::new(&dataset, 2, false, 0)?;
//!
//! let config = TrainingConfig { log_every: 0, ..TrainingConfig::default() };
//! let mut trainer = Trainer::new(&mut model, config)?;
//! let report = trainer.fit(&mut loader)?;
//! assert_eq!(report.steps, 1);
//! # Ok::<(), quill::QuillError>(())
//! ```

use crate::config::TrainingConfig;
use crate::data::{Batch, BatchLoader, TokenizedDataset};
use crate::error::{QuillError, Result};
use crate::gradients::{clip_gradients, compute_grad_norm, ModelGradients};
use crate::loss::{causal_lm_loss_sum, LossSum};
use crate::model::LanguageModel;
use crate::optimizer::AdamWOptimizer;
use crate::training_logger::{StepMetrics, TrainingLogger};
use rayon::prelude::*;

/// Result of one [`Trainer::train_step`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutput {
    /// Mean cross-entropy over the batch's real label positions
    pub loss: f32,
    /// Global gradient norm before clipping
    pub grad_norm: f32,
    /// Number of real label positions
    pub num_tokens: usize,
    /// Learning rate used for the update
    pub learning_rate: f32,
    /// `true` if the batch had no label positions and nothing was updated
    pub skipped: bool,
}

/// Loss without a parameter update
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    /// Mean cross-entropy over real label positions (0 when there are none)
    pub loss: f32,
    pub num_tokens: usize,
}

/// Summary of a [`Trainer::fit`] run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingReport {
    /// Mean loss of each epoch, weighted by token count
    pub epoch_losses: Vec<f32>,
    /// Optimizer steps taken during the run
    pub steps: usize,
    /// Batches skipped because they had no label positions
    pub skipped_batches: usize,
}

impl TrainingReport {
    /// Mean loss of the last epoch
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Summed loss and gradients for a group of sequences
struct Accumulated {
    loss_sum: f32,
    num_tokens: usize,
    grads: Option<ModelGradients>,
}

impl Accumulated {
    fn empty() -> Self {
        Self {
            loss_sum: 0.0,
            num_tokens: 0,
            grads: None,
        }
    }

    fn add(&mut self, loss_sum: f32, num_tokens: usize, grads: Option<ModelGradients>) {
        self.loss_sum += loss_sum;
        self.num_tokens += num_tokens;
        if let Some(g) = grads {
            match self.grads.as_mut() {
                Some(total) => total.accumulate(&g),
                None => self.grads = Some(g),
            }
        }
    }
}

/// Drives training of a [`LanguageModel`]
pub struct Trainer<'m> {
    model: &'m mut LanguageModel,
    optimizer: AdamWOptimizer,
    config: TrainingConfig,
    logger: Option<TrainingLogger>,
    step: usize,
    total_steps: usize,
}

impl<'m> Trainer<'m> {
    /// Create a trainer with fresh optimizer state
    ///
    /// Resize the model's vocabulary before this call; optimizer state is
    /// sized from the current parameters.
    ///
    /// # Errors
    ///
    /// [`QuillError::InvalidParameter`] if `config` fails validation
    pub fn new(model: &'m mut LanguageModel, config: TrainingConfig) -> Result<Self> {
        let optimizer = AdamWOptimizer::new(model);
        Self::with_optimizer(model, config, optimizer)
    }

    /// Resume with existing optimizer state (for example from a checkpoint)
    pub fn with_optimizer(
        model: &'m mut LanguageModel,
        config: TrainingConfig,
        optimizer: AdamWOptimizer,
    ) -> Result<Self> {
        config.validate()?;
        let step = optimizer.step;
        Ok(Self {
            model,
            optimizer,
            config,
            logger: None,
            step,
            total_steps: 0,
        })
    }

    /// Write metrics to `logger` instead of only printing them
    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Steps the learning-rate schedule spans (0 keeps the peak rate)
    pub fn set_total_steps(&mut self, total_steps: usize) {
        self.total_steps = total_steps;
    }

    pub fn model(&self) -> &LanguageModel {
        &*self.model
    }

    pub fn optimizer(&self) -> &AdamWOptimizer {
        &self.optimizer
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Optimizer steps taken so far
    pub fn step(&self) -> usize {
        self.step
    }

    /// Forward, backward and one AdamW update on `batch`
    ///
    /// # Errors
    ///
    /// - [`QuillError::ShapeMismatch`] for an empty or ragged batch, a mask
    ///   that does not match its sequence, or invalid token ids
    /// - [`QuillError::NumericInstability`] for a non-finite loss or gradient
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let learning_rate = self
            .config
            .learning_rate_at(self.step, self.total_steps);
        let acc = self.accumulate(batch, true)?;

        let (mut grads, num_tokens) = match acc.grads {
            Some(grads) if acc.num_tokens > 0 => (grads, acc.num_tokens),
            _ => {
                return Ok(StepOutput {
                    loss: 0.0,
                    grad_norm: 0.0,
                    num_tokens: 0,
                    learning_rate,
                    skipped: true,
                })
            }
        };

        let scale = 1.0 / num_tokens as f32;
        let loss = acc.loss_sum * scale;
        if !loss.is_finite() {
            return Err(QuillError::numeric(format!(
                "loss is {loss} at step {}",
                self.step
            )));
        }
        grads.scale(scale);
        if !grads.is_finite() {
            return Err(QuillError::numeric(format!(
                "non-finite gradient at step {}",
                self.step
            )));
        }

        let grad_norm = if self.config.grad_clip > 0.0 {
            clip_gradients(&mut grads, self.config.grad_clip)
        } else {
            compute_grad_norm(&grads)
        };

        self.optimizer
            .step(self.model, &grads, learning_rate, self.config.weight_decay)?;
        self.step += 1;

        Ok(StepOutput {
            loss,
            grad_norm,
            num_tokens,
            learning_rate,
            skipped: false,
        })
    }

    /// Loss on `batch` without updating parameters
    pub fn evaluate(&self, batch: &Batch) -> Result<Evaluation> {
        let acc = self.accumulate(batch, false)?;
        let loss = if acc.num_tokens == 0 {
            0.0
        } else {
            acc.loss_sum / acc.num_tokens as f32
        };
        if !loss.is_finite() {
            return Err(QuillError::numeric(format!("evaluation loss is {loss}")));
        }
        Ok(Evaluation {
            loss,
            num_tokens: acc.num_tokens,
        })
    }

    /// Token-weighted loss over a whole dataset
    pub fn evaluate_dataset(&self, dataset: &TokenizedDataset) -> Result<Evaluation> {
        let mut loader = BatchLoader::new(dataset, self.config.batch_size, false, 0)?;
        let mut loss_sum = 0.0;
        let mut num_tokens = 0;
        while let Some(batch) = loader.next_batch() {
            let eval = self.evaluate(&batch)?;
            loss_sum += eval.loss * eval.num_tokens as f32;
            num_tokens += eval.num_tokens;
        }
        let loss = if num_tokens == 0 {
            0.0
        } else {
            loss_sum / num_tokens as f32
        };
        Ok(Evaluation { loss, num_tokens })
    }

    /// Run `config.num_epochs` passes over `loader`
    ///
    /// Sets the schedule length to the steps already taken plus
    /// `num_epochs × num_batches` unless
    /// [`set_total_steps`](Self::set_total_steps) was called, so a resumed
    /// run continues the schedule instead of restarting it. Metrics go to
    /// the logger every `log_every` steps (0 disables step logging) and an
    /// epoch summary is printed at the end of each epoch.
    pub fn fit(&mut self, loader: &mut BatchLoader<'_>) -> Result<TrainingReport> {
        if self.total_steps == 0 {
            self.total_steps = self.step + self.config.num_epochs * loader.num_batches();
        }
        let mut report = TrainingReport::default();

        for epoch in 0..self.config.num_epochs {
            loader.reset();
            let mut loss_sum = 0.0;
            let mut num_tokens = 0;

            while let Some(batch) = loader.next_batch() {
                let out = self.train_step(&batch)?;
                if out.skipped {
                    report.skipped_batches += 1;
                    continue;
                }
                report.steps += 1;
                loss_sum += out.loss * out.num_tokens as f32;
                num_tokens += out.num_tokens;

                if self.config.log_every > 0 && self.step % self.config.log_every == 0 {
                    self.log(epoch, &out)?;
                }
            }

            let epoch_loss = if num_tokens == 0 {
                0.0
            } else {
                loss_sum / num_tokens as f32
            };
            report.epoch_losses.push(epoch_loss);
            if self.config.log_every > 0 {
                println!(
                    "Epoch {} complete | steps: {} | mean loss: {:.4} | perplexity: {:.2}",
                    epoch,
                    self.step,
                    epoch_loss,
                    epoch_loss.exp()
                );
            }
        }

        Ok(report)
    }

    fn log(&mut self, epoch: usize, out: &StepOutput) -> Result<()> {
        let metrics = StepMetrics {
            epoch,
            step: self.step,
            learning_rate: out.learning_rate,
            loss: out.loss,
            grad_norm: out.grad_norm,
        };
        match self.logger.as_mut() {
            Some(logger) => logger.log(&metrics)?,
            None => println!(
                "Step {:5} | LR: {:.6} | Loss: {:.4} | Grad norm: {:.3}",
                metrics.step, metrics.learning_rate, metrics.loss, metrics.grad_norm
            ),
        }
        Ok(())
    }

    /// Summed loss (and gradients if `with_grads`) over every sequence
    fn accumulate(&self, batch: &Batch, with_grads: bool) -> Result<Accumulated> {
        check_batch(batch)?;
        let model: &LanguageModel = &*self.model;

        let per_sequence: Vec<(f32, usize, Option<ModelGradients>)> = batch
            .input_ids
            .par_iter()
            .zip(&batch.attention_mask)
            .map(|(ids, mask)| -> Result<(f32, usize, Option<ModelGradients>)> {
                let (logits, cache) = model.forward_with_cache(ids)?;
                let LossSum {
                    loss_sum,
                    grad_logits,
                    num_tokens,
                } = causal_lm_loss_sum(&logits, ids, mask)?;
                let grads = (with_grads && num_tokens > 0)
                    .then(|| model.backward(&grad_logits, &cache));
                Ok((loss_sum, num_tokens, grads))
            })
            .collect::<Result<_>>()?;

        let mut acc = Accumulated::empty();
        for (loss_sum, num_tokens, grads) in per_sequence {
            acc.add(loss_sum, num_tokens, grads);
        }
        Ok(acc)
    }
}

/// Non-empty, rectangular, with one mask entry per token
fn check_batch(batch: &Batch) -> Result<()> {
    let seq_len = batch
        .input_ids
        .first()
        .map(Vec::len)
        .ok_or_else(|| QuillError::shape("batch must contain at least one sequence"))?;
    if batch.attention_mask.len() != batch.input_ids.len() {
        return Err(QuillError::shape(format!(
            "batch has {} sequences but {} attention masks",
            batch.input_ids.len(),
            batch.attention_mask.len()
        )));
    }
    for (i, (ids, mask)) in batch.input_ids.iter().zip(&batch.attention_mask).enumerate() {
        if ids.len() != seq_len {
            return Err(QuillError::shape(format!(
                "sequence {} has length {}, expected {}",
                i,
                ids.len(),
                seq_len
            )));
        }
        if mask.len() != ids.len() {
            return Err(QuillError::shape(format!(
                "attention mask {} has length {}, expected {}",
                i,
                mask.len(),
                ids.len()
            )));
        }
    }
    Ok(())
}
