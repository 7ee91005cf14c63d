//! Text Generation
//!
//! Autoregressive decoding with temperature and nucleus (top-p) sampling.
//!
//! ## Loop
//!
//! ```text
//! tokens = prompt
//! repeat:
//!     logits = model(tokens)[last]
//!     next   = sample_from_logits(logits, temperature, top_p)
//!     tokens.push(next)
//! until next == eos, max_new_tokens produced, or tokens fill the context
//! ```
//!
//! ## Nucleus Filter
//!
//! Sort the logits in descending order and keep the smallest prefix whose
//! probability mass reaches `top_p`:
//!
//! ```text
//! probs (sorted):  0.50  0.30  0.15  0.05
//! cumulative:      0.50  0.80  0.95  1.00
//! top_p = 0.7:     keep  keep  drop  drop     (0.80 is the first to pass 0.7)
//! ```
//!
//! Token `k` is dropped iff the mass *before* it already exceeds `top_p`, so
//! the most likely token is always kept and the nucleus is never empty.
//!
//! ## Temperature
//!
//! Logits are divided by `temperature` before filtering. Values below 1
//! sharpen the distribution; as it approaches 0 sampling becomes argmax.
//! If the division overflows, the argmax (lowest id on ties) is returned
//! directly.

use crate::config::GenerationConfig;
use crate::error::{QuillError, Result};
use crate::model::LanguageModel;
use crate::tensor::softmax_in_place;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::weighted::WeightedIndex;
use rand_distr::Distribution;

/// Why generation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The end-of-sequence token was produced
    EndOfSequence,
    /// `max_new_tokens` tokens were produced
    MaxLength,
    /// The sequence reached the model's `max_seq_len`
    ContextFull,
}

/// Output of [`Generator::generate`]
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    /// Prompt followed by the generated tokens
    pub tokens: Vec<usize>,
    /// How many tokens were appended to the prompt
    pub new_tokens: usize,
    pub stop_reason: StopReason,
}

impl Generation {
    /// Only the generated part
    pub fn generated(&self) -> &[usize] {
        &self.tokens[self.tokens.len() - self.new_tokens..]
    }
}

/// Samples continuations from a borrowed model
///
/// The generator only reads the model, so several generators can share one
/// model; training needs `&mut LanguageModel` and cannot run meanwhile.
pub struct Generator<'a> {
    model: &'a LanguageModel,
    config: GenerationConfig,
}

impl<'a> Generator<'a> {
    /// # Errors
    ///
    /// [`QuillError::InvalidParameter`] if `temperature ≤ 0` or
    /// `top_p ∉ (0, 1]`
    pub fn new(model: &'a LanguageModel, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate with an RNG seeded from `config.seed`
    ///
    /// The same model, prompt and config always give the same output.
    pub fn generate(&self, prompt: &[usize]) -> Result<Generation> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.generate_with_rng(prompt, &mut rng)
    }

    /// Generate drawing randomness from `rng`
    ///
    /// # Errors
    ///
    /// - [`QuillError::ShapeMismatch`] if the prompt is empty, longer than
    ///   `max_seq_len`, or contains ids outside the vocabulary
    /// - [`QuillError::NumericInstability`] if the model emits non-finite
    ///   logits
    pub fn generate_with_rng(&self, prompt: &[usize], rng: &mut StdRng) -> Result<Generation> {
        self.model.validate_sequence(prompt)?;
        let max_seq_len = self.model.max_seq_len();
        let mut tokens = prompt.to_vec();
        let mut new_tokens = 0;

        let stop_reason = loop {
            if new_tokens >= self.config.max_new_tokens {
                break StopReason::MaxLength;
            }
            if tokens.len() >= max_seq_len {
                break StopReason::ContextFull;
            }

            let logits = self.model.forward_sequence(&tokens)?;
            let last = logits.row(tokens.len() - 1);
            if last.iter().any(|v| !v.is_finite()) {
                return Err(QuillError::numeric(format!(
                    "non-finite logits at position {}",
                    tokens.len() - 1
                )));
            }

            let next = sample_from_logits(last, self.config.temperature, self.config.top_p, rng)?;
            tokens.push(next);
            new_tokens += 1;

            if self.config.eos_token_id == Some(next) {
                break StopReason::EndOfSequence;
            }
        };

        Ok(Generation {
            tokens,
            new_tokens,
            stop_reason,
        })
    }
}

/// Mask every logit outside the top-p nucleus with `-inf`
///
/// The input is not temperature-scaled here; pass already-scaled logits.
/// Ties are ordered by lower id first. The highest logit is always kept.
pub fn top_p_filter(logits: &[f32], top_p: f32) -> Vec<f32> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    // Stable sort: equal logits keep ascending id order
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));

    let mut probs: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
    softmax_in_place(&mut probs);

    let mut filtered = vec![f32::NEG_INFINITY; logits.len()];
    let mut cumulative = 0.0;
    for (k, &id) in order.iter().enumerate() {
        if k > 0 && cumulative > top_p {
            break;
        }
        filtered[id] = logits[id];
        cumulative += probs[k];
    }
    filtered
}

/// Sample one token id from raw logits
///
/// Divides by `temperature`, applies [`top_p_filter`], renormalizes, and
/// draws from the resulting distribution.
///
/// # Errors
///
/// - [`QuillError::InvalidParameter`] for `temperature ≤ 0` or
///   `top_p ∉ (0, 1]`
/// - [`QuillError::ShapeMismatch`] for empty logits
/// - [`QuillError::NumericInstability`] if the logits contain NaN or leave
///   nothing to sample
pub fn sample_from_logits(
    logits: &[f32],
    temperature: f32,
    top_p: f32,
    rng: &mut StdRng,
) -> Result<usize> {
    GenerationConfig {
        temperature,
        top_p,
        ..GenerationConfig::default()
    }
    .validate()?;
    if logits.is_empty() {
        return Err(QuillError::shape("cannot sample from empty logits"));
    }
    if logits.iter().any(|v| v.is_nan()) {
        return Err(QuillError::numeric("logits contain NaN"));
    }

    let scaled: Vec<f32> = logits.iter().map(|&l| l / temperature).collect();
    if scaled.iter().any(|v| v.is_infinite() && v.is_sign_positive()) {
        return Ok(argmax(logits));
    }

    let mut probs = top_p_filter(&scaled, top_p);
    softmax_in_place(&mut probs);

    let dist = WeightedIndex::new(&probs)
        .map_err(|e| QuillError::numeric(format!("cannot sample from logits: {e}")))?;
    Ok(dist.sample(rng))
}

/// Index of the largest value, lowest index on ties
fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use proptest::prelude::*;

    fn kept(filtered: &[f32]) -> Vec<usize> {
        filtered
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_top_p_filter_keeps_first_token_past_threshold() {
        // softmax ≈ [0.6439, 0.2369, 0.0871, 0.0321]
        let logits = [3.0, 2.0, 1.0, 0.0];
        assert_eq!(kept(&top_p_filter(&logits, 0.5)), vec![0]);
        assert_eq!(kept(&top_p_filter(&logits, 0.7)), vec![0, 1]);
        assert_eq!(kept(&top_p_filter(&logits, 0.9)), vec![0, 1, 2]);
        assert_eq!(kept(&top_p_filter(&logits, 1.0)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_top_p_filter_unsorted_input_and_ties() {
        let logits = [0.0, 5.0, 5.0, 1.0];
        // The two tied ids hold almost all of the mass; lower id comes first
        assert_eq!(kept(&top_p_filter(&logits, 0.3)), vec![1]);
        assert_eq!(kept(&top_p_filter(&logits, 0.6)), vec![1, 2]);
        // Kept logits are unchanged
        let filtered = top_p_filter(&logits, 0.6);
        assert_eq!(filtered[1], 5.0);
        assert_eq!(filtered[0], f32::NEG_INFINITY);
    }

    #[test]
    fn test_sampling_respects_nucleus() {
        let logits = [10.0, 0.0, 0.0, 9.5, -3.0];
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let id = sample_from_logits(&logits, 1.0, 0.9, &mut rng).unwrap();
            assert!(id == 0 || id == 3, "sampled {id} outside the nucleus");
        }
    }

    #[test]
    fn test_low_temperature_picks_argmax() {
        let logits = [0.1, 2.3, 2.2, -1.0, 0.5];
        let mut rng = StdRng::seed_from_u64(11);
        let mut counts = [0usize; 5];
        for _ in 0..100 {
            counts[sample_from_logits(&logits, 1e-3, 1.0, &mut rng).unwrap()] += 1;
        }
        let mode = (0..5).max_by_key(|&i| counts[i]).unwrap();
        assert_eq!(mode, 1);

        // Scaling overflows to infinity: falls back to argmax
        assert_eq!(sample_from_logits(&logits, 1e-40, 1.0, &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_sample_rejects_bad_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        let logits = [1.0, 2.0];
        for (t, p) in [(0.0, 0.9), (-1.0, 0.9), (1.0, 0.0), (1.0, 1.5)] {
            assert!(matches!(
                sample_from_logits(&logits, t, p, &mut rng),
                Err(QuillError::InvalidParameter(_))
            ));
        }
        assert!(matches!(
            sample_from_logits(&[], 1.0, 0.9, &mut rng),
            Err(QuillError::ShapeMismatch(_))
        ));
        assert!(matches!(
            sample_from_logits(&[f32::NAN, 1.0], 1.0, 0.9, &mut rng),
            Err(QuillError::NumericInstability(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_nucleus_never_empty(
            logits in prop::collection::vec(-20.0f32..20.0, 1..64),
            top_p in 0.0001f32..=1.0,
        ) {
            let filtered = top_p_filter(&logits, top_p);
            prop_assert!(!kept(&filtered).is_empty());

            // The most likely token is always in the nucleus
            let best = argmax(&logits);
            prop_assert!(filtered[best].is_finite());
        }

        #[test]
        fn prop_nucleus_monotone_in_top_p(
            logits in prop::collection::vec(-20.0f32..20.0, 1..64),
            a in 0.0001f32..=1.0,
            b in 0.0001f32..=1.0,
        ) {
            let (small, large) = if a <= b { (a, b) } else { (b, a) };
            let small_set = kept(&top_p_filter(&logits, small));
            let large_set = kept(&top_p_filter(&logits, large));
            prop_assert!(small_set.iter().all(|id| large_set.contains(id)));
        }
    }

    fn model() -> LanguageModel {
        LanguageModel::new(&ModelConfig {
            vocab_size: 30,
            embed_dim: 16,
            num_layers: 2,
            num_heads: 4,
            ff_dim: 32,
            max_seq_len: 12,
            ..ModelConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_generate_stops_at_max_new_tokens() {
        let model = model();
        let generator = Generator::new(
            &model,
            GenerationConfig {
                max_new_tokens: 4,
                ..GenerationConfig::default()
            },
        )
        .unwrap();
        let out = generator.generate(&[1, 2, 3]).unwrap();
        assert_eq!(out.stop_reason, StopReason::MaxLength);
        assert_eq!(out.new_tokens, 4);
        assert_eq!(out.tokens.len(), 7);
        assert_eq!(&out.tokens[..3], &[1, 2, 3]);
        assert_eq!(out.generated().len(), 4);
        assert!(out.tokens.iter().all(|&t| t < 30));
    }

    #[test]
    fn test_generate_stops_when_context_is_full() {
        let model = model();
        let generator = Generator::new(
            &model,
            GenerationConfig {
                max_new_tokens: 100,
                ..GenerationConfig::default()
            },
        )
        .unwrap();
        let out = generator.generate(&[5; 10]).unwrap();
        assert_eq!(out.stop_reason, StopReason::ContextFull);
        assert_eq!(out.tokens.len(), 12);
        assert_eq!(out.new_tokens, 2);

        let full = generator.generate(&[5; 12]).unwrap();
        assert_eq!(full.new_tokens, 0);
        assert_eq!(full.stop_reason, StopReason::ContextFull);
    }

    #[test]
    fn test_generate_stops_at_eos() {
        let model = model();
        // Find the token the model produces first, then declare it the EOS id
        let greedy = GenerationConfig {
            max_new_tokens: 1,
            temperature: 1e-3,
            top_p: 1.0,
            ..GenerationConfig::default()
        };
        let first = Generator::new(&model, greedy.clone())
            .unwrap()
            .generate(&[7, 8])
            .unwrap()
            .tokens[2];

        let generator = Generator::new(
            &model,
            GenerationConfig {
                max_new_tokens: 20,
                eos_token_id: Some(first),
                ..greedy
            },
        )
        .unwrap();
        let out = generator.generate(&[7, 8]).unwrap();
        assert_eq!(out.stop_reason, StopReason::EndOfSequence);
        assert_eq!(out.tokens, vec![7, 8, first]);
    }

    #[test]
    fn test_generate_is_reproducible() {
        let model = model();
        let config = GenerationConfig {
            max_new_tokens: 6,
            seed: 9,
            ..GenerationConfig::default()
        };
        let a = Generator::new(&model, config.clone()).unwrap().generate(&[1]).unwrap();
        let b = Generator::new(&model, config).unwrap().generate(&[1]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_rejects_bad_prompts_and_config() {
        let model = model();
        let generator = Generator::new(&model, GenerationConfig::default()).unwrap();
        assert!(matches!(generator.generate(&[]), Err(QuillError::ShapeMismatch(_))));
        assert!(matches!(generator.generate(&[30]), Err(QuillError::ShapeMismatch(_))));
        assert!(matches!(generator.generate(&[0; 13]), Err(QuillError::ShapeMismatch(_))));

        let bad = GenerationConfig {
            top_p: 0.0,
            ..GenerationConfig::default()
        };
        assert!(matches!(
            Generator::new(&model, bad),
            Err(QuillError::InvalidParameter(_))
        ));
    }
}
