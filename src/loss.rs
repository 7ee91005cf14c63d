//! Causal Language-Modeling Loss
//!
//! Cross-entropy between the logits at position `t` and the token at `t+1`.
//!
//! ```text
//! input_ids:   [a,  b,  c,  PAD]
//! mask:        [1,  1,  1,  0  ]
//! logits:      [ℓa, ℓb, ℓc, ℓp ]    ℓc predicts the label at index 3
//!
//! pairs:       (ℓa → b, w=1)  (ℓb → c, w=1)  (ℓc → PAD, w=0)
//! ```
//!
//! The last logit and the first token never form a pair. Each pair is
//! weighted by `attention_mask[t+1]`, so padding labels contribute nothing,
//! and the loss is the weighted sum divided by the number of real labels.
//!
//! ## Gradient
//!
//! For one pair with label `y`:
//!
//! ```text
//! loss = log Σ exp(ℓ) - ℓ[y]
//! ∂loss/∂ℓ = softmax(ℓ) - onehot(y)
//! ```
//!
//! [`causal_lm_loss_sum`] returns the unnormalized sum and its gradient so a
//! batch can be normalized by its total token count. [`causal_lm_loss`] is
//! the normalized single-sequence form.

use crate::error::{QuillError, Result};
use crate::tensor::{log_sum_exp, softmax_in_place, Tensor};

/// Unnormalized loss for one sequence
#[derive(Clone, Debug)]
pub struct LossSum {
    /// Σ over real label positions of `-log p(label)`
    pub loss_sum: f32,
    /// Gradient of `loss_sum` with respect to the logits, `[seq_len, vocab]`
    pub grad_logits: Tensor,
    /// Number of real label positions
    pub num_tokens: usize,
}

/// Summed shifted cross-entropy for one sequence
///
/// # Arguments
///
/// * `logits` - `[seq_len, vocab_size]`
/// * `input_ids` - The sequence the logits were computed from
/// * `attention_mask` - 1 for real tokens, 0 for padding
///
/// # Errors
///
/// - [`QuillError::ShapeMismatch`] if the lengths disagree or a label is
///   outside the vocabulary
/// - [`QuillError::NumericInstability`] if the loss is not finite
pub fn causal_lm_loss_sum(
    logits: &Tensor,
    input_ids: &[usize],
    attention_mask: &[u8],
) -> Result<LossSum> {
    let seq_len = input_ids.len();
    if logits.shape.len() != 2 || logits.shape[0] != seq_len {
        return Err(QuillError::shape(format!(
            "logits shape {:?} does not match sequence length {}",
            logits.shape, seq_len
        )));
    }
    if attention_mask.len() != seq_len {
        return Err(QuillError::shape(format!(
            "attention mask length {} does not match sequence length {}",
            attention_mask.len(),
            seq_len
        )));
    }
    let vocab_size = logits.shape[1];

    let mut grad_logits = Tensor::zeros(logits.shape.clone());
    let mut loss_sum = 0.0;
    let mut num_tokens = 0;

    for t in 0..seq_len.saturating_sub(1) {
        if attention_mask[t + 1] == 0 {
            continue;
        }
        let label = input_ids[t + 1];
        if label >= vocab_size {
            return Err(QuillError::shape(format!(
                "label {label} at position {} is out of range for vocab size {vocab_size}",
                t + 1
            )));
        }

        let row = logits.row(t);
        loss_sum += log_sum_exp(row) - row[label];
        num_tokens += 1;

        let grad = grad_logits.row_mut(t);
        grad.copy_from_slice(row);
        softmax_in_place(grad);
        grad[label] -= 1.0;
    }

    if !loss_sum.is_finite() {
        return Err(QuillError::numeric(format!("loss is {loss_sum}")));
    }

    Ok(LossSum {
        loss_sum,
        grad_logits,
        num_tokens,
    })
}

/// Mean shifted cross-entropy for one sequence
///
/// # Returns
///
/// `(loss, grad_logits)`, both divided by the number of real labels. A
/// sequence with no real labels gives `(0.0, zeros)`.
pub fn causal_lm_loss(
    logits: &Tensor,
    input_ids: &[usize],
    attention_mask: &[u8],
) -> Result<(f32, Tensor)> {
    let LossSum {
        loss_sum,
        mut grad_logits,
        num_tokens,
    } = causal_lm_loss_sum(logits, input_ids, attention_mask)?;
    if num_tokens == 0 {
        return Ok((0.0, grad_logits));
    }
    let scale = 1.0 / num_tokens as f32;
    grad_logits.scale_in_place(scale);
    Ok((loss_sum * scale, grad_logits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros(vec![4, 8]);
        let (loss, _) = causal_lm_loss(&logits, &[1, 2, 3, 4], &[1, 1, 1, 1]).unwrap();
        assert!((loss - 8f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_shift_uses_next_token_as_label() {
        // Row 0 strongly predicts token 5, which is the label at index 1
        let mut logits = Tensor::zeros(vec![2, 6]);
        logits.row_mut(0)[5] = 20.0;
        let (loss, grad) = causal_lm_loss(&logits, &[0, 5], &[1, 1]).unwrap();
        assert!(loss < 1e-6);
        // The last row never has a label
        assert!(grad.row(1).iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_padding_labels_are_ignored() {
        let mut logits = Tensor::zeros(vec![4, 5]);
        logits.row_mut(2)[0] = -50.0; // would be very wrong for label 0 at index 3
        let unpadded = causal_lm_loss(&logits, &[1, 2, 3, 0], &[1, 1, 1, 1]).unwrap();
        let padded = causal_lm_loss(&logits, &[1, 2, 3, 0], &[1, 1, 1, 0]).unwrap();

        assert!(unpadded.0 > padded.0);
        assert!((padded.0 - 5f32.ln()).abs() < 1e-5);
        assert!(padded.1.row(2).iter().all(|&g| g == 0.0));

        let sum = causal_lm_loss_sum(&logits, &[1, 2, 3, 0], &[1, 1, 1, 0]).unwrap();
        assert_eq!(sum.num_tokens, 2);
    }

    #[test]
    fn test_all_padding_gives_zero() {
        let logits = Tensor::full(vec![3, 4], 1.0);
        let (loss, grad) = causal_lm_loss(&logits, &[1, 0, 0], &[1, 0, 0]).unwrap();
        assert_eq!(loss, 0.0);
        assert!(grad.data.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let logits = Tensor::new(
            (0..3 * 5).map(|i| ((i * 7) % 11) as f32 * 0.3 - 1.5).collect(),
            vec![3, 5],
        );
        let ids = [2, 4, 1];
        let mask = [1, 1, 1];
        let (_, grad) = causal_lm_loss(&logits, &ids, &mask).unwrap();

        let h = 1e-3;
        for i in 0..logits.len() {
            let mut plus = logits.clone();
            plus.data[i] += h;
            let mut minus = logits.clone();
            minus.data[i] -= h;
            let numeric = (causal_lm_loss(&plus, &ids, &mask).unwrap().0
                - causal_lm_loss(&minus, &ids, &mask).unwrap().0)
                / (2.0 * h);
            assert!((numeric - grad.data[i]).abs() < 1e-3, "index {i}");
        }
    }

    #[test]
    fn test_rejects_mismatched_inputs() {
        let logits = Tensor::zeros(vec![3, 4]);
        assert!(causal_lm_loss(&logits, &[1, 2], &[1, 1]).is_err());
        assert!(causal_lm_loss(&logits, &[1, 2, 3], &[1, 1]).is_err());
        assert!(matches!(
            causal_lm_loss(&logits, &[1, 2, 9], &[1, 1, 1]),
            Err(QuillError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_non_finite_logits_are_reported() {
        let mut logits = Tensor::zeros(vec![2, 3]);
        logits.row_mut(0)[1] = f32::NAN;
        assert!(matches!(
            causal_lm_loss(&logits, &[0, 1], &[1, 1]),
            Err(QuillError::NumericInstability(_))
        ));
    }
}
