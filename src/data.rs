//! Training Data
//!
//! Turns text into fixed-length id sequences with an attention mask and
//! serves them in batches.
//!
//! ## Sequences
//!
//! [`TokenizedDataset::from_texts`] treats each text as one document:
//!
//! ```text
//! "hi"  →  [h, i, EOS, PAD, PAD]     mask [1, 1, 1, 0, 0]     (seq_len 5)
//! ```
//!
//! Documents longer than `seq_len` are truncated. The padding id is the
//! tokenizer's pad token, or end-of-text when none is defined; the mask is
//! what tells the loss to ignore it.
//!
//! [`TokenizedDataset::from_corpus`] encodes one long text and cuts it into
//! non-overlapping windows of `seq_len` tokens:
//!
//! ```text
//! Tokens: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
//! Seq length: 4
//!
//!   [1, 2, 3, 4]   [5, 6, 7, 8]   [9, 10, PAD, PAD]
//! ```
//!
//! The model predicts each next token inside a window, so targets are never
//! stored separately: the loss shifts the inputs by one position.
//!
//! ## Batches
//!
//! ```rust
//! # use quill::{BatchLoader, ByteTokenizer, TokenizedDataset};
//! let tokenizer = ByteTokenizer::new();
//! let dataset = TokenizedDataset::from_texts(&["to be", "or not"], &tokenizer, 8)?;
//! let mut loader = BatchLoader::new(&dataset, 2, true, 42)?;
//!
//! while let Some(batch) = loader.next_batch() {
//!     assert_eq!(batch.input_ids[0].len(), 8);
//! }
//! # Ok::<(), quill::QuillError>(())
//! ```

use crate::error::{QuillError, Result};
use crate::tokenizer::Tokenizer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

/// A batch of equal-length sequences and their attention masks
///
/// Both fields have shape `[batch_size][seq_len]`. A mask value of 1 marks a
/// real token, 0 marks padding.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub input_ids: Vec<Vec<usize>>,
    pub attention_mask: Vec<Vec<u8>>,
}

impl Batch {
    /// Batch with every position marked as real
    pub fn unpadded(input_ids: Vec<Vec<usize>>) -> Self {
        let attention_mask = input_ids.iter().map(|ids| vec![1; ids.len()]).collect();
        Self {
            input_ids,
            attention_mask,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of label positions the loss counts (`mask[t+1] == 1`)
    pub fn num_label_tokens(&self) -> usize {
        self.attention_mask
            .iter()
            .map(|mask| mask.iter().skip(1).filter(|&&m| m != 0).count())
            .sum()
    }
}

/// Fixed-length tokenized sequences with attention masks
#[derive(Clone, Debug)]
pub struct TokenizedDataset {
    input_ids: Vec<Vec<usize>>,
    attention_mask: Vec<Vec<u8>>,
    seq_len: usize,
    pad_token_id: usize,
}

impl TokenizedDataset {
    /// One padded/truncated sequence per text
    ///
    /// End-of-text is appended to every document before truncation. Texts
    /// that encode to nothing are skipped.
    ///
    /// # Errors
    ///
    /// [`QuillError::InvalidParameter`] if `seq_len` is 0
    pub fn from_texts<S, T>(texts: &[S], tokenizer: &T, seq_len: usize) -> Result<Self>
    where
        S: AsRef<str> + Sync,
        T: Tokenizer + ?Sized,
    {
        check_seq_len(seq_len)?;
        let eos = tokenizer.eos_token_id();
        let pad = tokenizer.pad_token_id().unwrap_or(eos);

        let documents: Vec<Vec<usize>> = texts
            .par_iter()
            .map(|text| tokenizer.encode(text.as_ref()))
            .filter(|ids| !ids.is_empty())
            .map(|mut ids| {
                ids.push(eos);
                ids
            })
            .collect();

        let mut dataset = Self::empty(seq_len, pad);
        for ids in documents {
            dataset.push_padded(&ids);
        }
        Ok(dataset)
    }

    /// Non-overlapping `seq_len` windows over one encoded text
    ///
    /// A trailing window shorter than two tokens has no prediction target
    /// and is dropped.
    pub fn from_corpus<T: Tokenizer + ?Sized>(
        text: &str,
        tokenizer: &T,
        seq_len: usize,
    ) -> Result<Self> {
        check_seq_len(seq_len)?;
        let pad = tokenizer
            .pad_token_id()
            .unwrap_or_else(|| tokenizer.eos_token_id());
        let tokens = tokenizer.encode(text);
        println!("Loaded {} tokens from text", tokens.len());

        let mut dataset = Self::empty(seq_len, pad);
        for window in tokens.chunks(seq_len) {
            if window.len() >= 2 || seq_len == 1 {
                dataset.push_padded(window);
            }
        }
        Ok(dataset)
    }

    fn empty(seq_len: usize, pad_token_id: usize) -> Self {
        Self {
            input_ids: Vec::new(),
            attention_mask: Vec::new(),
            seq_len,
            pad_token_id,
        }
    }

    fn push_padded(&mut self, ids: &[usize]) {
        let real = ids.len().min(self.seq_len);
        let mut padded = ids[..real].to_vec();
        padded.resize(self.seq_len, self.pad_token_id);
        let mut mask = vec![1u8; real];
        mask.resize(self.seq_len, 0);
        self.input_ids.push(padded);
        self.attention_mask.push(mask);
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn pad_token_id(&self) -> usize {
        self.pad_token_id
    }

    /// Sequence `i` and its mask
    pub fn get(&self, i: usize) -> Option<(&[usize], &[u8])> {
        Some((
            self.input_ids.get(i)?.as_slice(),
            self.attention_mask.get(i)?.as_slice(),
        ))
    }

    /// Total number of real (unpadded) tokens
    pub fn num_tokens(&self) -> usize {
        self.attention_mask
            .iter()
            .map(|mask| mask.iter().filter(|&&m| m != 0).count())
            .sum()
    }

    /// Split into training and validation sets
    ///
    /// The validation set is taken from the end, so sequential data keeps
    /// its order. A non-empty dataset always keeps at least one training
    /// sequence, even if that leaves validation empty.
    pub fn split(mut self, val_fraction: f32) -> (Self, Self) {
        let val_fraction = val_fraction.clamp(0.0, 1.0);
        let split_idx = (((self.len() as f32) * (1.0 - val_fraction)) as usize)
            .max(self.len().min(1));
        let val = Self {
            input_ids: self.input_ids.split_off(split_idx),
            attention_mask: self.attention_mask.split_off(split_idx),
            seq_len: self.seq_len,
            pad_token_id: self.pad_token_id,
        };
        (self, val)
    }

    fn batch(&self, indices: &[usize]) -> Batch {
        Batch {
            input_ids: indices.iter().map(|&i| self.input_ids[i].clone()).collect(),
            attention_mask: indices
                .iter()
                .map(|&i| self.attention_mask[i].clone())
                .collect(),
        }
    }
}

fn check_seq_len(seq_len: usize) -> Result<()> {
    if seq_len == 0 {
        return Err(QuillError::param("seq_len must be greater than 0"));
    }
    Ok(())
}

/// Serves batches from a [`TokenizedDataset`]
///
/// Sequential or shuffled order. Shuffling uses a seeded RNG, and the order
/// is redrawn at the start of every epoch. The final batch of an epoch may
/// be smaller than `batch_size`.
pub struct BatchLoader<'a> {
    dataset: &'a TokenizedDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
    position: usize,
}

impl<'a> BatchLoader<'a> {
    /// Create a loader
    ///
    /// # Errors
    ///
    /// [`QuillError::InvalidParameter`] if `batch_size` is 0
    pub fn new(
        dataset: &'a TokenizedDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(QuillError::param("batch_size must be greater than 0"));
        }
        let mut loader = Self {
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            order: (0..dataset.len()).collect(),
            position: 0,
        };
        loader.reset();
        Ok(loader)
    }

    /// Get the next batch
    ///
    /// Returns `None` once the epoch is complete and rewinds (reshuffling if
    /// enabled) for the next epoch.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.position >= self.order.len() {
            self.reset();
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let batch = self.dataset.batch(&self.order[self.position..end]);
        self.position = end;
        Some(batch)
    }

    /// Rewind to the start of a new epoch
    pub fn reset(&mut self) {
        self.position = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
