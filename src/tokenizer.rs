//! Tokenizers
//!
//! The model only sees integer ids. [`Tokenizer`] is the interface between
//! text and those ids; the rest of the crate depends on the trait only.
//!
//! ## Byte-Level Reference Tokenizer
//!
//! [`ByteTokenizer`] maps each UTF-8 byte to its own id and appends special
//! tokens after the byte range:
//!
//! ```text
//! id 0..=255   raw bytes
//! id 256       <|endoftext|>
//! id 257..     special tokens added at runtime (e.g. a padding token)
//! ```
//!
//! Any text round-trips through `encode`/`decode`. Special tokens written
//! literally in the input are recognized and mapped to their single id.
//!
//! ## Growing the Vocabulary
//!
//! Adding a special token increases `vocab_size()`. The model must then be
//! resized to match before it sees the new id:
//!
//! ```rust
//! use quill::{ensure_vocab_matches, ByteTokenizer, LanguageModel, ModelConfig, Tokenizer};
//!
//! let mut tokenizer = ByteTokenizer::new();
//! let mut model = LanguageModel::new(&ModelConfig::tiny(tokenizer.vocab_size()))?;
//!
//! tokenizer.add_pad_token("<|pad|>");
//! assert!(ensure_vocab_matches(&tokenizer, &model).is_err());
//!
//! model.resize_vocab(tokenizer.vocab_size())?;
//! ensure_vocab_matches(&tokenizer, &model)?;
//! # Ok::<(), quill::QuillError>(())
//! ```

use crate::error::{QuillError, Result};
use crate::model::LanguageModel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Text ↔ token id conversion
pub trait Tokenizer: Send + Sync {
    /// Convert text to token ids
    fn encode(&self, text: &str) -> Vec<usize>;

    /// Convert token ids back to text
    ///
    /// Unknown ids are skipped.
    fn decode(&self, ids: &[usize]) -> String;

    /// Number of distinct ids, i.e. every id is `< vocab_size()`
    fn vocab_size(&self) -> usize;

    /// Id that marks the end of a document
    fn eos_token_id(&self) -> usize;

    /// Id used to pad sequences to a fixed length, if one is defined
    fn pad_token_id(&self) -> Option<usize>;

    /// Register a special token and return its id
    ///
    /// Adding a token that already exists returns the existing id and leaves
    /// the vocabulary unchanged.
    fn add_special_token(&mut self, token: &str) -> usize;
}

/// Byte-level tokenizer with special tokens
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ByteTokenizer {
    /// Special tokens in id order, starting at id 256
    special_tokens: Vec<String>,
    /// Id of the padding token, if one was added
    pad_token: Option<usize>,
}

/// Number of byte ids
const NUM_BYTES: usize = 256;

impl ByteTokenizer {
    /// End-of-text marker, always id 256
    pub const EOS_TOKEN: &'static str = "<|endoftext|>";

    /// Create a tokenizer with 256 byte ids plus `<|endoftext|>`
    pub fn new() -> Self {
        Self {
            special_tokens: vec![Self::EOS_TOKEN.to_string()],
            pad_token: None,
        }
    }

    /// Register `token` as a special token and make it the padding token
    pub fn add_pad_token(&mut self, token: &str) -> usize {
        let id = self.add_special_token(token);
        self.pad_token = Some(id);
        id
    }

    /// Id of a special token, if registered
    pub fn special_token_id(&self, token: &str) -> Option<usize> {
        self.special_tokens
            .iter()
            .position(|t| t == token)
            .map(|i| NUM_BYTES + i)
    }

    /// Special token starting at the beginning of `text`, longest first
    fn match_special(&self, text: &str) -> Option<(usize, usize)> {
        self.special_tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_empty() && text.starts_with(t.as_str()))
            .max_by_key(|(_, t)| t.len())
            .map(|(i, t)| (NUM_BYTES + i, t.len()))
    }

    /// Save tokenizer to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load tokenizer from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let tokenizer: ByteTokenizer = serde_json::from_str(&json)?;
        tokenizer.validate()?;
        Ok(tokenizer)
    }

    /// Check a deserialized tokenizer
    ///
    /// The first special token must be end-of-text and the padding id, if
    /// any, must name a registered special token.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.special_tokens.first().map(String::as_str) != Some(Self::EOS_TOKEN) {
            return Err(QuillError::param(format!(
                "tokenizer file must start its special tokens with {}",
                Self::EOS_TOKEN
            )));
        }
        if let Some(pad) = self.pad_token {
            if !(NUM_BYTES..self.vocab_size()).contains(&pad) {
                return Err(QuillError::param(format!(
                    "pad token id {} is not a special token (special ids are {}..{})",
                    pad,
                    NUM_BYTES,
                    self.vocab_size()
                )));
            }
        }
        Ok(())
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<usize> {
        let mut ids = Vec::with_capacity(text.len());
        let mut rest = text;
        while !rest.is_empty() {
            if let Some((id, len)) = self.match_special(rest) {
                ids.push(id);
                rest = &rest[len..];
                continue;
            }
            // Advance one whole char so the remainder stays valid UTF-8
            let ch_len = rest.chars().next().map_or(1, char::len_utf8);
            ids.extend(rest.as_bytes()[..ch_len].iter().map(|&b| b as usize));
            rest = &rest[ch_len..];
        }
        ids
    }

    fn decode(&self, ids: &[usize]) -> String {
        let mut out = String::new();
        let mut bytes = Vec::new();
        for &id in ids {
            if id < NUM_BYTES {
                bytes.push(id as u8);
            } else if let Some(token) = self.special_tokens.get(id - NUM_BYTES) {
                out.push_str(&String::from_utf8_lossy(&bytes));
                bytes.clear();
                out.push_str(token);
            }
        }
        out.push_str(&String::from_utf8_lossy(&bytes));
        out
    }

    fn vocab_size(&self) -> usize {
        NUM_BYTES + self.special_tokens.len()
    }

    fn eos_token_id(&self) -> usize {
        NUM_BYTES
    }

    fn pad_token_id(&self) -> Option<usize> {
        self.pad_token
    }

    fn add_special_token(&mut self, token: &str) -> usize {
        if let Some(id) = self.special_token_id(token) {
            return id;
        }
        self.special_tokens.push(token.to_string());
        NUM_BYTES + self.special_tokens.len() - 1
    }
}

/// Check that `model` accepts every id `tokenizer` can produce
///
/// # Errors
///
/// [`QuillError::ShapeMismatch`] if the vocabulary sizes differ, typically
/// because a special token was added without calling
/// [`LanguageModel::resize_vocab`]
pub fn ensure_vocab_matches<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    model: &LanguageModel,
) -> Result<()> {
    if tokenizer.vocab_size() != model.vocab_size() {
        return Err(QuillError::shape(format!(
            "tokenizer vocab size {} does not match model vocab size {}; call resize_vocab",
            tokenizer.vocab_size(),
            model.vocab_size()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    #[test]
    fn test_encode_decode_roundtrip() {
        let tokenizer = ByteTokenizer::new();

        let test_cases = vec![
            "hello",
            "Hello, world!",
            "To be, or not to be",
            "newline\nand\ttab",
            "UTF-8: café, naïve, 日本語",
            "",
        ];

        for text in test_cases {
            let encoded = tokenizer.encode(text);
            assert_eq!(encoded.len(), text.len());
            assert_eq!(tokenizer.decode(&encoded), text, "Failed roundtrip for: {}", text);
        }
    }

    #[test]
    fn test_base_vocab() {
        let tokenizer = ByteTokenizer::new();
        assert_eq!(tokenizer.vocab_size(), 257);
        assert_eq!(tokenizer.eos_token_id(), 256);
        assert_eq!(tokenizer.pad_token_id(), None);
        assert_eq!(tokenizer.encode("A"), vec![65]);
    }

    #[test]
    fn test_special_tokens_are_single_ids() {
        let mut tokenizer = ByteTokenizer::new();
        let pad = tokenizer.add_pad_token("<|pad|>");
        assert_eq!(pad, 257);
        assert_eq!(tokenizer.vocab_size(), 258);
        assert_eq!(tokenizer.pad_token_id(), Some(257));

        let ids = tokenizer.encode("hi<|endoftext|><|pad|>");
        assert_eq!(ids, vec![104, 105, 256, 257]);
        assert_eq!(tokenizer.decode(&ids), "hi<|endoftext|><|pad|>");
    }

    #[test]
    fn test_add_existing_token_is_noop() {
        let mut tokenizer = ByteTokenizer::new();
        assert_eq!(tokenizer.add_special_token(ByteTokenizer::EOS_TOKEN), 256);
        let first = tokenizer.add_special_token("<x>");
        assert_eq!(tokenizer.add_special_token("<x>"), first);
        assert_eq!(tokenizer.vocab_size(), 258);
    }

    #[test]
    fn test_decode_skips_unknown_ids() {
        let tokenizer = ByteTokenizer::new();
        assert_eq!(tokenizer.decode(&[104, 9999, 105]), "hi");
    }

    #[test]
    fn test_ensure_vocab_matches() {
        let mut tokenizer = ByteTokenizer::new();
        let mut model = LanguageModel::new(&ModelConfig {
            num_layers: 1,
            ..ModelConfig::tiny(tokenizer.vocab_size())
        })
        .unwrap();
        assert!(ensure_vocab_matches(&tokenizer, &model).is_ok());

        tokenizer.add_pad_token("<|pad|>");
        assert!(matches!(
            ensure_vocab_matches(&tokenizer, &model),
            Err(QuillError::ShapeMismatch(_))
        ));

        model.resize_vocab(tokenizer.vocab_size()).unwrap();
        assert!(ensure_vocab_matches(&tokenizer, &model).is_ok());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");

        let mut tokenizer = ByteTokenizer::new();
        tokenizer.add_pad_token("<|pad|>");
        tokenizer.save(&path).unwrap();

        let loaded = ByteTokenizer::load(&path).unwrap();
        assert_eq!(loaded, tokenizer);
    }

    #[test]
    fn test_load_rejects_unknown_pad_id() {
        let dir = tempfile::tempdir().unwrap();
        for (name, pad) in [("past_end.json", 300), ("byte.json", 65)] {
            let path = dir.path().join(name);
            let json = format!(
                r#"{{"special_tokens":["{}"],"pad_token":{}}}"#,
                ByteTokenizer::EOS_TOKEN,
                pad
            );
            std::fs::write(&path, json).unwrap();
            assert!(matches!(
                ByteTokenizer::load(&path),
                Err(QuillError::InvalidParameter(_))
            ));
        }
    }
}
