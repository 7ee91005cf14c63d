//! Checkpoints
//!
//! Saves a model's named parameters, optionally with optimizer state and the
//! tokenizer, so training can resume or a trained model can be reloaded for
//! generation.
//!
//! ## File Layout
//!
//! ```text
//! b"QUILL_CKPT"            magic header
//! u8                       format version (1)
//! u32 + JSON               metadata: model config, step, tokenizer
//! u32                      number of parameters
//! per parameter:
//!     u32 + UTF-8          name, e.g. "blocks.0.attn.q_proj.weight"
//!     tensor
//! u8                       1 if optimizer state follows
//! optimizer (if present):
//!     u64 step, f32 beta1, f32 beta2, f32 epsilon
//!     u32 count, then per parameter: u8 decay flag, m tensor, v tensor
//! ```
//!
//! A tensor is written as `u32 rank, u32 dims…, u32 len, f32 values…`, all
//! little-endian.
//!
//! Parameters are keyed by name, the same names as
//! [`LanguageModel::state_dict`], so a checkpoint is independent of the
//! in-memory layout.

use crate::config::ModelConfig;
use crate::error::{QuillError, Result};
use crate::model::LanguageModel;
use crate::optimizer::AdamWOptimizer;
use crate::tensor::Tensor;
use crate::tokenizer::ByteTokenizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 10] = b"QUILL_CKPT";
const VERSION: u8 = 1;

/// Everything needed to rebuild a model and resume training
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub config: ModelConfig,
    /// Parameter name → tensor
    pub state: BTreeMap<String, Tensor>,
    pub optimizer: Option<AdamWOptimizer>,
    pub tokenizer: Option<ByteTokenizer>,
    /// Optimizer steps taken when the checkpoint was written
    pub step: usize,
}

#[derive(Serialize, Deserialize)]
struct CheckpointMetadata {
    config: ModelConfig,
    step: usize,
    tokenizer: Option<ByteTokenizer>,
}

impl Checkpoint {
    /// Snapshot of `model`'s current parameters
    pub fn from_model(model: &LanguageModel) -> Self {
        Self {
            config: model.config().clone(),
            state: model.state_dict(),
            optimizer: None,
            tokenizer: None,
            step: 0,
        }
    }

    /// Include optimizer state; `step` is taken from the optimizer
    pub fn with_optimizer(mut self, optimizer: AdamWOptimizer) -> Self {
        self.step = optimizer.step;
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: ByteTokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Rebuild the model
    ///
    /// # Errors
    ///
    /// [`QuillError::ShapeMismatch`] if the stored parameters do not match
    /// the stored config
    pub fn to_model(&self) -> Result<LanguageModel> {
        let mut model = LanguageModel::new(&self.config)?;
        model.load_state_dict(&self.state)?;
        Ok(model)
    }

    /// Write the checkpoint to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        println!("💾 Saving checkpoint to {}...", path.display());

        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;

        let metadata = CheckpointMetadata {
            config: self.config.clone(),
            step: self.step,
            tokenizer: self.tokenizer.clone(),
        };
        write_bytes(&mut file, serde_json::to_string(&metadata)?.as_bytes())?;

        write_u32(&mut file, self.state.len())?;
        for (name, tensor) in &self.state {
            write_bytes(&mut file, name.as_bytes())?;
            write_tensor(&mut file, tensor)?;
        }

        file.write_all(&[self.optimizer.is_some() as u8])?;
        if let Some(opt) = &self.optimizer {
            file.write_all(&(opt.step as u64).to_le_bytes())?;
            file.write_all(&opt.beta1.to_le_bytes())?;
            file.write_all(&opt.beta2.to_le_bytes())?;
            file.write_all(&opt.epsilon.to_le_bytes())?;
            write_u32(&mut file, opt.m.len())?;
            for ((m, v), &decay) in opt.m.iter().zip(&opt.v).zip(&opt.decay) {
                file.write_all(&[decay as u8])?;
                write_tensor(&mut file, m)?;
                write_tensor(&mut file, v)?;
            }
        }
        file.flush()?;

        let file_size = std::fs::metadata(path)?.len() as f64 / 1_000_000.0;
        println!("✅ Checkpoint saved successfully!");
        println!("   File size: {:.2} MB", file_size);
        let mut includes = vec!["Model weights"];
        if self.optimizer.is_some() {
            includes.push("Optimizer state");
        }
        if self.tokenizer.is_some() {
            includes.push("Tokenizer");
        }
        println!("   Includes: {}", includes.join(" + "));
        Ok(())
    }

    /// Read a checkpoint written by [`save`](Self::save)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        println!("📂 Loading checkpoint from {}...", path.display());

        let mut file = BufReader::new(File::open(path)?);

        let mut header = [0u8; 10];
        file.read_exact(&mut header)?;
        if &header != MAGIC {
            return Err(invalid_data("invalid checkpoint header, expected QUILL_CKPT"));
        }
        let version = read_u8(&mut file)?;
        if version != VERSION {
            return Err(invalid_data(format!("unsupported checkpoint version: {version}")));
        }

        let metadata: CheckpointMetadata = serde_json::from_slice(&read_bytes(&mut file)?)?;
        if let Some(tokenizer) = &metadata.tokenizer {
            tokenizer.validate()?;
        }

        let num_params = read_u32(&mut file)?;
        let mut state = BTreeMap::new();
        for _ in 0..num_params {
            let name = String::from_utf8(read_bytes(&mut file)?)
                .map_err(|e| invalid_data(format!("parameter name is not UTF-8: {e}")))?;
            let tensor = read_tensor(&mut file)?;
            state.insert(name, tensor);
        }

        let optimizer = match read_u8(&mut file)? {
            0 => None,
            _ => {
                let step = u64::from_le_bytes(read_array(&mut file)?) as usize;
                let beta1 = f32::from_le_bytes(read_array(&mut file)?);
                let beta2 = f32::from_le_bytes(read_array(&mut file)?);
                let epsilon = f32::from_le_bytes(read_array(&mut file)?);
                let count = read_u32(&mut file)?;
                let mut m = Vec::with_capacity(count);
                let mut v = Vec::with_capacity(count);
                let mut decay = Vec::with_capacity(count);
                for _ in 0..count {
                    decay.push(read_u8(&mut file)? != 0);
                    m.push(read_tensor(&mut file)?);
                    v.push(read_tensor(&mut file)?);
                }
                Some(AdamWOptimizer {
                    m,
                    v,
                    decay,
                    beta1,
                    beta2,
                    epsilon,
                    step,
                })
            }
        };

        println!(
            "   {} parameters, step {}{}",
            state.len(),
            metadata.step,
            if optimizer.is_some() { ", with optimizer state" } else { "" }
        );

        Ok(Self {
            config: metadata.config,
            state,
            optimizer,
            tokenizer: metadata.tokenizer,
            step: metadata.step,
        })
    }
}

fn invalid_data(msg: impl Into<String>) -> QuillError {
    QuillError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        msg.into(),
    ))
}

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| invalid_data(format!("{value} does not fit the checkpoint format")))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(w, bytes.len())?;
    w.write_all(bytes)?;
    Ok(())
}

fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.data.len())?;
    for &val in &tensor.data {
        w.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    Ok(read_array::<R, 1>(r)?[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<usize> {
    Ok(u32::from_le_bytes(read_array(r)?) as usize)
}

/// Read exactly `len` bytes, growing the buffer only as data arrives
fn read_exact_len<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(invalid_data(format!(
            "expected {} bytes, file ended after {}",
            len,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)?;
    read_exact_len(r, len)
}

fn read_tensor<R: Read>(r: &mut R) -> Result<Tensor> {
    let rank = read_u32(r)?;
    let shape = (0..rank).map(|_| read_u32(r)).collect::<Result<Vec<_>>>()?;
    let len = read_u32(r)?;
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| invalid_data(format!("tensor shape {shape:?} overflows")))?;
    if numel != len {
        return Err(invalid_data(format!(
            "tensor with shape {shape:?} cannot hold {len} values"
        )));
    }
    let num_bytes = len
        .checked_mul(4)
        .ok_or_else(|| invalid_data(format!("tensor of {len} values overflows")))?;
    let raw = read_exact_len(r, num_bytes)?;
    let data = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}
