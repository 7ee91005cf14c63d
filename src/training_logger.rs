//! Training Logger
//!
//! Records training metrics to a CSV file and the console.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quill::{StepMetrics, TrainingLogger};
//!
//! let mut logger = TrainingLogger::new("training_log.csv")?;
//! logger.log(&StepMetrics {
//!     epoch: 0,
//!     step: 100,
//!     learning_rate: 1e-3,
//!     loss: 2.5,
//!     grad_norm: 0.8,
//! })?;
//! # Ok::<(), quill::QuillError>(())
//! ```
//!
//! ## CSV Format
//!
//! - `epoch`: Zero-based epoch
//! - `step`: Global optimizer step
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Learning rate used for the step
//! - `loss`: Masked cross-entropy of the batch
//! - `perplexity`: exp(loss)
//! - `grad_norm`: Global gradient norm before clipping
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! - **Perfect model**: perplexity = 1.0 (loss = 0)
//! - **Random guessing** (byte vocab, 258 ids): perplexity ≈ 258 (loss ≈ 5.55)
//!
//! Lower perplexity means the model makes better predictions.

use crate::error::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Metrics for one logged training step
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepMetrics {
    pub epoch: usize,
    pub step: usize,
    pub learning_rate: f32,
    pub loss: f32,
    pub grad_norm: f32,
}

/// Logs training metrics to a CSV file and the console
///
/// Every row is flushed immediately, so the file is complete up to the last
/// logged step even if training is interrupted.
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header
    pub fn new<P: AsRef<Path>>(log_path: P) -> Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "epoch,step,elapsed_seconds,learning_rate,loss,perplexity,grad_norm"
        )?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Write one CSV row and print a progress line
    pub fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let perplexity = metrics.loss.exp();

        writeln!(
            self.log_file,
            "{},{},{:.2},{:.6},{:.4},{:.2},{:.4}",
            metrics.epoch,
            metrics.step,
            elapsed,
            metrics.learning_rate,
            metrics.loss,
            perplexity,
            metrics.grad_norm
        )?;
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f32();
        println!(
            "Epoch {:2} | Step {:5} | Time: {:7.1}s (+{:.1}s) | LR: {:.6} | Loss: {:.4} | Perplexity: {:.2} | Grad norm: {:.3}",
            metrics.epoch,
            metrics.step,
            elapsed,
            step_time,
            metrics.learning_rate,
            metrics.loss,
            perplexity,
            metrics.grad_norm
        );

        self.last_log_time = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");

        let mut logger = TrainingLogger::new(&path).unwrap();
        logger
            .log(&StepMetrics {
                epoch: 1,
                step: 7,
                learning_rate: 0.001,
                loss: 0.0,
                grad_norm: 0.5,
            })
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "epoch,step,elapsed_seconds,learning_rate,loss,perplexity,grad_norm"
        );
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "7");
        assert_eq!(fields[3], "0.001000");
        assert_eq!(fields[5], "1.00");
        assert_eq!(fields[6], "0.5000");
    }
}
