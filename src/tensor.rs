//! Tensor Operations
//!
//! A minimal dense tensor for the model's numeric core. Every activation in
//! the forward and backward passes is a 2D `[rows, cols]` matrix (one
//! sequence at a time), and parameters are 2D weight matrices or 1D vectors,
//! so the operations here focus on those two ranks.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[seq_len, embed_dim]`)
//!
//! ## Example
//!
//! ```rust
//! use quill::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Parallelism
//!
//! Matrix multiplication above a small work threshold runs a cache-blocked
//! kernel across Rayon threads. Softmax and element-wise operations iterate
//! rows or elements in parallel.
//!
//! ## Invariants
//!
//! Shape disagreements between tensors are programmer errors inside the
//! crate and panic. Public model entry points validate user input before any
//! tensor is built, so user input cannot trigger these panics.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A dense row-major `f32` array
///
/// For shape `[2, 3]`, data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the last dimension
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of rows when viewed as `[len / last_dim, last_dim]`
    pub fn rows(&self) -> usize {
        let cols = self.last_dim();
        if cols == 0 {
            0
        } else {
            self.data.len() / cols
        }
    }

    /// Borrow row `i` of the `[rows, last_dim]` view
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.last_dim();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Mutably borrow row `i` of the `[rows, last_dim]` view
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.last_dim();
        &mut self.data[i * cols..(i + 1) * cols]
    }

    /// `true` if no element is NaN or infinite
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&v| v * v).sum()
    }

    /// Matrix multiplication `[m, k] @ [k, n] -> [m, n]`
    ///
    /// # Performance
    ///
    /// - **Small matrices** (< 1K multiply-adds): sequential triple loop
    /// - **Larger matrices**: parallel cache-blocked algorithm
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or inner dimensions disagree
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "matmul expects 2D operands, got {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::axpy(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// `result[j] += a * b[j]`, written so LLVM can auto-vectorize it
    #[inline(always)]
    fn axpy(a: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a * b_val;
        }
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of 8, one Rayon task per block.
    /// Within a block the column and inner dimensions are also tiled by 8 so
    /// the working set stays in L1.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];
        if n == 0 {
            return Tensor::new(result, vec![m, n]);
        }

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);
                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);
                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::axpy(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax over the last dimension
    ///
    /// Uses the numerically stable form
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / Σ exp(x[j] - max(x))
    /// ```
    ///
    /// Rows where every entry is `-inf` are left as all zeros rather than NaN.
    pub fn softmax(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();
        if cols == 0 {
            return Tensor::new(result, self.shape.clone());
        }
        result.par_chunks_mut(cols).for_each(softmax_in_place);
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition
    ///
    /// Supports an exact shape match, or broadcasting a vector over the last
    /// dimension (`[*, n] + [n]`, used for biases).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.last_dim();
        if other.shape.len() == 1 && other.data.len() == last_dim {
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise accumulation, shapes must match
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for add_assign");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, &b)| *a += b);
    }

    /// Element-wise multiplication, with the same broadcasting as [`add`](Self::add)
    pub fn mul(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a * b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.last_dim();
        if other.shape.len() == 1 && other.data.len() == last_dim {
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x * other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for mul: {:?} * {:?}",
            self.shape, other.shape
        );
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Multiply all elements by scalar in place
    pub fn scale_in_place(&mut self, scalar: f32) {
        self.data.par_iter_mut().for_each(|x| *x *= scalar);
    }

    /// Sum over rows: `[rows, cols] -> [cols]`
    ///
    /// This is the bias gradient of a linear layer.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.last_dim();
        let mut sums = vec![0.0; cols];
        for row in self.data.chunks(cols.max(1)) {
            for (s, &v) in sums.iter_mut().zip(row) {
                *s += v;
            }
        }
        Tensor::new(sums, vec![cols])
    }

    /// Transpose a 2D matrix
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Copy columns `start..end` of a 2D matrix
    ///
    /// Used to split `[seq_len, embed_dim]` into per-head `[seq_len, head_dim]` views.
    pub fn columns(&self, start: usize, end: usize) -> Tensor {
        assert_eq!(self.shape.len(), 2, "columns expects a 2D tensor");
        assert!(start <= end && end <= self.shape[1], "column range out of bounds");
        let rows = self.shape[0];
        let width = end - start;
        let mut result = Vec::with_capacity(rows * width);
        for i in 0..rows {
            result.extend_from_slice(&self.row(i)[start..end]);
        }
        Tensor::new(result, vec![rows, width])
    }

    /// Write `src` into columns `start..start + src.cols` of a 2D matrix
    pub fn set_columns(&mut self, start: usize, src: &Tensor) {
        assert_eq!(self.shape.len(), 2, "set_columns expects a 2D tensor");
        assert_eq!(self.shape[0], src.shape[0], "row count mismatch in set_columns");
        let width = src.shape[1];
        assert!(start + width <= self.shape[1], "column range out of bounds");
        for i in 0..self.shape[0] {
            self.row_mut(i)[start..start + width].copy_from_slice(src.row(i));
        }
    }

    /// Copy the leading `rows × cols` block of a 2D matrix
    pub fn top_left(&self, rows: usize, cols: usize) -> Tensor {
        assert_eq!(self.shape.len(), 2, "top_left expects a 2D tensor");
        assert!(rows <= self.shape[0] && cols <= self.shape[1]);
        let mut result = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            result.extend_from_slice(&self.row(i)[..cols]);
        }
        Tensor::new(result, vec![rows, cols])
    }

    /// Replace values where mask is non-zero with `value`
    ///
    /// Used for causal masking in attention (setting future positions to -inf)
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        assert_eq!(self.shape, mask.shape, "Mask shape must match tensor shape");
        let result = self
            .data
            .par_iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }
}

/// Numerically stable softmax of one row, in place
///
/// A row of all `-inf` becomes all zeros.
pub fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        row.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

/// `log Σ exp(x)` computed with max subtraction
pub fn log_sum_exp(row: &[f32]) -> f32 {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_small() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        assert_eq!(a.matmul(&b).data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_blocked_matches_naive() {
        // 17x13 @ 13x11 crosses the parallel threshold and leaves ragged blocks
        let (m, k, n) = (17, 13, 11);
        let a = Tensor::new((0..m * k).map(|i| (i % 7) as f32 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|i| (i % 5) as f32 * 0.5).collect(), vec![k, n]);
        let c = a.matmul(&b);

        for i in 0..m {
            for j in 0..n {
                let expected: f32 = (0..k).map(|l| a.data[i * k + l] * b.data[l * n + j]).sum();
                assert!((c.data[i * n + j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], vec![2, 3]);
        let s = t.softmax();
        for i in 0..2 {
            let sum: f32 = s.row(i).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(s.is_finite());
        assert!((s.data[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_masked_entries_are_zero() {
        let t = Tensor::new(vec![0.5, f32::NEG_INFINITY, 0.5], vec![1, 3]);
        let s = t.softmax();
        assert_eq!(s.data[1], 0.0);
        assert!((s.data[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_all_masked_row_is_zero() {
        let t = Tensor::full(vec![1, 4], f32::NEG_INFINITY);
        assert_eq!(t.softmax().data, vec![0.0; 4]);
    }

    #[test]
    fn test_add_broadcasts_bias() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]);
        assert_eq!(x.add(&b).data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_transpose_and_sum_rows() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let t = x.transpose();
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(t.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(x.sum_rows().data, vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_columns_round_trip() {
        let x = Tensor::new((0..12).map(|v| v as f32).collect(), vec![3, 4]);
        let mid = x.columns(1, 3);
        assert_eq!(mid.data, vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);

        let mut y = Tensor::zeros(vec![3, 4]);
        y.set_columns(1, &mid);
        assert_eq!(y.row(2), &[0.0, 9.0, 10.0, 0.0]);
    }

    #[test]
    fn test_log_sum_exp_stable() {
        let v = [1000.0, 1000.0];
        assert!((log_sum_exp(&v) - (1000.0 + 2f32.ln())).abs() < 1e-3);
    }
}
