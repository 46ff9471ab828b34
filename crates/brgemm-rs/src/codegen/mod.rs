//! In-process code generation.

mod portable;

pub use portable::{PortableCodegen, PortableKernel};

/// Per-column s8s8 correction for a `k x n` block of B with row stride `ldb`.
///
/// Kernels built with compensation read A as `a + 128`; adding
/// `-128 * sum_k B[k][n]` to column `n` restores the signed product. The
/// vector covers the whole reduction, so it is applied on the first K block
/// only.
pub fn s8s8_compensation(b: &[i8], k: usize, n: usize, ldb: usize) -> Vec<i32> {
    (0..n)
        .map(|col| {
            let sum: i32 = (0..k).map(|row| i32::from(b[row * ldb + col])).sum();
            -128 * sum
        })
        .collect()
}
