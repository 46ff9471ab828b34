//! Shape and layout metadata supplied by the lowering pipeline.

use crate::dtype::DType;
use crate::error::{BrgemmError, BrgemmResult};
use crate::post_ops::PostOpChain;

/// Everything an executor needs to refresh its configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BrgemmMetadata {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub beta: f32,
    /// `(A, B, out)`; `None` keeps the current precisions.
    pub precisions: Option<(DType, DType, DType)>,
    /// `None` keeps the current chain.
    pub post_ops: Option<PostOpChain>,
}

impl BrgemmMetadata {
    pub fn shape(
        m: usize,
        n: usize,
        k: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        beta: f32,
    ) -> Self {
        Self {
            m,
            n,
            k,
            lda,
            ldb,
            ldc,
            beta,
            precisions: None,
            post_ops: None,
        }
    }
}

pub trait MetadataSource: Send + Sync {
    fn brgemm_metadata(&self) -> BrgemmResult<BrgemmMetadata>;
}

impl MetadataSource for BrgemmMetadata {
    fn brgemm_metadata(&self) -> BrgemmResult<BrgemmMetadata> {
        Ok(self.clone())
    }
}

/// Subtensor `[rows, cols]` of one port and its row stride in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDescriptor {
    pub subtensor: [usize; 2],
    pub leading_dim: usize,
}

impl PortDescriptor {
    pub fn new(rows: usize, cols: usize, leading_dim: usize) -> Self {
        Self {
            subtensor: [rows, cols],
            leading_dim,
        }
    }

    /// Dense row-major port: the leading dimension equals the row length.
    pub fn dense(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, cols)
    }

    pub fn rows(&self) -> usize {
        self.subtensor[0]
    }

    pub fn cols(&self) -> usize {
        self.subtensor[1]
    }
}

/// A brgemm node of the lowered program.
///
/// Inside a blocked K loop, the first block overwrites the output and every
/// later block accumulates into it.
#[derive(Debug, Clone)]
pub struct BrgemmExpression {
    pub input_a: PortDescriptor,
    pub input_b: PortDescriptor,
    pub output: PortDescriptor,
    pub k_block_index: usize,
    pub precisions: Option<(DType, DType, DType)>,
    pub post_ops: Option<PostOpChain>,
}

impl BrgemmExpression {
    pub fn new(input_a: PortDescriptor, input_b: PortDescriptor, output: PortDescriptor) -> Self {
        Self {
            input_a,
            input_b,
            output,
            k_block_index: 0,
            precisions: None,
            post_ops: None,
        }
    }

    pub fn with_k_block(mut self, index: usize) -> Self {
        self.k_block_index = index;
        self
    }

    pub fn with_precisions(mut self, a: DType, b: DType, out: DType) -> Self {
        self.precisions = Some((a, b, out));
        self
    }

    pub fn with_post_ops(mut self, post_ops: PostOpChain) -> Self {
        self.post_ops = Some(post_ops);
        self
    }

    fn validate(&self) -> BrgemmResult<()> {
        let (a, b, c) = (&self.input_a, &self.input_b, &self.output);
        if a.cols() != b.rows() {
            return Err(BrgemmError::invalid_metadata(format!(
                "A has {} columns but B has {} rows",
                a.cols(),
                b.rows()
            )));
        }
        if a.rows() != c.rows() || b.cols() != c.cols() {
            return Err(BrgemmError::invalid_metadata(format!(
                "output subtensor {:?} does not match A {:?} x B {:?}",
                c.subtensor, a.subtensor, b.subtensor
            )));
        }
        for (name, port) in [("A", a), ("B", b), ("output", c)] {
            if port.leading_dim < port.cols() {
                return Err(BrgemmError::invalid_metadata(format!(
                    "{name} leading dimension {} is smaller than its row length {}",
                    port.leading_dim,
                    port.cols()
                )));
            }
        }
        Ok(())
    }
}

impl MetadataSource for BrgemmExpression {
    fn brgemm_metadata(&self) -> BrgemmResult<BrgemmMetadata> {
        self.validate()?;
        let beta = if self.k_block_index == 0 { 0.0 } else { 1.0 };
        Ok(BrgemmMetadata {
            m: self.output.rows(),
            n: self.output.cols(),
            k: self.input_a.cols(),
            lda: self.input_a.leading_dim,
            ldb: self.input_b.leading_dim,
            ldc: self.output.leading_dim,
            beta,
            precisions: self.precisions,
            post_ops: self.post_ops.clone(),
        })
    }
}
