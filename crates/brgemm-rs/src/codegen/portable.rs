use std::sync::Arc;

use crate::call::{load_f32, load_i32, store_f32, Element, KernelCall};
use crate::dtype::DType;
use crate::error::{BrgemmError, BrgemmResult};
use crate::kernel::{BrgemmDesc, BrgemmKernel, CodeGenerator, ShapePolicy};
use crate::post_ops::PostOpChain;

/// Generator for scalar kernels that read the problem shape at call time.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableCodegen;

impl PortableCodegen {
    pub fn new() -> Self {
        Self
    }
}

impl CodeGenerator for PortableCodegen {
    fn name(&self) -> &str {
        "portable"
    }

    fn shape_policy(&self) -> ShapePolicy {
        ShapePolicy::Runtime
    }

    fn generate(&self, desc: &BrgemmDesc) -> BrgemmResult<Arc<dyn BrgemmKernel>> {
        Ok(Arc::new(PortableKernel::new(desc)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accumulator {
    F32,
    I32,
}

#[derive(Debug)]
pub struct PortableKernel {
    name: String,
    dt_in0: DType,
    dt_in1: DType,
    dt_out: DType,
    accumulator: Accumulator,
    post_ops: PostOpChain,
    is_with_comp: bool,
}

impl PortableKernel {
    pub fn new(desc: &BrgemmDesc) -> BrgemmResult<Self> {
        let accumulator = match (desc.dt_in0, desc.dt_in1) {
            (DType::F32, DType::F32) | (DType::Bf16, DType::Bf16) | (DType::F16, DType::F16) => {
                Accumulator::F32
            }
            (DType::U8 | DType::I8, DType::I8) => Accumulator::I32,
            (a, b) => {
                return Err(BrgemmError::unsupported(format!(
                    "portable kernels do not support {a} x {b}"
                )))
            }
        };
        let out_ok = match accumulator {
            Accumulator::F32 => desc.dt_out.is_float(),
            Accumulator::I32 => matches!(desc.dt_out, DType::I32 | DType::F32),
        };
        if !out_ok {
            return Err(BrgemmError::unsupported(format!(
                "portable kernels cannot write {} from {} x {}",
                desc.dt_out, desc.dt_in0, desc.dt_in1
            )));
        }
        if desc.is_with_comp && desc.dt_in0 != DType::I8 {
            return Err(BrgemmError::unsupported(format!(
                "compensation requested for {} x {}",
                desc.dt_in0, desc.dt_in1
            )));
        }
        Ok(Self {
            name: format!("portable_{}{}{}", desc.dt_in0, desc.dt_in1, desc.dt_out),
            dt_in0: desc.dt_in0,
            dt_in1: desc.dt_in1,
            dt_out: desc.dt_out,
            accumulator,
            post_ops: desc.post_ops.clone(),
            is_with_comp: desc.is_with_comp,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dot_f32(
        &self,
        a: &[u8],
        b: &[u8],
        row: usize,
        col: usize,
        k: usize,
        lda: usize,
        ldb: usize,
    ) -> f32 {
        (0..k)
            .map(|kk| {
                load_f32(self.dt_in0, a, row * lda + kk) * load_f32(self.dt_in1, b, kk * ldb + col)
            })
            .sum()
    }

    #[allow(clippy::too_many_arguments)]
    fn dot_i32(
        &self,
        a: &[u8],
        b: &[u8],
        row: usize,
        col: usize,
        k: usize,
        lda: usize,
        ldb: usize,
    ) -> i32 {
        let shift = if self.is_with_comp { 128 } else { 0 };
        (0..k)
            .map(|kk| {
                let lhs = load_i32(self.dt_in0, a, row * lda + kk) + shift;
                lhs.wrapping_mul(load_i32(self.dt_in1, b, kk * ldb + col))
            })
            .fold(0i32, i32::wrapping_add)
    }
}

impl BrgemmKernel for PortableKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, call: KernelCall<'_, '_>) -> BrgemmResult<()> {
        let dims = call.dims;
        let args = call.args;
        let post_ops = call.apply_post_ops && !self.post_ops.is_empty();

        for row in 0..dims.m {
            for col in 0..dims.n {
                let c_idx = row * dims.ldc + col;
                match self.accumulator {
                    Accumulator::F32 => {
                        let acc =
                            self.dot_f32(args.a, args.b, row, col, dims.k, dims.lda, dims.ldb);
                        self.finish(
                            args.c,
                            c_idx,
                            acc,
                            (row, col),
                            dims.ldc,
                            dims.beta,
                            post_ops,
                            args.post_ops_binary_args,
                        );
                    }
                    Accumulator::I32 => {
                        let mut acc =
                            self.dot_i32(args.a, args.b, row, col, dims.k, dims.lda, dims.ldb);
                        if self.is_with_comp && call.apply_compensation {
                            acc = acc.wrapping_add(i32::load(args.scratch, col));
                        }
                        if self.dt_out == DType::I32 && !post_ops {
                            let previous = i32::load(args.c, c_idx);
                            let out = if dims.beta == 0.0 {
                                acc
                            } else if dims.beta == 1.0 {
                                acc.wrapping_add(previous)
                            } else {
                                acc.wrapping_add((dims.beta * previous as f32).round() as i32)
                            };
                            out.store(args.c, c_idx);
                        } else {
                            self.finish(
                                args.c,
                                c_idx,
                                acc as f32,
                                (row, col),
                                dims.ldc,
                                dims.beta,
                                post_ops,
                                args.post_ops_binary_args,
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl PortableKernel {
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        c: &mut [u8],
        c_idx: usize,
        acc: f32,
        (row, col): (usize, usize),
        ldc: usize,
        beta: f32,
        post_ops: bool,
        binary_args: &[&[f32]],
    ) {
        let previous = load_f32(self.dt_out, c, c_idx);
        let mut value = if beta == 0.0 { acc } else { acc + beta * previous };
        if post_ops {
            value = self.post_ops.apply(value, previous, (row, col, ldc), binary_args);
        }
        store_f32(self.dt_out, c, c_idx, value);
    }
}
