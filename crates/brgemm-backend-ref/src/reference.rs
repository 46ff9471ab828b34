use std::sync::Arc;

use brgemm_rs::call::{load_f32, store_f32};
use brgemm_rs::{
    brgemm_assert, BrgemmKernel, BrgemmResult, CompiledKernel, DType, DynamicParams, KernelCall,
    KernelCompiler, KernelConfig, ShapePolicy,
};

const STRATEGY: &str = "reference";

/// Aborts unless `config` can be interpreted by [`ReferenceKernel`].
pub fn check_preconditions(config: &KernelConfig) {
    brgemm_assert!(
        !config.is_with_comp(),
        "reference executor does not support compensation"
    );
    brgemm_assert!(
        [config.dt_in0(), config.dt_in1(), config.dt_out()]
            .iter()
            .all(|dtype| *dtype == DType::F32),
        "reference executor supports f32 only, got {} x {} -> {}",
        config.dt_in0(),
        config.dt_in1(),
        config.dt_out()
    );
}

/// Nested-loop brgemm over the dimensions it was built for.
///
/// Always overwrites the output: beta and post-ops are not applied.
#[derive(Debug)]
pub struct ReferenceKernel {
    dims: DynamicParams,
}

impl ReferenceKernel {
    pub fn new(config: &KernelConfig) -> Self {
        check_preconditions(config);
        Self {
            dims: *config.dynamic(),
        }
    }

    pub fn dims(&self) -> &DynamicParams {
        &self.dims
    }
}

impl BrgemmKernel for ReferenceKernel {
    fn name(&self) -> &str {
        STRATEGY
    }

    fn invoke(&self, call: KernelCall<'_, '_>) -> BrgemmResult<()> {
        let DynamicParams {
            m,
            n,
            k,
            lda,
            ldb,
            ldc,
            ..
        } = self.dims;
        let args = call.args;
        for row in 0..m {
            let a_row = row * lda;
            let c_row = row * ldc;
            for col in 0..n {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    acc += load_f32(DType::F32, args.a, a_row + kk)
                        * load_f32(DType::F32, args.b, kk * ldb + col);
                }
                store_f32(DType::F32, args.c, c_row + col, acc);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCompiler;

impl ReferenceCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl KernelCompiler for ReferenceCompiler {
    fn name(&self) -> &str {
        STRATEGY
    }

    fn shape_policy(&self) -> ShapePolicy {
        ShapePolicy::Baked
    }

    fn compile_kernel(&self, config: &KernelConfig) -> BrgemmResult<CompiledKernel> {
        if config.is_empty() {
            return Ok(CompiledKernel::empty(STRATEGY));
        }
        let kernel = ReferenceKernel::new(config);
        tracing::debug!(
            m = config.m(),
            n = config.n(),
            k = config.k(),
            "built reference brgemm kernel"
        );
        Ok(CompiledKernel::new(STRATEGY, Arc::new(kernel)))
    }
}
