pub mod reference;

use std::sync::Arc;

use brgemm_rs::{env, BrgemmKernelExecutor, KernelCache, KernelCompiler, KernelConfig};

pub use reference::{check_preconditions, ReferenceCompiler, ReferenceKernel};

/// Executor that interprets `config` with plain loops instead of generated code.
///
/// Panics unless `config` is an f32 configuration without compensation.
pub fn reference_executor(cache: &Arc<KernelCache>, config: KernelConfig) -> BrgemmKernelExecutor {
    check_preconditions(&config);
    BrgemmKernelExecutor::new(cache, config, Arc::new(ReferenceCompiler::new()))
}

/// Returns the reference strategy when `BRGEMM_REFERENCE_EXECUTOR` is set,
/// `jit` otherwise.
pub fn compiler_from_env(jit: Arc<dyn KernelCompiler>) -> Arc<dyn KernelCompiler> {
    if env::reference_executor_enabled() {
        tracing::info!(
            replaced = jit.name(),
            "using reference brgemm executor ({} is set)",
            env::REFERENCE_EXECUTOR_VAR
        );
        return Arc::new(ReferenceCompiler::new());
    }
    jit
}
