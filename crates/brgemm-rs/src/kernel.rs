use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::call::KernelCall;
use crate::config::KernelConfig;
use crate::dtype::DType;
use crate::error::{BrgemmError, BrgemmResult};
use crate::isa::IsaTier;
use crate::post_ops::PostOpChain;

const EMPTY_STRATEGY: &str = "empty";

static EMPTY_KERNEL: OnceLock<Arc<CompiledKernel>> = OnceLock::new();

/// Executable kernel produced by a compile strategy.
pub trait BrgemmKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the kernel. Buffers have been validated against `call.dims`.
    fn invoke(&self, call: KernelCall<'_, '_>) -> BrgemmResult<()>;
}

/// Whether a strategy reads problem sizes at call time or compiles them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapePolicy {
    /// One artifact serves every shape of a static identity.
    Runtime,
    /// Every distinct dynamic part gets its own artifact.
    Baked,
}

/// Shared compiled artifact. The empty artifact holds no kernel and runs as a
/// no-op.
pub struct CompiledKernel {
    strategy: Arc<str>,
    kernel: Option<Arc<dyn BrgemmKernel>>,
}

impl CompiledKernel {
    pub fn new(strategy: impl Into<Arc<str>>, kernel: Arc<dyn BrgemmKernel>) -> Self {
        Self {
            strategy: strategy.into(),
            kernel: Some(kernel),
        }
    }

    pub fn empty(strategy: impl Into<Arc<str>>) -> Self {
        Self {
            strategy: strategy.into(),
            kernel: None,
        }
    }

    /// Process-wide artifact for zero-sized problems.
    pub fn shared_empty() -> Arc<CompiledKernel> {
        Arc::clone(EMPTY_KERNEL.get_or_init(|| Arc::new(CompiledKernel::empty(EMPTY_STRATEGY))))
    }

    pub fn is_empty(&self) -> bool {
        self.kernel.is_none()
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn kernel(&self) -> Option<&Arc<dyn BrgemmKernel>> {
        self.kernel.as_ref()
    }

    pub fn invoke(&self, call: KernelCall<'_, '_>) -> BrgemmResult<()> {
        match &self.kernel {
            Some(kernel) => kernel.invoke(call),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("strategy", &self.strategy)
            .field("kernel", &self.kernel.as_ref().map(|kernel| kernel.name().to_string()))
            .finish()
    }
}

/// Turns a configuration into a compiled artifact.
pub trait KernelCompiler: Send + Sync {
    fn name(&self) -> &str;

    fn shape_policy(&self) -> ShapePolicy;

    fn compile_kernel(&self, config: &KernelConfig) -> BrgemmResult<CompiledKernel>;
}

/// Kernel-creation parameters handed to a code generator.
#[derive(Debug, Clone, PartialEq)]
pub struct BrgemmDesc {
    pub dt_in0: DType,
    pub dt_in1: DType,
    pub dt_out: DType,
    pub isa: IsaTier,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub beta: f32,
    pub post_ops: PostOpChain,
    pub is_with_comp: bool,
}

impl BrgemmDesc {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            dt_in0: config.dt_in0(),
            dt_in1: config.dt_in1(),
            dt_out: config.dt_out(),
            isa: config.isa(),
            m: config.m(),
            n: config.n(),
            k: config.k(),
            lda: config.lda(),
            ldb: config.ldb(),
            ldc: config.ldc(),
            beta: config.beta(),
            post_ops: config.post_ops().clone(),
            is_with_comp: config.is_with_comp(),
        }
    }
}

/// Machine-code (or source) generator for brgemm kernels.
pub trait CodeGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn shape_policy(&self) -> ShapePolicy;

    fn generate(&self, desc: &BrgemmDesc) -> BrgemmResult<Arc<dyn BrgemmKernel>>;
}

/// Compile strategy backed by a [`CodeGenerator`].
pub struct JitCompiler {
    generator: Arc<dyn CodeGenerator>,
}

impl JitCompiler {
    pub fn new(generator: Arc<dyn CodeGenerator>) -> Self {
        Self { generator }
    }

    pub fn generator(&self) -> &Arc<dyn CodeGenerator> {
        &self.generator
    }
}

impl KernelCompiler for JitCompiler {
    fn name(&self) -> &str {
        self.generator.name()
    }

    fn shape_policy(&self) -> ShapePolicy {
        self.generator.shape_policy()
    }

    fn compile_kernel(&self, config: &KernelConfig) -> BrgemmResult<CompiledKernel> {
        if config.is_empty() {
            return Ok(CompiledKernel::empty(self.name()));
        }
        if !config.isa().supports(config.dt_in0(), config.dt_in1()) {
            return Err(BrgemmError::unsupported(format!(
                "{} x {} kernels are not available at ISA {}",
                config.dt_in0(),
                config.dt_in1(),
                config.isa()
            )));
        }
        let desc = BrgemmDesc::from_config(config);
        let kernel = self.generator.generate(&desc)?;
        tracing::debug!(
            strategy = self.name(),
            kernel = kernel.name(),
            m = desc.m,
            n = desc.n,
            k = desc.k,
            "generated brgemm kernel"
        );
        Ok(CompiledKernel::new(self.name(), kernel))
    }
}
