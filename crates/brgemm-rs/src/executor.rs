use std::fmt;
use std::sync::{Arc, Weak};

use crate::brgemm_fatal;
use crate::cache::{KernelCache, KernelKey};
use crate::call::{validate_call, BrgemmCallArgs, KernelCall};
use crate::config::{KernelConfig, StaticParams};
use crate::error::BrgemmResult;
use crate::kernel::{CodeGenerator, CompiledKernel, JitCompiler, KernelCompiler};
use crate::metadata::MetadataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Built from an empty configuration and never updated.
    Unconfigured,
    /// Holds a configuration without a matching compiled kernel.
    Configured,
    Compiled,
    Executed,
}

/// Dispatches one brgemm call site to a compiled kernel.
///
/// The cache is held weakly: once it is dropped, kernels are compiled on
/// demand and not persisted.
pub struct BrgemmKernelExecutor {
    cache: Weak<KernelCache>,
    compiler: Arc<dyn KernelCompiler>,
    config: KernelConfig,
    kernel: Option<Arc<CompiledKernel>>,
    state: ExecutorState,
}

impl BrgemmKernelExecutor {
    pub fn new(
        cache: &Arc<KernelCache>,
        config: KernelConfig,
        compiler: Arc<dyn KernelCompiler>,
    ) -> Self {
        let state = if config.is_empty() {
            ExecutorState::Unconfigured
        } else {
            ExecutorState::Configured
        };
        Self {
            cache: Arc::downgrade(cache),
            compiler,
            config,
            kernel: None,
            state,
        }
    }

    pub fn jit(
        cache: &Arc<KernelCache>,
        config: KernelConfig,
        generator: Arc<dyn CodeGenerator>,
    ) -> Self {
        Self::new(cache, config, Arc::new(JitCompiler::new(generator)))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn kernel(&self) -> Option<&Arc<CompiledKernel>> {
        self.kernel.as_ref()
    }

    pub fn compiler(&self) -> &Arc<dyn KernelCompiler> {
        &self.compiler
    }

    /// Rewrites the configuration from current program metadata.
    ///
    /// Unchanged metadata keeps the configuration and any compiled kernel.
    pub fn update_config(&mut self, source: &dyn MetadataSource) -> BrgemmResult<()> {
        let metadata = source.brgemm_metadata()?;
        let mut next = self.config.clone();

        if metadata.precisions.is_some() || metadata.post_ops.is_some() {
            let current = next.static_params();
            let (dt_in0, dt_in1, dt_out) = metadata.precisions.unwrap_or((
                current.dt_in0(),
                current.dt_in1(),
                current.dt_out(),
            ));
            let is_with_comp = match metadata.precisions {
                Some(_) => StaticParams::compensation_required(dt_in0, dt_in1, current.isa()),
                None => current.is_with_comp(),
            };
            let post_ops = metadata
                .post_ops
                .unwrap_or_else(|| current.post_ops().clone());
            let params = StaticParams::new(
                dt_in0,
                dt_in1,
                dt_out,
                current.isa(),
                post_ops,
                is_with_comp,
            );
            next.set_static_params(params);
        }
        next.update(
            metadata.m,
            metadata.n,
            metadata.k,
            metadata.lda,
            metadata.ldb,
            metadata.ldc,
            metadata.beta,
        );

        if next != self.config {
            tracing::trace!(hash = next.hash(), "brgemm executor config changed");
            self.config = next;
            self.kernel = None;
            self.state = ExecutorState::Configured;
        } else if self.state == ExecutorState::Unconfigured {
            self.state = ExecutorState::Configured;
        }
        Ok(())
    }

    /// [`update_config`](Self::update_config) followed by
    /// [`get_or_compile`](Self::get_or_compile).
    pub fn update_by_metadata(
        &mut self,
        source: &dyn MetadataSource,
    ) -> BrgemmResult<Arc<CompiledKernel>> {
        self.update_config(source)?;
        self.get_or_compile()
    }

    pub fn get_or_compile(&mut self) -> BrgemmResult<Arc<CompiledKernel>> {
        if let Some(kernel) = &self.kernel {
            return Ok(Arc::clone(kernel));
        }

        let compiled = if self.config.is_empty() {
            CompiledKernel::shared_empty()
        } else {
            let compiler = Arc::clone(&self.compiler);
            let config = &self.config;
            match self.cache.upgrade() {
                Some(cache) => {
                    let key = KernelKey::new(compiler.name(), config, compiler.shape_policy());
                    cache.lookup_or_insert(key, || compiler.compile_kernel(config))?
                }
                None => {
                    tracing::warn!(
                        strategy = compiler.name(),
                        "brgemm kernel cache is gone; compiling without caching"
                    );
                    Arc::new(compiler.compile_kernel(config)?)
                }
            }
        };

        self.kernel = Some(Arc::clone(&compiled));
        self.state = ExecutorState::Compiled;
        Ok(compiled)
    }

    /// Runs the compiled kernel on `args`.
    ///
    /// Panics if no kernel has been compiled for the current configuration.
    pub fn execute(&mut self, args: &mut BrgemmCallArgs<'_>) -> BrgemmResult<()> {
        let Some(kernel) = self.kernel.clone() else {
            brgemm_fatal!(
                "no compiled kernel for the current config (state {:?}):\n{}",
                self.state,
                self.config
            );
        };
        if kernel.is_empty() {
            self.state = ExecutorState::Executed;
            return Ok(());
        }

        let dims = *self.config.dynamic();
        let apply_compensation = dims.beta == 0.0 && self.config.is_with_comp();
        // Post-ops run on every call, including intermediate K blocks of a
        // blocked accumulation loop.
        let apply_post_ops = true;

        validate_call(&self.config, args, apply_compensation, apply_post_ops)?;
        kernel.invoke(KernelCall {
            args,
            dims,
            apply_compensation,
            apply_post_ops,
        })?;
        self.state = ExecutorState::Executed;
        Ok(())
    }
}

impl fmt::Display for BrgemmKernelExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "strategy = {}", self.compiler.name())?;
        writeln!(f, "state = {:?}", self.state)?;
        write!(f, "{}", self.config)
    }
}
