pub mod cache;
pub mod call;
pub mod codegen;
pub mod config;
pub mod dtype;
pub mod env;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod isa;
pub mod kernel;
pub mod metadata;
pub mod post_ops;
pub mod table;

pub use cache::{CacheStats, KernelCache, KernelCacheConfig, KernelKey};
pub use call::{bytes_of, bytes_of_mut, BrgemmCallArgs, Element, KernelCall};
pub use codegen::{s8s8_compensation, PortableCodegen, PortableKernel};
pub use config::{DynamicParams, KernelConfig, StaticParams};
pub use dtype::DType;
pub use error::{BrgemmError, BrgemmResult};
pub use executor::{BrgemmKernelExecutor, ExecutorState};
pub use isa::IsaTier;
pub use kernel::{
    BrgemmDesc, BrgemmKernel, CodeGenerator, CompiledKernel, JitCompiler, KernelCompiler,
    ShapePolicy,
};
pub use metadata::{BrgemmExpression, BrgemmMetadata, MetadataSource, PortDescriptor};
pub use post_ops::{BinaryBroadcast, BinaryOp, EltwiseKind, PostOp, PostOpChain};
pub use table::{ExecutorId, KernelExecutorTable};
