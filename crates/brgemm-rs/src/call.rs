use half::{bf16, f16};

use crate::config::{DynamicParams, KernelConfig};
use crate::dtype::DType;
use crate::error::{BrgemmError, BrgemmResult};

mod sealed {
    pub trait Sealed {}
}

/// Plain element types a brgemm operand buffer may hold.
pub trait Element: sealed::Sealed + bytemuck::Pod {
    const DTYPE: DType;

    fn load(bytes: &[u8], index: usize) -> Self;
    fn store(self, bytes: &mut [u8], index: usize);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $size:expr) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn load(bytes: &[u8], index: usize) -> Self {
                let start = index * $size;
                let mut raw = [0u8; $size];
                raw.copy_from_slice(&bytes[start..start + $size]);
                bytemuck::cast(raw)
            }

            #[inline]
            fn store(self, bytes: &mut [u8], index: usize) {
                let start = index * $size;
                let raw: [u8; $size] = bytemuck::cast(self);
                bytes[start..start + $size].copy_from_slice(&raw);
            }
        }
    };
}

impl_element!(f32, DType::F32, 4);
impl_element!(i32, DType::I32, 4);
impl_element!(bf16, DType::Bf16, 2);
impl_element!(f16, DType::F16, 2);
impl_element!(i8, DType::I8, 1);
impl_element!(u8, DType::U8, 1);

pub fn bytes_of<T: Element>(values: &[T]) -> &[u8] {
    bytemuck::cast_slice(values)
}

pub fn bytes_of_mut<T: Element>(values: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(values)
}

/// Reads element `index` of a `dtype` buffer widened to f32.
pub fn load_f32(dtype: DType, bytes: &[u8], index: usize) -> f32 {
    match dtype {
        DType::F32 => f32::load(bytes, index),
        DType::Bf16 => bf16::load(bytes, index).to_f32(),
        DType::F16 => f16::load(bytes, index).to_f32(),
        DType::I32 => i32::load(bytes, index) as f32,
        DType::I8 => f32::from(i8::load(bytes, index)),
        DType::U8 => f32::from(u8::load(bytes, index)),
    }
}

/// Writes `value` into element `index` of a `dtype` buffer, narrowing as needed.
pub fn store_f32(dtype: DType, bytes: &mut [u8], index: usize, value: f32) {
    match dtype {
        DType::F32 => value.store(bytes, index),
        DType::Bf16 => bf16::from_f32(value).store(bytes, index),
        DType::F16 => f16::from_f32(value).store(bytes, index),
        DType::I32 => (value.round() as i32).store(bytes, index),
        DType::I8 => (value.round() as i8).store(bytes, index),
        DType::U8 => (value.round() as u8).store(bytes, index),
    }
}

/// Reads element `index` of an integer buffer widened to i32.
pub fn load_i32(dtype: DType, bytes: &[u8], index: usize) -> i32 {
    match dtype {
        DType::I32 => i32::load(bytes, index),
        DType::I8 => i32::from(i8::load(bytes, index)),
        DType::U8 => i32::from(u8::load(bytes, index)),
        DType::F32 | DType::Bf16 | DType::F16 => load_f32(dtype, bytes, index) as i32,
    }
}

/// Per-call buffers handed to a compiled kernel.
///
/// Operands are raw bytes interpreted with the config's dtypes; rows are
/// `LDA`/`LDB`/`LDC` elements apart. `scratch` carries the s8s8 compensation
/// vector (one i32 per output column) when the config needs it.
pub struct BrgemmCallArgs<'a> {
    pub a: &'a [u8],
    pub b: &'a [u8],
    pub c: &'a mut [u8],
    pub scratch: &'a mut [u8],
    pub post_ops_binary_args: &'a [&'a [f32]],
}

impl<'a> BrgemmCallArgs<'a> {
    pub fn new(a: &'a [u8], b: &'a [u8], c: &'a mut [u8]) -> Self {
        Self {
            a,
            b,
            c,
            scratch: Default::default(),
            post_ops_binary_args: &[],
        }
    }

    pub fn with_scratch(mut self, scratch: &'a mut [u8]) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn with_binary_args(mut self, args: &'a [&'a [f32]]) -> Self {
        self.post_ops_binary_args = args;
        self
    }
}

/// One invocation of a compiled kernel.
pub struct KernelCall<'c, 'a> {
    pub args: &'c mut BrgemmCallArgs<'a>,
    pub dims: DynamicParams,
    pub apply_compensation: bool,
    pub apply_post_ops: bool,
}

fn required_bytes(rows: usize, cols: usize, ld: usize, dtype: DType) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    ((rows - 1) * ld + cols) * dtype.size_in_bytes()
}

fn check_len(name: &str, actual: usize, required: usize) -> BrgemmResult<()> {
    if actual < required {
        return Err(BrgemmError::invalid_arguments(format!(
            "{name} holds {actual} bytes, kernel needs {required}"
        )));
    }
    Ok(())
}

/// Checks every buffer the kernel will touch against the config's extents.
pub fn validate_call(
    config: &KernelConfig,
    args: &BrgemmCallArgs<'_>,
    apply_compensation: bool,
    apply_post_ops: bool,
) -> BrgemmResult<()> {
    let dims = config.dynamic();
    if dims.lda < dims.k || dims.ldb < dims.n || dims.ldc < dims.n {
        return Err(BrgemmError::invalid_arguments(format!(
            "leading dimensions (LDA={}, LDB={}, LDC={}) smaller than rows (K={}, N={})",
            dims.lda, dims.ldb, dims.ldc, dims.k, dims.n
        )));
    }
    check_len("A", args.a.len(), required_bytes(dims.m, dims.k, dims.lda, config.dt_in0()))?;
    check_len("B", args.b.len(), required_bytes(dims.k, dims.n, dims.ldb, config.dt_in1()))?;
    check_len("C", args.c.len(), required_bytes(dims.m, dims.n, dims.ldc, config.dt_out()))?;
    if apply_compensation {
        check_len("scratch", args.scratch.len(), dims.n * DType::I32.size_in_bytes())?;
    }
    if apply_post_ops {
        let binary_ops = config.post_ops().ops().iter().filter_map(|op| match op {
            crate::post_ops::PostOp::Binary { broadcast, .. } => Some(*broadcast),
            _ => None,
        });
        for (idx, broadcast) in binary_ops.enumerate() {
            let arg = args.post_ops_binary_args.get(idx).ok_or_else(|| {
                BrgemmError::invalid_arguments(format!(
                    "missing argument for binary post-op #{idx}"
                ))
            })?;
            let required = broadcast.required_len(dims.m, dims.n, dims.ldc);
            if arg.len() < required {
                return Err(BrgemmError::invalid_arguments(format!(
                    "binary post-op #{idx} argument holds {} values, needs {required}",
                    arg.len()
                )));
            }
        }
    }
    Ok(())
}
