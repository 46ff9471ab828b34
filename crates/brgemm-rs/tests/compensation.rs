use std::sync::{Arc, Mutex};

use brgemm_rs::{
    bytes_of, bytes_of_mut, s8s8_compensation, BrgemmCallArgs, BrgemmDesc, BrgemmKernel,
    BrgemmKernelExecutor, BrgemmResult, CodeGenerator, DType, IsaTier, KernelCache, KernelCall,
    KernelConfig, PortableCodegen, PostOpChain, ShapePolicy,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Flags = Arc<Mutex<Vec<(bool, bool)>>>;

/// Kernel that records the flags it was invoked with and writes nothing.
struct RecordingKernel {
    flags: Flags,
}

impl BrgemmKernel for RecordingKernel {
    fn name(&self) -> &str {
        "recording"
    }

    fn invoke(&self, call: KernelCall<'_, '_>) -> BrgemmResult<()> {
        self.flags
            .lock()
            .expect("flags poisoned")
            .push((call.apply_compensation, call.apply_post_ops));
        Ok(())
    }
}

struct RecordingCodegen {
    flags: Flags,
}

impl CodeGenerator for RecordingCodegen {
    fn name(&self) -> &str {
        "recording"
    }

    fn shape_policy(&self) -> ShapePolicy {
        ShapePolicy::Baked
    }

    fn generate(&self, _desc: &BrgemmDesc) -> BrgemmResult<Arc<dyn BrgemmKernel>> {
        Ok(Arc::new(RecordingKernel {
            flags: Arc::clone(&self.flags),
        }))
    }
}

fn int8_config(isa: IsaTier, beta: f32) -> KernelConfig {
    KernelConfig::for_isa(DType::I8, DType::I8, DType::I32, isa, PostOpChain::new())
        .with_dims(2, 2, 2, 2, 2, 2, beta)
}

fn recorded_flags(config: KernelConfig) -> anyhow::Result<(bool, bool)> {
    let flags: Flags = Arc::default();
    let cache = Arc::new(KernelCache::new(16));
    let codegen = Arc::new(RecordingCodegen {
        flags: Arc::clone(&flags),
    });
    let mut executor = BrgemmKernelExecutor::jit(&cache, config, codegen);
    executor.get_or_compile()?;

    let (a, b) = ([1i8; 4], [1i8; 4]);
    let mut c = [0i32; 4];
    let mut scratch = [0i32; 2];
    let mut args = BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c))
        .with_scratch(bytes_of_mut(&mut scratch));
    executor.execute(&mut args)?;

    let recorded = flags.lock().expect("flags poisoned");
    assert_eq!(recorded.len(), 1);
    Ok(recorded[0])
}

#[test]
fn compensation_requested_on_first_accumulation() -> anyhow::Result<()> {
    let (apply_compensation, apply_post_ops) =
        recorded_flags(int8_config(IsaTier::Avx512CoreVnni, 0.0))?;
    assert!(apply_compensation);
    assert!(apply_post_ops);
    Ok(())
}

#[test]
fn compensation_skipped_when_accumulating() -> anyhow::Result<()> {
    let (apply_compensation, apply_post_ops) =
        recorded_flags(int8_config(IsaTier::Avx512CoreVnni, 1.0))?;
    assert!(!apply_compensation);
    assert!(apply_post_ops);
    Ok(())
}

#[test]
fn compensation_never_requested_without_the_flag() -> anyhow::Result<()> {
    let (apply_compensation, _) = recorded_flags(int8_config(IsaTier::Avx512CoreAmx, 0.0))?;
    assert!(!apply_compensation);
    let f32_config = KernelConfig::f32(IsaTier::Avx2).with_dims(1, 1, 1, 1, 1, 1, 0.0);
    let flags: Flags = Arc::default();
    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        f32_config,
        Arc::new(RecordingCodegen {
            flags: Arc::clone(&flags),
        }),
    );
    executor.get_or_compile()?;
    let (a, b, mut c) = ([1.0f32], [1.0f32], [0.0f32]);
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;
    assert_eq!(flags.lock().expect("flags poisoned")[0], (false, true));
    Ok(())
}

fn signed_product(a: &[i8], b: &[i8], m: usize, n: usize, k: usize) -> Vec<i32> {
    let mut out = vec![0i32; m * n];
    for row in 0..m {
        for col in 0..n {
            out[row * n + col] = (0..k)
                .map(|kk| i32::from(a[row * k + kk]) * i32::from(b[kk * n + col]))
                .sum();
        }
    }
    out
}

fn random_i8(rng: &mut StdRng, len: usize) -> Vec<i8> {
    (0..len).map(|_| rng.gen::<i8>()).collect()
}

#[test]
fn portable_s8s8_with_compensation_is_exact() -> anyhow::Result<()> {
    let (m, n, k) = (3, 5, 8);
    let mut rng = StdRng::seed_from_u64(7);
    let a = random_i8(&mut rng, m * k);
    let b = random_i8(&mut rng, k * n);

    let cache = Arc::new(KernelCache::new(4));
    let config = KernelConfig::for_isa(
        DType::I8,
        DType::I8,
        DType::I32,
        IsaTier::Avx512CoreVnni,
        PostOpChain::new(),
    )
    .with_dims(m, n, k, k, n, n, 0.0);
    assert!(config.is_with_comp());
    let mut executor = BrgemmKernelExecutor::jit(&cache, config, Arc::new(PortableCodegen::new()));
    executor.get_or_compile()?;

    let mut compensation = s8s8_compensation(&b, k, n, n);
    let mut c = vec![0i32; m * n];
    let mut args = BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c))
        .with_scratch(bytes_of_mut(&mut compensation));
    executor.execute(&mut args)?;

    assert_eq!(c, signed_product(&a, &b, m, n, k));
    Ok(())
}

#[test]
fn blocked_k_loop_applies_compensation_once() -> anyhow::Result<()> {
    let (m, n, k) = (2, 4, 8);
    let half = k / 2;
    let mut rng = StdRng::seed_from_u64(11);
    let a = random_i8(&mut rng, m * k);
    let b = random_i8(&mut rng, k * n);
    let mut compensation = s8s8_compensation(&b, k, n, n);
    let mut c = vec![0i32; m * n];

    let cache = Arc::new(KernelCache::new(4));
    let config = KernelConfig::for_isa(
        DType::I8,
        DType::I8,
        DType::I32,
        IsaTier::Avx2Vnni,
        PostOpChain::new(),
    )
    .with_dims(m, n, half, k, n, n, 0.0);
    let mut executor = BrgemmKernelExecutor::jit(&cache, config, Arc::new(PortableCodegen::new()));

    for block in 0..2 {
        let beta = if block == 0 { 0.0 } else { 1.0 };
        let mut metadata = brgemm_rs::BrgemmMetadata::shape(m, n, half, k, n, n, beta);
        metadata.precisions = Some((DType::I8, DType::I8, DType::I32));
        executor.update_by_metadata(&metadata)?;

        let a_block = &a[block * half..];
        let b_block = &b[block * half * n..];
        let mut args =
            BrgemmCallArgs::new(bytes_of(a_block), bytes_of(b_block), bytes_of_mut(&mut c))
                .with_scratch(bytes_of_mut(&mut compensation));
        executor.execute(&mut args)?;
    }

    assert_eq!(c, signed_product(&a, &b, m, n, k));
    Ok(())
}

#[test]
fn u8s8_needs_no_compensation() -> anyhow::Result<()> {
    let (m, n, k) = (2, 3, 4);
    let mut rng = StdRng::seed_from_u64(3);
    let a: Vec<u8> = (0..m * k).map(|_| rng.gen::<u8>()).collect();
    let b = random_i8(&mut rng, k * n);

    let config = KernelConfig::for_isa(
        DType::U8,
        DType::I8,
        DType::I32,
        IsaTier::Avx2Vnni,
        PostOpChain::new(),
    )
    .with_dims(m, n, k, k, n, n, 0.0);
    assert!(!config.is_with_comp());
    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(&cache, config, Arc::new(PortableCodegen::new()));
    executor.get_or_compile()?;

    let mut c = vec![0i32; m * n];
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    for row in 0..m {
        for col in 0..n {
            let expected: i32 = (0..k)
                .map(|kk| i32::from(a[row * k + kk]) * i32::from(b[kk * n + col]))
                .sum();
            assert_eq!(c[row * n + col], expected);
        }
    }
    Ok(())
}
