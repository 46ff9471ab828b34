use std::sync::Arc;

use brgemm_rs::{
    bytes_of, bytes_of_mut, BinaryBroadcast, BinaryOp, BrgemmCallArgs, BrgemmKernelExecutor,
    DType, EltwiseKind, IsaTier, KernelCache, KernelConfig, PortableCodegen, PostOp, PostOpChain,
};
use half::bf16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Problem {
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
}

impl Problem {
    fn a_len(&self) -> usize {
        (self.m - 1) * self.lda + self.k
    }

    fn b_len(&self) -> usize {
        (self.k - 1) * self.ldb + self.n
    }

    fn c_len(&self) -> usize {
        self.m * self.ldc
    }

    fn reference(&self, a: &[f32], b: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.c_len()];
        for row in 0..self.m {
            for col in 0..self.n {
                out[row * self.ldc + col] = (0..self.k)
                    .map(|kk| a[row * self.lda + kk] * b[kk * self.ldb + col])
                    .sum();
            }
        }
        out
    }

    fn config(&self, post_ops: PostOpChain, beta: f32) -> KernelConfig {
        KernelConfig::new(
            DType::F32,
            DType::F32,
            DType::F32,
            IsaTier::Avx2,
            post_ops,
            false,
        )
        .with_dims(self.m, self.n, self.k, self.lda, self.ldb, self.ldc, beta)
    }
}

fn random_f32(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (idx, (lhs, rhs)) in actual.iter().zip(expected).enumerate() {
        assert!((lhs - rhs).abs() <= tol, "mismatch at {idx}: {lhs} vs {rhs}");
    }
}

#[test]
fn strided_f32_matches_naive_loops() -> anyhow::Result<()> {
    let problem = Problem {
        m: 5,
        n: 7,
        k: 9,
        lda: 12,
        ldb: 8,
        ldc: 10,
    };
    let mut rng = StdRng::seed_from_u64(42);
    let a = random_f32(&mut rng, problem.a_len());
    let b = random_f32(&mut rng, problem.b_len());
    let mut c = vec![0.0f32; problem.c_len()];

    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        problem.config(PostOpChain::new(), 0.0),
        Arc::new(PortableCodegen::new()),
    );
    executor.get_or_compile()?;
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    assert_close(&c, &problem.reference(&a, &b), 1e-5);
    Ok(())
}

#[test]
fn padding_columns_are_left_untouched() -> anyhow::Result<()> {
    let problem = Problem {
        m: 2,
        n: 2,
        k: 2,
        lda: 2,
        ldb: 2,
        ldc: 3,
    };
    let (a, b) = ([1.0f32, 0.0, 0.0, 1.0], [1.0f32, 2.0, 3.0, 4.0]);
    let mut c = [-1.0f32; 6];

    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        problem.config(PostOpChain::new(), 0.0),
        Arc::new(PortableCodegen::new()),
    );
    executor.get_or_compile()?;
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    assert_eq!(c, [1.0, 2.0, -1.0, 3.0, 4.0, -1.0]);
    Ok(())
}

#[test]
fn nonzero_beta_accumulates_into_output() -> anyhow::Result<()> {
    let problem = Problem {
        m: 1,
        n: 2,
        k: 1,
        lda: 1,
        ldb: 2,
        ldc: 2,
    };
    let (a, b) = ([2.0f32], [1.0f32, 3.0]);
    let mut c = [10.0f32, 20.0];

    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        problem.config(PostOpChain::new(), 0.5),
        Arc::new(PortableCodegen::new()),
    );
    executor.get_or_compile()?;
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    assert_eq!(c, [2.0 + 5.0, 6.0 + 10.0]);
    Ok(())
}

#[test]
fn bias_then_relu_post_ops_apply_in_order() -> anyhow::Result<()> {
    let problem = Problem {
        m: 2,
        n: 2,
        k: 1,
        lda: 1,
        ldb: 2,
        ldc: 2,
    };
    let post_ops = PostOpChain::new()
        .with(PostOp::binary(BinaryOp::Add, BinaryBroadcast::PerColumn))
        .with(PostOp::relu());
    let (a, b) = ([1.0f32, -1.0], [1.0f32, 2.0]);
    let bias: &[f32] = &[0.5, -3.0];
    let binary = [bias];
    let mut c = [0.0f32; 4];

    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        problem.config(post_ops, 0.0),
        Arc::new(PortableCodegen::new()),
    );
    executor.get_or_compile()?;
    let mut args = BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c))
        .with_binary_args(&binary);
    executor.execute(&mut args)?;

    // Row 0: [1 + 0.5, 2 - 3]; row 1: [-1 + 0.5, -2 - 3]; then relu.
    assert_eq!(c, [1.5, 0.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn sum_and_linear_post_ops_see_previous_output() -> anyhow::Result<()> {
    let problem = Problem {
        m: 1,
        n: 1,
        k: 1,
        lda: 1,
        ldb: 1,
        ldc: 1,
    };
    let post_ops = PostOpChain::new()
        .with(PostOp::Sum { scale: 2.0 })
        .with(PostOp::Eltwise {
            kind: EltwiseKind::Linear,
            alpha: 3.0,
            beta: 1.0,
        });
    let (a, b) = ([2.0f32], [3.0f32]);
    let mut c = [4.0f32];

    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        problem.config(post_ops, 0.0),
        Arc::new(PortableCodegen::new()),
    );
    executor.get_or_compile()?;
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    // (6 + 2 * 4) * 3 + 1
    assert_eq!(c, [43.0]);
    Ok(())
}

#[test]
fn bf16_inputs_accumulate_in_f32() -> anyhow::Result<()> {
    let (m, n, k) = (2, 3, 4);
    let mut rng = StdRng::seed_from_u64(5);
    let a_f32 = random_f32(&mut rng, m * k);
    let b_f32 = random_f32(&mut rng, k * n);
    let a: Vec<bf16> = a_f32.iter().copied().map(bf16::from_f32).collect();
    let b: Vec<bf16> = b_f32.iter().copied().map(bf16::from_f32).collect();
    let a_rounded: Vec<f32> = a.iter().map(|v| v.to_f32()).collect();
    let b_rounded: Vec<f32> = b.iter().map(|v| v.to_f32()).collect();

    let config = KernelConfig::new(
        DType::Bf16,
        DType::Bf16,
        DType::F32,
        IsaTier::Avx512CoreBf16,
        PostOpChain::new(),
        false,
    )
    .with_dims(m, n, k, k, n, n, 0.0);
    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(&cache, config, Arc::new(PortableCodegen::new()));
    executor.get_or_compile()?;

    let mut c = vec![0.0f32; m * n];
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    let expected = Problem {
        m,
        n,
        k,
        lda: k,
        ldb: n,
        ldc: n,
    }
    .reference(&a_rounded, &b_rounded);
    assert_close(&c, &expected, 1e-5);
    Ok(())
}

#[test]
fn integer_accumulation_wraps_on_long_k() -> anyhow::Result<()> {
    let k = 70_000;
    let a = vec![255u8; k];
    let b = vec![127i8; k];
    let config = KernelConfig::for_isa(
        DType::U8,
        DType::I8,
        DType::I32,
        IsaTier::Avx2Vnni,
        PostOpChain::new(),
    )
    .with_dims(1, 1, k, k, 1, 1, 0.0);
    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(&cache, config, Arc::new(PortableCodegen::new()));
    executor.get_or_compile()?;

    let mut c = [0i32];
    executor.execute(&mut BrgemmCallArgs::new(bytes_of(&a), bytes_of(&b), bytes_of_mut(&mut c)))?;

    assert_eq!(c, [(255i64 * 127 * k as i64) as i32]);
    Ok(())
}
