use std::sync::Arc;

use brgemm_rs::{
    BrgemmError, BrgemmExpression, BrgemmKernelExecutor, DType, ExecutorState, IsaTier,
    KernelCache, KernelConfig, KernelExecutorTable, MetadataSource, PortDescriptor,
    PortableCodegen, PostOp, PostOpChain,
};

fn expression(m: usize, n: usize, k: usize) -> BrgemmExpression {
    BrgemmExpression::new(
        PortDescriptor::dense(m, k),
        PortDescriptor::dense(k, n),
        PortDescriptor::dense(m, n),
    )
}

#[test]
fn expression_metadata_follows_ports() -> anyhow::Result<()> {
    let expr = BrgemmExpression::new(
        PortDescriptor::new(4, 16, 32),
        PortDescriptor::new(16, 8, 64),
        PortDescriptor::new(4, 8, 8),
    );
    let metadata = expr.brgemm_metadata()?;
    assert_eq!((metadata.m, metadata.n, metadata.k), (4, 8, 16));
    assert_eq!((metadata.lda, metadata.ldb, metadata.ldc), (32, 64, 8));
    assert_eq!(metadata.beta, 0.0);
    assert!(metadata.precisions.is_none());
    Ok(())
}

#[test]
fn later_k_blocks_accumulate() -> anyhow::Result<()> {
    assert_eq!(expression(2, 2, 2).with_k_block(0).brgemm_metadata()?.beta, 0.0);
    assert_eq!(expression(2, 2, 2).with_k_block(3).brgemm_metadata()?.beta, 1.0);
    Ok(())
}

#[test]
fn mismatched_ports_are_invalid_metadata() {
    let bad_k = BrgemmExpression::new(
        PortDescriptor::dense(2, 3),
        PortDescriptor::dense(4, 2),
        PortDescriptor::dense(2, 2),
    );
    let bad_out = BrgemmExpression::new(
        PortDescriptor::dense(2, 3),
        PortDescriptor::dense(3, 2),
        PortDescriptor::dense(2, 5),
    );
    let bad_ld = BrgemmExpression::new(
        PortDescriptor::new(2, 3, 2),
        PortDescriptor::dense(3, 2),
        PortDescriptor::dense(2, 2),
    );
    for expr in [bad_k, bad_out, bad_ld] {
        let err = expr.brgemm_metadata().unwrap_err();
        assert!(matches!(err, BrgemmError::InvalidMetadata { .. }), "{err}");
    }
}

#[test]
fn invalid_metadata_leaves_config_untouched() {
    let cache = Arc::new(KernelCache::new(4));
    let initial = KernelConfig::f32(IsaTier::Avx2).with_dims(2, 2, 2, 2, 2, 2, 0.0);
    let mut executor =
        BrgemmKernelExecutor::jit(&cache, initial.clone(), Arc::new(PortableCodegen::new()));
    let bad = BrgemmExpression::new(
        PortDescriptor::dense(2, 3),
        PortDescriptor::dense(4, 2),
        PortDescriptor::dense(2, 2),
    );
    assert!(executor.update_config(&bad).is_err());
    assert_eq!(executor.config(), &initial);
}

#[test]
fn expression_post_ops_flow_into_static_identity() -> anyhow::Result<()> {
    let cache = Arc::new(KernelCache::new(4));
    let mut executor = BrgemmKernelExecutor::jit(
        &cache,
        KernelConfig::f32(IsaTier::Avx2),
        Arc::new(PortableCodegen::new()),
    );
    assert_eq!(executor.state(), ExecutorState::Unconfigured);

    let chain = PostOpChain::new().with(PostOp::relu());
    executor.update_config(&expression(2, 2, 2).with_post_ops(chain.clone()))?;
    assert_eq!(executor.state(), ExecutorState::Configured);
    assert_eq!(executor.config().post_ops(), &chain);
    assert_eq!(executor.config().dt_in0(), DType::F32);
    Ok(())
}

#[test]
fn table_refreshes_every_executor() -> anyhow::Result<()> {
    let cache = Arc::new(KernelCache::new(16));
    let codegen = Arc::new(PortableCodegen::new());
    let mut table = KernelExecutorTable::new();

    let ids: Vec<_> = [(2, 2, 2), (4, 4, 8), (0, 4, 4)]
        .into_iter()
        .map(|(m, n, k)| {
            let config = KernelConfig::f32(IsaTier::Avx2);
            let executor = BrgemmKernelExecutor::jit(&cache, config, codegen.clone());
            table.register(Box::new(expression(m, n, k)), executor)
        })
        .collect();
    assert_eq!(table.len(), 3);

    table.update_state()?;
    for id in &ids[..2] {
        let executor = table.get(*id).expect("registered");
        assert_eq!(executor.state(), ExecutorState::Compiled);
        assert!(!executor.kernel().expect("compiled").is_empty());
    }
    let empty = table.get(ids[2]).expect("registered");
    assert!(empty.config().is_empty());
    assert!(empty.kernel().expect("compiled").is_empty());
    // Portable kernels are shape independent: one artifact serves both shapes.
    assert_eq!(cache.len(), 1);

    let first = Arc::clone(table.get(ids[0]).and_then(|e| e.kernel()).expect("compiled"));
    table.update_state()?;
    let again = table.get(ids[0]).and_then(|e| e.kernel()).expect("compiled");
    assert!(Arc::ptr_eq(&first, again));
    Ok(())
}

#[test]
fn table_reports_metadata_errors() {
    let cache = Arc::new(KernelCache::new(4));
    let mut table = KernelExecutorTable::new();
    let executor = BrgemmKernelExecutor::jit(
        &cache,
        KernelConfig::f32(IsaTier::Avx2),
        Arc::new(PortableCodegen::new()),
    );
    let id = table.register(Box::new(expression(2, 2, 2)), executor);
    table
        .set_source(
            id,
            Box::new(BrgemmExpression::new(
                PortDescriptor::dense(2, 3),
                PortDescriptor::dense(2, 2),
                PortDescriptor::dense(2, 2),
            )),
        )
        .expect("registered");
    assert!(table.update_state().is_err());
    assert_eq!(table.ids().count(), 1);
}
