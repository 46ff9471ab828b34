//! Kernel configuration identity.
//!
//! A [`KernelConfig`] is split into a shared [`StaticParams`] part, which
//! decides which compiled artifact a call needs, and [`DynamicParams`], which
//! describe the problem size and memory layout of one call.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;

use crate::dtype::DType;
use crate::hashing::{hash_combine, hash_value, FingerprintHasher};
use crate::isa::IsaTier;
use crate::post_ops::PostOpChain;

/// Compile-time-only parameters of a brgemm kernel.
#[derive(Debug, Clone, Serialize)]
pub struct StaticParams {
    dt_in0: DType,
    dt_in1: DType,
    dt_out: DType,
    isa: IsaTier,
    post_ops: PostOpChain,
    is_with_comp: bool,
    #[serde(skip)]
    hash: u64,
}

impl StaticParams {
    pub fn new(
        dt_in0: DType,
        dt_in1: DType,
        dt_out: DType,
        isa: IsaTier,
        post_ops: PostOpChain,
        is_with_comp: bool,
    ) -> Self {
        let hash = Self::compute_hash(dt_in0, dt_in1, dt_out, isa, &post_ops, is_with_comp);
        Self {
            dt_in0,
            dt_in1,
            dt_out,
            isa,
            post_ops,
            is_with_comp,
            hash,
        }
    }

    /// Whether `dt_in0 x dt_in1` at `isa` needs a compensation pass.
    ///
    /// VNNI instructions multiply u8 by s8 only, so a signed A operand is
    /// shifted into the unsigned range and corrected per output column.
    pub fn compensation_required(dt_in0: DType, dt_in1: DType, isa: IsaTier) -> bool {
        dt_in0 == DType::I8 && dt_in1 == DType::I8 && isa < IsaTier::Avx512CoreAmx
    }

    fn compute_hash(
        dt_in0: DType,
        dt_in1: DType,
        dt_out: DType,
        isa: IsaTier,
        post_ops: &PostOpChain,
        is_with_comp: bool,
    ) -> u64 {
        let mut seed = 0u64;
        seed = hash_combine(seed, hash_value(&dt_in0));
        seed = hash_combine(seed, hash_value(&dt_in1));
        seed = hash_combine(seed, hash_value(&dt_out));
        seed = hash_combine(seed, hash_value(&isa));
        seed = hash_combine(seed, hash_value(post_ops));
        hash_combine(seed, hash_value(&is_with_comp))
    }

    pub fn dt_in0(&self) -> DType {
        self.dt_in0
    }

    pub fn dt_in1(&self) -> DType {
        self.dt_in1
    }

    pub fn dt_out(&self) -> DType {
        self.dt_out
    }

    pub fn isa(&self) -> IsaTier {
        self.isa
    }

    pub fn post_ops(&self) -> &PostOpChain {
        &self.post_ops
    }

    pub fn is_with_comp(&self) -> bool {
        self.is_with_comp
    }

    /// Hash computed once at construction.
    pub fn precomputed_hash(&self) -> u64 {
        self.hash
    }

    #[cfg(test)]
    pub(crate) fn with_forced_hash(mut self, hash: u64) -> Self {
        self.hash = hash;
        self
    }
}

impl PartialEq for StaticParams {
    fn eq(&self, rhs: &Self) -> bool {
        self.dt_in0 == rhs.dt_in0
            && self.dt_in1 == rhs.dt_in1
            && self.dt_out == rhs.dt_out
            && self.isa == rhs.isa
            && self.is_with_comp == rhs.is_with_comp
            && self.post_ops == rhs.post_ops
    }
}

impl Eq for StaticParams {}

impl Hash for StaticParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for StaticParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dt_in0 = {}", self.dt_in0)?;
        writeln!(f, "dt_in1 = {}", self.dt_in1)?;
        writeln!(f, "dt_out = {}", self.dt_out)?;
        writeln!(f, "isa = {}", self.isa)?;
        writeln!(f, "post_ops = {}", self.post_ops)?;
        writeln!(f, "is_with_comp = {}", self.is_with_comp)
    }
}

/// Per-call problem size and layout. Leading dimensions are in elements.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DynamicParams {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub beta: f32,
}

impl DynamicParams {
    pub fn new(
        m: usize,
        n: usize,
        k: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        beta: f32,
    ) -> Self {
        let mut params = Self {
            m,
            n,
            k,
            lda,
            ldb,
            ldc,
            beta,
        };
        if params.is_empty() {
            // Not executed (e.g. a loop with zero work amount): one identity
            // for every empty problem.
            params = Self::default();
        }
        params
    }

    pub fn is_empty(&self) -> bool {
        self.m == 0 || self.n == 0 || self.k == 0
    }

    pub fn compute_hash(&self) -> u64 {
        let mut hasher = FingerprintHasher::new();
        hasher.write(&self.m);
        hasher.write(&self.n);
        hasher.write(&self.k);
        hasher.write(&self.lda);
        hasher.write(&self.ldb);
        hasher.write(&self.ldc);
        hasher.write_f32(self.beta);
        hasher.finish()
    }
}

impl PartialEq for DynamicParams {
    fn eq(&self, rhs: &Self) -> bool {
        self.m == rhs.m
            && self.n == rhs.n
            && self.k == rhs.k
            && self.lda == rhs.lda
            && self.ldb == rhs.ldb
            && self.ldc == rhs.ldc
            && self.beta.to_bits() == rhs.beta.to_bits()
    }
}

impl Eq for DynamicParams {}

impl Hash for DynamicParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.compute_hash());
    }
}

/// Full brgemm kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    static_params: Arc<StaticParams>,
    dynamic: DynamicParams,
    hash: u64,
}

#[derive(Serialize)]
struct KernelConfigDump<'a> {
    #[serde(flatten)]
    static_params: &'a StaticParams,
    #[serde(flatten)]
    dynamic: &'a DynamicParams,
    hash: u64,
}

impl KernelConfig {
    /// Creates an empty (not yet executable) configuration.
    pub fn new(
        dt_in0: DType,
        dt_in1: DType,
        dt_out: DType,
        isa: IsaTier,
        post_ops: PostOpChain,
        is_with_comp: bool,
    ) -> Self {
        let static_params = Arc::new(StaticParams::new(
            dt_in0,
            dt_in1,
            dt_out,
            isa,
            post_ops,
            is_with_comp,
        ));
        Self::from_static(static_params)
    }

    /// Like [`KernelConfig::new`], deriving the compensation flag from the
    /// operand types and ISA tier.
    pub fn for_isa(
        dt_in0: DType,
        dt_in1: DType,
        dt_out: DType,
        isa: IsaTier,
        post_ops: PostOpChain,
    ) -> Self {
        let is_with_comp = StaticParams::compensation_required(dt_in0, dt_in1, isa);
        Self::new(dt_in0, dt_in1, dt_out, isa, post_ops, is_with_comp)
    }

    pub fn f32(isa: IsaTier) -> Self {
        Self::new(DType::F32, DType::F32, DType::F32, isa, PostOpChain::new(), false)
    }

    pub fn from_static(static_params: Arc<StaticParams>) -> Self {
        let mut config = Self {
            static_params,
            dynamic: DynamicParams::default(),
            hash: 0,
        };
        config.hash = config.compute_hash();
        config
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_dims(
        mut self,
        m: usize,
        n: usize,
        k: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        beta: f32,
    ) -> Self {
        self.update(m, n, k, lda, ldb, ldc, beta);
        self
    }

    /// Rewrites the dynamic part in place.
    ///
    /// If any of M/N/K is zero the configuration becomes empty and every
    /// dynamic field is reset to zero.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        m: usize,
        n: usize,
        k: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        beta: f32,
    ) {
        self.dynamic = DynamicParams::new(m, n, k, lda, ldb, ldc, beta);
        self.hash = self.compute_hash();
    }

    /// Replaces the static part, keeping the dynamic one.
    ///
    /// The shared allocation is reused when the new parameters are equal.
    pub fn set_static_params(&mut self, static_params: StaticParams) {
        if *self.static_params != static_params {
            self.static_params = Arc::new(static_params);
            self.hash = self.compute_hash();
        }
    }

    pub fn compute_hash(&self) -> u64 {
        hash_combine(self.static_params.precomputed_hash(), self.dynamic.compute_hash())
    }

    pub fn is_empty(&self) -> bool {
        self.dynamic.is_empty()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn static_params(&self) -> &Arc<StaticParams> {
        &self.static_params
    }

    pub fn static_hash(&self) -> u64 {
        self.static_params.precomputed_hash()
    }

    pub fn dynamic(&self) -> &DynamicParams {
        &self.dynamic
    }

    pub fn dt_in0(&self) -> DType {
        self.static_params.dt_in0()
    }

    pub fn dt_in1(&self) -> DType {
        self.static_params.dt_in1()
    }

    pub fn dt_out(&self) -> DType {
        self.static_params.dt_out()
    }

    pub fn isa(&self) -> IsaTier {
        self.static_params.isa()
    }

    pub fn post_ops(&self) -> &PostOpChain {
        self.static_params.post_ops()
    }

    pub fn is_with_comp(&self) -> bool {
        self.static_params.is_with_comp()
    }

    pub fn m(&self) -> usize {
        self.dynamic.m
    }

    pub fn n(&self) -> usize {
        self.dynamic.n
    }

    pub fn k(&self) -> usize {
        self.dynamic.k
    }

    pub fn lda(&self) -> usize {
        self.dynamic.lda
    }

    pub fn ldb(&self) -> usize {
        self.dynamic.ldb
    }

    pub fn ldc(&self) -> usize {
        self.dynamic.ldc
    }

    pub fn beta(&self) -> f32 {
        self.dynamic.beta
    }

    pub fn to_json(&self) -> String {
        let dump = KernelConfigDump {
            static_params: &self.static_params,
            dynamic: &self.dynamic,
            hash: self.hash,
        };
        serde_json::to_string_pretty(&dump)
            .unwrap_or_else(|err| format!("{{\"error\": \"{err}\"}}"))
    }
}

impl PartialEq for KernelConfig {
    fn eq(&self, rhs: &Self) -> bool {
        (Arc::ptr_eq(&self.static_params, &rhs.static_params)
            || *self.static_params == *rhs.static_params)
            && self.dynamic == rhs.dynamic
    }
}

impl Eq for KernelConfig {}

impl Hash for KernelConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.static_params)?;
        writeln!(f, "M = {}", self.dynamic.m)?;
        writeln!(f, "N = {}", self.dynamic.n)?;
        writeln!(f, "K = {}", self.dynamic.k)?;
        writeln!(f, "LDA = {}", self.dynamic.lda)?;
        writeln!(f, "LDB = {}", self.dynamic.ldb)?;
        writeln!(f, "LDC = {}", self.dynamic.ldc)?;
        writeln!(f, "beta = {}", self.dynamic.beta)
    }
}
