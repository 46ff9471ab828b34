use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::env;
use crate::error::BrgemmError;

static HOST_ISA: OnceLock<IsaTier> = OnceLock::new();

/// Hardware feature tiers, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsaTier {
    Scalar,
    Avx2,
    Avx2Vnni,
    Avx512Core,
    Avx512CoreVnni,
    Avx512CoreBf16,
    Avx512CoreFp16,
    Avx512CoreAmx,
}

impl IsaTier {
    pub const ALL: [IsaTier; 8] = [
        IsaTier::Scalar,
        IsaTier::Avx2,
        IsaTier::Avx2Vnni,
        IsaTier::Avx512Core,
        IsaTier::Avx512CoreVnni,
        IsaTier::Avx512CoreBf16,
        IsaTier::Avx512CoreFp16,
        IsaTier::Avx512CoreAmx,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IsaTier::Scalar => "scalar",
            IsaTier::Avx2 => "avx2",
            IsaTier::Avx2Vnni => "avx2_vnni",
            IsaTier::Avx512Core => "avx512_core",
            IsaTier::Avx512CoreVnni => "avx512_core_vnni",
            IsaTier::Avx512CoreBf16 => "avx512_core_bf16",
            IsaTier::Avx512CoreFp16 => "avx512_core_fp16",
            IsaTier::Avx512CoreAmx => "avx512_core_amx",
        }
    }

    /// Best tier the running CPU supports.
    pub fn detect() -> IsaTier {
        detect_host()
    }

    /// Host tier, honouring the `BRGEMM_ISA` override.
    pub fn host() -> IsaTier {
        *HOST_ISA.get_or_init(|| {
            if let Some(value) = env::var(env::ISA_VAR) {
                match value.parse::<IsaTier>() {
                    Ok(tier) => {
                        tracing::debug!(isa = tier.name(), "using ISA override");
                        return tier;
                    }
                    Err(err) => tracing::warn!(%err, "ignoring ISA override"),
                }
            }
            detect_host()
        })
    }

    /// Whether kernels for `a x b` operands can be generated at this tier.
    pub fn supports(self, a: DType, b: DType) -> bool {
        match (a, b) {
            (DType::F32, DType::F32) => true,
            (DType::Bf16, DType::Bf16) => self >= IsaTier::Avx512CoreBf16,
            (DType::F16, DType::F16) => self >= IsaTier::Avx512CoreFp16,
            (DType::U8 | DType::I8, DType::I8) => self >= IsaTier::Avx2Vnni,
            _ => false,
        }
    }
}

impl fmt::Display for IsaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IsaTier {
    type Err = BrgemmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        IsaTier::ALL
            .into_iter()
            .find(|tier| tier.name() == normalized)
            .ok_or_else(|| BrgemmError::unsupported(format!("unknown ISA tier '{normalized}'")))
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_host() -> IsaTier {
    let ext = ExtendedFeatures::query();
    let avx512_core = is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512bw")
        && is_x86_feature_detected!("avx512vl")
        && is_x86_feature_detected!("avx512dq");
    if avx512_core {
        if ext.amx_tile {
            return IsaTier::Avx512CoreAmx;
        }
        if ext.avx512_fp16 {
            return IsaTier::Avx512CoreFp16;
        }
        if ext.avx512_bf16 {
            return IsaTier::Avx512CoreBf16;
        }
        if ext.avx512_vnni {
            return IsaTier::Avx512CoreVnni;
        }
        return IsaTier::Avx512Core;
    }
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        if ext.avx_vnni {
            return IsaTier::Avx2Vnni;
        }
        return IsaTier::Avx2;
    }
    IsaTier::Scalar
}

/// CPUID leaf 7 bits not covered by the std detection macro on older toolchains.
#[cfg(target_arch = "x86_64")]
#[derive(Default)]
struct ExtendedFeatures {
    avx512_vnni: bool,
    avx512_bf16: bool,
    avx512_fp16: bool,
    amx_tile: bool,
    avx_vnni: bool,
}

#[cfg(target_arch = "x86_64")]
impl ExtendedFeatures {
    #[allow(unused_unsafe)]
    fn query() -> Self {
        use std::arch::x86_64::__cpuid_count;

        // SAFETY: cpuid is available on every x86_64 processor.
        let max_leaf = unsafe { __cpuid_count(0, 0) }.eax;
        if max_leaf < 7 {
            return Self::default();
        }
        let leaf7 = unsafe { __cpuid_count(7, 0) };
        let leaf7_1 = if leaf7.eax >= 1 {
            unsafe { __cpuid_count(7, 1) }.eax
        } else {
            0
        };
        Self {
            avx512_vnni: leaf7.ecx & (1 << 11) != 0,
            avx512_bf16: leaf7_1 & (1 << 5) != 0,
            avx512_fp16: leaf7.edx & (1 << 23) != 0,
            amx_tile: leaf7.edx & (1 << 24) != 0,
            avx_vnni: leaf7_1 & (1 << 4) != 0,
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_host() -> IsaTier {
    IsaTier::Scalar
}
