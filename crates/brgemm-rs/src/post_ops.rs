//! Fused output-stage operations.
//!
//! A [`PostOpChain`] is applied element by element, in order, after the
//! multiply-accumulate of a brgemm kernel has produced an output value.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EltwiseKind {
    /// `alpha` is the negative slope.
    Relu,
    Tanh,
    Sigmoid,
    /// Tanh approximation.
    Gelu,
    /// `x * sigmoid(alpha * x)`.
    Swish,
    /// Clamp into `[alpha, beta]`.
    Clip,
    /// `alpha * x + beta`.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Mul,
    Max,
    Min,
}

/// How a binary post-op argument is indexed for output element `(m, n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryBroadcast {
    PerTensor,
    PerRow,
    PerColumn,
    /// Same layout as the output, row stride LDC.
    Full,
}

impl BinaryBroadcast {
    pub fn index(self, m: usize, n: usize, ldc: usize) -> usize {
        match self {
            BinaryBroadcast::PerTensor => 0,
            BinaryBroadcast::PerRow => m,
            BinaryBroadcast::PerColumn => n,
            BinaryBroadcast::Full => m * ldc + n,
        }
    }

    /// Number of elements an argument must hold for an `m x n` output.
    pub fn required_len(self, m: usize, n: usize, ldc: usize) -> usize {
        if m == 0 || n == 0 {
            return 0;
        }
        self.index(m - 1, n - 1, ldc) + 1
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostOp {
    Eltwise {
        kind: EltwiseKind,
        alpha: f32,
        beta: f32,
    },
    Binary {
        op: BinaryOp,
        broadcast: BinaryBroadcast,
    },
    Sum {
        scale: f32,
    },
}

impl PostOp {
    pub fn eltwise(kind: EltwiseKind) -> Self {
        PostOp::Eltwise {
            kind,
            alpha: 0.0,
            beta: 0.0,
        }
    }

    pub fn relu() -> Self {
        PostOp::eltwise(EltwiseKind::Relu)
    }

    pub fn binary(op: BinaryOp, broadcast: BinaryBroadcast) -> Self {
        PostOp::Binary { op, broadcast }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, PostOp::Binary { .. })
    }
}

// Float parameters participate by bit pattern so that equality stays
// reflexive and consistent with `Hash`.
impl PartialEq for PostOp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PostOp::Eltwise { kind, alpha, beta },
                PostOp::Eltwise {
                    kind: rhs_kind,
                    alpha: rhs_alpha,
                    beta: rhs_beta,
                },
            ) => {
                kind == rhs_kind
                    && alpha.to_bits() == rhs_alpha.to_bits()
                    && beta.to_bits() == rhs_beta.to_bits()
            }
            (
                PostOp::Binary { op, broadcast },
                PostOp::Binary {
                    op: rhs_op,
                    broadcast: rhs_broadcast,
                },
            ) => op == rhs_op && broadcast == rhs_broadcast,
            (PostOp::Sum { scale }, PostOp::Sum { scale: rhs_scale }) => {
                scale.to_bits() == rhs_scale.to_bits()
            }
            _ => false,
        }
    }
}

impl Eq for PostOp {}

impl Hash for PostOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            PostOp::Eltwise { kind, alpha, beta } => {
                kind.hash(state);
                alpha.to_bits().hash(state);
                beta.to_bits().hash(state);
            }
            PostOp::Binary { op, broadcast } => {
                op.hash(state);
                broadcast.hash(state);
            }
            PostOp::Sum { scale } => scale.to_bits().hash(state),
        }
    }
}

impl fmt::Display for PostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostOp::Eltwise { kind, alpha, beta } => {
                write!(f, "eltwise({kind:?}, alpha={alpha}, beta={beta})")
            }
            PostOp::Binary { op, broadcast } => write!(f, "binary({op:?}, {broadcast:?})"),
            PostOp::Sum { scale } => write!(f, "sum(scale={scale})"),
        }
    }
}

/// Ordered post-op sequence; order affects the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostOpChain {
    ops: Vec<PostOp>,
}

impl PostOpChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: PostOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn push(&mut self, op: PostOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[PostOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn binary_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_binary()).count()
    }

    /// Applies the chain to one output element.
    ///
    /// `previous` is the output value before this call wrote it (used by
    /// `Sum`); `binary_args[i]` feeds the i-th binary post-op.
    pub fn apply(
        &self,
        value: f32,
        previous: f32,
        (m, n, ldc): (usize, usize, usize),
        binary_args: &[&[f32]],
    ) -> f32 {
        let mut acc = value;
        let mut binary_idx = 0usize;
        for op in &self.ops {
            acc = match *op {
                PostOp::Eltwise { kind, alpha, beta } => apply_eltwise(kind, alpha, beta, acc),
                PostOp::Binary { op, broadcast } => {
                    let rhs = binary_args[binary_idx][broadcast.index(m, n, ldc)];
                    binary_idx += 1;
                    apply_binary(op, acc, rhs)
                }
                PostOp::Sum { scale } => acc + scale * previous,
            };
        }
        acc
    }
}

impl FromIterator<PostOp> for PostOpChain {
    fn from_iter<T: IntoIterator<Item = PostOp>>(iter: T) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for PostOpChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ops.is_empty() {
            return f.write_str("[]");
        }
        let rendered = self
            .ops
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{rendered}]")
    }
}

pub fn apply_eltwise(kind: EltwiseKind, alpha: f32, beta: f32, x: f32) -> f32 {
    match kind {
        EltwiseKind::Relu => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        EltwiseKind::Tanh => x.tanh(),
        EltwiseKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        EltwiseKind::Gelu => {
            const SQRT_2_OVER_PI: f32 = 0.797_884_6;
            0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
        }
        EltwiseKind::Swish => x / (1.0 + (-alpha * x).exp()),
        EltwiseKind::Clip => x.max(alpha).min(beta),
        EltwiseKind::Linear => alpha * x + beta,
    }
}

pub fn apply_binary(op: BinaryOp, lhs: f32, rhs: f32) -> f32 {
    match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Max => lhs.max(rhs),
        BinaryOp::Min => lhs.min(rhs),
    }
}
