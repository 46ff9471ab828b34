use std::fmt::Write as _;

use brgemm_rs::{
    BinaryBroadcast, BinaryOp, BrgemmDesc, BrgemmError, BrgemmResult, DType, EltwiseKind, PostOp,
};

/// Upper bound on binary post-ops per kernel; arguments travel in a fixed array.
pub const MAX_BINARY_POST_OPS: usize = 8;

/// Signature of every generated entry point.
pub type CEntrypoint = unsafe extern "C" fn(
    a: *const u8,
    b: *const u8,
    c: *mut u8,
    comp: *const i32,
    binary: *const *const f32,
    apply_comp: i32,
    apply_post_ops: i32,
);

pub(crate) fn format_f32(value: f32) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-INFINITY".to_string()
        } else {
            "INFINITY".to_string()
        }
    } else {
        let base = value.to_string();
        let needs_decimal = !base.contains('.') && !base.contains('e') && !base.contains('E');
        let suffix = if needs_decimal { ".0f" } else { "f" };
        format!("({base}{suffix})")
    }
}

fn c_type(dtype: DType) -> BrgemmResult<&'static str> {
    match dtype {
        DType::F32 => Ok("float"),
        DType::I32 => Ok("int32_t"),
        DType::I8 => Ok("int8_t"),
        DType::U8 => Ok("uint8_t"),
        DType::Bf16 | DType::F16 => Err(BrgemmError::unsupported(format!(
            "C kernels do not support {dtype}"
        ))),
    }
}

enum Family {
    Float,
    Int,
}

fn family(desc: &BrgemmDesc) -> BrgemmResult<Family> {
    match (desc.dt_in0, desc.dt_in1, desc.dt_out) {
        (DType::F32, DType::F32, DType::F32) => Ok(Family::Float),
        (DType::U8 | DType::I8, DType::I8, DType::I32 | DType::F32) => Ok(Family::Int),
        (a, b, out) => Err(BrgemmError::unsupported(format!(
            "C kernels do not support {a} x {b} -> {out}"
        ))),
    }
}

fn broadcast_index(broadcast: BinaryBroadcast) -> &'static str {
    match broadcast {
        BinaryBroadcast::PerTensor => "0",
        BinaryBroadcast::PerRow => "m",
        BinaryBroadcast::PerColumn => "n",
        BinaryBroadcast::Full => "m * BRGEMM_LDC + n",
    }
}

fn emit_post_ops(desc: &BrgemmDesc, out: &mut String, indent: &str) {
    let mut binary_idx = 0usize;
    for op in desc.post_ops.ops() {
        let stmt = match *op {
            PostOp::Eltwise { kind, alpha, beta } => {
                let (alpha, beta) = (format_f32(alpha), format_f32(beta));
                match kind {
                    EltwiseKind::Relu => format!("v = v > 0.0f ? v : {alpha} * v;"),
                    EltwiseKind::Tanh => "v = tanhf(v);".to_string(),
                    EltwiseKind::Sigmoid => "v = 1.0f / (1.0f + expf(-v));".to_string(),
                    EltwiseKind::Gelu => {
                        "v = 0.5f * v * (1.0f + tanhf(0.7978846f * (v + 0.044715f * v * v * v)));"
                            .to_string()
                    }
                    EltwiseKind::Swish => format!("v = v / (1.0f + expf(-{alpha} * v));"),
                    EltwiseKind::Clip => format!("v = fminf(fmaxf(v, {alpha}), {beta});"),
                    EltwiseKind::Linear => format!("v = {alpha} * v + {beta};"),
                }
            }
            PostOp::Binary { op, broadcast } => {
                let rhs = format!("binary[{binary_idx}][{}]", broadcast_index(broadcast));
                binary_idx += 1;
                match op {
                    BinaryOp::Add => format!("v = v + {rhs};"),
                    BinaryOp::Mul => format!("v = v * {rhs};"),
                    BinaryOp::Max => format!("v = fmaxf(v, {rhs});"),
                    BinaryOp::Min => format!("v = fminf(v, {rhs});"),
                }
            }
            PostOp::Sum { scale } => format!("v = v + {} * prev;", format_f32(scale)),
        };
        let _ = writeln!(out, "{indent}{stmt}");
    }
}

/// C source of a kernel with every shape parameter compiled in.
pub fn kernel_source(desc: &BrgemmDesc, symbol: &str) -> BrgemmResult<String> {
    let family = family(desc)?;
    if desc.post_ops.binary_count() > MAX_BINARY_POST_OPS {
        return Err(BrgemmError::unsupported(format!(
            "C kernels accept at most {MAX_BINARY_POST_OPS} binary post-ops"
        )));
    }
    if desc.is_with_comp && desc.dt_in0 != DType::I8 {
        return Err(BrgemmError::unsupported(format!(
            "compensation requested for {} x {}",
            desc.dt_in0, desc.dt_in1
        )));
    }
    let (a_ty, b_ty, c_ty) = (c_type(desc.dt_in0)?, c_type(desc.dt_in1)?, c_type(desc.dt_out)?);

    let mut out = String::new();
    out.push_str("#include <math.h>\n#include <stddef.h>\n#include <stdint.h>\n\n");
    let _ = writeln!(out, "#define BRGEMM_M {}", desc.m);
    let _ = writeln!(out, "#define BRGEMM_N {}", desc.n);
    let _ = writeln!(out, "#define BRGEMM_K {}", desc.k);
    let _ = writeln!(out, "#define BRGEMM_LDA {}", desc.lda);
    let _ = writeln!(out, "#define BRGEMM_LDB {}", desc.ldb);
    let _ = writeln!(out, "#define BRGEMM_LDC {}", desc.ldc);
    let _ = writeln!(out, "#define BRGEMM_BETA {}", format_f32(desc.beta));
    out.push('\n');
    let _ = writeln!(
        out,
        "void {symbol}(const void* a_raw, const void* b_raw, void* c_raw, const int32_t* comp, \
         const float* const* binary, int32_t apply_comp, int32_t apply_post_ops) {{"
    );
    let _ = writeln!(out, "    const {a_ty}* a = (const {a_ty}*)a_raw;");
    let _ = writeln!(out, "    const {b_ty}* b = (const {b_ty}*)b_raw;");
    let _ = writeln!(out, "    {c_ty}* c = ({c_ty}*)c_raw;");
    for param in ["comp", "binary", "apply_comp", "apply_post_ops"] {
        let _ = writeln!(out, "    (void){param};");
    }
    out.push_str("    for (size_t m = 0; m < BRGEMM_M; ++m) {\n");
    out.push_str("        for (size_t n = 0; n < BRGEMM_N; ++n) {\n");
    out.push_str("            const size_t idx = m * BRGEMM_LDC + n;\n");

    let with_beta = desc.beta != 0.0;
    match family {
        Family::Float => {
            out.push_str("            float acc = 0.0f;\n");
            out.push_str("            for (size_t k = 0; k < BRGEMM_K; ++k) {\n");
            out.push_str("                acc += a[m * BRGEMM_LDA + k] * b[k * BRGEMM_LDB + n];\n");
            out.push_str("            }\n");
        }
        Family::Int => {
            let shift = if desc.is_with_comp { " + 128" } else { "" };
            // Unsigned accumulation wraps like the portable kernel instead of
            // overflowing a signed int.
            out.push_str("            uint32_t acc = 0u;\n");
            out.push_str("            for (size_t k = 0; k < BRGEMM_K; ++k) {\n");
            let _ = writeln!(
                out,
                "                acc += (uint32_t)(((int32_t)a[m * BRGEMM_LDA + k]{shift}) \
                 * (int32_t)b[k * BRGEMM_LDB + n]);"
            );
            out.push_str("            }\n");
            if desc.is_with_comp {
                out.push_str("            if (apply_comp) {\n");
                out.push_str("                acc += (uint32_t)comp[n];\n");
                out.push_str("            }\n");
            }
        }
    }

    let acc = match family {
        Family::Float => "acc",
        Family::Int => "(int32_t)acc",
    };
    let exact_int = matches!(family, Family::Int) && desc.dt_out == DType::I32;
    if exact_int && desc.post_ops.is_empty() {
        if !with_beta {
            out.push_str("            c[idx] = (int32_t)acc;\n");
        } else if desc.beta == 1.0 {
            out.push_str("            c[idx] = (int32_t)(acc + (uint32_t)c[idx]);\n");
        } else {
            out.push_str(
                "            c[idx] = (int32_t)(acc \
                 + (uint32_t)(int32_t)roundf(BRGEMM_BETA * (float)c[idx]));\n",
            );
        }
    } else {
        out.push_str("            const float prev = (float)c[idx];\n");
        out.push_str("            (void)prev;\n");
        if with_beta {
            let _ = writeln!(out, "            float v = (float){acc} + BRGEMM_BETA * prev;");
        } else {
            let _ = writeln!(out, "            float v = (float){acc};");
        }
        if !desc.post_ops.is_empty() {
            out.push_str("            if (apply_post_ops) {\n");
            emit_post_ops(desc, &mut out, "                ");
            out.push_str("            }\n");
        }
        if desc.dt_out == DType::I32 {
            out.push_str("            c[idx] = (int32_t)roundf(v);\n");
        } else {
            out.push_str("            c[idx] = v;\n");
        }
    }
    out.push_str("        }\n    }\n}\n");
    Ok(out)
}
