use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static BRGEMM_REFERENCE: OnceLock<bool> = OnceLock::new();

pub const ISA_VAR: &str = "BRGEMM_ISA";
pub const CACHE_CAPACITY_VAR: &str = "BRGEMM_KERNEL_CACHE_CAPACITY";
pub const REFERENCE_EXECUTOR_VAR: &str = "BRGEMM_REFERENCE_EXECUTOR";
pub const C_CACHE_DIR_VAR: &str = "BRGEMM_C_CACHE_DIR";

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Trimmed, non-empty value of `key`.
pub fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses the value of `key`, warning and yielding `None` when it is not a
/// number.
pub fn parse_usize(key: &str, value: &str) -> Option<usize> {
    match value.trim().parse::<usize>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring non-numeric environment override");
            None
        }
    }
}

pub fn reference_executor_enabled() -> bool {
    *BRGEMM_REFERENCE.get_or_init(|| match var(REFERENCE_EXECUTOR_VAR) {
        Some(value) => parse_bool(&value),
        None => false,
    })
}

pub fn c_cache_dir() -> PathBuf {
    match var(C_CACHE_DIR_VAR) {
        Some(value) => PathBuf::from(value),
        None => env::temp_dir().join("brgemm_c_backend"),
    }
}

pub fn c_compiler() -> String {
    var("CC").unwrap_or_else(|| "cc".to_string())
}
