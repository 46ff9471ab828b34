use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, Weak};

use brgemm_rs::hashing::{fnv1a_bytes, fnv1a_hash};
use brgemm_rs::{
    env, BrgemmDesc, BrgemmError, BrgemmKernel, BrgemmResult, CodeGenerator, DType, KernelCall,
    ShapePolicy,
};
use libloading::Library;

mod codegen;

pub use codegen::{kernel_source, CEntrypoint, MAX_BINARY_POST_OPS};

const FINGERPRINT_SYMBOL: &str = "brgemm_c_kernel";

/// Code generator that compiles specialized C through the system compiler.
///
/// Shared libraries are cached on disk by source fingerprint. A loaded library
/// is shared while any artifact still uses it and unloaded after the last one
/// is dropped.
pub struct CCodegen {
    cache_dir: PathBuf,
    compiler: String,
    loaded: Mutex<HashMap<u64, Weak<CKernel>>>,
    compile_gates: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl CCodegen {
    /// Uses `BRGEMM_C_CACHE_DIR` and `CC` when set.
    pub fn new() -> Self {
        Self::with_cache_dir(env::c_cache_dir())
    }

    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            compiler: env::c_compiler(),
            loaded: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Whether the configured C compiler can be launched.
    pub fn is_available(&self) -> bool {
        Command::new(&self.compiler)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    pub fn fingerprint(&self, desc: &BrgemmDesc) -> BrgemmResult<u64> {
        let source = kernel_source(desc, FINGERPRINT_SYMBOL)?;
        Ok(fnv1a_bytes(fnv1a_hash(source.as_bytes()), self.compiler.as_bytes()))
    }

    /// Number of loaded libraries still referenced by an artifact.
    pub fn live_kernels(&self) -> usize {
        self.loaded
            .lock()
            .expect("brgemm C kernel cache poisoned")
            .values()
            .filter(|kernel| kernel.strong_count() > 0)
            .count()
    }

    /// Number of fingerprints with a compile in flight.
    pub fn pending_compiles(&self) -> usize {
        self.compile_gates
            .lock()
            .expect("brgemm C compile gate cache poisoned")
            .len()
    }

    fn compile_and_load(&self, desc: &BrgemmDesc) -> BrgemmResult<Arc<CKernel>> {
        let fingerprint = self.fingerprint(desc)?;
        if let Some(found) = self.cached(fingerprint) {
            return Ok(found);
        }

        let gate = {
            let mut guard = self
                .compile_gates
                .lock()
                .expect("brgemm C compile gate cache poisoned");
            guard
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let result = {
            let _gate_lock = gate.lock().expect("brgemm C compile gate poisoned");
            match self.cached(fingerprint) {
                Some(found) => Ok(found),
                None => self.load_uncached(desc, fingerprint),
            }
        };

        let mut gates = self
            .compile_gates
            .lock()
            .expect("brgemm C compile gate cache poisoned");
        if gates
            .get(&fingerprint)
            .is_some_and(|current| Arc::ptr_eq(current, &gate))
        {
            gates.remove(&fingerprint);
        }
        result
    }

    fn load_uncached(&self, desc: &BrgemmDesc, fingerprint: u64) -> BrgemmResult<Arc<CKernel>> {
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|err| BrgemmError::compilation(err.to_string()))?;
        let symbol = format!("brgemm_c_{fingerprint:016x}");
        let src_path = self.cache_dir.join(format!("{symbol}.c"));
        let lib_path = self
            .cache_dir
            .join(format!("lib{symbol}{}", lib_ext()));

        if !lib_path.exists() {
            let source = kernel_source(desc, &symbol)?;
            std::fs::write(&src_path, source)
                .map_err(|err| BrgemmError::compilation(err.to_string()))?;
            compile_c(&self.compiler, &src_path, &lib_path)?;
        } else {
            tracing::debug!(path = %lib_path.display(), "reusing compiled brgemm C kernel");
        }

        let lib = unsafe { Library::new(&lib_path) }
            .map_err(|err| BrgemmError::compilation(err.to_string()))?;
        let entry = unsafe { lib.get::<CEntrypoint>(symbol.as_bytes()).map(|sym| *sym) }
            .map_err(|err| BrgemmError::compilation(err.to_string()))?;

        let kernel = Arc::new(CKernel {
            name: symbol,
            entry,
            dt_in0: desc.dt_in0,
            dt_in1: desc.dt_in1,
            dt_out: desc.dt_out,
            _lib: lib,
        });
        let mut loaded = self.loaded.lock().expect("brgemm C kernel cache poisoned");
        loaded.retain(|_, kernel| kernel.strong_count() > 0);
        loaded.insert(fingerprint, Arc::downgrade(&kernel));
        Ok(kernel)
    }

    fn cached(&self, fingerprint: u64) -> Option<Arc<CKernel>> {
        let mut loaded = self.loaded.lock().expect("brgemm C kernel cache poisoned");
        let found = loaded.get(&fingerprint).and_then(Weak::upgrade);
        if found.is_none() {
            loaded.remove(&fingerprint);
        }
        found
    }
}

impl Default for CCodegen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator for CCodegen {
    fn name(&self) -> &str {
        "c"
    }

    fn shape_policy(&self) -> ShapePolicy {
        ShapePolicy::Baked
    }

    fn generate(&self, desc: &BrgemmDesc) -> BrgemmResult<Arc<dyn BrgemmKernel>> {
        let kernel: Arc<dyn BrgemmKernel> = self.compile_and_load(desc)?;
        Ok(kernel)
    }
}

/// Kernel loaded from a compiled shared library.
pub struct CKernel {
    name: String,
    entry: CEntrypoint,
    dt_in0: DType,
    dt_in1: DType,
    dt_out: DType,
    _lib: Library,
}

fn check_aligned(name: &str, ptr: *const u8, dtype: DType) -> BrgemmResult<()> {
    if (ptr as usize) % dtype.size_in_bytes() != 0 {
        return Err(BrgemmError::invalid_arguments(format!(
            "{name} is not aligned for {dtype}"
        )));
    }
    Ok(())
}

impl BrgemmKernel for CKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, call: KernelCall<'_, '_>) -> BrgemmResult<()> {
        let args = call.args;
        check_aligned("A", args.a.as_ptr(), self.dt_in0)?;
        check_aligned("B", args.b.as_ptr(), self.dt_in1)?;
        check_aligned("C", args.c.as_ptr(), self.dt_out)?;

        let comp = if call.apply_compensation {
            check_aligned("scratch", args.scratch.as_ptr(), DType::I32)?;
            args.scratch.as_ptr() as *const i32
        } else {
            std::ptr::null()
        };
        if args.post_ops_binary_args.len() > MAX_BINARY_POST_OPS {
            return Err(BrgemmError::invalid_arguments(format!(
                "at most {MAX_BINARY_POST_OPS} binary post-op arguments are supported"
            )));
        }
        let mut binary = [std::ptr::null::<f32>(); MAX_BINARY_POST_OPS];
        for (slot, arg) in binary.iter_mut().zip(args.post_ops_binary_args) {
            *slot = arg.as_ptr();
        }

        // SAFETY: buffer extents were validated against the baked dimensions
        // before the call and alignment is checked above.
        unsafe {
            (self.entry)(
                args.a.as_ptr(),
                args.b.as_ptr(),
                args.c.as_mut_ptr(),
                comp,
                binary.as_ptr(),
                i32::from(call.apply_compensation),
                i32::from(call.apply_post_ops),
            );
        }
        Ok(())
    }
}

fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

fn compile_c(compiler: &str, src: &Path, out: &Path) -> BrgemmResult<()> {
    let mut cmd = Command::new(compiler);
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared").arg("-fPIC");
    }
    cmd.arg("-O3");
    if !cfg!(target_os = "windows") {
        cmd.arg("-fno-math-errno");
    }
    cmd.arg("-o").arg(out).arg(src);
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }

    tracing::info!(compiler, src = %src.display(), "compiling brgemm C kernel");
    let output = cmd
        .output()
        .map_err(|err| BrgemmError::compilation(format!("failed to run {compiler}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BrgemmError::compilation(format!(
            "C compiler failed: {stderr}"
        )));
    }
    Ok(())
}
