use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Deserialize;

use crate::config::{DynamicParams, KernelConfig, StaticParams};
use crate::env;
use crate::error::BrgemmResult;
use crate::kernel::{CompiledKernel, ShapePolicy};

pub const DEFAULT_CACHE_CAPACITY: usize = 5000;

/// Identity of one cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    strategy: Arc<str>,
    static_params: Arc<StaticParams>,
    dynamic: Option<DynamicParams>,
}

impl KernelKey {
    pub fn new(strategy: &str, config: &KernelConfig, policy: ShapePolicy) -> Self {
        let dynamic = match policy {
            ShapePolicy::Runtime => None,
            ShapePolicy::Baked => Some(*config.dynamic()),
        };
        Self {
            strategy: Arc::from(strategy),
            static_params: Arc::clone(config.static_params()),
            dynamic,
        }
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn static_params(&self) -> &StaticParams {
        &self.static_params
    }

    pub fn dynamic(&self) -> Option<&DynamicParams> {
        self.dynamic.as_ref()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelCacheConfig {
    pub capacity: usize,
}

impl Default for KernelCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl KernelCacheConfig {
    /// Defaults overridden by `BRGEMM_KERNEL_CACHE_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(env::var)
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let capacity = lookup(env::CACHE_CAPACITY_VAR)
            .and_then(|value| env::parse_usize(env::CACHE_CAPACITY_VAR, &value));
        if let Some(capacity) = capacity {
            config.capacity = capacity;
        }
        config
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
}

type Slot = Arc<Mutex<Option<Arc<CompiledKernel>>>>;

/// Bounded, thread-safe store of compiled kernels.
///
/// Each key owns a slot; the first caller to find a slot empty compiles while
/// holding only that slot's lock, so concurrent misses on one key compile once
/// and different keys compile in parallel. A failed compile leaves no entry.
pub struct KernelCache {
    entries: Option<Mutex<LruCache<KernelKey, Slot>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
}

impl KernelCache {
    /// A zero capacity stores nothing: every lookup compiles.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    pub fn with_config(config: &KernelCacheConfig) -> Self {
        Self::new(config.capacity)
    }

    pub fn from_env() -> Self {
        Self::with_config(&KernelCacheConfig::from_env())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lookup_or_insert<F>(
        &self,
        key: KernelKey,
        factory: F,
    ) -> BrgemmResult<Arc<CompiledKernel>>
    where
        F: FnOnce() -> BrgemmResult<CompiledKernel>,
    {
        let Some(entries) = &self.entries else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let compiled = Arc::new(factory()?);
            self.compiles.fetch_add(1, Ordering::Relaxed);
            return Ok(compiled);
        };

        let slot = {
            let mut guard = entries.lock().expect("brgemm kernel cache poisoned");
            let existing = guard.get(&key).map(Arc::clone);
            match existing {
                Some(slot) => slot,
                None => {
                    let slot: Slot = Arc::new(Mutex::new(None));
                    if let Some((evicted, _)) = guard.push(key.clone(), Arc::clone(&slot)) {
                        tracing::debug!(
                            strategy = evicted.strategy(),
                            hash = evicted.static_params().precomputed_hash(),
                            "evicted brgemm kernel"
                        );
                    }
                    slot
                }
            }
        };

        let mut state = slot.lock().expect("brgemm kernel slot poisoned");
        if let Some(found) = state.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(strategy = key.strategy(), "brgemm kernel cache hit");
            return Ok(Arc::clone(found));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            strategy = key.strategy(),
            hash = key.static_params().precomputed_hash(),
            "brgemm kernel cache miss"
        );

        match factory() {
            Ok(compiled) => {
                self.compiles.fetch_add(1, Ordering::Relaxed);
                let compiled = Arc::new(compiled);
                *state = Some(Arc::clone(&compiled));
                Ok(compiled)
            }
            Err(err) => {
                drop(state);
                let mut guard = entries.lock().expect("brgemm kernel cache poisoned");
                if guard.peek(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    guard.pop(&key);
                }
                Err(err)
            }
        }
    }

    /// Cached artifact for `key`, if one has been compiled.
    pub fn get(&self, key: &KernelKey) -> Option<Arc<CompiledKernel>> {
        let entries = self.entries.as_ref()?;
        let slot = entries
            .lock()
            .expect("brgemm kernel cache poisoned")
            .peek(key)
            .cloned()?;
        let found = slot.lock().expect("brgemm kernel slot poisoned").clone();
        found
    }

    pub fn contains(&self, key: &KernelKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|entries| entries.lock().expect("brgemm kernel cache poisoned").len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().expect("brgemm kernel cache poisoned").clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
        }
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
