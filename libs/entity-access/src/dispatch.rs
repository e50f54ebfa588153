//! Write-once cache of compiled per-type delegates.

use std::any::TypeId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Cache key: an operation name, the concrete type(s) it is specialized for
/// and an optional member name (for named functions).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    operation: &'static str,
    types: [Option<TypeId>; 2],
    name: Option<Arc<str>>,
}

impl DispatchKey {
    #[must_use]
    pub fn new(operation: &'static str, ty: TypeId) -> Self {
        Self {
            operation,
            types: [Some(ty), None],
            name: None,
        }
    }

    #[must_use]
    pub fn pair(operation: &'static str, first: TypeId, second: TypeId) -> Self {
        Self {
            operation,
            types: [Some(first), Some(second)],
            name: None,
        }
    }

    #[must_use]
    pub fn named(operation: &'static str, ty: TypeId, name: &str) -> Self {
        Self {
            operation,
            types: [Some(ty), None],
            name: Some(Arc::from(name)),
        }
    }

    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

/// Lazily compiles and caches one value per [`DispatchKey`].
///
/// The compile step for a key runs at most once: insertion goes through the
/// map's entry API, which holds the shard lock while compiling. A compile
/// closure must therefore never touch the same cache.
#[derive(Debug)]
pub struct DispatchCache<V> {
    entries: DashMap<DispatchKey, V>,
    compiled: AtomicU64,
}

impl<V> Default for DispatchCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            compiled: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> DispatchCache<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key`, compiling it on first use.
    pub fn get_or_compile<F>(&self, key: &DispatchKey, compile: F) -> V
    where
        F: FnOnce(&DispatchKey) -> V,
    {
        if let Some(hit) = self.entries.get(key) {
            return hit.value().clone();
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| {
                self.compiled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation = key.operation, "compiled dispatch entry");
                compile(key)
            })
            .value()
            .clone()
    }

    /// Number of compile steps executed so far.
    #[must_use]
    pub fn compiled_count(&self) -> u64 {
        self.compiled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_compiles_once_per_key() {
        let cache = DispatchCache::<usize>::new();
        let calls = AtomicUsize::new(0);
        let key = DispatchKey::new("select", TypeId::of::<u8>());

        for _ in 0..10 {
            let v = cache.get_or_compile(&key, |_| calls.fetch_add(1, Ordering::SeqCst) + 42);
            assert_eq!(v, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.compiled_count(), 1);
    }

    #[test]
    fn test_distinct_keys_compile_separately() {
        let cache = DispatchCache::<&'static str>::new();
        let a = DispatchKey::new("select", TypeId::of::<u8>());
        let b = DispatchKey::new("insert", TypeId::of::<u8>());
        let c = DispatchKey::named("function", TypeId::of::<u8>(), "recent");
        let d = DispatchKey::pair("select", TypeId::of::<u8>(), TypeId::of::<u16>());

        assert_eq!(cache.get_or_compile(&a, |_| "a"), "a");
        assert_eq!(cache.get_or_compile(&b, |_| "b"), "b");
        assert_eq!(cache.get_or_compile(&c, |_| "c"), "c");
        assert_eq!(cache.get_or_compile(&d, |_| "d"), "d");
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.compiled_count(), 4);
    }

    #[test]
    fn test_concurrent_first_resolution_compiles_once() {
        let cache = Arc::new(DispatchCache::<u64>::new());
        let key = DispatchKey::new("update", TypeId::of::<String>());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let key = key.clone();
                std::thread::spawn(move || cache.get_or_compile(&key, |_| 7))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 7);
        }
        assert_eq!(cache.compiled_count(), 1);
    }
}
