//! The linker front end: memoized downcall handles and upcall stubs.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::abi::Abi;
use crate::calling_sequence::Direction;
use crate::classify::classify;
use crate::downcall::DowncallHandle;
use crate::layout::FunctionType;
use crate::stub::StubStrategy;
use crate::upcall::{
    UncaughtHandler, UpcallCode, UpcallStub, UpcallTarget, default_uncaught_handler,
};
use crate::{Error, Result};

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Linker settings.
#[derive(Clone)]
pub struct LinkerConfig {
    pub strategy: StubStrategy,
    /// Most compiled entries kept per cache; least recently used ones are evicted.
    pub cache_capacity: usize,
    /// Receives errors raised by upcall targets.
    pub uncaught_handler: UncaughtHandler,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            strategy: StubStrategy::Auto,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            uncaught_handler: default_uncaught_handler(),
        }
    }
}

impl LinkerConfig {
    #[must_use]
    pub fn with_strategy(mut self, strategy: StubStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_uncaught_handler(mut self, handler: UncaughtHandler) -> Self {
        self.uncaught_handler = handler;
        self
    }
}

impl fmt::Debug for LinkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkerConfig")
            .field("strategy", &self.strategy)
            .field("cache_capacity", &self.cache_capacity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

type Slot<V> = Arc<OnceLock<Result<V>>>;

struct CacheState<K, V> {
    slots: HashMap<K, (Slot<V>, u64)>,
    clock: u64,
    stats: CacheStats,
}

/// A bounded LRU map computing each value at most once per residency.
///
/// The map lock is held only to find or install a key's slot. The value is
/// computed outside it, so threads asking for the same key wait for the first
/// one while other keys proceed. Failures are cached like values.
pub struct LinkerCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LinkerCache<K, V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                clock: 0,
                stats: CacheStats::default(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get_or_compute(&self, key: &K, compute: impl FnOnce() -> Result<V>) -> Result<V> {
        let slot = {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let state = &mut *guard;
            state.clock += 1;
            let now = state.clock;
            if let Some((slot, used)) = state.slots.get_mut(key) {
                *used = now;
                let slot = Arc::clone(slot);
                state.stats.hits += 1;
                slot
            } else {
                state.stats.misses += 1;
                if state.slots.len() >= self.capacity {
                    let oldest = state
                        .slots
                        .iter()
                        .min_by_key(|(_, (_, used))| *used)
                        .map(|(k, _)| k.clone());
                    if let Some(oldest) = oldest {
                        state.slots.remove(&oldest);
                        state.stats.evictions += 1;
                    }
                }
                let slot: Slot<V> = Arc::new(OnceLock::new());
                state.slots.insert(key.clone(), (Arc::clone(&slot), now));
                slot
            }
        };
        slot.get_or_init(compute).clone()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Key = (Abi, FunctionType);

/// Builds and memoizes downcall handles and upcall code.
pub struct Linker {
    abi: Abi,
    config: LinkerConfig,
    downcalls: LinkerCache<Key, DowncallHandle>,
    upcalls: LinkerCache<Key, Arc<UpcallCode>>,
}

impl Linker {
    #[must_use]
    pub fn new(abi: Abi, config: LinkerConfig) -> Self {
        Self {
            abi,
            downcalls: LinkerCache::new(config.cache_capacity),
            upcalls: LinkerCache::new(config.cache_capacity),
            config,
        }
    }

    /// A linker for the host ABI with default settings.
    #[must_use]
    pub fn native() -> Self {
        Self::new(Abi::host(), LinkerConfig::default())
    }

    #[must_use]
    pub const fn abi(&self) -> Abi {
        self.abi
    }

    #[must_use]
    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Returns the handle for `signature`, building it on first use. A
    /// signature that fails to link is cached too and fails the same way again.
    pub fn downcall_handle(&self, signature: &FunctionType) -> Result<DowncallHandle> {
        let key = (self.abi, signature.clone());
        self.downcalls.get_or_compute(&key, || {
            let sequence = classify(signature, self.abi, Direction::Downcall)?;
            DowncallHandle::new(Arc::new(sequence), self.config.strategy)
        })
    }

    /// Registers a fresh entry point for `target`. The compiled code is shared
    /// with every other stub of the same signature.
    ///
    /// The code is keyed on the signature alone, so the target's carrier type
    /// is checked after the lookup.
    pub fn upcall_stub(
        &self,
        target: UpcallTarget,
        signature: &FunctionType,
    ) -> Result<UpcallStub> {
        let key = (self.abi, signature.clone());
        let code = self.upcalls.get_or_compute(&key, || {
            let sequence = classify(signature, self.abi, Direction::Upcall)?;
            UpcallCode::new(Arc::new(sequence), self.config.strategy).map(Arc::new)
        })?;
        let expected = signature.carrier_type();
        if *target.method_type() != expected {
            return Err(Error::SignatureMismatch {
                expected: expected.to_string(),
                actual: target.method_type().to_string(),
            });
        }
        UpcallStub::register(code, target, Arc::clone(&self.config.uncaught_handler))
    }

    #[must_use]
    pub fn downcall_stats(&self) -> CacheStats {
        self.downcalls.stats()
    }

    #[must_use]
    pub fn upcall_stats(&self) -> CacheStats {
        self.upcalls.stats()
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("abi", &self.abi)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TypeLayout;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cache_computes_once() {
        let cache: LinkerCache<u32, u32> = LinkerCache::new(4);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache.get_or_compute(&7, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(49)
            });
            assert_eq!(v, Ok(49));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn test_cache_keeps_failures() {
        let cache: LinkerCache<&str, u32> = LinkerCache::new(4);
        let first = cache.get_or_compute(&"bad", || Err(Error::Internal("nope".into())));
        let second = cache.get_or_compute(&"bad", || Ok(1));
        assert_eq!(first, second);
    }

    #[test]
    fn test_lru_eviction() {
        let cache: LinkerCache<u32, u32> = LinkerCache::new(2);
        cache.get_or_compute(&1, || Ok(1)).unwrap();
        cache.get_or_compute(&2, || Ok(2)).unwrap();
        cache.get_or_compute(&1, || Ok(1)).unwrap();
        cache.get_or_compute(&3, || Ok(3)).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        // 2 was least recently used and must be recomputed.
        assert_eq!(cache.get_or_compute(&2, || Ok(20)), Ok(20));
        assert_eq!(cache.get_or_compute(&3, || Ok(30)), Ok(3));
    }

    #[test]
    fn test_signature_mismatch() {
        let linker = Linker::new(Abi::SysV, LinkerConfig::default());
        let sig = FunctionType::returning([TypeLayout::I32], TypeLayout::I32);
        let target = UpcallTarget::new(
            "wrong",
            FunctionType::void([TypeLayout::I32]).carrier_type(),
            |_| Ok(None),
        );
        let err = linker.upcall_stub(target, &sig).unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch { .. }), "{err}");
    }

    #[test]
    fn test_link_failures_are_cached() {
        let linker = Linker::new(Abi::SysV, LinkerConfig::default());
        let sig: FunctionType = "(packed{i8, i32}) -> void".parse().unwrap();
        let first = linker.downcall_handle(&sig).unwrap_err();
        let second = linker.downcall_handle(&sig).unwrap_err();
        assert!(matches!(first, Error::InvalidSignature(_)), "{first}");
        assert_eq!(first, second);
        assert_eq!(
            linker.downcall_stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }
}
