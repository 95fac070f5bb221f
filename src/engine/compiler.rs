//! Compiled script caching.
//!
//! V8 unbound scripts are context independent, so one compilation can be
//! bound to any context of the same isolate. The cache keeps the most
//! recently used ones, keyed by a SHA-256 of resource name and source.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Cache entry with metadata
struct CacheEntry {
    /// Compiled, context independent script
    script: v8::Global<v8::UnboundScript>,
    /// Access tick of the last lookup
    last_accessed: u64,
    /// Access count
    access_count: u64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently cached
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that required compilation
    pub misses: u64,
}

/// Per-isolate cache of compiled scripts
pub(crate) struct ScriptCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl ScriptCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Compute cache key from resource name and source
    pub(crate) fn key(name: &str, source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<v8::Global<v8::UnboundScript>> {
        self.tick += 1;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = self.tick;
                entry.access_count += 1;
                self.hits += 1;
                Some(entry.script.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub(crate) fn insert(&mut self, key: String, script: v8::Global<v8::UnboundScript>) {
        if self.capacity == 0 {
            return;
        }

        while self.entries.len() >= self.capacity {
            if !self.evict_lru() {
                break;
            }
        }

        self.tick += 1;
        self.entries.insert(
            key,
            CacheEntry {
                script,
                last_accessed: self.tick,
                access_count: 0,
            },
        );
    }

    /// Evict least recently used entry
    fn evict_lru(&mut self) -> bool {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone());

        match lru_key {
            Some(key) => {
                if let Some(entry) = self.entries.remove(&key) {
                    debug!(key = %key, uses = entry.access_count, "Evicted LRU script");
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_deterministic() {
        let a = ScriptCache::key("a.js", "1 + 1");
        let b = ScriptCache::key("a.js", "1 + 1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_includes_name() {
        assert_ne!(ScriptCache::key("a.js", "1"), ScriptCache::key("b.js", "1"));
        assert_ne!(ScriptCache::key("ab", "c"), ScriptCache::key("a", "bc"));
    }

    #[test]
    fn test_cache_miss_counts() {
        let mut cache = ScriptCache::new(4);
        assert!(cache.get("missing").is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 0,
                hits: 0,
                misses: 1
            }
        );
    }
}
