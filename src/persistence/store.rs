use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::persistence::record::Record;
use crate::world::entity::lock_unpoisoned;

/// The actual storage, whatever it is. The core never sees schemas or
/// connection handles, only records by key.
pub trait RecordBackend: Send + Sync {
    fn fetch(&self, key: &str) -> Option<Record>;
    fn store(&self, key: &str, record: Record);
}

/// Backend for tests and single-process tools.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordBackend for MemoryBackend {
    fn fetch(&self, key: &str) -> Option<Record> {
        lock_unpoisoned(&self.records).get(key).cloned()
    }

    fn store(&self, key: &str, record: Record) {
        lock_unpoisoned(&self.records).insert(key.to_owned(), record);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64)
        }
    }
}

struct StoreInner {
    cache: LruCache<String, Record>,
    stats: CacheStats,
}

/// Keyed record store with a bounded hot cache in front of the backend.
/// Writes go through; reads fill.
pub struct RecordStore {
    backend: Box<dyn RecordBackend>,
    inner: Mutex<StoreInner>,
}

impl RecordStore {
    pub fn new(backend: Box<dyn RecordBackend>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            inner: Mutex::new(StoreInner {
                cache: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn fetch(&self, key: &str) -> Option<Record> {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            if let Some(record) = inner.cache.get(key) {
                let record = record.clone();
                inner.stats.hits += 1;
                return Some(record);
            }
            inner.stats.misses += 1;
        }
        let record = self.backend.fetch(key)?;
        lock_unpoisoned(&self.inner)
            .cache
            .put(key.to_owned(), record.clone());
        Some(record)
    }

    pub fn store(&self, key: &str, record: Record) {
        self.backend.store(key, record.clone());
        lock_unpoisoned(&self.inner).cache.put(key.to_owned(), record);
    }

    pub fn stats(&self) -> CacheStats {
        lock_unpoisoned(&self.inner).stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(name: &str) -> Record {
        let mut record = Record::new();
        record.set_str("name", name);
        record
    }

    #[test]
    fn fetch_fills_the_cache() {
        let backend = MemoryBackend::new();
        backend.store("npc:1", record_with("one"));
        let store = RecordStore::new(Box::new(backend), 8);

        assert_eq!(store.fetch("npc:1").unwrap().str("name"), Some("one"));
        assert_eq!(store.stats(), CacheStats { hits: 0, misses: 1 });

        assert!(store.fetch("npc:1").is_some());
        assert_eq!(store.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn missing_key_counts_as_miss() {
        let store = RecordStore::new(Box::new(MemoryBackend::new()), 8);
        assert!(store.fetch("npc:404").is_none());
        assert_eq!(store.stats(), CacheStats { hits: 0, misses: 1 });
    }

    #[test]
    fn writes_go_through_to_the_backend() {
        let store = RecordStore::new(Box::new(MemoryBackend::new()), 2);
        store.store("door:1", record_with("gate"));

        // Evict door:1 from the tiny cache with two other keys.
        store.store("door:2", record_with("postern"));
        store.store("door:3", record_with("trapdoor"));

        // It still comes back from the backend.
        assert_eq!(store.fetch("door:1").unwrap().str("name"), Some("gate"));
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn hit_rate_is_zero_without_traffic() {
        let store = RecordStore::new(Box::new(MemoryBackend::new()), 4);
        assert_eq!(store.stats().hit_rate(), 0.0);
    }
}
