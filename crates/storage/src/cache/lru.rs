//! In-memory LRU index for the local disk cache.
//!
//! Access order is a logical clock rather than wall time, so two touches
//! in the same instant still order deterministically. The index is rebuilt
//! from disk on startup, seeded oldest-first by file mtime.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryMeta {
    size_bytes: u64,
    last_access: u64,
}

/// Thread-safe size and recency tracking for cache entries.
#[derive(Debug, Default)]
pub struct LruIndex {
    entries: DashMap<String, EntryMeta>,
    total_size: AtomicU64,
    clock: AtomicU64,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a new entry, or replace an existing one's size.
    pub fn record(&self, key: &str, size: u64) {
        let meta = EntryMeta {
            size_bytes: size,
            last_access: self.tick(),
        };
        match self.entries.insert(key.to_string(), meta) {
            Some(old) if size >= old.size_bytes => {
                self.total_size
                    .fetch_add(size - old.size_bytes, Ordering::Relaxed);
            }
            Some(old) => {
                self.total_size
                    .fetch_sub(old.size_bytes - size, Ordering::Relaxed);
            }
            None => {
                self.total_size.fetch_add(size, Ordering::Relaxed);
            }
        }
    }

    /// Mark an entry as just used. Unknown keys are ignored.
    pub fn touch(&self, key: &str) {
        let tick = self.tick();
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_access = tick;
        }
    }

    /// Forget an entry, returning its size.
    pub fn remove(&self, key: &str) -> Option<u64> {
        let (_, meta) = self.entries.remove(key)?;
        self.total_size
            .fetch_sub(meta.size_bytes, Ordering::Relaxed);
        Some(meta.size_bytes)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The least recently used key, if any.
    pub fn oldest(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_total_size_across_replace_and_remove() {
        let index = LruIndex::new();
        index.record("a", 100);
        index.record("b", 50);
        assert_eq!(index.total_size(), 150);

        index.record("a", 20);
        assert_eq!(index.total_size(), 70);
        assert_eq!(index.len(), 2);

        assert_eq!(index.remove("b"), Some(50));
        assert_eq!(index.remove("b"), None);
        assert_eq!(index.total_size(), 20);
    }

    #[test]
    fn touch_moves_entry_to_most_recent() {
        let index = LruIndex::new();
        index.record("a", 1);
        index.record("b", 1);
        index.record("c", 1);
        assert_eq!(index.oldest().as_deref(), Some("a"));

        index.touch("a");
        assert_eq!(index.oldest().as_deref(), Some("b"));

        index.touch("missing");
        assert!(!index.contains("missing"));
    }
}
