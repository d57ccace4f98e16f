//! Local half of the distributed cache: an LRU-ordered map with a byte
//! weight budget.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

/// Default weight budget: 32 MiB.
pub const DEFAULT_MAX_WEIGHT: usize = 32 * 1024 * 1024;

struct Entry {
    value: Bytes,
    inserted: Instant,
}

struct Inner {
    map: LruCache<String, Entry>,
    weight: usize,
    max_weight: usize,
}

/// Weighted LRU over string keys and opaque byte values.
pub struct LocalCache {
    inner: Mutex<Inner>,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCache {
    pub fn new() -> LocalCache {
        LocalCache {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                weight: 0,
                max_weight: DEFAULT_MAX_WEIGHT,
            }),
        }
    }

    /// Insert or replace. Evicts least-recently-bumped entries until the
    /// budget holds again; a value that alone exceeds the budget is not
    /// stored at all.
    pub fn store(&self, key: &str, value: Bytes) {
        let mut inner = self.inner.lock().expect("cache lock");
        if value.len() > inner.max_weight {
            tracing::warn!(key, len = value.len(), "value exceeds cache weight budget");
            return;
        }
        if let Some(old) = inner.map.put(
            key.to_string(),
            Entry { value: value.clone(), inserted: Instant::now() },
        ) {
            inner.weight -= old.value.len();
        }
        inner.weight += value.len();
        while inner.weight > inner.max_weight {
            match inner.map.pop_lru() {
                Some((_, evicted)) => inner.weight -= evicted.value.len(),
                None => break,
            }
        }
    }

    /// Read a value. `bump` refreshes recency; `max_age` drops and
    /// rejects entries older than the limit.
    pub fn load(&self, key: &str, bump: bool, max_age: Option<Duration>) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("cache lock");
        let inserted = inner.map.peek(key)?.inserted;
        if let Some(limit) = max_age {
            if inserted.elapsed() > limit {
                if let Some(old) = inner.map.pop(key) {
                    inner.weight -= old.value.len();
                }
                return None;
            }
        }
        if bump {
            inner.map.get(key).map(|e| e.value.clone())
        } else {
            inner.map.peek(key).map(|e| e.value.clone())
        }
    }

    /// Remove one key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock");
        match inner.map.pop(key) {
            Some(old) => {
                inner.weight -= old.value.len();
                true
            }
            None => false,
        }
    }

    pub fn delete_prefix(&self, prefix: &str) {
        self.delete_matching(|k| k.starts_with(prefix));
    }

    pub fn delete_contains(&self, needle: &str) {
        self.delete_matching(|k| k.contains(needle));
    }

    fn delete_matching(&self, pred: impl Fn(&str) -> bool) {
        let mut inner = self.inner.lock().expect("cache lock");
        let doomed: Vec<String> =
            inner.map.iter().filter(|(k, _)| pred(k)).map(|(k, _)| k.clone()).collect();
        for key in doomed {
            if let Some(old) = inner.map.pop(&key) {
                inner.weight -= old.value.len();
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.map.clear();
        inner.weight = 0;
    }

    /// Current total weight in bytes.
    pub fn weight(&self) -> usize {
        self.inner.lock().expect("cache lock").weight
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_max_weight(&self, max_weight: usize) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.max_weight = max_weight;
        while inner.weight > inner.max_weight {
            match inner.map.pop_lru() {
                Some((_, evicted)) => inner.weight -= evicted.value.len(),
                None => break,
            }
        }
    }

    /// Every entry, most recently used first. Used by the rescue scan.
    pub fn snapshot(&self) -> Vec<(String, Bytes)> {
        let inner = self.inner.lock().expect("cache lock");
        inner.map.iter().map(|(k, e)| (k.clone(), e.value.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Bytes {
        Bytes::from(vec![0u8; n])
    }

    #[test]
    fn store_load_delete() {
        let c = LocalCache::new();
        c.store("a", Bytes::from_static(b"AAA"));
        assert_eq!(c.load("a", true, None).unwrap().as_ref(), b"AAA");
        assert_eq!(c.weight(), 3);
        assert!(c.delete("a"));
        assert!(!c.delete("a"));
        assert!(c.load("a", true, None).is_none());
        assert_eq!(c.weight(), 0);
    }

    #[test]
    fn weight_budget_evicts_lru() {
        let c = LocalCache::new();
        c.set_max_weight(100);
        c.store("one", bytes(40));
        c.store("two", bytes(40));
        // Bump "one" so "two" is the eviction candidate.
        c.load("one", true, None);
        c.store("three", bytes(40));
        assert!(c.load("one", false, None).is_some());
        assert!(c.load("two", false, None).is_none());
        assert!(c.load("three", false, None).is_some());
        assert!(c.weight() <= 100);
    }

    #[test]
    fn oversize_value_is_refused() {
        let c = LocalCache::new();
        c.set_max_weight(10);
        c.store("big", bytes(11));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn no_bump_preserves_eviction_order() {
        let c = LocalCache::new();
        c.set_max_weight(100);
        c.store("one", bytes(40));
        c.store("two", bytes(40));
        // Peek must not rescue "one" from eviction.
        c.load("one", false, None);
        c.store("three", bytes(40));
        assert!(c.load("one", false, None).is_none());
        assert!(c.load("two", false, None).is_some());
    }

    #[test]
    fn max_age_rejects_and_drops() {
        let c = LocalCache::new();
        c.store("a", bytes(5));
        assert!(c.load("a", true, Some(Duration::from_secs(60))).is_some());
        assert!(c.load("a", true, Some(Duration::ZERO)).is_none());
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn prefix_and_contains_deletion() {
        let c = LocalCache::new();
        c.store("user:1", bytes(1));
        c.store("user:2", bytes(1));
        c.store("group:1", bytes(1));
        c.delete_prefix("user:");
        assert_eq!(c.len(), 1);
        c.store("alpha-x", bytes(1));
        c.delete_contains("pha");
        assert!(c.load("alpha-x", false, None).is_none());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn replace_adjusts_weight() {
        let c = LocalCache::new();
        c.store("a", bytes(10));
        c.store("a", bytes(4));
        assert_eq!(c.weight(), 4);
        assert_eq!(c.len(), 1);
    }
}
