//! Bounded TTL cache for historical query responses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
}

pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_size: max_size.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: Value) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            // Past capacity: drop expired entries first, then the oldest.
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
            while entries.len() >= self.max_size {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => entries.remove(&k),
                    None => break,
                };
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = QueryCache::new(10, Duration::from_millis(20));
        cache.put("k".into(), json!({"rows": 1}));
        assert_eq!(cache.get("k"), Some(json!({"rows": 1})));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), json!(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("b".into(), json!(2));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("c".into(), json!(3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(json!(3)));
    }
}
