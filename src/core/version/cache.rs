use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    /// `None` never expires.
    expires_at: Option<Instant>,
}

/// String-keyed memo with a fixed time-to-live.
///
/// The lock is only held to copy a value in or out.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(key) {
            Some(entry) => entry
                .expires_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false),
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let expires_at = Some(Instant::now() + self.ttl);
        self.store(key.into(), value, expires_at);
    }

    /// Store a value that never expires.
    pub fn insert_permanent(&self, key: impl Into<String>, value: V) {
        self.store(key.into(), value, None);
    }

    fn store(&self, key: String, value: V, expires_at: Option<Instant>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, CacheEntry { value, expires_at });
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
