use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Single-flight gate: concurrent calls with the same key share one
/// execution and all receive a clone of its result.
///
/// If the running future is dropped (its caller was cancelled) one of the
/// remaining waiters picks the work up. Once a flight lands the key is
/// forgotten, so later calls start fresh; persistence is the caller's job.
pub struct Coalescer<T> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut inflight = self.lock();
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(work).await.clone();

        let mut inflight = self.lock();
        if inflight
            .get(key)
            .map(|current| Arc::ptr_eq(current, &cell))
            .unwrap_or(false)
        {
            inflight.remove(key);
        }
        value
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OnceCell<T>>>> {
        // The map holds no invariants a panicking holder could break.
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}
