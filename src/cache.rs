//! Address-keyed memoization.
//!
//! Parsing never depends on the cache; it only avoids re-reading strings and
//! pointers that are looked up repeatedly through the converter. Entries are
//! shared as `Arc` so a hit never copies the value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A thread-safe map from virtual address to a decoded value.
#[derive(Debug)]
pub struct AddressCache<V> {
    entries: Mutex<HashMap<u64, Arc<V>>>,
}

impl<V> Default for AddressCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> AddressCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<V>>> {
        // A panic while holding the lock leaves the map consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, addr: u64) -> Option<Arc<V>> {
        self.lock().get(&addr).cloned()
    }

    pub fn insert(&self, addr: u64, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.lock().insert(addr, Arc::clone(&value));
        value
    }

    /// Return the cached value or compute and store it. Errors are not cached.
    pub fn get_or_try_insert_with<E>(
        &self,
        addr: u64,
        f: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(hit) = self.get(addr) {
            return Ok(hit);
        }
        // Computed outside the lock; a racing insert for the same address wins.
        let value = f()?;
        let mut entries = self.lock();
        Ok(Arc::clone(
            entries.entry(addr).or_insert_with(|| Arc::new(value)),
        ))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
