//! Per-helper-pod lock table (component G): serializes the mount/unmount
//! sequence for a given helper pod without serializing unrelated helper
//! pods against each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct Entry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    refcount: usize,
}

/// A process-wide table of per-helper-pod mutexes. The map mutex is only
/// ever held across table mutations (insert/increment/decrement/remove),
/// never across the per-entry lock itself, so acquiring one helper pod's
/// lock never blocks behind another's in-flight mount.
#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Holds one helper pod's lock for as long as it's alive; dropping it
/// releases the lock and, if this was the last holder, removes the table
/// entry.
pub struct LockGuard<'a> {
    table: &'a LockTable,
    name: String,
    // Held for the guard's lifetime; dropped (unlocking) before the table
    // entry's refcount is decremented.
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `name`, creating its table entry if absent.
    /// The entry's refcount is incremented under the map mutex before the
    /// (potentially slow) per-entry lock is awaited, so the entry is never
    /// deleted while a concurrent acquisition is in flight.
    pub async fn lock(&self, name: &str) -> LockGuard<'_> {
        let mutex = {
            let mut entries = self.lock_map();
            let entry = entries.entry(name.to_string()).or_insert_with(|| Entry { mutex: Arc::new(tokio::sync::Mutex::new(())), refcount: 0 });
            entry.refcount += 1;
            entry.mutex.clone()
        };

        let permit = mutex.lock_owned().await;
        LockGuard { table: self, name: name.to_string(), _permit: permit }
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("lock table mutex poisoned")
    }

    fn release(&self, name: &str) {
        let mut entries = self.lock_map();
        if let Some(entry) = entries.get_mut(name) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(name);
            }
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.name);
    }
}
