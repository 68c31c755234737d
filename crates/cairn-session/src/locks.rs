//! Per-id locks serializing concurrent creation of the same session id.
//!
//! Entries are created on first use and removed when their last user leaves,
//! with the user count maintained under the outer map lock so a creator
//! arriving mid-removal always finds (or recreates) a live entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

struct Entry {
    lock: Arc<Mutex<()>>,
    users: usize,
}

/// Registry of lazily created, eagerly removed per-id mutexes.
#[derive(Default)]
pub struct CreationLocks {
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for CreationLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationLocks")
            .field("active", &self.active())
            .finish()
    }
}

/// Drops one user of an entry, removing the entry with its last user.
struct Checkout<'a> {
    owner: &'a CreationLocks,
    id: &'a str,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        let mut entries = self.owner.entries.lock();
        if let Some(entry) = entries.get_mut(self.id) {
            entry.users -= 1;
            if entry.users == 0 {
                entries.remove(self.id);
            }
        }
    }
}

impl CreationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `id`.
    pub fn with_lock<R>(&self, id: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(id.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                users: 0,
            });
            entry.users += 1;
            Arc::clone(&entry.lock)
        };
        let _checkout = Checkout { owner: self, id };
        let _guard = lock.lock();
        f()
    }

    /// Number of ids with a live entry.
    pub fn active(&self) -> usize {
        self.entries.lock().len()
    }
}
