//! Backing tier hooks for loading and saving sessions.
//!
//! The store keeps live records in memory and delegates durability to a
//! [`BackingStore`]. Implementations might front a database table or a
//! distributed cache; the engine only relies on snapshots round-tripping
//! attributes, timestamps, version and validity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::session::SessionSnapshot;

/// Trait for backing tiers.
///
/// All methods are called without any session lock held.
pub trait BackingStore: Send + Sync {
    /// Name used in logs.
    fn backend_name(&self) -> &'static str;

    /// Record a newly created session.
    fn create(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Load a session that is not in memory.
    fn get(&self, id: &str) -> Result<Option<SessionSnapshot>>;

    /// Whether the tier knows this id.
    fn id_exists(&self, id: &str) -> Result<bool>;

    /// Write a snapshot (full or partial, see [`SessionSnapshot::full`]).
    fn write(&self, snapshot: SessionSnapshot) -> Result<()>;

    /// Write only a cached last-access time.
    fn write_last_access(&self, id: &str, last_accessed: u64) -> Result<()>;

    /// Remove a session from the tier.
    fn release(&self, id: &str) -> Result<()>;

    /// Expire sessions known only to the tier. Returns the ids it removed.
    fn run_invalidation_sweep(&self, now: u64) -> Result<Vec<String>>;

    /// Write a batch of dirty snapshots (time-based writes).
    fn run_periodic_flush(&self, snapshots: Vec<SessionSnapshot>) -> Result<()> {
        for snapshot in snapshots {
            self.write(snapshot)?;
        }
        Ok(())
    }

    /// Capacity limit of the tier itself, if any.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Memory-only operation: nothing is persisted.
#[derive(Debug, Clone, Default)]
pub struct NoPersistence;

impl BackingStore for NoPersistence {
    fn backend_name(&self) -> &'static str {
        "none"
    }

    fn create(&self, _snapshot: &SessionSnapshot) -> Result<()> {
        Ok(())
    }

    fn get(&self, _id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(None)
    }

    fn id_exists(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }

    fn write(&self, _snapshot: SessionSnapshot) -> Result<()> {
        Ok(())
    }

    fn write_last_access(&self, _id: &str, _last_accessed: u64) -> Result<()> {
        Ok(())
    }

    fn release(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn run_invalidation_sweep(&self, _now: u64) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A shared table of snapshots standing in for an external tier.
///
/// Clones share the same table, so several managers (or a manager rebuilt
/// after a simulated restart) see the same persisted state.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    table: Arc<RwLock<HashMap<String, SessionSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored snapshot for `id`, if any.
    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.table.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Ids currently persisted.
    pub fn ids(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }
}

impl BackingStore for SnapshotStore {
    fn backend_name(&self) -> &'static str {
        "snapshot"
    }

    fn create(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.table
            .write()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.snapshot(id))
    }

    fn id_exists(&self, id: &str) -> Result<bool> {
        Ok(self.table.read().contains_key(id))
    }

    fn write(&self, snapshot: SessionSnapshot) -> Result<()> {
        let mut table = self.table.write();
        match table.get_mut(&snapshot.id) {
            Some(stored) => snapshot.merge_into(stored),
            None => {
                table.insert(snapshot.id.clone(), snapshot);
            }
        }
        Ok(())
    }

    fn write_last_access(&self, id: &str, last_accessed: u64) -> Result<()> {
        if let Some(stored) = self.table.write().get_mut(id) {
            stored.last_accessed = stored.last_accessed.max(last_accessed);
        }
        Ok(())
    }

    fn release(&self, id: &str) -> Result<()> {
        self.table.write().remove(id);
        Ok(())
    }

    fn run_invalidation_sweep(&self, now: u64) -> Result<Vec<String>> {
        let mut table = self.table.write();
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            table.remove(id);
        }
        Ok(expired)
    }
}
