//! Lookup tables from manager ids and application ids to session managers.
//!
//! The registry is an ordinary value handed to whoever hosts applications;
//! there is no process-global instance. Several applications may share one
//! manager ("shared sessions"): the manager is started when its first
//! application registers and stopped when its last one unregisters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::manager::{SessionManager, SessionStats};

struct Entry {
    manager: Arc<SessionManager>,
    users: usize,
}

#[derive(Default)]
struct Tables {
    managers: HashMap<String, Entry>,
    apps: HashMap<String, String>,
}

/// Registry of running session managers.
#[derive(Default)]
pub struct SessionRegistry {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("SessionRegistry")
            .field("managers", &tables.managers.keys().collect::<Vec<_>>())
            .field("apps", &tables.apps)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `app_id` against the manager `manager_id`.
    ///
    /// If the manager is not registered yet, `create` builds it and it is
    /// started; otherwise the existing manager is shared. Registering an app
    /// twice returns its manager without taking another reference.
    pub fn register<F>(&self, app_id: &str, manager_id: &str, create: F) -> Result<Arc<SessionManager>>
    where
        F: FnOnce() -> SessionManager,
    {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.apps.get(app_id)
            && let Some(entry) = tables.managers.get(existing)
        {
            return Ok(Arc::clone(&entry.manager));
        }

        let manager = match tables.managers.get_mut(manager_id) {
            Some(entry) => {
                entry.users += 1;
                debug!(app = %app_id, manager = %manager_id, users = entry.users, "Sharing session manager");
                Arc::clone(&entry.manager)
            }
            None => {
                let manager = Arc::new(create());
                manager.start()?;
                tables.managers.insert(
                    manager_id.to_string(),
                    Entry {
                        manager: Arc::clone(&manager),
                        users: 1,
                    },
                );
                info!(app = %app_id, manager = %manager_id, "Session manager registered");
                manager
            }
        };
        tables
            .apps
            .insert(app_id.to_string(), manager_id.to_string());
        Ok(manager)
    }

    /// Drop `app_id`'s reference. The manager is stopped and removed with its
    /// last application. Returns `false` for an unknown app.
    pub fn unregister(&self, app_id: &str) -> bool {
        let removed = {
            let mut tables = self.tables.write();
            let Some(manager_id) = tables.apps.remove(app_id) else {
                return false;
            };
            let Some(entry) = tables.managers.get_mut(&manager_id) else {
                return true;
            };
            entry.users = entry.users.saturating_sub(1);
            if entry.users > 0 {
                debug!(app = %app_id, manager = %manager_id, users = entry.users, "Released shared session manager");
                return true;
            }
            tables
                .managers
                .remove(&manager_id)
                .map(|entry| (manager_id, entry.manager))
        };

        if let Some((manager_id, manager)) = removed {
            manager.stop();
            manager.events().clear();
            info!(app = %app_id, manager = %manager_id, "Session manager unregistered");
        }
        true
    }

    pub fn manager(&self, manager_id: &str) -> Option<Arc<SessionManager>> {
        self.tables
            .read()
            .managers
            .get(manager_id)
            .map(|e| Arc::clone(&e.manager))
    }

    pub fn manager_for_app(&self, app_id: &str) -> Option<Arc<SessionManager>> {
        let tables = self.tables.read();
        let manager_id = tables.apps.get(app_id)?;
        tables
            .managers
            .get(manager_id)
            .map(|e| Arc::clone(&e.manager))
    }

    pub fn manager_ids(&self) -> Vec<String> {
        self.tables.read().managers.keys().cloned().collect()
    }

    pub fn app_ids(&self) -> Vec<String> {
        self.tables.read().apps.keys().cloned().collect()
    }

    /// Number of registered managers.
    pub fn len(&self) -> usize {
        self.tables.read().managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().managers.is_empty()
    }

    fn all(&self) -> Vec<Arc<SessionManager>> {
        self.tables
            .read()
            .managers
            .values()
            .map(|e| Arc::clone(&e.manager))
            .collect()
    }

    /// Force-invalidate `id` in every manager. Returns how many held it.
    pub fn invalidate_everywhere(&self, id: &str) -> usize {
        let count = self
            .all()
            .iter()
            .filter(|m| m.invalidate_id(id, true))
            .count();
        debug!(session_id = %id, managers = count, "Invalidated session everywhere");
        count
    }

    /// Touch `id`'s last-access time in every manager. Returns how many held it.
    pub fn refresh_everywhere(&self, id: &str) -> usize {
        self.all()
            .iter()
            .filter(|m| m.refresh_last_access(id, None))
            .count()
    }

    pub fn stats(&self) -> Vec<SessionStats> {
        self.all().iter().map(|m| m.stats()).collect()
    }

    /// Stop and forget every manager.
    pub fn shutdown(&self) {
        let managers: Vec<_> = {
            let mut tables = self.tables.write();
            tables.apps.clear();
            tables.managers.drain().map(|(_, e)| e.manager).collect()
        };
        for manager in managers {
            manager.stop();
        }
        info!("Session registry shut down");
    }
}
