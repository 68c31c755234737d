//! The session record: identity, attributes, timestamps and reference count.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::config::WriteContents;
use crate::error::{Result, SessionError};

/// Serializable view of a record as handed to the backing tier.
///
/// When `full` is false, `attributes` holds only the attributes changed since
/// the previous write and `removed` lists the attributes deleted since then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub version: u32,
    pub app_name: String,
    pub created_at: u64,
    pub last_accessed: u64,
    pub max_inactive_secs: i64,
    pub valid: bool,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default = "default_full")]
    pub full: bool,
}

fn default_full() -> bool {
    true
}

impl SessionSnapshot {
    /// Whether the snapshot is past its inactivity deadline at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        expired(self.last_accessed, self.max_inactive_secs, now)
    }

    /// Fold this write into a previously stored snapshot.
    pub fn merge_into(self, stored: &mut SessionSnapshot) {
        if self.full {
            *stored = self;
            return;
        }
        for name in &self.removed {
            stored.attributes.remove(name);
        }
        stored.attributes.extend(self.attributes);
        stored.id = self.id;
        stored.version = self.version;
        stored.last_accessed = self.last_accessed;
        stored.max_inactive_secs = self.max_inactive_secs;
        stored.valid = self.valid;
        stored.user_name = self.user_name;
    }
}

fn expired(last_accessed: u64, max_inactive_secs: i64, now: u64) -> bool {
    if max_inactive_secs <= 0 {
        return false;
    }
    let ttl_millis = (max_inactive_secs as u64).saturating_mul(1000);
    now > last_accessed.saturating_add(ttl_millis)
}

/// Changes not yet written to the backing tier.
#[derive(Debug, Default)]
struct Dirty {
    changed: HashSet<String>,
    removed: HashSet<String>,
    max_inactive: bool,
}

impl Dirty {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && !self.max_inactive
    }
}

#[derive(Debug)]
struct SessionState {
    id: String,
    version: u32,
    attributes: HashMap<String, Value>,
    last_accessed: u64,
    max_inactive_secs: i64,
    ref_count: u32,
    valid: bool,
    is_new: bool,
    user_name: Option<String>,
    dirty: Dirty,
}

/// A session record.
///
/// All mutable state sits behind a single per-record mutex; no lock is held
/// while listeners run.
#[derive(Debug)]
pub struct Session {
    app_name: String,
    created_at: u64,
    overflow: bool,
    state: Mutex<SessionState>,
}

/// Result of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Released {
    pub ref_count: u32,
    pub valid: bool,
}

impl Session {
    pub(crate) fn new(
        id: impl Into<String>,
        version: u32,
        app_name: impl Into<String>,
        now: u64,
        max_inactive_secs: i64,
        overflow: bool,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            created_at: now,
            overflow,
            state: Mutex::new(SessionState {
                id: id.into(),
                version,
                attributes: HashMap::new(),
                last_accessed: now,
                max_inactive_secs,
                ref_count: 0,
                valid: true,
                is_new: true,
                user_name: None,
                dirty: Dirty::default(),
            }),
        }
    }

    /// Rebuild a live record from the backing tier.
    pub(crate) fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            app_name: snapshot.app_name,
            created_at: snapshot.created_at,
            overflow: false,
            state: Mutex::new(SessionState {
                id: snapshot.id,
                version: snapshot.version,
                attributes: snapshot.attributes,
                last_accessed: snapshot.last_accessed,
                max_inactive_secs: snapshot.max_inactive_secs,
                ref_count: 0,
                valid: snapshot.valid,
                is_new: false,
                user_name: snapshot.user_name,
                dirty: Dirty::default(),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    pub fn version(&self) -> u32 {
        self.state.lock().version
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_accessed(&self) -> u64 {
        self.state.lock().last_accessed
    }

    pub fn max_inactive_secs(&self) -> i64 {
        self.state.lock().max_inactive_secs
    }

    /// Number of requests currently holding this record.
    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// True until the first request holding the record releases it.
    pub fn is_new(&self) -> bool {
        self.state.lock().is_new
    }

    /// Throw-away record handed out while the table was full.
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    pub fn user_name(&self) -> Option<String> {
        self.state.lock().user_name.clone()
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.state.lock().attributes.get(name).cloned()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.state.lock().attributes.keys().cloned().collect()
    }

    /// Whether there are changes not yet written to the backing tier.
    pub fn is_dirty(&self) -> bool {
        !self.state.lock().dirty.is_empty()
    }

    /// Whether the record is valid, idle and past its deadline at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        let state = self.state.lock();
        state.valid && expired(state.last_accessed, state.max_inactive_secs, now)
    }

    /// Invalidate the record if it is reapable at `now`, as one step.
    ///
    /// Returns `true` when this call expired it.
    pub(crate) fn expire_if_reapable(&self, now: u64) -> bool {
        let mut state = self.state.lock();
        if state.valid
            && state.ref_count == 0
            && expired(state.last_accessed, state.max_inactive_secs, now)
        {
            state.valid = false;
            return true;
        }
        false
    }

    pub(crate) fn set_attribute(&self, name: &str, value: Value) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(SessionError::Invalidated(state.id.clone()));
        }
        state.dirty.removed.remove(name);
        state.dirty.changed.insert(name.to_string());
        Ok(state.attributes.insert(name.to_string(), value))
    }

    pub(crate) fn remove_attribute(&self, name: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(SessionError::Invalidated(state.id.clone()));
        }
        let old = state.attributes.remove(name);
        if old.is_some() {
            state.dirty.changed.remove(name);
            state.dirty.removed.insert(name.to_string());
        }
        Ok(old)
    }

    pub(crate) fn set_max_inactive_secs(&self, secs: i64) {
        let mut state = self.state.lock();
        if state.max_inactive_secs != secs {
            state.max_inactive_secs = secs;
            state.dirty.max_inactive = true;
        }
    }

    pub(crate) fn set_user_name(&self, user: Option<String>) {
        self.state.lock().user_name = user;
    }

    pub(crate) fn set_id(&self, id: String, version: u32) {
        let mut state = self.state.lock();
        state.id = id;
        state.version = version;
    }

    /// Take one reference. Returns `false` when the record is no longer valid.
    pub(crate) fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if !state.valid {
            return false;
        }
        state.ref_count += 1;
        true
    }

    /// Drop one reference and, if still valid, record the access.
    pub(crate) fn release(&self, now: u64) -> Released {
        let mut state = self.state.lock();
        debug_assert!(state.ref_count > 0, "released a session with no references");
        if state.ref_count == 0 {
            error!(session_id = %state.id, "Release of session with zero references");
        } else {
            state.ref_count -= 1;
        }
        if state.valid {
            state.last_accessed = state.last_accessed.max(now);
            state.is_new = false;
        }
        Released {
            ref_count: state.ref_count,
            valid: state.valid,
        }
    }

    /// Move the last-access time forward without touching the reference count.
    pub(crate) fn touch(&self, now: u64) {
        let mut state = self.state.lock();
        if state.valid {
            state.last_accessed = state.last_accessed.max(now);
        }
    }

    /// Mark the record invalid. Returns `true` only for the call that flipped it.
    pub(crate) fn invalidate(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.valid, false)
    }

    /// Full snapshot, leaving dirty tracking untouched.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        self.build_snapshot(&state, state.attributes.clone(), Vec::new(), true)
    }

    /// Snapshot for a write and clear dirty tracking.
    ///
    /// Returns `None` when nothing changed and `force` is false.
    pub(crate) fn take_write(&self, contents: WriteContents, force: bool) -> Option<SessionSnapshot> {
        let mut state = self.state.lock();
        if state.dirty.is_empty() && !force {
            return None;
        }
        let dirty = std::mem::take(&mut state.dirty);
        let snapshot = match contents {
            WriteContents::All => {
                self.build_snapshot(&state, state.attributes.clone(), Vec::new(), true)
            }
            WriteContents::OnlyUpdated => {
                let changed = dirty
                    .changed
                    .iter()
                    .filter_map(|name| {
                        state
                            .attributes
                            .get(name)
                            .map(|v| (name.clone(), v.clone()))
                    })
                    .collect();
                let removed = dirty.removed.into_iter().collect();
                self.build_snapshot(&state, changed, removed, false)
            }
        };
        Some(snapshot)
    }

    fn build_snapshot(
        &self,
        state: &SessionState,
        attributes: HashMap<String, Value>,
        removed: Vec<String>,
        full: bool,
    ) -> SessionSnapshot {
        SessionSnapshot {
            id: state.id.clone(),
            version: state.version,
            app_name: self.app_name.clone(),
            created_at: self.created_at,
            last_accessed: state.last_accessed,
            max_inactive_secs: state.max_inactive_secs,
            valid: state.valid,
            user_name: state.user_name.clone(),
            attributes,
            removed,
            full,
        }
    }
}
