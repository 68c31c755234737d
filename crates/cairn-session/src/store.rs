//! The in-memory session table for one manager.
//!
//! The store owns the existence of every live record. Lookups that miss the
//! table fall through to the [`BackingStore`]; creation, removal and the
//! timeout sweep keep both tiers in step.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Timelike;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::backing::BackingStore;
use crate::clock::Clock;
use crate::codec::next_version;
use crate::config::{SessionManagerConfig, WriteContents, WritePolicy};
use crate::error::{Result, SessionError};
use crate::events::SessionEvents;
use crate::session::{Released, Session};

/// Outcome of [`SessionStore::create_session`].
#[derive(Debug, Clone)]
pub enum Creation {
    /// A new record was created by this call.
    Created(Arc<Session>),
    /// A live record already existed under the id.
    Joined(Arc<Session>),
    /// A fresh id was requested but the id is already taken.
    Collision,
}

/// Store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Records in the in-memory table.
    pub live: usize,
    /// Overflow records currently handed out.
    pub overflow: usize,
    pub created: u64,
    pub destroyed: u64,
    pub timed_out: u64,
}

/// Result of one invalidation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records expired from memory.
    pub expired: usize,
    /// Records the backing tier expired on its own.
    pub backing_expired: usize,
    /// Cached access times written before the scan.
    pub access_times_written: usize,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    timed_out: AtomicU64,
    overflow_live: AtomicUsize,
}

/// Whether `hour` is one of the configured invalidation hours.
pub fn within_hours(hours: Option<[u8; 2]>, hour: u8) -> bool {
    hours.is_none_or(|[first, second]| hour == first || hour == second)
}

/// Table of live records for one session manager.
pub struct SessionStore {
    app_name: String,
    table: RwLock<HashMap<String, Arc<Session>>>,
    backing: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    events: Arc<SessionEvents>,
    capacity: usize,
    allow_overflow: bool,
    max_inactive_secs: i64,
    write_policy: WritePolicy,
    write_contents: WriteContents,
    scheduled_hours: Option<[u8; 2]>,
    pending_access: Mutex<HashMap<String, u64>>,
    recently_invalidated: Mutex<VecDeque<(String, u32)>>,
    recently_invalidated_cap: usize,
    counters: Counters,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("app_name", &self.app_name)
            .field("backing", &self.backing.backend_name())
            .field("live", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(
        config: &SessionManagerConfig,
        backing: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
        events: Arc<SessionEvents>,
    ) -> Self {
        Self {
            app_name: config.app_name.clone(),
            table: RwLock::new(HashMap::new()),
            backing,
            clock,
            events,
            capacity: config.max_in_memory,
            allow_overflow: config.allow_overflow,
            max_inactive_secs: config.max_inactive_secs,
            write_policy: config.write_policy,
            write_contents: config.write_contents,
            scheduled_hours: config.scheduled_invalidation,
            pending_access: Mutex::new(HashMap::new()),
            recently_invalidated: Mutex::new(VecDeque::new()),
            recently_invalidated_cap: config.recently_invalidated,
            counters: Counters::default(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn backend_name(&self) -> &'static str {
        self.backing.backend_name()
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    /// Default inactivity timeout for new records.
    pub fn max_inactive_secs(&self) -> i64 {
        self.max_inactive_secs
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Effective capacity: the smaller of ours and the backing tier's.
    pub fn capacity(&self) -> usize {
        self.backing
            .capacity()
            .map_or(self.capacity, |c| c.min(self.capacity))
    }

    /// Ids in the in-memory table.
    pub fn ids(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }

    /// Record in the in-memory table, without consulting the backing tier.
    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.table.read().get(id).cloned()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live: self.len(),
            overflow: self.counters.overflow_live.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Create a record under `id`.
    ///
    /// Unless `force_new_id` is set, a live record already stored under `id`
    /// is returned as [`Creation::Joined`]. With `force_new_id`, any existing
    /// use of the id is a [`Creation::Collision`]. A full table yields an
    /// overflow record when overflow is enabled.
    pub fn create_session(
        &self,
        id: &str,
        version: Option<u32>,
        force_new_id: bool,
    ) -> Result<Creation> {
        if force_new_id && self.backing_knows(id) {
            return Ok(Creation::Collision);
        }

        let now = self.now();
        let capacity = self.capacity();
        let session = {
            let mut table = self.table.write();
            if let Some(existing) = table.get(id) {
                if force_new_id {
                    return Ok(Creation::Collision);
                }
                if existing.is_valid() {
                    trace!(session_id = %id, "Joining existing session");
                    return Ok(Creation::Joined(Arc::clone(existing)));
                }
            } else if table.len() >= capacity {
                drop(table);
                return self.overflow(id, version.unwrap_or(0), now, capacity);
            }

            let version = self.take_version(id, version);
            let session = Arc::new(Session::new(
                id,
                version,
                self.app_name.as_str(),
                now,
                self.max_inactive_secs,
                false,
            ));
            table.insert(id.to_string(), Arc::clone(&session));
            session
        };

        if let Err(e) = self.backing.create(&session.snapshot()) {
            self.remove_if_current(id, &session);
            return Err(e);
        }

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(
            session_id = %id,
            version = session.version(),
            app = %self.app_name,
            "Session created"
        );
        Ok(Creation::Created(session))
    }

    fn overflow(&self, id: &str, version: u32, now: u64, capacity: usize) -> Result<Creation> {
        if !self.allow_overflow {
            warn!(app = %self.app_name, capacity, "Session table full, no session available");
            return Err(SessionError::CapacityExhausted { capacity });
        }
        warn!(
            session_id = %id,
            app = %self.app_name,
            capacity,
            "Session table full, handing out overflow session"
        );
        self.counters.overflow_live.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(Creation::Created(Arc::new(Session::new(
            id,
            version,
            self.app_name.as_str(),
            now,
            self.max_inactive_secs,
            true,
        ))))
    }

    /// Version for a new record under `id`, bumped past a recent invalidation.
    fn take_version(&self, id: &str, requested: Option<u32>) -> u32 {
        let requested = requested.unwrap_or(0);
        let mut recent = self.recently_invalidated.lock();
        match recent.iter().position(|(r, _)| r == id) {
            Some(pos) => {
                let old = recent.remove(pos).map_or(0, |(_, v)| v);
                next_version(requested.max(old))
            }
            None => requested,
        }
    }

    fn remember_invalidated(&self, id: &str, version: u32) {
        if self.recently_invalidated_cap == 0 {
            return;
        }
        let mut recent = self.recently_invalidated.lock();
        recent.retain(|(r, _)| r != id);
        if recent.len() >= self.recently_invalidated_cap {
            recent.pop_front();
        }
        recent.push_back((id.to_string(), version));
    }

    fn is_recently_invalidated(&self, id: &str) -> bool {
        self.recently_invalidated
            .lock()
            .iter()
            .any(|(r, _)| r == id)
    }

    fn backing_knows(&self, id: &str) -> bool {
        self.backing.id_exists(id).unwrap_or_else(|e| {
            warn!(session_id = %id, error = %e, "Backing id lookup failed");
            false
        })
    }

    /// Look up a record, loading it from the backing tier on a miss.
    ///
    /// Returns `None` when the stored version is older than `version`.
    pub fn get(&self, id: &str, version: u32) -> Option<Arc<Session>> {
        let session = match self.lookup(id) {
            Some(session) => session,
            None => self.materialize(id)?,
        };
        if session.version() < version {
            debug!(
                session_id = %id,
                stored = session.version(),
                requested = version,
                "Stored session is older than requested version"
            );
            return None;
        }
        Some(session)
    }

    fn materialize(&self, id: &str) -> Option<Arc<Session>> {
        if self.is_recently_invalidated(id) {
            return None;
        }
        let snapshot = match self.backing.get(id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Backing lookup failed");
                return None;
            }
        };
        if !snapshot.valid || snapshot.is_expired(self.now()) {
            return None;
        }

        let loaded = Arc::new(Session::from_snapshot(snapshot));
        let session = Arc::clone(
            self.table
                .write()
                .entry(id.to_string())
                .or_insert(loaded),
        );
        debug!(session_id = %id, backend = self.backend_name(), "Session loaded from backing tier");
        Some(session)
    }

    /// Whether `id` names a live session in memory or in the backing tier.
    pub fn id_exists(&self, id: &str) -> bool {
        if self.is_recently_invalidated(id) {
            return false;
        }
        match self.lookup(id) {
            Some(session) => session.is_valid(),
            None => self.backing_knows(id),
        }
    }

    /// Bookkeeping after a request dropped its reference.
    pub(crate) fn release(&self, session: &Arc<Session>, released: Released) {
        if released.ref_count > 0 {
            return;
        }
        if session.is_overflow() {
            if session.invalidate() {
                self.events.session_destroyed(session);
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.overflow_live.fetch_sub(1, Ordering::Relaxed);
            trace!(session_id = %session.id(), "Overflow session discarded");
            return;
        }
        if !released.valid {
            self.remove(session);
        }
    }

    /// Invalidate a record and notify listeners.
    ///
    /// The record leaves the table once no request holds it, or immediately
    /// when `force` is set. Returns `false` if it was already invalid.
    pub fn invalidate(&self, session: &Arc<Session>, force: bool) -> bool {
        if !session.invalidate() {
            return false;
        }
        debug!(session_id = %session.id(), force, "Session invalidated");
        self.finish_invalidation(session, force, false);
        true
    }

    fn finish_invalidation(&self, session: &Arc<Session>, force: bool, by_timeout: bool) {
        if !session.is_overflow() {
            self.remember_invalidated(&session.id(), session.version());
        }
        if by_timeout {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            self.events.session_destroyed_by_timeout(session);
        }
        self.events.session_destroyed(session);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);

        if force || session.ref_count() == 0 {
            self.remove(session);
        }
    }

    /// Remove `session` from both tiers if it is still the record under its id.
    fn remove(&self, session: &Arc<Session>) -> bool {
        let id = session.id();
        if !self.remove_if_current(&id, session) {
            return false;
        }
        self.pending_access.lock().remove(&id);
        if let Err(e) = self.backing.release(&id) {
            warn!(session_id = %id, error = %e, "Backing release failed");
        }
        trace!(session_id = %id, "Session removed");
        true
    }

    fn remove_if_current(&self, id: &str, session: &Arc<Session>) -> bool {
        let mut table = self.table.write();
        match table.get(id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                table.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Expire idle records past their deadline.
    ///
    /// Cached access times are written first; expiry itself is skipped
    /// outside the scheduled invalidation hours.
    pub fn run_invalidation_sweep(&self) -> SweepReport {
        let now = self.now();
        let mut report = SweepReport::default();

        if !self.write_policy.writes_on_release() {
            report.access_times_written = self.write_cached_access_times();
        }

        let hour = chrono::Local::now().hour() as u8;
        if !within_hours(self.scheduled_hours, hour) {
            trace!(app = %self.app_name, hour, "Outside scheduled invalidation hours");
            return report;
        }

        let sessions: Vec<Arc<Session>> = self.table.read().values().cloned().collect();
        for session in sessions {
            if session.expire_if_reapable(now) {
                debug!(session_id = %session.id(), "Session timed out");
                self.finish_invalidation(&session, false, true);
                report.expired += 1;
            }
        }

        match self.backing.run_invalidation_sweep(now) {
            Ok(ids) => report.backing_expired = ids.len(),
            Err(e) => error!(app = %self.app_name, error = %e, "Backing invalidation sweep failed"),
        }

        if report.expired > 0 || report.backing_expired > 0 {
            debug!(
                app = %self.app_name,
                expired = report.expired,
                backing_expired = report.backing_expired,
                "Invalidation sweep finished"
            );
        }
        report
    }

    /// Remember an access time to be written later.
    pub(crate) fn cache_last_access(&self, session: &Session) {
        if session.is_overflow() {
            return;
        }
        self.pending_access
            .lock()
            .insert(session.id(), session.last_accessed());
    }

    fn write_cached_access_times(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_access.lock());
        let count = pending.len();
        for (id, last_accessed) in pending {
            if let Err(e) = self.backing.write_last_access(&id, last_accessed) {
                error!(session_id = %id, error = %e, "Writing cached access time failed");
            }
        }
        count
    }

    /// Push a record's pending changes to the backing tier.
    ///
    /// With `force`, a write happens even if nothing is dirty. Returns whether
    /// anything was written.
    pub fn write_session(&self, session: &Session, force: bool) -> Result<bool> {
        if session.is_overflow() || !session.is_valid() {
            return Ok(false);
        }
        let Some(snapshot) = session.take_write(self.write_contents, force) else {
            return Ok(false);
        };
        self.pending_access.lock().remove(&snapshot.id);
        trace!(session_id = %snapshot.id, full = snapshot.full, "Writing session");
        self.backing.write(snapshot)?;
        Ok(true)
    }

    /// Write every dirty record and all cached access times.
    pub fn flush_dirty(&self) -> Result<usize> {
        self.write_cached_access_times();
        let sessions: Vec<Arc<Session>> = self.table.read().values().cloned().collect();
        let snapshots: Vec<_> = sessions
            .iter()
            .filter(|s| s.is_valid())
            .filter_map(|s| s.take_write(self.write_contents, false))
            .collect();
        let count = snapshots.len();
        if count > 0 {
            self.backing.run_periodic_flush(snapshots)?;
            trace!(app = %self.app_name, count, "Flushed dirty sessions");
        }
        Ok(count)
    }

    /// Move a record's last-access time to now.
    ///
    /// Returns `false` if no live record matches `id` (and `version`, when given).
    pub fn refresh_last_access(&self, id: &str, version: Option<u32>) -> bool {
        let Some(session) = self.lookup(id) else {
            return false;
        };
        if !session.is_valid() || version.is_some_and(|v| session.version() < v) {
            return false;
        }
        session.touch(self.now());
        if self.write_policy.writes_on_release() {
            if let Err(e) = self.backing.write_last_access(id, session.last_accessed()) {
                warn!(session_id = %id, error = %e, "Writing access time failed");
            }
        } else {
            self.cache_last_access(&session);
        }
        true
    }

    /// Re-index `session` under `new_id`. Returns the previous id.
    pub fn rekey(&self, session: &Arc<Session>, new_id: &str) -> Result<String> {
        let old_id = session.id();
        if session.is_overflow() {
            session.set_id(new_id.to_string(), 0);
            return Ok(old_id);
        }

        {
            let mut table = self.table.write();
            if table.contains_key(new_id) {
                return Err(SessionError::IdGeneration { attempts: 1 });
            }
            if table
                .get(&old_id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                table.remove(&old_id);
            }
            session.set_id(new_id.to_string(), 0);
            table.insert(new_id.to_string(), Arc::clone(session));
        }

        if let Some(last_accessed) = self.pending_access.lock().remove(&old_id) {
            self.pending_access
                .lock()
                .insert(new_id.to_string(), last_accessed);
        }
        self.backing.release(&old_id)?;
        self.backing.create(&session.snapshot())?;
        Ok(old_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{NoPersistence, SnapshotStore};
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: SessionStore,
        clock: Arc<ManualClock>,
        backing: SnapshotStore,
        events: Arc<SessionEvents>,
    }

    fn fixture(config: SessionManagerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let backing = SnapshotStore::new();
        let events = Arc::new(SessionEvents::new());
        let store = SessionStore::new(
            &config,
            Arc::new(backing.clone()),
            clock.clone(),
            Arc::clone(&events),
        );
        Fixture {
            store,
            clock,
            backing,
            events,
        }
    }

    fn created(c: Creation) -> Arc<Session> {
        match c {
            Creation::Created(s) => s,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn test_create_then_join() {
        let f = fixture(SessionManagerConfig::new("app"));
        let first = created(f.store.create_session("s1", None, false).unwrap());
        match f.store.create_session("s1", None, false).unwrap() {
            Creation::Joined(joined) => assert!(Arc::ptr_eq(&first, &joined)),
            other => panic!("expected Joined, got {other:?}"),
        }
        assert!(f.backing.id_exists("s1").unwrap());
        assert_eq!(f.store.stats().created, 1);
    }

    #[test]
    fn test_force_new_id_collides() {
        let f = fixture(SessionManagerConfig::new("app"));
        f.store.create_session("s1", None, false).unwrap();
        assert!(matches!(
            f.store.create_session("s1", None, true).unwrap(),
            Creation::Collision
        ));
    }

    #[test]
    fn test_full_table_hands_out_overflow() {
        let f = fixture(SessionManagerConfig::new("app").with_max_in_memory(1));
        f.store.create_session("a", None, false).unwrap();
        let overflow = created(f.store.create_session("b", None, false).unwrap());

        assert!(overflow.is_overflow());
        assert_eq!(f.store.len(), 1);
        assert!(!f.backing.id_exists("b").unwrap());
        assert_eq!(f.store.stats().overflow, 1);

        overflow.acquire();
        let released = overflow.release(f.clock.now_millis());
        f.store.release(&overflow, released);
        assert!(!overflow.is_valid());
        assert_eq!(f.store.stats().overflow, 0);
    }

    #[test]
    fn test_full_table_without_overflow_fails() {
        let f = fixture(
            SessionManagerConfig::new("app")
                .with_max_in_memory(1)
                .with_overflow(false),
        );
        f.store.create_session("a", None, false).unwrap();
        assert!(matches!(
            f.store.create_session("b", None, false),
            Err(SessionError::CapacityExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn test_get_version_rule() {
        let f = fixture(SessionManagerConfig::new("app"));
        f.store.create_session("s1", Some(3), false).unwrap();
        assert!(f.store.get("s1", 2).is_some());
        assert!(f.store.get("s1", 3).is_some());
        assert!(f.store.get("s1", 4).is_none());
    }

    #[test]
    fn test_recently_invalidated_bumps_version() {
        let f = fixture(SessionManagerConfig::new("app"));
        let s = created(f.store.create_session("s1", Some(2), false).unwrap());
        assert!(f.store.invalidate(&s, false));
        assert!(!f.store.invalidate(&s, false));

        assert!(!f.store.id_exists("s1"));
        assert!(f.store.lookup("s1").is_none());

        let again = created(f.store.create_session("s1", None, false).unwrap());
        assert_eq!(again.version(), 3);
        assert!(f.store.id_exists("s1"));
    }

    #[test]
    fn test_invalidate_defers_removal_while_referenced() {
        let f = fixture(SessionManagerConfig::new("app"));
        let s = created(f.store.create_session("s1", None, false).unwrap());
        s.acquire();

        f.store.invalidate(&s, false);
        assert!(f.store.lookup("s1").is_some());

        let released = s.release(f.clock.now_millis());
        f.store.release(&s, released);
        assert!(f.store.lookup("s1").is_none());
        assert!(!f.backing.id_exists("s1").unwrap());
    }

    #[test]
    fn test_get_materializes_from_backing() {
        let config = SessionManagerConfig::new("app");
        let f = fixture(config.clone());
        let s = created(f.store.create_session("s1", None, false).unwrap());
        s.set_attribute("cart", json!(["pear"])).unwrap();
        f.store.write_session(&s, false).unwrap();

        let restarted = SessionStore::new(
            &config,
            Arc::new(f.backing.clone()),
            f.clock.clone(),
            Arc::new(SessionEvents::new()),
        );
        let loaded = restarted.get("s1", 0).unwrap();
        assert_eq!(loaded.attribute("cart"), Some(json!(["pear"])));
        assert!(!loaded.is_new());
        assert_eq!(restarted.len(), 1);
    }

    #[test]
    fn test_expired_backing_snapshot_is_not_loaded() {
        let config = SessionManagerConfig::new("app").with_max_inactive_secs(1);
        let f = fixture(config.clone());
        f.store.create_session("s1", None, false).unwrap();
        f.clock.advance(Duration::from_secs(5));

        let other = SessionStore::new(
            &config,
            Arc::new(f.backing.clone()),
            f.clock.clone(),
            Arc::new(SessionEvents::new()),
        );
        assert!(other.get("s1", 0).is_none());
    }

    #[test]
    fn test_sweep_skips_referenced_sessions() {
        let f = fixture(SessionManagerConfig::new("app").with_max_inactive_secs(1));
        let held = created(f.store.create_session("held", None, false).unwrap());
        let idle = created(f.store.create_session("idle", None, false).unwrap());
        held.acquire();

        let timeouts = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&timeouts);
        f.events.on_destroyed_by_timeout(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        f.clock.advance(Duration::from_secs(10));
        let report = f.store.run_invalidation_sweep();

        assert_eq!(report.expired, 1);
        assert!(!idle.is_valid());
        assert!(held.is_valid());
        assert!(f.store.lookup("held").is_some());
        assert!(f.store.lookup("idle").is_none());
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        f.store.run_invalidation_sweep();
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.stats().timed_out, 1);
    }

    #[test]
    fn test_sweep_writes_cached_access_times() {
        let f = fixture(
            SessionManagerConfig::new("app")
                .with_write_policy(WritePolicy::Manual)
                .with_max_inactive_secs(0),
        );
        let s = created(f.store.create_session("s1", None, false).unwrap());
        s.acquire();
        f.clock.advance(Duration::from_secs(30));
        s.release(f.clock.now_millis());
        f.store.cache_last_access(&s);

        let report = f.store.run_invalidation_sweep();
        assert_eq!(report.access_times_written, 1);
        assert_eq!(f.backing.snapshot("s1").unwrap().last_accessed, 31_000);
    }

    #[test]
    fn test_flush_dirty_writes_only_changed() {
        let f = fixture(SessionManagerConfig::new("app"));
        let a = created(f.store.create_session("a", None, false).unwrap());
        f.store.create_session("b", None, false).unwrap();
        a.set_attribute("k", json!("v")).unwrap();

        assert_eq!(f.store.flush_dirty().unwrap(), 1);
        assert_eq!(f.backing.snapshot("a").unwrap().attributes["k"], json!("v"));
        assert_eq!(f.store.flush_dirty().unwrap(), 0);
    }

    #[test]
    fn test_refresh_last_access() {
        let f = fixture(SessionManagerConfig::new("app"));
        let s = created(f.store.create_session("s1", Some(1), false).unwrap());
        f.clock.advance(Duration::from_secs(3));

        assert!(!f.store.refresh_last_access("s1", Some(2)));
        assert!(f.store.refresh_last_access("s1", None));
        assert_eq!(s.last_accessed(), 4_000);
        assert_eq!(f.backing.snapshot("s1").unwrap().last_accessed, 4_000);
        assert!(!f.store.refresh_last_access("missing", None));
    }

    #[test]
    fn test_rekey_moves_both_tiers() {
        let f = fixture(SessionManagerConfig::new("app"));
        let s = created(f.store.create_session("old", None, false).unwrap());
        let previous = f.store.rekey(&s, "new").unwrap();

        assert_eq!(previous, "old");
        assert_eq!(s.id(), "new");
        assert!(f.store.lookup("old").is_none());
        assert!(Arc::ptr_eq(&f.store.lookup("new").unwrap(), &s));
        assert!(!f.backing.id_exists("old").unwrap());
        assert!(f.backing.id_exists("new").unwrap());
    }

    #[test]
    fn test_capacity_uses_smaller_limit() {
        struct Small;
        impl BackingStore for Small {
            fn backend_name(&self) -> &'static str {
                "small"
            }
            fn create(&self, s: &crate::SessionSnapshot) -> Result<()> {
                NoPersistence.create(s)
            }
            fn get(&self, _id: &str) -> Result<Option<crate::SessionSnapshot>> {
                Ok(None)
            }
            fn id_exists(&self, _id: &str) -> Result<bool> {
                Ok(false)
            }
            fn write(&self, _s: crate::SessionSnapshot) -> Result<()> {
                Ok(())
            }
            fn write_last_access(&self, _id: &str, _t: u64) -> Result<()> {
                Ok(())
            }
            fn release(&self, _id: &str) -> Result<()> {
                Ok(())
            }
            fn run_invalidation_sweep(&self, _now: u64) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn capacity(&self) -> Option<usize> {
                Some(2)
            }
        }

        let store = SessionStore::new(
            &SessionManagerConfig::new("app"),
            Arc::new(Small),
            Arc::new(ManualClock::new(0)),
            Arc::new(SessionEvents::new()),
        );
        assert_eq!(store.capacity(), 2);
    }

    #[test]
    fn test_within_hours() {
        assert!(within_hours(None, 13));
        assert!(within_hours(Some([2, 3]), 3));
        assert!(!within_hours(Some([2, 3]), 4));
    }
}
