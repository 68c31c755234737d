//! The session manager: obtaining, releasing and re-keying sessions for
//! requests.
//!
//! A manager ties together the store, the affinity manager, the write policy
//! and the invalidator for one application (or one shared context). Requests
//! get a [`SessionHandle`] from [`SessionManager::obtain_session`]; dropping
//! or releasing the handle gives the reference back.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::affinity::{AffinityContext, AffinityManager};
use crate::backing::{BackingStore, NoPersistence};
use crate::clock::{Clock, SystemClock};
use crate::config::{RuntimeSettings, SessionManagerConfig};
use crate::error::{Result, SessionError};
use crate::events::SessionEvents;
use crate::id_gen::{IdGenerator, RandomIdGenerator};
use crate::invalidator::{self, Invalidator, sweep_interval};
use crate::locks::CreationLocks;
use crate::session::Session;
use crate::storer::{self, Storer};
use crate::store::{Creation, SessionStore, StoreStats, SweepReport};

/// Attempts at generating an unused id before giving up.
const MAX_ID_ATTEMPTS: u32 = 10;

/// Attempts at joining a reused id whose record keeps being invalidated.
const MAX_JOIN_ATTEMPTS: u32 = 3;

/// Authorization hook for existing sessions. The engine asks, never decides.
pub trait AccessCheck: Send + Sync {
    /// Whether `principal` may use `session`.
    fn check(&self, session: &Session, principal: Option<&str>) -> bool;
}

/// Access check that allows every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn check(&self, _session: &Session, _principal: Option<&str>) -> bool {
        true
    }
}

/// Point-in-time manager statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub app_name: String,
    pub backend: &'static str,
    pub write_policy: String,
    pub sweep_interval_secs: Option<u64>,
    #[serde(flatten)]
    pub store: StoreStats,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: SessionManagerConfig,
    backing: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    access_check: Arc<dyn AccessCheck>,
    events: Option<Arc<SessionEvents>>,
}

impl SessionManagerBuilder {
    pub fn with_backing(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.backing = backing;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    pub fn with_access_check(mut self, check: Arc<dyn AccessCheck>) -> Self {
        self.access_check = check;
        self
    }

    /// Share an event dispatcher, e.g. between managers of one shared context.
    pub fn with_events(mut self, events: Arc<SessionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the manager. Background tasks start with [`SessionManager::start`].
    ///
    /// The pool reaper backend binds to the tokio runtime current at this call.
    pub fn build(self) -> SessionManager {
        let config = self.config;
        let events = self.events.unwrap_or_default();
        let store = Arc::new(SessionStore::new(
            &config,
            self.backing,
            self.clock,
            Arc::clone(&events),
        ));
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(RandomIdGenerator::new(config.id_length)));

        SessionManager {
            affinity: AffinityManager::new(&config),
            storer: storer::for_policy(config.write_policy, config.reaper_backend),
            invalidator: invalidator::for_backend(
                config.reaper_backend,
                config.invalidator_start_delay,
            ),
            derived_interval: sweep_interval(config.max_inactive_secs),
            runtime: RwLock::new(config.runtime.clone()),
            running: AtomicBool::new(false),
            locks: CreationLocks::new(),
            access_check: self.access_check,
            id_generator,
            events,
            store,
            config,
        }
    }
}

/// Orchestrates session lifecycle for one application.
pub struct SessionManager {
    config: SessionManagerConfig,
    store: Arc<SessionStore>,
    affinity: AffinityManager,
    events: Arc<SessionEvents>,
    id_generator: Arc<dyn IdGenerator>,
    access_check: Arc<dyn AccessCheck>,
    locks: CreationLocks,
    storer: Box<dyn Storer>,
    invalidator: Box<dyn Invalidator>,
    derived_interval: Duration,
    runtime: RwLock<RuntimeSettings>,
    running: AtomicBool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("app_name", &self.config.app_name)
            .field("store", &self.store)
            .field("write_policy", &self.storer.policy())
            .field("invalidator", &self.invalidator.backend())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Builder over a memory-only backing tier and the system clock.
    pub fn builder(config: SessionManagerConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            backing: Arc::new(NoPersistence),
            clock: Arc::new(SystemClock::new()),
            id_generator: None,
            access_check: Arc::new(AllowAll),
            events: None,
        }
    }

    /// Memory-only manager with default collaborators.
    pub fn new(config: SessionManagerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn events(&self) -> &Arc<SessionEvents> {
        &self.events
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn affinity(&self) -> &AffinityManager {
        &self.affinity
    }

    pub fn runtime(&self) -> RuntimeSettings {
        self.runtime.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The sweep period in effect: the override if set, otherwise the one
    /// derived from the timeout when the manager was built.
    pub fn sweep_period(&self) -> Duration {
        self.runtime
            .read()
            .reaper_interval
            .unwrap_or(self.derived_interval)
    }

    /// Start the invalidator and the write policy's background work.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let started = self
            .storer
            .start(Arc::clone(&self.store))
            .and_then(|()| {
                self.invalidator
                    .start(Arc::clone(&self.store), self.sweep_period())
            });
        if let Err(e) = started {
            self.storer.stop();
            self.running.store(false, Ordering::Release);
            return Err(e);
        }
        info!(
            app = %self.config.app_name,
            write_policy = %self.storer.policy(),
            invalidator = self.invalidator.backend(),
            sweep_secs = self.sweep_period().as_secs(),
            "Session manager started"
        );
        Ok(())
    }

    /// Stop background work. An in-flight sweep or flush is allowed to
    /// finish first, so async callers should run this on a blocking thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.invalidator.stop();
        self.storer.stop();
        info!(app = %self.config.app_name, "Session manager stopped");
    }

    /// Apply hot-reloadable settings. A changed sweep period restarts the
    /// invalidator when it is running, waiting for an in-flight sweep.
    pub fn apply_runtime(&self, settings: RuntimeSettings) -> Result<()> {
        let previous = std::mem::replace(&mut *self.runtime.write(), settings.clone());
        if previous.clone_id != settings.clone_id {
            self.affinity.set_clone_id(settings.clone_id.clone());
            info!(
                app = %self.config.app_name,
                clone_id = settings.clone_id.as_deref().unwrap_or("<none>"),
                "Clone id changed"
            );
        }
        if previous.reaper_interval != settings.reaper_interval && self.is_running() {
            let period = self.sweep_period();
            self.invalidator.start(Arc::clone(&self.store), period)?;
            info!(
                app = %self.config.app_name,
                sweep_secs = period.as_secs(),
                "Invalidator rescheduled"
            );
        }
        Ok(())
    }

    /// Find or create the session for a request.
    ///
    /// Candidates in `ctx` are tried in order until one names a live record.
    /// Failing that, a session is created when `allow_create` is set,
    /// reusing the incoming id when reuse applies. Returns `Ok(None)` when no
    /// session exists and creation is not allowed.
    pub fn obtain_session(
        &self,
        ctx: &mut AffinityContext,
        allow_create: bool,
    ) -> Result<Option<SessionHandle<'_>>> {
        let mut first_seen: Option<(String, u32)> = None;
        loop {
            if let Some((id, version)) = self.affinity.in_use_id(ctx) {
                if let Some(handle) = self.join_existing(&id, version, ctx)? {
                    ctx.set_response(&id, handle.version());
                    return Ok(Some(handle));
                }
                first_seen.get_or_insert((id, version));
            }
            if ctx.response().is_some() || !self.affinity.set_next_id(ctx) {
                break;
            }
        }

        if !allow_create {
            trace!(app = %self.config.app_name, "No session and creation not allowed");
            return Ok(None);
        }

        let reuse =
            self.config.id_reuse || ctx.response().is_some() || ctx.transport_unique;
        let reused = first_seen.filter(|_| reuse);
        let (session, created) = match &reused {
            Some((id, version)) => self.create_or_join(id, *version, ctx)?,
            None => self.create_fresh()?,
        };

        if created {
            self.events.session_created(&session);
        } else {
            self.events.session_accessed(&session);
        }
        ctx.set_response(&session.id(), session.version());
        Ok(Some(SessionHandle::new(self, session, created)))
    }

    fn join_existing(
        &self,
        id: &str,
        version: u32,
        ctx: &AffinityContext,
    ) -> Result<Option<SessionHandle<'_>>> {
        let Some(session) = self.store.get(id, version) else {
            return Ok(None);
        };
        if !session.is_valid() {
            return Ok(None);
        }
        if !self.access_check.check(&session, ctx.principal.as_deref()) {
            warn!(session_id = %id, "Access check refused session");
            return Err(SessionError::Unauthorized { id: id.to_string() });
        }
        if !session.acquire() {
            return Ok(None);
        }
        trace!(session_id = %id, ref_count = session.ref_count(), "Session accessed");
        self.events.session_accessed(&session);
        Ok(Some(SessionHandle::new(self, session, false)))
    }

    /// Create under a caller-supplied id, serialized per id so concurrent
    /// creators all end up with the same record.
    fn create_or_join(
        &self,
        id: &str,
        version: u32,
        ctx: &AffinityContext,
    ) -> Result<(Arc<Session>, bool)> {
        let version = (version > 0).then_some(version);
        let outcome = self.locks.with_lock(id, || {
            for _ in 0..MAX_JOIN_ATTEMPTS {
                match self.store.create_session(id, version, false)? {
                    Creation::Created(session) => {
                        session.acquire();
                        return Ok((session, true));
                    }
                    Creation::Joined(session) => {
                        if session.acquire() {
                            debug!(session_id = %id, "Lost creation race, joined existing session");
                            return Ok((session, false));
                        }
                    }
                    Creation::Collision => break,
                }
            }
            Err(SessionError::IdGeneration {
                attempts: MAX_JOIN_ATTEMPTS,
            })
        })?;

        let (session, created) = outcome;
        if !created && !self.access_check.check(&session, ctx.principal.as_deref()) {
            self.release_inner(&session);
            return Err(SessionError::Unauthorized { id: id.to_string() });
        }
        Ok((session, created))
    }

    fn create_fresh(&self) -> Result<(Arc<Session>, bool)> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = self.id_generator.next_id();
            match self.store.create_session(&id, None, true)? {
                Creation::Created(session) => {
                    session.acquire();
                    return Ok((session, true));
                }
                Creation::Joined(_) | Creation::Collision => {
                    warn!(attempt, "Generated session id already in use, retrying");
                }
            }
        }
        error!(
            app = %self.config.app_name,
            attempts = MAX_ID_ATTEMPTS,
            "Could not generate an unused session id"
        );
        Err(SessionError::IdGeneration {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Give back the request's reference. Safe to call more than once per
    /// handle.
    pub fn release_session(&self, handle: &SessionHandle<'_>) {
        handle.release();
    }

    fn release_inner(&self, session: &Arc<Session>) {
        let released = session.release(self.store.now());
        if released.valid
            && !session.is_overflow()
            && let Err(e) = self.storer.on_release(&self.store, session)
        {
            error!(session_id = %session.id(), error = %e, "Write on release failed");
        }
        self.store.release(session, released);
        trace!(
            session_id = %session.id(),
            ref_count = released.ref_count,
            "Session released"
        );
        self.events.session_released(session);
    }

    /// Give the session a fresh id, keeping its contents.
    ///
    /// Returns the new id; the outgoing id in `ctx` is updated.
    pub fn change_session_id(
        &self,
        handle: &SessionHandle<'_>,
        ctx: &mut AffinityContext,
    ) -> Result<String> {
        let session = handle.session();
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let new_id = self.id_generator.next_id();
            if self.store.id_exists(&new_id) {
                warn!(attempt, "Generated session id already in use, retrying");
                continue;
            }
            match self.store.rekey(session, &new_id) {
                Ok(old_id) => {
                    debug!(old_id = %old_id, session_id = %new_id, "Session id changed");
                    self.events.session_id_changed(session, &old_id);
                    ctx.set_response(&new_id, session.version());
                    return Ok(new_id);
                }
                Err(SessionError::IdGeneration { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::IdGeneration {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Invalidate the session stored under `id`, if any.
    pub fn invalidate_id(&self, id: &str, force: bool) -> bool {
        match self.store.lookup(id) {
            Some(session) => self.store.invalidate(&session, force),
            None => false,
        }
    }

    /// Touch the last-access time of a stored session.
    pub fn refresh_last_access(&self, id: &str, version: Option<u32>) -> bool {
        self.store.refresh_last_access(id, version)
    }

    /// Run one sweep now, outside the schedule.
    pub fn run_invalidation_sweep(&self) -> SweepReport {
        self.store.run_invalidation_sweep()
    }

    /// Outgoing token for the request's session, `None` when unsafe.
    pub fn encode_token(
        &self,
        ctx: &mut AffinityContext,
        handle: &SessionHandle<'_>,
    ) -> Option<String> {
        self.affinity.encode_token(ctx, handle.session())
    }

    /// `url` with the session token appended, or unchanged when unsafe.
    pub fn encode_url(
        &self,
        url: &str,
        ctx: &mut AffinityContext,
        handle: &SessionHandle<'_>,
    ) -> String {
        self.affinity.encode_url(url, ctx, handle.session())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            app_name: self.config.app_name.clone(),
            backend: self.store.backend_name(),
            write_policy: self.storer.policy().to_string(),
            sweep_interval_secs: self.invalidator.interval().map(|d| d.as_secs()),
            store: self.store.stats(),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A request's reference to a session.
///
/// Dereferences to the [`Session`] for reads; mutations go through the
/// handle so listeners are notified. The reference is given back on
/// [`SessionHandle::release`] or on drop, whichever comes first.
pub struct SessionHandle<'m> {
    manager: &'m SessionManager,
    session: Arc<Session>,
    created: bool,
    released: AtomicBool,
}

impl std::fmt::Debug for SessionHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .field("created", &self.created)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl<'m> SessionHandle<'m> {
    fn new(manager: &'m SessionManager, session: Arc<Session>, created: bool) -> Self {
        Self {
            manager,
            session,
            created,
            released: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether this request created the session.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let old = self.session.set_attribute(name, value.clone())?;
        self.manager
            .events
            .attribute_set(&self.session, name, old.as_ref(), &value);
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Value>> {
        let old = self.session.remove_attribute(name)?;
        if let Some(old) = &old {
            self.manager
                .events
                .attribute_removed(&self.session, name, old);
        }
        Ok(old)
    }

    pub fn set_max_inactive_secs(&self, secs: i64) {
        self.session.set_max_inactive_secs(secs);
    }

    pub fn set_user_name(&self, user: Option<String>) {
        self.session.set_user_name(user);
    }

    /// Invalidate the session. Returns `false` if it already was.
    pub fn invalidate(&self) -> bool {
        self.manager.store.invalidate(&self.session, false)
    }

    /// Write the session to the backing tier now.
    pub fn sync(&self) -> Result<()> {
        self.manager.storer.sync(&self.manager.store, &self.session)
    }

    /// Give the reference back. Later calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            trace!(session_id = %self.session.id(), "Session already released");
            return;
        }
        self.manager.release_inner(&self.session);
    }
}

impl Deref for SessionHandle<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionHandle<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
