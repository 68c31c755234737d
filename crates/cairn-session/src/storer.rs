//! Write policies: when a mutated record reaches the backing tier.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{ReaperBackend, WritePolicy};
use crate::error::Result;
use crate::schedule::{PeriodicTask, Scheduler};
use crate::session::Session;
use crate::store::SessionStore;

/// A write policy with a background lifecycle.
///
/// `start` and `stop` exist on every policy so the manager can treat them
/// uniformly; for the synchronous policies they do nothing.
pub trait Storer: Send + Sync {
    fn policy(&self) -> WritePolicy;

    /// Called when a request releases a record that is still valid.
    fn on_release(&self, store: &SessionStore, session: &Session) -> Result<()>;

    /// Explicit write requested by the application.
    fn sync(&self, store: &SessionStore, session: &Session) -> Result<()> {
        store.write_session(session, true).map(|_| ())
    }

    fn start(&self, store: Arc<SessionStore>) -> Result<()>;

    fn stop(&self);
}

/// Writes synchronously inside `release_session`.
#[derive(Debug, Default)]
pub struct EndOfServiceStorer;

impl Storer for EndOfServiceStorer {
    fn policy(&self) -> WritePolicy {
        WritePolicy::EndOfService
    }

    fn on_release(&self, store: &SessionStore, session: &Session) -> Result<()> {
        store.write_session(session, false).map(|_| ())
    }

    fn start(&self, _store: Arc<SessionStore>) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Writes only when the application calls `sync`.
#[derive(Debug, Default)]
pub struct ManualStorer;

impl Storer for ManualStorer {
    fn policy(&self) -> WritePolicy {
        WritePolicy::Manual
    }

    fn on_release(&self, store: &SessionStore, session: &Session) -> Result<()> {
        store.cache_last_access(session);
        Ok(())
    }

    fn start(&self, _store: Arc<SessionStore>) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Flushes every dirty record on a fixed period.
///
/// Stopping performs one last flush so a clean shutdown loses nothing.
#[derive(Debug)]
pub struct TimeBasedStorer {
    interval: Duration,
    backend: ReaperBackend,
    task: Mutex<Option<PeriodicTask>>,
    store: Mutex<Option<Arc<SessionStore>>>,
}

impl TimeBasedStorer {
    pub fn new(interval: Duration, backend: ReaperBackend) -> Self {
        Self {
            interval,
            backend,
            task: Mutex::new(None),
            store: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Storer for TimeBasedStorer {
    fn policy(&self) -> WritePolicy {
        WritePolicy::TimeBased {
            interval: self.interval,
        }
    }

    fn on_release(&self, store: &SessionStore, session: &Session) -> Result<()> {
        store.cache_last_access(session);
        Ok(())
    }

    fn start(&self, store: Arc<SessionStore>) -> Result<()> {
        let app = store.app_name().to_string();
        let flush_store = Arc::clone(&store);
        let task = Scheduler::for_backend(self.backend).spawn(
            &format!("storer-{app}"),
            Duration::ZERO,
            self.interval,
            Arc::new(move || flush_store.flush_dirty().map(|_| ())),
        )?;

        if let Some(previous) = self.task.lock().replace(task) {
            previous.stop();
        }
        *self.store.lock() = Some(store);
        info!(app = %app, interval_secs = self.interval.as_secs(), "Time-based writer started");
        Ok(())
    }

    fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop();
        }
        let store = self.store.lock().take();
        if let Some(store) = store {
            if let Err(e) = store.flush_dirty() {
                warn!(app = %store.app_name(), error = %e, "Final flush failed");
            }
            info!(app = %store.app_name(), "Time-based writer stopped");
        }
    }
}

/// Build the storer for a write policy.
pub fn for_policy(policy: WritePolicy, backend: ReaperBackend) -> Box<dyn Storer> {
    match policy {
        WritePolicy::EndOfService => Box::new(EndOfServiceStorer),
        WritePolicy::Manual => Box::new(ManualStorer),
        WritePolicy::TimeBased { interval } => Box::new(TimeBasedStorer::new(interval, backend)),
    }
}
