//! Background expiry of idle sessions.
//!
//! An invalidator periodically calls [`SessionStore::run_invalidation_sweep`].
//! Two interchangeable backends exist: [`TimerInvalidator`] owns a dedicated
//! thread, [`PooledInvalidator`] runs on a shared tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::ReaperBackend;
use crate::error::Result;
use crate::schedule::{Job, PeriodicTask, Scheduler};
use crate::store::SessionStore;

/// Base period, jitter steps and step size (seconds) for a given timeout.
fn interval_parts(max_inactive_secs: i64) -> (u64, u64, u64) {
    match max_inactive_secs {
        t if t > 0 && t <= 120 => (30, 30, 1),
        t if t > 0 && t <= 900 => (60, 30, 1),
        t if t > 0 && t <= 1800 => (120, 30, 2),
        _ => (240, 60, 1),
    }
}

/// Sweep period for sessions with the given timeout.
///
/// Jittered so that many managers started together do not sweep in step:
/// 30–60 s for timeouts up to 2 minutes, 60–90 s up to 15 minutes,
/// 120–180 s up to 30 minutes and 240–300 s beyond (or with no timeout).
pub fn sweep_interval(max_inactive_secs: i64) -> Duration {
    let (base, steps, step) = interval_parts(max_inactive_secs);
    let jitter = rand::rng().random_range(0..=steps);
    Duration::from_secs(base + jitter * step)
}

/// Periodic expiry of a store's idle sessions.
pub trait Invalidator: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Begin sweeping `store` every `interval`. Restarts if already running.
    fn start(&self, store: Arc<SessionStore>, interval: Duration) -> Result<()>;

    /// Cancel future sweeps. An in-flight sweep finishes first.
    fn stop(&self);

    /// Current sweep period, `None` when stopped.
    fn interval(&self) -> Option<Duration>;

    fn is_running(&self) -> bool {
        self.interval().is_some()
    }
}

fn sweep_job(store: Arc<SessionStore>) -> Job {
    Arc::new(move || {
        store.run_invalidation_sweep();
        Ok(())
    })
}

/// Shared start/stop bookkeeping for both backends.
#[derive(Debug, Default)]
struct Slot {
    task: Mutex<Option<PeriodicTask>>,
}

impl Slot {
    fn replace(&self, task: PeriodicTask) {
        let previous = self.task.lock().replace(task);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn stop(&self) -> bool {
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.task.lock().as_ref().map(PeriodicTask::period)
    }
}

/// Invalidator on a dedicated thread.
#[derive(Debug, Default)]
pub struct TimerInvalidator {
    start_delay: Duration,
    slot: Slot,
}

impl TimerInvalidator {
    pub fn new(start_delay: Duration) -> Self {
        Self {
            start_delay,
            slot: Slot::default(),
        }
    }
}

impl Invalidator for TimerInvalidator {
    fn backend(&self) -> &'static str {
        "timer"
    }

    fn start(&self, store: Arc<SessionStore>, interval: Duration) -> Result<()> {
        let app = store.app_name().to_string();
        let task = Scheduler::Thread.spawn(
            &format!("invalidator-{app}"),
            self.start_delay,
            interval,
            sweep_job(store),
        )?;
        self.slot.replace(task);
        info!(app = %app, backend = "timer", interval_secs = interval.as_secs(), "Invalidator started");
        Ok(())
    }

    fn stop(&self) {
        if self.slot.stop() {
            info!(backend = "timer", "Invalidator stopped");
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.slot.interval()
    }
}

/// Invalidator on a shared tokio runtime.
#[derive(Debug)]
pub struct PooledInvalidator {
    handle: Handle,
    start_delay: Duration,
    slot: Slot,
}

impl PooledInvalidator {
    pub fn new(handle: Handle, start_delay: Duration) -> Self {
        Self {
            handle,
            start_delay,
            slot: Slot::default(),
        }
    }
}

impl Invalidator for PooledInvalidator {
    fn backend(&self) -> &'static str {
        "pool"
    }

    fn start(&self, store: Arc<SessionStore>, interval: Duration) -> Result<()> {
        let app = store.app_name().to_string();
        let task = Scheduler::Pool(self.handle.clone()).spawn(
            &format!("invalidator-{app}"),
            self.start_delay,
            interval,
            sweep_job(store),
        )?;
        self.slot.replace(task);
        info!(app = %app, backend = "pool", interval_secs = interval.as_secs(), "Invalidator started");
        Ok(())
    }

    fn stop(&self) {
        if self.slot.stop() {
            info!(backend = "pool", "Invalidator stopped");
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.slot.interval()
    }
}

/// Build the invalidator for a configured backend.
pub fn for_backend(backend: ReaperBackend, start_delay: Duration) -> Box<dyn Invalidator> {
    match Scheduler::for_backend(backend) {
        Scheduler::Pool(handle) => Box::new(PooledInvalidator::new(handle, start_delay)),
        Scheduler::Thread => Box::new(TimerInvalidator::new(start_delay)),
    }
}
