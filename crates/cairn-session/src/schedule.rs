//! Periodic background jobs on a dedicated thread or a shared tokio runtime.
//!
//! Both backends honor the same contract: an optional start delay, a fixed
//! period, and a [`PeriodicTask::stop`] after which no new run begins. A run
//! already in flight when `stop` is called is allowed to finish; `stop` waits
//! for it. Each run is isolated, so an error or a panic is logged and the
//! schedule carries on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ReaperBackend;
use crate::error::Result;

/// Shortest period accepted; shorter values are clamped.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// The body of a periodic job.
pub type Job = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Where periodic jobs run.
#[derive(Debug, Clone)]
pub enum Scheduler {
    /// One dedicated OS thread per job.
    Thread,
    /// Tasks on a shared tokio runtime; runs go to its blocking pool.
    Pool(Handle),
}

impl Scheduler {
    /// Resolve a configured backend against the current context.
    ///
    /// The pool backend needs a tokio runtime; outside one it falls back to
    /// a dedicated thread.
    pub fn for_backend(backend: ReaperBackend) -> Self {
        match backend {
            ReaperBackend::Timer => Scheduler::Thread,
            ReaperBackend::Pool => match Handle::try_current() {
                Ok(handle) => Scheduler::Pool(handle),
                Err(_) => {
                    warn!("No tokio runtime available, using a dedicated thread for background jobs");
                    Scheduler::Thread
                }
            },
        }
    }

    pub fn spawn(
        &self,
        name: &str,
        delay: Duration,
        period: Duration,
        job: Job,
    ) -> Result<PeriodicTask> {
        match self {
            Scheduler::Thread => spawn_thread(name, delay, period, job),
            Scheduler::Pool(handle) => Ok(spawn_pooled(handle, name, delay, period, job)),
        }
    }
}

/// Shared between a task and its runner. Held for the whole of each run,
/// so `stop` observes either "not started" or "finished".
#[derive(Debug, Default)]
struct Gate {
    stopped: Mutex<bool>,
}

impl Gate {
    /// Run `job` unless stopped. Returns `false` when the task should exit.
    fn run(&self, name: &str, job: &Job) -> bool {
        let stopped = self.stopped.lock();
        if *stopped {
            return false;
        }
        match catch_unwind(AssertUnwindSafe(|| job())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = %name, error = %e, "Background job failed"),
            Err(_) => error!(task = %name, "Background job panicked"),
        }
        true
    }

    fn close(&self) {
        *self.stopped.lock() = true;
    }
}

enum Runner {
    Thread {
        wake: mpsc::Sender<()>,
        handle: Option<thread::JoinHandle<()>>,
    },
    Pool {
        token: CancellationToken,
    },
}

/// Handle to a running periodic job.
pub struct PeriodicTask {
    name: String,
    period: Duration,
    gate: Arc<Gate>,
    runner: Runner,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.runner {
            Runner::Thread { .. } => "thread",
            Runner::Pool { .. } => "pool",
        };
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("backend", &backend)
            .finish()
    }
}

impl PeriodicTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cancel future runs, waiting for an in-flight run to finish.
    ///
    /// Blocks the calling thread for as long as that run takes; async
    /// callers go through `spawn_blocking`. Must not be called from inside
    /// the job itself.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.gate.close();
        match &mut self.runner {
            Runner::Thread { wake, handle } => {
                let _ = wake.send(());
                if let Some(handle) = handle.take()
                    && handle.thread().id() != thread::current().id()
                {
                    let _ = handle.join();
                }
            }
            Runner::Pool { token } => token.cancel(),
        }
        debug!(task = %self.name, "Background job stopped");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if !*self.gate.stopped.lock() {
            self.shutdown();
        }
    }
}

fn spawn_thread(name: &str, delay: Duration, period: Duration, job: Job) -> Result<PeriodicTask> {
    let period = period.max(MIN_PERIOD);
    let gate = Arc::new(Gate::default());
    let (wake, rx) = mpsc::channel::<()>();

    let task_name = name.to_string();
    let task_gate = Arc::clone(&gate);
    let handle = thread::Builder::new()
        .name(format!("cairn-{name}"))
        .spawn(move || {
            if !delay.is_zero() && !matches!(rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout)) {
                return;
            }
            loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !task_gate.run(&task_name, &job) {
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })?;

    debug!(task = %name, ?delay, ?period, "Started background thread");
    Ok(PeriodicTask {
        name: name.to_string(),
        period,
        gate,
        runner: Runner::Thread {
            wake,
            handle: Some(handle),
        },
    })
}

fn spawn_pooled(
    handle: &Handle,
    name: &str,
    delay: Duration,
    period: Duration,
    job: Job,
) -> PeriodicTask {
    let period = period.max(MIN_PERIOD);
    let gate = Arc::new(Gate::default());
    let token = CancellationToken::new();

    let task_name = name.to_string();
    let task_gate = Arc::clone(&gate);
    let task_token = token.clone();
    handle.spawn(async move {
        let start = tokio::time::Instant::now() + delay + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    let gate = Arc::clone(&task_gate);
                    let job = Arc::clone(&job);
                    let name = task_name.clone();
                    match tokio::task::spawn_blocking(move || gate.run(&name, &job)).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            error!(task = %task_name, error = %e, "Background job could not run");
                        }
                    }
                }
            }
        }
    });

    debug!(task = %name, ?delay, ?period, "Started pooled background job");
    PeriodicTask {
        name: name.to_string(),
        period,
        gate,
        runner: Runner::Pool { token },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn wait_for(counter: &AtomicUsize, at_least: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < at_least {
            assert!(Instant::now() < deadline, "job did not run in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_thread_runs_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Scheduler::Thread
            .spawn(
                "test",
                Duration::ZERO,
                Duration::from_millis(10),
                counting_job(&counter),
            )
            .unwrap();
        wait_for(&counter, 2);
        task.stop();

        let after_stop = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_errors_and_panics_do_not_end_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let job: Job = Arc::new(move || {
            let n = r.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => Err(SessionError::Backing("boom".to_string())),
                1 => panic!("job panicked"),
                _ => Ok(()),
            }
        });

        let task = Scheduler::Thread
            .spawn("flaky", Duration::ZERO, Duration::from_millis(5), job)
            .unwrap();
        wait_for(&runs, 3);
        task.stop();
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_run() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let job: Job = Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let task = Scheduler::Thread
            .spawn("slow", Duration::ZERO, Duration::from_secs(60), job)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "job did not start in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = tokio::task::spawn_blocking(move || task.stop());
        tokio::time::sleep(Duration::from_millis(10)).await;
        stopping.await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Scheduler::Thread
            .spawn(
                "delayed",
                Duration::from_secs(60),
                Duration::from_millis(5),
                counting_job(&counter),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        task.stop();
    }

    #[test]
    fn test_pool_backend_requires_runtime() {
        assert!(matches!(
            Scheduler::for_backend(ReaperBackend::Pool),
            Scheduler::Thread
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::for_backend(ReaperBackend::Pool);
        assert!(matches!(scheduler, Scheduler::Pool(_)));

        let task = scheduler
            .spawn(
                "pooled",
                Duration::ZERO,
                Duration::from_millis(10),
                counting_job(&counter),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "pooled job did not run in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.stop();

        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }
}
