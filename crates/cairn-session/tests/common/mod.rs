//! Common helpers for session engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cairn_session::{
    ManualClock, Session, SessionListener, SessionManager, SessionManagerConfig, SnapshotStore,
};

/// A 23 character id that the codec accepts.
pub const FIXED_ID: &str = "FixedSessionIdForTests0";

/// Manager over a shared snapshot table with a manual clock.
pub struct Node {
    pub manager: SessionManager,
    pub clock: Arc<ManualClock>,
    pub backing: SnapshotStore,
    pub counts: Arc<EventCounts>,
}

pub fn node(config: SessionManagerConfig) -> Node {
    node_with(config, SnapshotStore::new(), Arc::new(ManualClock::new(1_000)))
}

pub fn node_with(
    config: SessionManagerConfig,
    backing: SnapshotStore,
    clock: Arc<ManualClock>,
) -> Node {
    let manager = SessionManager::builder(config)
        .with_backing(Arc::new(backing.clone()))
        .with_clock(clock.clone())
        .build();
    let counts = Arc::new(EventCounts::default());
    manager.events().add_listener(counts.clone());
    Node {
        manager,
        clock,
        backing,
        counts,
    }
}

/// Listener counting every lifecycle event.
#[derive(Debug, Default)]
pub struct EventCounts {
    pub created: AtomicUsize,
    pub accessed: AtomicUsize,
    pub released: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub timed_out: AtomicUsize,
}

impl EventCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl SessionListener for EventCounts {
    fn on_created(&self, _session: &Session) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_accessed(&self, _session: &Session) {
        self.accessed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_released(&self, _session: &Session) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn on_destroyed(&self, _session: &Session) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_destroyed_by_timeout(&self, _session: &Session) {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
