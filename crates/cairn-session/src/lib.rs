//! Session lifecycle, affinity and expiration engine.
//!
//! This crate holds per-client session records for a multi-server web tier:
//! - Encoding and decoding of versioned session tokens with clone chains
//! - Create-or-join of sessions, serialized per id
//! - Reference-counted lifetime with background expiry
//! - Pluggable backing tiers and write policies
//! - Typed lifecycle event registries
//!
//! # Example
//!
//! ```rust,ignore
//! use cairn_session::{AffinityContext, SessionManager, SessionManagerConfig};
//!
//! let manager = SessionManager::new(SessionManagerConfig::new("shop").with_clone_id("A"));
//! manager.start()?;
//!
//! let mut ctx = AffinityContext::new(incoming_cookie_values);
//! if let Some(session) = manager.obtain_session(&mut ctx, true)? {
//!     session.set_attribute("cart", serde_json::json!(["apple"]))?;
//!     let token = manager.encode_token(&mut ctx, &session);
//! }
//! ```

mod affinity;
mod backing;
mod clock;
mod codec;
mod config;
mod error;
mod events;
mod id_gen;
mod invalidator;
mod locks;
mod manager;
mod registry;
mod schedule;
mod session;
mod storer;
mod store;

pub use affinity::{AffinityContext, AffinityManager};
pub use backing::{BackingStore, NoPersistence, SnapshotStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{IdCodec, MAX_VERSION, ParsedId, UNSAFE_CHARS, VERSION_PREFIX_LEN, is_safe, next_version};
pub use config::{
    DEFAULT_CLONE_SEPARATOR, DEFAULT_ID_LENGTH, DEFAULT_MAX_ID_LENGTH, DEFAULT_MAX_IN_MEMORY,
    DEFAULT_MAX_INACTIVE_SECS, DEFAULT_RECENTLY_INVALIDATED, DEFAULT_URL_PARAMETER,
    DEFAULT_WRITE_INTERVAL, ReaperBackend, RuntimeSettings, SessionManagerConfig, WriteContents,
    WritePolicy,
};
pub use error::{Result, SessionError};
pub use events::{
    AttributeRemovedHandler, AttributeSetHandler, HandlerRegistry, IdChangedHandler,
    SessionEvents, SessionHandler, SessionListener,
};
pub use id_gen::{IdGenerator, RandomIdGenerator};
pub use invalidator::{Invalidator, PooledInvalidator, TimerInvalidator, sweep_interval};
pub use locks::CreationLocks;
pub use manager::{
    AccessCheck, AllowAll, SessionHandle, SessionManager, SessionManagerBuilder, SessionStats,
};
pub use registry::SessionRegistry;
pub use schedule::{Job, PeriodicTask, Scheduler};
pub use session::{Session, SessionSnapshot};
pub use storer::{EndOfServiceStorer, ManualStorer, Storer, TimeBasedStorer};
pub use store::{Creation, SessionStore, StoreStats, SweepReport, within_hours};
