//! Configuration for a session manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default length of generated base ids.
pub const DEFAULT_ID_LENGTH: usize = 23;

/// Default separator between base id and clone tokens.
pub const DEFAULT_CLONE_SEPARATOR: char = ':';

/// Default maximum length of an outgoing combined identifier.
pub const DEFAULT_MAX_ID_LENGTH: usize = 1024;

/// Default number of records held in memory before overflow.
pub const DEFAULT_MAX_IN_MEMORY: usize = 1000;

/// Default inactivity timeout (30 minutes).
pub const DEFAULT_MAX_INACTIVE_SECS: i64 = 1800;

/// Default interval for time-based writes.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_secs(10);

/// Default URL path parameter carrying the session token.
pub const DEFAULT_URL_PARAMETER: &str = "jsessionid";

/// Default size of the recently-invalidated id list.
pub const DEFAULT_RECENTLY_INVALIDATED: usize = 100;

/// When a mutated record is pushed to the backing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "policy")]
pub enum WritePolicy {
    /// Written synchronously when the request releases the session.
    #[default]
    EndOfService,
    /// Written only when the application calls `sync`.
    Manual,
    /// Written by a background flush every `interval`.
    TimeBased {
        #[serde(with = "duration_secs")]
        interval: Duration,
    },
}

impl WritePolicy {
    /// Whether releases write through to the backing tier.
    pub fn writes_on_release(&self) -> bool {
        matches!(self, WritePolicy::EndOfService)
    }
}

impl std::fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WritePolicy::EndOfService => write!(f, "end-of-service"),
            WritePolicy::Manual => write!(f, "manual"),
            WritePolicy::TimeBased { interval } => {
                write!(f, "time-based ({}s)", interval.as_secs())
            }
        }
    }
}

/// Which attributes a write sends to the backing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteContents {
    /// Only attributes changed or removed since the last write.
    #[default]
    OnlyUpdated,
    /// The full attribute map on every write.
    All,
}

/// Scheduling backend for background sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaperBackend {
    /// A dedicated thread per manager.
    #[default]
    Timer,
    /// Tasks on a shared tokio runtime.
    Pool,
}

/// Settings that may change while the manager is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Token identifying this server in clone chains.
    pub clone_id: Option<String>,

    /// Fixed sweep interval, overriding the one derived from the timeout.
    pub reaper_interval: Option<Duration>,
}

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Application (or shared context) name, used for logging and registry keys.
    pub app_name: String,

    /// Length of generated base ids.
    pub id_length: usize,

    /// Separator between base id and clone tokens.
    pub clone_separator: char,

    /// Maximum length of an outgoing combined identifier.
    pub max_id_length: usize,

    /// New servers go to the front of the clone chain instead of the back.
    pub no_affinity_switchback: bool,

    /// Clone tokens a chain may contain; any other token discards the chain.
    pub expected_clone_ids: Option<Vec<String>>,

    /// Reuse incoming ids for new sessions.
    pub id_reuse: bool,

    /// Maximum number of records in the in-memory table.
    pub max_in_memory: usize,

    /// Hand out throw-away overflow records when the table is full.
    pub allow_overflow: bool,

    /// Inactivity timeout for new sessions; `<= 0` disables expiry.
    pub max_inactive_secs: i64,

    /// When mutated records are written to the backing tier.
    pub write_policy: WritePolicy,

    /// Which attributes each write carries.
    pub write_contents: WriteContents,

    /// Scheduling backend for the invalidator and time-based writes.
    pub reaper_backend: ReaperBackend,

    /// Delay before the first sweep.
    pub invalidator_start_delay: Duration,

    /// Hours of day (local time) during which sweeps may expire records.
    pub scheduled_invalidation: Option<[u8; 2]>,

    /// URL path parameter used by `encode_url`.
    pub url_parameter: String,

    /// Capacity of the recently-invalidated id list.
    pub recently_invalidated: usize,

    /// Hot-reloadable settings.
    pub runtime: RuntimeSettings,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            app_name: "default".to_string(),
            id_length: DEFAULT_ID_LENGTH,
            clone_separator: DEFAULT_CLONE_SEPARATOR,
            max_id_length: DEFAULT_MAX_ID_LENGTH,
            no_affinity_switchback: false,
            expected_clone_ids: None,
            id_reuse: false,
            max_in_memory: DEFAULT_MAX_IN_MEMORY,
            allow_overflow: true,
            max_inactive_secs: DEFAULT_MAX_INACTIVE_SECS,
            write_policy: WritePolicy::default(),
            write_contents: WriteContents::default(),
            reaper_backend: ReaperBackend::default(),
            invalidator_start_delay: Duration::ZERO,
            scheduled_invalidation: None,
            url_parameter: DEFAULT_URL_PARAMETER.to_string(),
            recently_invalidated: DEFAULT_RECENTLY_INVALIDATED,
            runtime: RuntimeSettings::default(),
        }
    }
}

impl SessionManagerConfig {
    /// Create a configuration with default values for `app_name`.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn with_id_length(mut self, len: usize) -> Self {
        self.id_length = len;
        self
    }

    pub fn with_clone_separator(mut self, sep: char) -> Self {
        self.clone_separator = sep;
        self
    }

    pub fn with_max_id_length(mut self, max: usize) -> Self {
        self.max_id_length = max;
        self
    }

    pub fn with_clone_id(mut self, clone_id: impl Into<String>) -> Self {
        self.runtime.clone_id = Some(clone_id.into());
        self
    }

    pub fn with_no_affinity_switchback(mut self, enabled: bool) -> Self {
        self.no_affinity_switchback = enabled;
        self
    }

    /// Restrict clone chains to the given tokens.
    pub fn with_expected_clone_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_clone_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_id_reuse(mut self, enabled: bool) -> Self {
        self.id_reuse = enabled;
        self
    }

    pub fn with_max_in_memory(mut self, max: usize) -> Self {
        self.max_in_memory = max;
        self
    }

    pub fn with_overflow(mut self, enabled: bool) -> Self {
        self.allow_overflow = enabled;
        self
    }

    pub fn with_max_inactive_secs(mut self, secs: i64) -> Self {
        self.max_inactive_secs = secs;
        self
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_write_contents(mut self, contents: WriteContents) -> Self {
        self.write_contents = contents;
        self
    }

    pub fn with_reaper_backend(mut self, backend: ReaperBackend) -> Self {
        self.reaper_backend = backend;
        self
    }

    /// Fix the sweep interval instead of deriving it from the timeout.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.runtime.reaper_interval = Some(interval);
        self
    }

    pub fn with_invalidator_start_delay(mut self, delay: Duration) -> Self {
        self.invalidator_start_delay = delay;
        self
    }

    /// Only expire records during these two hours of the day.
    pub fn with_scheduled_invalidation(mut self, first: u8, second: u8) -> Self {
        self.scheduled_invalidation = Some([first, second]);
        self
    }

    pub fn with_url_parameter(mut self, name: impl Into<String>) -> Self {
        self.url_parameter = name.into();
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
