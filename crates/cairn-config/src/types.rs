//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [session]        # naming, timeout, id reuse
//! [affinity]       # clone id, chain handling
//! [memory]         # in-memory table capacity
//! [persistence]    # write policy
//! [reaper]         # invalidator scheduling
//! [logging]        # binary log level and file output
//! ```

use std::path::PathBuf;
use std::time::Duration;

use cairn_session::{
    DEFAULT_CLONE_SEPARATOR, DEFAULT_ID_LENGTH, DEFAULT_MAX_ID_LENGTH, DEFAULT_MAX_IN_MEMORY,
    DEFAULT_MAX_INACTIVE_SECS, DEFAULT_RECENTLY_INVALIDATED, DEFAULT_URL_PARAMETER,
    DEFAULT_WRITE_INTERVAL, ReaperBackend, RuntimeSettings, SessionManagerConfig, WriteContents,
    WritePolicy, is_safe,
};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Maps to the full TOML config file. All sections are optional so that
/// partial configs (e.g., project-local overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    /// Session naming and lifetime.
    pub session: Option<SessionSection>,

    /// Clone identity and chain handling.
    pub affinity: Option<AffinitySection>,

    /// In-memory table sizing.
    pub memory: Option<MemorySection>,

    /// Backing-tier write policy.
    pub persistence: Option<PersistenceSection>,

    /// Background invalidation.
    pub reaper: Option<ReaperSection>,

    /// Log output for the `cairn` binary.
    pub logging: Option<LoggingConfig>,
}

impl CairnConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Layers replace whole sections: a project file that sets `[affinity]`
    /// replaces the user file's `[affinity]` entirely.
    pub fn merge(&mut self, other: CairnConfig) {
        if other.session.is_some() {
            self.session = other.session;
        }

        if other.affinity.is_some() {
            self.affinity = other.affinity;
        }

        if other.memory.is_some() {
            self.memory = other.memory;
        }

        if other.persistence.is_some() {
            self.persistence = other.persistence;
        }

        if other.reaper.is_some() {
            self.reaper = other.reaper;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    pub fn session(&self) -> SessionSection {
        self.session.clone().unwrap_or_default()
    }

    pub fn affinity(&self) -> AffinitySection {
        self.affinity.clone().unwrap_or_default()
    }

    pub fn memory(&self) -> MemorySection {
        self.memory.clone().unwrap_or_default()
    }

    pub fn persistence(&self) -> PersistenceSection {
        self.persistence.clone().unwrap_or_default()
    }

    pub fn reaper(&self) -> ReaperSection {
        self.reaper.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// The settings a running manager can pick up without a restart.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            clone_id: self.affinity().clone_id,
            reaper_interval: self
                .reaper()
                .interval_secs
                .map(Duration::from_secs),
        }
    }

    /// Validate and convert into a [`SessionManagerConfig`].
    pub fn to_manager_config(&self) -> crate::Result<SessionManagerConfig> {
        let session = self.session();
        let affinity = self.affinity();
        let memory = self.memory();
        let persistence = self.persistence();
        let reaper = self.reaper();

        if session.app_name.trim().is_empty() {
            return Err(ConfigError::invalid("session.app_name", "must not be empty"));
        }
        if session.id_length == 0 {
            return Err(ConfigError::invalid("session.id_length", "must be positive"));
        }
        if session.url_parameter.is_empty() || !is_safe(&session.url_parameter) {
            return Err(ConfigError::invalid(
                "session.url_parameter",
                "must be a non-empty, URL-safe name",
            ));
        }

        let separator = single_char(&affinity.clone_separator)?;
        if affinity.max_id_length < session.id_length {
            return Err(ConfigError::invalid(
                "affinity.max_id_length",
                format!("must be at least session.id_length ({})", session.id_length),
            ));
        }
        if let Some(ref clone_id) = affinity.clone_id {
            check_token("affinity.clone_id", clone_id, separator)?;
        }
        if let Some(ref expected) = affinity.expected_clone_ids {
            for token in expected {
                check_token("affinity.expected_clone_ids", token, separator)?;
            }
        }

        if memory.max_in_memory == 0 {
            return Err(ConfigError::invalid("memory.max_in_memory", "must be positive"));
        }

        let write_policy = match persistence.write_policy {
            WritePolicyKind::EndOfService => WritePolicy::EndOfService,
            WritePolicyKind::Manual => WritePolicy::Manual,
            WritePolicyKind::TimeBased => {
                if persistence.write_interval_secs == 0 {
                    return Err(ConfigError::invalid(
                        "persistence.write_interval_secs",
                        "must be positive for the time-based policy",
                    ));
                }
                WritePolicy::TimeBased {
                    interval: Duration::from_secs(persistence.write_interval_secs),
                }
            }
        };

        if reaper.interval_secs == Some(0) {
            return Err(ConfigError::invalid("reaper.interval_secs", "must be positive"));
        }
        let scheduled_invalidation = match reaper.scheduled_hours.as_deref() {
            None => None,
            Some([first, second]) => {
                for hour in [first, second] {
                    if *hour > 23 {
                        return Err(ConfigError::invalid(
                            "reaper.scheduled_hours",
                            format!("hour {hour} is outside 0-23"),
                        ));
                    }
                }
                Some([*first, *second])
            }
            Some(other) => {
                return Err(ConfigError::invalid(
                    "reaper.scheduled_hours",
                    format!("expected two hours, got {}", other.len()),
                ));
            }
        };

        Ok(SessionManagerConfig {
            app_name: session.app_name,
            id_length: session.id_length,
            clone_separator: separator,
            max_id_length: affinity.max_id_length,
            no_affinity_switchback: affinity.no_switchback,
            expected_clone_ids: affinity.expected_clone_ids,
            id_reuse: session.id_reuse,
            max_in_memory: memory.max_in_memory,
            allow_overflow: memory.allow_overflow,
            max_inactive_secs: session.max_inactive_secs,
            write_policy,
            write_contents: persistence.write_contents,
            reaper_backend: reaper.backend,
            invalidator_start_delay: Duration::from_secs(reaper.start_delay_secs),
            scheduled_invalidation,
            url_parameter: session.url_parameter,
            recently_invalidated: session.recently_invalidated,
            runtime: self.runtime_settings(),
        })
    }
}

fn single_char(value: &str) -> crate::Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if is_safe(value) && !c.is_alphanumeric() => Ok(c),
        _ => Err(ConfigError::invalid(
            "affinity.clone_separator",
            format!("expected one non-alphanumeric character, got {value:?}"),
        )),
    }
}

fn check_token(field: &str, token: &str, separator: char) -> crate::Result<()> {
    if token.is_empty() {
        return Err(ConfigError::invalid(field, "clone ids must not be empty"));
    }
    if !is_safe(token) || token.contains(separator) {
        return Err(ConfigError::invalid(
            field,
            format!("clone id {token:?} contains a reserved character"),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Session naming and lifetime.
///
/// ```toml
/// [session]
/// app_name = "shop"
/// max_inactive_secs = 1800
/// id_reuse = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Name used for logging and registry keys.
    pub app_name: String,
    /// Length of generated base ids.
    pub id_length: usize,
    /// Inactivity timeout in seconds; zero or negative disables expiry.
    pub max_inactive_secs: i64,
    /// Reuse incoming ids when creating sessions.
    pub id_reuse: bool,
    /// Path parameter used when encoding URLs.
    pub url_parameter: String,
    /// How many invalidated ids to remember.
    pub recently_invalidated: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            app_name: "default".to_string(),
            id_length: DEFAULT_ID_LENGTH,
            max_inactive_secs: DEFAULT_MAX_INACTIVE_SECS,
            id_reuse: false,
            url_parameter: DEFAULT_URL_PARAMETER.to_string(),
            recently_invalidated: DEFAULT_RECENTLY_INVALIDATED,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Affinity
// ─────────────────────────────────────────────────────────────────────────────

/// Clone identity and chain handling.
///
/// ```toml
/// [affinity]
/// clone_id = "A"
/// expected_clone_ids = ["A", "B", "C"]
/// no_switchback = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinitySection {
    /// This server's token in clone chains. Hot-reloadable.
    pub clone_id: Option<String>,
    /// Separator between the base id and clone tokens.
    pub clone_separator: String,
    /// Maximum length of an outgoing identifier.
    pub max_id_length: usize,
    /// Put a newly serving clone at the front of the chain.
    pub no_switchback: bool,
    /// Allow-list of clone tokens; chains with anything else are discarded.
    pub expected_clone_ids: Option<Vec<String>>,
}

impl Default for AffinitySection {
    fn default() -> Self {
        Self {
            clone_id: None,
            clone_separator: DEFAULT_CLONE_SEPARATOR.to_string(),
            max_id_length: DEFAULT_MAX_ID_LENGTH,
            no_switchback: false,
            expected_clone_ids: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory table sizing.
///
/// ```toml
/// [memory]
/// max_in_memory = 1000
/// allow_overflow = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_in_memory: usize,
    /// Hand out throw-away records when the table is full.
    pub allow_overflow: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_in_memory: DEFAULT_MAX_IN_MEMORY,
            allow_overflow: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Write policy names accepted in `[persistence]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicyKind {
    #[default]
    EndOfService,
    Manual,
    TimeBased,
}

/// Backing-tier write policy.
///
/// ```toml
/// [persistence]
/// write_policy = "time-based"
/// write_interval_secs = 10
/// write_contents = "only-updated"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub write_policy: WritePolicyKind,
    /// Flush interval for the time-based policy.
    pub write_interval_secs: u64,
    pub write_contents: WriteContents,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            write_policy: WritePolicyKind::default(),
            write_interval_secs: DEFAULT_WRITE_INTERVAL.as_secs(),
            write_contents: WriteContents::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reaper
// ─────────────────────────────────────────────────────────────────────────────

/// Background invalidation.
///
/// ```toml
/// [reaper]
/// backend = "pool"
/// interval_secs = 60        # omit to derive from the timeout
/// start_delay_secs = 0
/// scheduled_hours = [2, 5]  # only expire between 02:00 and 05:59
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSection {
    pub backend: ReaperBackend,
    /// Fixed sweep interval. Hot-reloadable.
    pub interval_secs: Option<u64>,
    pub start_delay_secs: u64,
    pub scheduled_hours: Option<Vec<u8>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
///
/// ```toml
/// [logging]
/// level = "info"
/// directory = "/var/log/cairn"   # enables the daily JSON log file
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily-rolling JSON log files.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = CairnConfig::new();
        assert!(config.session.is_none());
        assert!(config.affinity.is_none());

        let manager = config.to_manager_config().unwrap();
        assert_eq!(manager.app_name, "default");
        assert_eq!(manager.id_length, 23);
        assert_eq!(manager.clone_separator, ':');
        assert_eq!(manager.max_in_memory, 1000);
        assert_eq!(manager.write_policy, WritePolicy::EndOfService);
        assert_eq!(manager.runtime, RuntimeSettings::default());
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
[session]
app_name = "shop"
max_inactive_secs = 600
id_reuse = true

[affinity]
clone_id = "A"
clone_separator = "!"
expected_clone_ids = ["A", "B"]
no_switchback = true

[memory]
max_in_memory = 50
allow_overflow = false

[persistence]
write_policy = "time-based"
write_interval_secs = 5
write_contents = "all"

[reaper]
backend = "pool"
interval_secs = 30
scheduled_hours = [1, 4]

[logging]
level = "debug"
"#;
        let config = CairnConfig::from_toml(toml).unwrap();
        let err = config.to_manager_config().unwrap_err();
        assert!(err.to_string().contains("affinity.clone_separator"));

        let mut config = config;
        config.affinity.as_mut().unwrap().clone_separator = "+".to_string();
        let manager = config.to_manager_config().unwrap();
        assert_eq!(manager.app_name, "shop");
        assert_eq!(manager.max_inactive_secs, 600);
        assert!(manager.id_reuse);
        assert_eq!(manager.clone_separator, '+');
        assert!(manager.no_affinity_switchback);
        assert_eq!(
            manager.expected_clone_ids,
            Some(vec!["A".to_string(), "B".to_string()])
        );
        assert_eq!(manager.max_in_memory, 50);
        assert!(!manager.allow_overflow);
        assert_eq!(
            manager.write_policy,
            WritePolicy::TimeBased {
                interval: Duration::from_secs(5)
            }
        );
        assert_eq!(manager.write_contents, WriteContents::All);
        assert_eq!(manager.reaper_backend, ReaperBackend::Pool);
        assert_eq!(manager.scheduled_invalidation, Some([1, 4]));
        assert_eq!(manager.runtime.clone_id.as_deref(), Some("A"));
        assert_eq!(manager.runtime.reaper_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.logging().level, "debug");
    }

    #[test]
    fn test_merge_replaces_sections() {
        let mut base = CairnConfig::from_toml(
            r#"
[session]
app_name = "user"

[affinity]
clone_id = "A"
"#,
        )
        .unwrap();
        let project = CairnConfig::from_toml(
            r#"
[affinity]
clone_id = "B"
"#,
        )
        .unwrap();

        base.merge(project);
        assert_eq!(base.session().app_name, "user");
        assert_eq!(base.affinity().clone_id.as_deref(), Some("B"));
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ("[session]\nid_length = 0", "session.id_length"),
            ("[session]\nurl_parameter = \"a<b\"", "session.url_parameter"),
            ("[affinity]\nclone_separator = \"::\"", "affinity.clone_separator"),
            ("[affinity]\nclone_id = \"a:b\"", "affinity.clone_id"),
            (
                "[affinity]\nexpected_clone_ids = [\"ok\", \"(x)\"]",
                "affinity.expected_clone_ids",
            ),
            ("[affinity]\nmax_id_length = 4", "affinity.max_id_length"),
            ("[memory]\nmax_in_memory = 0", "memory.max_in_memory"),
            (
                "[persistence]\nwrite_policy = \"time-based\"\nwrite_interval_secs = 0",
                "persistence.write_interval_secs",
            ),
            ("[reaper]\nscheduled_hours = [1, 24]", "reaper.scheduled_hours"),
            ("[reaper]\nscheduled_hours = [1]", "reaper.scheduled_hours"),
            ("[reaper]\ninterval_secs = 0", "reaper.interval_secs"),
        ];
        for (toml, field) in cases {
            let err = CairnConfig::from_toml(toml)
                .unwrap()
                .to_manager_config()
                .unwrap_err();
            match err {
                ConfigError::Invalid { field: f, .. } => assert_eq!(f, field, "{toml}"),
                other => panic!("unexpected error for {toml}: {other}"),
            }
        }
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        let err = CairnConfig::from_toml("[persistence]\nwrite_policy = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip_keeps_sections() {
        let mut config = CairnConfig::new();
        config.affinity = Some(AffinitySection {
            clone_id: Some("A".to_string()),
            ..Default::default()
        });
        config.reaper = Some(ReaperSection {
            interval_secs: Some(90),
            ..Default::default()
        });
        let parsed = CairnConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
