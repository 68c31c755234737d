//! Applying a changed configuration to a running session manager.
//!
//! Only the clone id and the sweep interval can change while a manager runs.
//! Everything else is reported as needing a restart and left untouched.

use std::fmt::Debug;

use cairn_session::{RuntimeSettings, SessionManager, SessionManagerConfig};
use tracing::{info, warn};

use crate::{CairnConfig, Result};

/// Outcome of comparing two configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadPlan {
    /// Runtime settings to install.
    pub runtime: RuntimeSettings,
    /// Changed fields that take effect immediately.
    pub hot: Vec<String>,
    /// Changed fields that only take effect after a restart.
    pub restart: Vec<String>,
}

impl ReloadPlan {
    pub fn is_empty(&self) -> bool {
        self.hot.is_empty() && self.restart.is_empty()
    }

    pub fn needs_restart(&self) -> bool {
        !self.restart.is_empty()
    }
}

/// Compare `old` and `new`. Both must validate.
pub fn diff(old: &CairnConfig, new: &CairnConfig) -> Result<ReloadPlan> {
    let before = old.to_manager_config()?;
    let after = new.to_manager_config()?;

    let mut hot = Vec::new();
    changed(&mut hot, "affinity.clone_id", &before.runtime.clone_id, &after.runtime.clone_id);
    changed(
        &mut hot,
        "reaper.interval_secs",
        &before.runtime.reaper_interval,
        &after.runtime.reaper_interval,
    );

    Ok(ReloadPlan {
        runtime: after.runtime.clone(),
        hot,
        restart: restart_fields(&before, &after),
    })
}

fn restart_fields(a: &SessionManagerConfig, b: &SessionManagerConfig) -> Vec<String> {
    let mut out = Vec::new();
    changed(&mut out, "session.app_name", &a.app_name, &b.app_name);
    changed(&mut out, "session.id_length", &a.id_length, &b.id_length);
    changed(&mut out, "session.max_inactive_secs", &a.max_inactive_secs, &b.max_inactive_secs);
    changed(&mut out, "session.id_reuse", &a.id_reuse, &b.id_reuse);
    changed(&mut out, "session.url_parameter", &a.url_parameter, &b.url_parameter);
    changed(
        &mut out,
        "session.recently_invalidated",
        &a.recently_invalidated,
        &b.recently_invalidated,
    );
    changed(&mut out, "affinity.clone_separator", &a.clone_separator, &b.clone_separator);
    changed(&mut out, "affinity.max_id_length", &a.max_id_length, &b.max_id_length);
    changed(
        &mut out,
        "affinity.no_switchback",
        &a.no_affinity_switchback,
        &b.no_affinity_switchback,
    );
    changed(
        &mut out,
        "affinity.expected_clone_ids",
        &a.expected_clone_ids,
        &b.expected_clone_ids,
    );
    changed(&mut out, "memory.max_in_memory", &a.max_in_memory, &b.max_in_memory);
    changed(&mut out, "memory.allow_overflow", &a.allow_overflow, &b.allow_overflow);
    changed(&mut out, "persistence.write_policy", &a.write_policy, &b.write_policy);
    changed(&mut out, "persistence.write_contents", &a.write_contents, &b.write_contents);
    changed(&mut out, "reaper.backend", &a.reaper_backend, &b.reaper_backend);
    changed(
        &mut out,
        "reaper.start_delay_secs",
        &a.invalidator_start_delay,
        &b.invalidator_start_delay,
    );
    changed(
        &mut out,
        "reaper.scheduled_hours",
        &a.scheduled_invalidation,
        &b.scheduled_invalidation,
    );
    out
}

fn changed<T: PartialEq + Debug>(out: &mut Vec<String>, field: &str, a: &T, b: &T) {
    if a != b {
        out.push(field.to_string());
    }
}

/// Push the hot part of `plan` into `manager`.
///
/// A rescheduled sweep waits for the running one to finish; call through
/// `spawn_blocking` from async code.
pub fn apply(manager: &SessionManager, plan: &ReloadPlan) -> Result<()> {
    if !plan.restart.is_empty() {
        warn!(
            app = %manager.app_name(),
            fields = ?plan.restart,
            "Config changes need a restart and were not applied"
        );
    }
    if plan.hot.is_empty() {
        return Ok(());
    }
    manager.apply_runtime(plan.runtime.clone())?;
    info!(app = %manager.app_name(), fields = ?plan.hot, "Config reloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse(toml: &str) -> CairnConfig {
        CairnConfig::from_toml(toml).unwrap()
    }

    #[test]
    fn test_identical_configs() {
        let config = parse("[affinity]\nclone_id = \"A\"");
        let plan = diff(&config, &config).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.runtime.clone_id.as_deref(), Some("A"));
    }

    #[test]
    fn test_hot_and_restart_fields() {
        let old = parse("[affinity]\nclone_id = \"A\"\n[memory]\nmax_in_memory = 10");
        let new = parse(
            "[affinity]\nclone_id = \"B\"\n[memory]\nmax_in_memory = 20\n[reaper]\ninterval_secs = 5",
        );
        let plan = diff(&old, &new).unwrap();
        assert_eq!(plan.hot, vec!["affinity.clone_id", "reaper.interval_secs"]);
        assert_eq!(plan.restart, vec!["memory.max_in_memory"]);
        assert!(plan.needs_restart());
        assert_eq!(plan.runtime.reaper_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_new_config_is_rejected() {
        let old = CairnConfig::new();
        let new = parse("[session]\nid_length = 0");
        assert!(diff(&old, &new).is_err());
    }

    #[test]
    fn test_apply_updates_running_manager() {
        let old = parse("[session]\napp_name = \"shop\"\n[affinity]\nclone_id = \"A\"");
        let new = parse("[session]\napp_name = \"shop\"\n[affinity]\nclone_id = \"B\"");
        let manager = SessionManager::new(old.to_manager_config().unwrap());
        assert_eq!(manager.affinity().clone_id().as_deref(), Some("A"));

        let plan = diff(&old, &new).unwrap();
        apply(&manager, &plan).unwrap();
        assert_eq!(manager.affinity().clone_id().as_deref(), Some("B"));
        assert_eq!(manager.runtime().clone_id.as_deref(), Some("B"));
    }
}
