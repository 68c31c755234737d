//! Hot-reload file watcher for config files.
//!
//! Watches the directories holding the user and project config files and
//! reloads the layered config when either file changes. Uses debouncing to
//! coalesce rapid edits (e.g., editor save patterns).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::discovery::{LoadedConfig, load_config_with_options};
use crate::reload::{ReloadPlan, diff};
use crate::{CairnConfig, ConfigError, Result};

/// Default debounce duration.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// How often the watcher thread checks whether its receiver is gone.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Event emitted when the watched config changes.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// The config was reloaded and differs from the previous one.
    Reloaded {
        config: Box<CairnConfig>,
        plan: ReloadPlan,
    },
    /// The changed config did not validate; the previous one stays in force.
    Rejected { error: String },
}

/// Watches the config layers of one project.
#[derive(Debug, Clone)]
pub struct ConfigWatcher {
    project_dir: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    debounce: Duration,
}

impl ConfigWatcher {
    /// Create a watcher over the same layers `load_config_with_options` reads.
    pub fn new(project_dir: Option<PathBuf>, config_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            config_dir,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Load the layered config this watcher tracks.
    pub fn load(&self) -> Result<LoadedConfig> {
        load_config_with_options(self.project_dir.as_deref(), self.config_dir.as_deref())
    }

    /// Reload and compare against `current`. `None` when nothing changed.
    fn reload(&self, current: &CairnConfig) -> Option<ReloadEvent> {
        let loaded = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                return Some(ReloadEvent::Rejected {
                    error: e.to_string(),
                });
            }
        };
        for warning in &loaded.warnings {
            warn!("{warning}");
        }
        match diff(current, &loaded.config) {
            Ok(plan) if plan.is_empty() => None,
            Ok(plan) => Some(ReloadEvent::Reloaded {
                config: Box::new(loaded.config),
                plan,
            }),
            Err(e) => Some(ReloadEvent::Rejected {
                error: e.to_string(),
            }),
        }
    }

    /// Start watching, comparing changes against `current`.
    ///
    /// Returns a channel of [`ReloadEvent`]s and a handle to the watcher
    /// thread. Drop the receiver to stop watching.
    pub fn watch(&self, current: CairnConfig) -> Result<(mpsc::Receiver<ReloadEvent>, WatcherHandle)> {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer(self.debounce, notify_tx)
            .map_err(|e| ConfigError::Watch(format!("watcher init: {e}")))?;

        let targets = self.targets()?;
        for (dir, _) in &targets {
            if let Err(e) = debouncer.watcher().watch(dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %e, "Failed to watch config directory");
            }
        }
        info!(files = targets.len(), "Watching config files");

        let watcher = self.clone();
        let handle = std::thread::Builder::new()
            .name("cairn-config-watch".to_string())
            .spawn(move || {
                let _debouncer = debouncer;
                let mut current = current;

                loop {
                    let events = match notify_rx.recv_timeout(IDLE_POLL) {
                        Ok(Ok(events)) => events,
                        Ok(Err(e)) => {
                            warn!(error = %e, "Config watcher error");
                            continue;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if event_tx.is_closed() {
                                break;
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    let relevant = events.iter().any(|event| {
                        event.kind == DebouncedEventKind::Any && is_target(&event.path, &targets)
                    });
                    if !relevant {
                        continue;
                    }

                    debug!("Config file changed, reloading");
                    let Some(event) = watcher.reload(&current) else {
                        continue;
                    };
                    if let ReloadEvent::Reloaded { ref config, .. } = event {
                        current = (**config).clone();
                    }
                    if event_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                debug!("Config watcher stopped");
            })
            .map_err(|e| ConfigError::Watch(format!("watcher thread: {e}")))?;

        Ok((event_rx, WatcherHandle { handle }))
    }

    /// Existing directories to watch, each with the file name it holds.
    fn targets(&self) -> Result<Vec<(PathBuf, OsString)>> {
        let loaded = self.load()?;
        Ok(loaded
            .sources
            .iter()
            .filter_map(|source| {
                let name = source.path.file_name()?.to_os_string();
                let dir = canonical_parent(&source.path)?;
                Some((dir, name))
            })
            .collect())
    }
}

fn canonical_parent(path: &Path) -> Option<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    parent.canonicalize().ok()
}

fn is_target(path: &Path, targets: &[(PathBuf, OsString)]) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let Some(dir) = canonical_parent(path) else {
        return false;
    };
    targets.iter().any(|(d, n)| *d == dir && n.as_os_str() == name)
}

/// Handle to the running watcher thread.
pub struct WatcherHandle {
    handle: std::thread::JoinHandle<()>,
}

impl WatcherHandle {
    /// Check if the watcher thread is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
