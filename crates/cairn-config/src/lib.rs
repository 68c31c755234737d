//! Configuration system for the Cairn session engine.
//!
//! Provides TOML-based configuration with:
//! - Sectioned settings (`[session]`, `[affinity]`, `[memory]`, `[persistence]`,
//!   `[reaper]`, `[logging]`)
//! - Config file layering (user config dir + project-local overrides)
//! - Validation into a [`cairn_session::SessionManagerConfig`]
//! - Hot reload: diffing two configs and pushing the hot-applicable part
//!   into a running manager, optionally driven by a file watcher

pub mod discovery;
pub mod error;
pub mod reload;
pub mod types;
pub mod watcher;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use reload::{ReloadPlan, apply, diff};
pub use types::*;
pub use watcher::{ConfigWatcher, ReloadEvent, WatcherHandle};
