//! CLI command handlers.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use cairn_config::LoadedConfig;
use cairn_session::SessionManagerConfig;

pub mod config;
pub mod id;
pub mod simulate;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// User config directory override (`--config`).
    pub config_dir: Option<PathBuf>,
    /// Config discovered at startup.
    pub loaded: LoadedConfig,
}

impl Context {
    /// The validated manager configuration from the discovered config.
    pub fn manager_config(&self) -> Result<SessionManagerConfig> {
        self.loaded
            .config
            .to_manager_config()
            .context("configuration is invalid (see `cairn config check`)")
    }
}
