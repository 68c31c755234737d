//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/cairn/config.toml` (user config, or `CAIRN_CONFIG_DIR`)
//! 2. `./cairn.toml` (project-local)
//! 3. CLI arguments (handled externally)

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{CairnConfig, ConfigError, Result};

/// Default config filename for project-local config.
pub const PROJECT_CONFIG_FILE: &str = "cairn.toml";

/// Default config filename within the user config directory.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for config directory resolution.
const APP_NAME: &str = "cairn";

/// Environment variable to override the config directory.
///
/// When set, this takes precedence over the platform default.
/// Useful for testing and running several nodes with different configs.
pub const CONFIG_DIR_ENV: &str = "CAIRN_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: CairnConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Highest-precedence source that loaded, for save operations.
    pub source: Option<ConfigSource>,
    /// Warnings generated during loading.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `CAIRN_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = CairnConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_config_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_config_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    check_affinity(&config, &mut warnings);

    let source = sources.iter().rev().find(|s| s.loaded).cloned();
    debug!(
        loaded = sources.iter().filter(|s| s.loaded).count(),
        warnings = warnings.len(),
        "Config discovery finished"
    );

    Ok(LoadedConfig {
        config,
        sources,
        source,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<CairnConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    CairnConfig::from_toml(&contents)
}

/// Save configuration to a file.
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &CairnConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// Path of the user config file.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory for cairn.
///
/// Checks `CAIRN_CONFIG_DIR` first, then falls back to the platform default
/// (`~/.config/cairn` on Linux, `~/Library/Application Support/cairn` on macOS).
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Try to load a config file and merge it into the existing config.
///
/// A missing file is skipped silently; an unreadable or malformed one is
/// skipped with a warning.
fn load_layer(config: &mut CairnConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}

/// Flag affinity settings that are legal but almost certainly mistakes.
fn check_affinity(config: &CairnConfig, warnings: &mut Vec<String>) {
    let affinity = config.affinity();
    if let (Some(clone_id), Some(expected)) = (&affinity.clone_id, &affinity.expected_clone_ids)
        && !expected.contains(clone_id)
    {
        warnings.push(format!(
            "[affinity] clone_id '{}' is not in expected_clone_ids; \
             every chain this server extends will be discarded by its peers",
            clone_id
        ));
    }

    if config.session().max_inactive_secs <= 0 {
        warnings.push("[session] max_inactive_secs <= 0: sessions never expire".to_string());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
