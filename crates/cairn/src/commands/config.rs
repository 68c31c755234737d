//! Config command - configuration management.

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::{Style, style};
use serde::Serialize;

use cairn_config::{
    AffinitySection, CairnConfig, ConfigWatcher, LoggingConfig, MemorySection, PersistenceSection,
    ReaperSection, ReloadEvent, SessionSection,
};
use cairn_session::{SessionManager, SessionManagerConfig};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Validate the configuration
    Check,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./cairn.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Watch config files and apply hot-reloadable changes until interrupted
    Watch,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Check => cmd_check(ctx),
        ConfigCommand::Init { local, force } => cmd_init(ctx, local, force),
        ConfigCommand::Watch => cmd_watch(ctx).await,
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    let config = &loaded.config;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("# Cairn Configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    match config.to_manager_config() {
        Ok(manager) => print_summary(&manager),
        Err(e) => println!("Invalid configuration: {e}\n"),
    }

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn print_summary(config: &SessionManagerConfig) {
    let dim = Style::new().dim();
    let row = |label: &str, value: String| {
        println!("  {} {}", dim.apply_to(format!("{label:<20}")), value);
    };

    println!("Session manager:");
    row("app", config.app_name.clone());
    row(
        "clone id",
        config
            .runtime
            .clone_id
            .clone()
            .unwrap_or_else(|| "(none)".to_string()),
    );
    row(
        "id format",
        format!(
            "{} chars, separator '{}', max {}",
            config.id_length, config.clone_separator, config.max_id_length
        ),
    );
    row(
        "timeout",
        if config.max_inactive_secs > 0 {
            format!("{}s", config.max_inactive_secs)
        } else {
            "never".to_string()
        },
    );
    row(
        "capacity",
        format!(
            "{} ({})",
            config.max_in_memory,
            if config.allow_overflow {
                "overflow allowed"
            } else {
                "no overflow"
            }
        ),
    );
    row("write policy", config.write_policy.to_string());
    row(
        "reaper",
        match config.runtime.reaper_interval {
            Some(interval) => format!("{:?} every {}s", config.reaper_backend, interval.as_secs()),
            None => format!("{:?} (interval from timeout)", config.reaper_backend),
        },
    );
    if let Some(ref expected) = config.expected_clone_ids {
        row("expected clones", expected.join(", "));
    }
    println!();
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;

    if ctx.json_output {
        #[derive(Serialize)]
        struct Source<'a> {
            path: &'a std::path::Path,
            loaded: bool,
        }
        let sources: Vec<_> = loaded
            .sources
            .iter()
            .map(|s| Source {
                path: &s.path,
                loaded: s.loaded,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(());
    }

    println!("Config file search order (later overrides earlier):\n");
    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }
    println!();

    Ok(())
}

fn cmd_check(ctx: &Context) -> Result<()> {
    let result = ctx.loaded.config.to_manager_config();

    if ctx.json_output {
        #[derive(Serialize)]
        struct CheckOutput<'a> {
            valid: bool,
            error: Option<String>,
            warnings: &'a [String],
        }
        let output = CheckOutput {
            valid: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            warnings: &ctx.loaded.warnings,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        match &result {
            Ok(config) => println!(
                "{} configuration is valid (app '{}')",
                style("✓").green(),
                config.app_name
            ),
            Err(e) => println!("{} {}", style("✗").red(), e),
        }
        for w in &ctx.loaded.warnings {
            println!("  ⚠ {}", w);
        }
    }

    result?;
    Ok(())
}

fn cmd_init(ctx: &Context, local: bool, force: bool) -> Result<()> {
    let path = if local {
        std::path::PathBuf::from(cairn_config::discovery::PROJECT_CONFIG_FILE)
    } else {
        match &ctx.config_dir {
            Some(dir) => dir.join(cairn_config::discovery::USER_CONFIG_FILE),
            None => match cairn_config::user_config_path() {
                Some(path) => path,
                None => bail!("could not determine the user config directory; use --local"),
            },
        }
    };

    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    cairn_config::save_config(&default_config(), &path)?;
    if ctx.json_output {
        println!("{}", serde_json::json!({ "path": path }));
    } else {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

/// Every section spelled out with its defaults.
fn default_config() -> CairnConfig {
    CairnConfig {
        session: Some(SessionSection::default()),
        affinity: Some(AffinitySection::default()),
        memory: Some(MemorySection::default()),
        persistence: Some(PersistenceSection::default()),
        reaper: Some(ReaperSection::default()),
        logging: Some(LoggingConfig::default()),
    }
}

async fn cmd_watch(ctx: &Context) -> Result<()> {
    let current = ctx.loaded.config.clone();
    let manager = Arc::new(SessionManager::new(ctx.manager_config()?));
    manager.start()?;

    let watcher = ConfigWatcher::new(None, ctx.config_dir.clone());
    let (mut events, _handle) = watcher.watch(current)?;

    if !ctx.json_output {
        println!(
            "Watching {} config file(s); Ctrl-C to stop",
            ctx.loaded.sources.len()
        );
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                report(ctx, &manager, event).await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Stopping waits out an in-flight sweep.
    tokio::task::spawn_blocking(move || manager.stop()).await?;
    Ok(())
}

async fn report(ctx: &Context, manager: &Arc<SessionManager>, event: ReloadEvent) -> Result<()> {
    match event {
        ReloadEvent::Reloaded { plan, .. } => {
            let (m, p) = (Arc::clone(manager), plan.clone());
            tokio::task::spawn_blocking(move || cairn_config::apply(&m, &p)).await??;
            if ctx.json_output {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": "reloaded",
                        "applied": plan.hot,
                        "restart_required": plan.restart,
                    })
                );
            } else {
                if !plan.hot.is_empty() {
                    println!("{} applied: {}", style("↻").green(), plan.hot.join(", "));
                }
                if plan.needs_restart() {
                    println!(
                        "{} restart required for: {}",
                        style("!").yellow(),
                        plan.restart.join(", ")
                    );
                }
            }
        }
        ReloadEvent::Rejected { error } => {
            if ctx.json_output {
                println!(
                    "{}",
                    serde_json::json!({ "event": "rejected", "error": error })
                );
            } else {
                println!("{} rejected: {}", style("✗").red(), error);
            }
        }
    }
    Ok(())
}
