//! CLI integration tests for the Cairn command-line interface.
//!
//! Every test runs with an empty working directory and an explicit user
//! config directory so the developer's own config never leaks in.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const BASE_ID: &str = "abcdefghijklmnopqrstuvw";

struct Env {
    cwd: TempDir,
    config: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            cwd: TempDir::new().unwrap(),
            config: TempDir::new().unwrap(),
        }
    }

    fn with_user_config(self, toml: &str) -> Self {
        fs::write(self.config.path().join("config.toml"), toml).unwrap();
        self
    }

    /// Get a command for the cairn binary.
    fn cairn(&self) -> Command {
        let mut cmd = Command::cargo_bin("cairn").unwrap();
        cmd.current_dir(self.cwd.path())
            .env_remove("CAIRN_CONFIG_DIR")
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(self.config.path());
        cmd
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    Env::new()
        .cairn()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cairn"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("id"))
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn test_version_displays() {
    Env::new()
        .cairn()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cairn"));
}

#[test]
fn test_unknown_subcommand_fails() {
    Env::new().cairn().arg("frobnicate").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Id Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_id_decode_json() {
    let token = format!("0003{BASE_ID}:A:B");
    let output = Env::new()
        .cairn()
        .args(["--json", "id", "decode", &token])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["version"], 3);
    assert_eq!(value["base_id"], BASE_ID);
    assert_eq!(value["clone_chain"], "A:B");
    assert_eq!(value["clones"], serde_json::json!(["A", "B"]));
}

#[test]
fn test_id_decode_plain() {
    Env::new()
        .cairn()
        .args(["id", "decode", BASE_ID])
        .assert()
        .success()
        .stdout(predicate::str::contains(BASE_ID))
        .stdout(predicate::str::contains("(none)"));
}

#[test]
fn test_id_decode_rejects_malformed() {
    Env::new()
        .cairn()
        .args(["id", "decode", "ab:cd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a well-formed"));
}

#[test]
fn test_id_encode() {
    Env::new()
        .cairn()
        .args(["id", "encode", "--id", BASE_ID, "--version", "2", "--chain", "A:B"])
        .assert()
        .success()
        .stdout(predicate::str::diff(format!("0002{BASE_ID}:A:B\n")));
}

#[test]
fn test_id_encode_uses_configured_separator() {
    Env::new()
        .with_user_config("[affinity]\nclone_separator = \"+\"")
        .cairn()
        .args(["id", "encode", "--id", BASE_ID, "--chain", "A"])
        .assert()
        .success()
        .stdout(predicate::str::diff(format!("{BASE_ID}+A\n")));
}

#[test]
fn test_id_encode_refuses_unsafe_chain() {
    Env::new()
        .cairn()
        .args(["id", "encode", "--id", BASE_ID, "--chain", "<script>"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("refusing to encode"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_which_json() {
    let env = Env::new().with_user_config("[session]\napp_name = \"shop\"");
    let output = env
        .cairn()
        .args(["--json", "config", "which"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let sources: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["loaded"], true);
    assert_eq!(sources[1]["loaded"], false);
}

#[test]
fn test_config_show_json() {
    let output = Env::new()
        .with_user_config("[affinity]\nclone_id = \"A\"")
        .cairn()
        .args(["--json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["affinity"]["clone_id"], "A");
}

#[test]
fn test_config_show_summary() {
    Env::new()
        .with_user_config("[session]\napp_name = \"shop\"\n[persistence]\nwrite_policy = \"manual\"")
        .cairn()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shop"))
        .stdout(predicate::str::contains("manual"));
}

#[test]
fn test_config_check_valid() {
    Env::new()
        .cairn()
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration is valid"));
}

#[test]
fn test_config_check_invalid() {
    Env::new()
        .with_user_config("[memory]\nmax_in_memory = 0")
        .cairn()
        .args(["config", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("memory.max_in_memory"));
}

#[test]
fn test_config_init_then_refuse_overwrite() {
    let env = Env::new();
    env.cairn().args(["config", "init"]).assert().success();

    let written = fs::read_to_string(env.config.path().join("config.toml")).unwrap();
    assert!(written.contains("[session]"));
    assert!(written.contains("[reaper]"));

    env.cairn()
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    env.cairn()
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_init_local() {
    let env = Env::new();
    env.cairn()
        .args(["config", "init", "--local"])
        .assert()
        .success();
    assert!(env.cwd.path().join("cairn.toml").is_file());
}

// ─────────────────────────────────────────────────────────────────────────────
// Simulate Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_simulate_json() {
    let output = Env::new()
        .cairn()
        .args([
            "--json",
            "simulate",
            "--workers",
            "2",
            "--requests",
            "25",
            "--clients",
            "4",
            "--clones",
            "A,B",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["requests"], 50);
    assert_eq!(value["failures"], 0);
    assert_eq!(value["clients"], 4);
    assert!(value["distinct_sessions"].as_u64().unwrap() <= 4);
    assert_eq!(value["managers"].as_array().unwrap().len(), 2);
}

#[test]
fn test_simulate_rejects_zero_workers() {
    Env::new()
        .cairn()
        .args(["simulate", "--workers", "0"])
        .assert()
        .failure();
}
