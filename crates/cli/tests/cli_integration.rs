//! CLI integration tests.
//!
//! Spawns the `connector` binary with `assert_cmd` and checks exit codes
//! and output. Paths are relative to the workspace root.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .to_path_buf()
}

fn connector() -> Command {
    let mut cmd = cargo_bin_cmd!("connector");
    cmd.current_dir(workspace_root());
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

// ──────────────────────────────────────────────
// Help
// ──────────────────────────────────────────────

#[test]
fn help_lists_subcommands() {
    connector()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn demo_requires_a_scenario() {
    connector()
        .arg("demo")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--scenario"));
}

// ──────────────────────────────────────────────
// check-config
// ──────────────────────────────────────────────

#[test]
fn check_config_prints_effective_settings() {
    connector()
        .args(["check-config", "demos/connector.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("connector_id      demo"))
        .stdout(predicate::str::contains("identity_claim    client_id"))
        .stdout(predicate::str::contains("batch_size=10"))
        .stdout(predicate::str::contains("ids:tier -> tier"));
}

#[test]
fn check_config_json_round_trips_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "partial.toml", "[transfer]\nmax_retries = 7\n");

    let output = connector()
        .args(["--output", "json", "check-config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["transfer"]["max_retries"], 7);
    assert_eq!(config["negotiation"]["max_retries"], 5);
    assert_eq!(config["connector_id"], "connector");
}

#[test]
fn check_config_rejects_unknown_keys() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "bad.toml", "[negotiation]\nmax_retry = 2\n");

    connector()
        .arg("check-config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"))
        .stderr(predicate::str::contains("max_retry"));
}

#[test]
fn check_config_missing_file_fails() {
    connector()
        .args(["--output", "json", "check-config", "demos/missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("{\"error\": \"error reading config"));
}

// ──────────────────────────────────────────────
// demo
// ──────────────────────────────────────────────

#[test]
fn demo_scenario_is_confirmed_and_provisioned() {
    connector()
        .args([
            "demo",
            "--scenario",
            "demos/scenario.toml",
            "--config",
            "demos/connector.toml",
            "--timeout-secs",
            "10",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("offer             eu-weather"))
        .stdout(predicate::str::contains("(Confirmed)"))
        .stdout(predicate::str::contains("(Provisioned)"))
        .stdout(predicate::str::contains("region=eu"))
        .stdout(predicate::str::contains("-secret"));
}

#[test]
fn demo_json_summary() {
    let output = connector()
        .args([
            "--output",
            "json",
            "demo",
            "--scenario",
            "demos/scenario.toml",
            "--config",
            "demos/connector.toml",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["offers"], 2);
    assert_eq!(summary["negotiation_state"], "CONFIRMED");
    assert_eq!(summary["transfer_state"], "PROVISIONED");
    assert_eq!(summary["destination"]["kind"], "memory");
    assert!(summary["agreement_id"]
        .as_str()
        .unwrap()
        .starts_with("eu-weather:"));
}

#[test]
fn demo_fails_when_nothing_is_offered() {
    let dir = TempDir::new().unwrap();
    let scenario = fs::read_to_string(workspace_root().join("demos/scenario.toml"))
        .unwrap()
        .replace(
            "claims = { region = \"eu\", partnerLevel = \"gold\" }",
            "claims = { region = \"us\" }",
        );
    let path = write(&dir, "scenario.toml", &scenario);

    connector()
        .args(["demo", "--config", "demos/connector.toml", "--scenario"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no offers visible to 'consumer'"));
}

#[test]
fn demo_fails_when_provisioning_fails() {
    let dir = TempDir::new().unwrap();
    let scenario = fs::read_to_string(workspace_root().join("demos/scenario.toml"))
        .unwrap()
        .replace("kind = \"memory\", properties", "kind = \"tape\", properties");
    let path = write(&dir, "scenario.toml", &scenario);

    connector()
        .args(["demo", "--config", "demos/connector.toml", "--scenario"])
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("(Confirmed)"))
        .stdout(predicate::str::contains("(Error)"))
        .stdout(predicate::str::contains("no provisioner for resource kind 'tape'"));
}
