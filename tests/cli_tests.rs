//! CLI integration tests for the pipeline binary
//!
//! Covers help output, config validation and the sources listing. Nothing
//! here talks to a model.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_cli(args: &[&str], working_dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ares-pipeline"))
        .arg("--no-color")
        .args(args)
        .current_dir(working_dir)
        .output()
        .expect("Failed to execute binary")
}

fn write_config(dir: &Path, content: &str) {
    fs::write(dir.join("ares-pipeline.toml"), content).unwrap();
}

const CONFIG: &str = r#"
[pipeline]
max_concurrency = 3

[sources.sales_db]
description = "quarterly sales figures"

[sources.hr_db]
description = "employee records"
"#;

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["--help"], dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("config"));
    assert!(stdout.contains("sources"));
}

#[test]
fn test_run_requires_a_message() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["run"], dir.path());
    assert!(!output.status.success());
}

#[test]
fn test_sources_lists_configured_sources() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), CONFIG);

    let output = run_cli(&["sources"], dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sales_db"));
    assert!(stdout.contains("employee records"));
}

#[test]
fn test_config_shows_limits() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), CONFIG);

    let output = run_cli(&["config"], dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("max concurrency: 3"));
    assert!(stdout.contains("provider: Ollama"));
}

#[test]
fn test_config_full_prints_toml() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), CONFIG);

    let output = run_cli(&["config", "--full"], dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[sources.sales_db]"));
}

#[test]
fn test_validate_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "[pipeline]\nevent_buffer = 0\n");

    let output = run_cli(&["config", "--validate"], dir.path());
    assert!(!output.status.success());
}

#[test]
fn test_validate_requires_config_file() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["config", "--validate"], dir.path());
    assert!(!output.status.success());
}

#[test]
fn test_missing_config_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["sources"], dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("using default configuration"));
    assert!(stdout.contains("No sources configured"));
}
