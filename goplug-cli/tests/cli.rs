//! End-to-end tests for the goplug binary

use std::process::{Command, Output};

use tempfile::TempDir;

const GOPLUG: &str = env!("CARGO_BIN_EXE_goplug");

/// Run goplug with its home and project config isolated under `home`
fn goplug(home: &TempDir, args: &[&str]) -> Output {
    Command::new(GOPLUG)
        .args(args)
        .env("GOPLUG_HOME", home.path())
        .env("GOPLUG_PROJECT_CONFIG_DIR", home.path().join("project"))
        .env_remove("GOPLUG_PLUGIN_DIR")
        .env_remove("GOPLUG_FILE_GLOB")
        .output()
        .expect("failed to run goplug")
}

#[test]
fn help_lists_commands() {
    let home = TempDir::new().unwrap();
    let output = goplug(&home, &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Discover, build, load and call goplug plugins"));
    for command in ["list", "scan", "build", "call", "info", "config"] {
        assert!(stdout.contains(command), "missing {command}");
    }
}

#[test]
fn config_show_works_without_config() {
    let home = TempDir::new().unwrap();
    let output = goplug(&home, &["config", "show"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("file_glob = \"goplug-*\""), "{stdout}");
    assert!(stdout.contains("[handshake]"));
}

#[test]
fn project_config_overrides_defaults() {
    let home = TempDir::new().unwrap();
    let project = home.path().join("project");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("config.toml"), "file_glob = \"ext-*\"\n").unwrap();

    let output = goplug(&home, &["config", "show"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("file_glob = \"ext-*\""), "{stdout}");
}

#[test]
fn list_with_empty_plugin_dir() {
    let home = TempDir::new().unwrap();
    let plugins = home.path().join("plugins");
    let output = goplug(&home, &["list", "--dir", plugins.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No plugins loaded"), "{stdout}");
    assert!(plugins.is_dir());
}

#[test]
fn call_on_unknown_plugin_fails() {
    let home = TempDir::new().unwrap();
    let output = goplug(&home, &["call", "nobody", "Greet"]);
    assert!(!output.status.success());
}
