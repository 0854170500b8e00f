//! Rebuild-on-change through the manager
#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, SystemTime};

use goplug_core::builder::artifact_for;
use goplug_core::{BuildConfig, ErrorKind, HostConfig, Manager};
use tempfile::TempDir;

fn set_mtime(path: &Path, time: SystemTime) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

/// Host whose "compiler" copies the source over the artifact
fn manager(dir: &TempDir, script: &str) -> Manager {
    let mut config = HostConfig::default().with_plugin_dir(dir.path());
    config.build = BuildConfig {
        program: "/bin/sh".into(),
        args: vec![
            "-c".into(),
            script.into(),
            "{artifact}".into(),
            "{source}".into(),
        ],
        source_extension: "rs".into(),
        smoke_test: false,
        timeout: Some(Duration::from_secs(10)),
    };
    Manager::new(config).unwrap()
}

#[tokio::test]
async fn newer_source_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("goplug-x.rs");
    let artifact = artifact_for(&source);
    std::fs::write(&source, "// v2").unwrap();
    std::fs::write(&artifact, "v1").unwrap();

    let t = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&artifact, t);
    set_mtime(&source, t + Duration::from_secs(10));

    let mgr = manager(&dir, "cp \"$1\" \"$0\"");
    let report = mgr.build_plugins().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.failed);
    assert_eq!(report.built, vec![artifact.clone()]);
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "// v2");
    assert!(mtime(&artifact) >= mtime(&source));

    // Second pass is a no-op
    let before = mtime(&artifact);
    let report = mgr.build_plugins().await.unwrap();
    assert!(report.built.is_empty());
    assert_eq!(report.skipped, vec![source]);
    assert_eq!(mtime(&artifact), before);
}

#[tokio::test]
async fn older_source_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("goplug-x.rs");
    let artifact = artifact_for(&source);
    std::fs::write(&source, "// new").unwrap();
    std::fs::write(&artifact, "old").unwrap();

    let t = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&source, t);
    set_mtime(&artifact, t + Duration::from_secs(10));

    let mgr = manager(&dir, "cp \"$1\" \"$0\"");
    let report = mgr.build_plugins().await.unwrap();
    assert!(report.built.is_empty());
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "old");
}

#[tokio::test]
async fn failing_compiler_is_reported_in_error_slot() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("goplug-broken.rs"), "fn").unwrap();

    let mgr = manager(&dir, "echo 'error: expected identifier' >&2; exit 1");
    let report = mgr.build_plugins().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].kind, ErrorKind::BuildFailed);
    assert_eq!(mgr.error().map(|d| d.kind), Some(ErrorKind::BuildFailed));
}
