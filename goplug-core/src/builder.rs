//! Rebuild-on-change for native plugin sources
//!
//! A source is compiled when it has no artifact yet or is strictly newer than
//! the one beside it. The toolchain runs as a child process; its stdout and
//! stderr are streamed to the log by two tasks that finish before the build
//! returns.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::config::{BuildConfig, HostConfig};
use crate::discovery::matching_files;
use crate::error::{Diagnostic, PluginHostError, Result};
use crate::native;
use crate::output::forward_lines;

/// Outcome of one pass over the plugin root
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub built: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<Diagnostic>,
}

impl BuildReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Artifact path for a plugin source: same stem, platform library extension
pub fn artifact_for(source: &Path) -> PathBuf {
    source.with_extension(std::env::consts::DLL_EXTENSION)
}

/// Whether `source` must be (re)built into `artifact`
pub fn needs_build(source: &Path, artifact: &Path) -> Result<bool> {
    let source_mtime = std::fs::metadata(source)?.modified()?;
    match std::fs::metadata(artifact) {
        Ok(meta) => Ok(source_mtime > meta.modified()?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

pub struct Builder {
    config: BuildConfig,
    timeout: Duration,
}

impl Builder {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            config: config.build.clone(),
            timeout: config.build_timeout(),
        }
    }

    /// Sources under `root` whose file name matches `pattern`
    pub fn sources(&self, root: &Path, pattern: &glob::Pattern) -> Result<Vec<PathBuf>> {
        Ok(matching_files(root, pattern)?
            .into_iter()
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == self.config.source_extension.as_str())
            })
            .collect())
    }

    /// Build every stale source. One failure does not stop the others.
    pub async fn build_all(&self, root: &Path, pattern: &glob::Pattern) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        for source in self.sources(root, pattern)? {
            let artifact = artifact_for(&source);
            let stale = match needs_build(&source, &artifact) {
                Ok(stale) => stale,
                Err(e) => {
                    report.failed.push(e.diagnostic(source.display().to_string()));
                    continue;
                }
            };
            if !stale {
                tracing::debug!(source = %source.display(), "Artifact is up to date");
                report.skipped.push(source);
                continue;
            }
            match self.build(&source, &artifact).await {
                Ok(()) => report.built.push(artifact),
                Err(e) => {
                    tracing::error!(source = %source.display(), error = %e, "Build failed");
                    report.failed.push(e.diagnostic(source.display().to_string()));
                }
            }
        }
        tracing::info!(
            built = report.built.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Build pass complete"
        );
        Ok(report)
    }

    /// Compile one source, then smoke-test the artifact if configured
    pub async fn build(&self, source: &Path, artifact: &Path) -> Result<()> {
        let logger = format!(
            "build[{}]",
            source.file_name().unwrap_or_default().to_string_lossy()
        );
        let args = self.config.render_args(source, artifact);
        tracing::info!(source = %source.display(), program = %self.config.program, "Building plugin");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginHostError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to run {}: {}", self.config.program, e),
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, logger.clone(), "stdout", true)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, logger.clone(), "stderr", true)));

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(PluginHostError::BuildFailed {
                    path: source.to_path_buf(),
                    status: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        for task in [stdout, stderr].into_iter().flatten() {
            if let Err(e) = task.await {
                tracing::debug!(plugin = %logger, error = %e, "Output task failed");
            }
        }

        if !status.success() {
            return Err(PluginHostError::BuildFailed {
                path: source.to_path_buf(),
                status: status.to_string(),
            });
        }
        if !artifact.exists() {
            return Err(PluginHostError::BuildFailed {
                path: source.to_path_buf(),
                status: format!("{} was not produced", artifact.display()),
            });
        }
        align_mtime(source, artifact)?;

        if self.config.smoke_test {
            let path = artifact.to_path_buf();
            let identity = tokio::task::spawn_blocking(move || native::probe(&path))
                .await
                .map_err(|e| PluginHostError::BuildFailed {
                    path: source.to_path_buf(),
                    status: format!("smoke test aborted: {e}"),
                })??;
            tracing::info!(plugin = %identity.name, version = %identity.version, "Smoke test passed");
        }
        Ok(())
    }
}

/// Raise the artifact's mtime to the source's if the clock put it behind
fn align_mtime(source: &Path, artifact: &Path) -> Result<()> {
    let source_mtime = std::fs::metadata(source)?.modified()?;
    let artifact_mtime = std::fs::metadata(artifact)?.modified()?;
    if artifact_mtime < source_mtime {
        std::fs::File::options()
            .write(true)
            .open(artifact)?
            .set_modified(source_mtime)?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    /// A "compiler" that copies the source to the artifact
    fn copying_builder(dir: &TempDir) -> Builder {
        let mut config = HostConfig::default().with_plugin_dir(dir.path());
        config.build = BuildConfig {
            program: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                "cp \"$1\" \"$0\"".into(),
                "{artifact}".into(),
                "{source}".into(),
            ],
            source_extension: "rs".into(),
            smoke_test: false,
            timeout: Some(Duration::from_secs(10)),
        };
        Builder::new(&config)
    }

    #[test]
    fn test_needs_build() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("goplug-x.rs");
        let artifact = artifact_for(&source);
        std::fs::write(&source, "fn main() {}").unwrap();
        assert!(needs_build(&source, &artifact).unwrap());

        std::fs::write(&artifact, "").unwrap();
        let t = SystemTime::now() - Duration::from_secs(100);
        set_mtime(&artifact, t);
        set_mtime(&source, t + Duration::from_secs(10));
        assert!(needs_build(&source, &artifact).unwrap());

        set_mtime(&source, t);
        set_mtime(&artifact, t + Duration::from_secs(10));
        assert!(!needs_build(&source, &artifact).unwrap());

        // Equal timestamps are not stale
        set_mtime(&artifact, t);
        assert!(!needs_build(&source, &artifact).unwrap());
    }

    #[tokio::test]
    async fn test_build_all_then_noop() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("goplug-x.rs");
        std::fs::write(&source, "// plugin").unwrap();
        let builder = copying_builder(&dir);
        let pattern = glob::Pattern::new("goplug-*").unwrap();

        let first = builder.build_all(dir.path(), &pattern).await.unwrap();
        assert!(first.is_ok(), "{:?}", first.failed);
        assert_eq!(first.built, vec![artifact_for(&source)]);

        let second = builder.build_all(dir.path(), &pattern).await.unwrap();
        assert!(second.built.is_empty());
        assert_eq!(second.skipped, vec![source]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_sources() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("goplug-a.rs"), "a").unwrap();
        std::fs::write(dir.path().join("goplug-b.rs"), "b").unwrap();

        let mut config = HostConfig::default();
        config.build = BuildConfig {
            program: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                "case \"$1\" in *goplug-a.rs) echo 'error: broken' >&2; exit 1;; esac; cp \"$1\" \"$0\"".into(),
                "{artifact}".into(),
                "{source}".into(),
            ],
            source_extension: "rs".into(),
            smoke_test: false,
            timeout: None,
        };
        let builder = Builder::new(&config);
        let report = builder
            .build_all(dir.path(), &glob::Pattern::new("goplug-*").unwrap())
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind.as_str(), "BUILD_FAILED");
        assert_eq!(report.built.len(), 1);
        assert!(artifact_for(&dir.path().join("goplug-b.rs")).exists());
    }
}
