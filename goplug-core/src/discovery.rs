//! Plugin discovery under the plugin root
//!
//! Looks at files directly under the root and one directory down, matching
//! file names against the discovery glob. Shared libraries go to the native
//! mechanism, other executables to the RPC mechanism.

use std::path::{Path, PathBuf};

use goplug_plugin_api::{Capabilities, Identity};
use serde::Serialize;

use crate::error::{PluginHostError, Result};
use crate::lifecycle::Mechanism;
use crate::native::is_library;
use crate::rpc::is_executable;

/// A file some mechanism may load
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub path: PathBuf,
    pub mechanism: Mechanism,
    /// Advisory `<stem>.json` found beside the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_identity: Option<Identity>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub candidates: Vec<Candidate>,
    pub warnings: Vec<String>,
}

/// Compile a discovery glob
pub fn pattern(glob: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(glob)
        .map_err(|e| PluginHostError::Config(format!("invalid file glob '{glob}': {e}")))
}

/// Files under `root` and its immediate subdirectories whose name matches
/// `pattern`, sorted by path
pub(crate) fn matching_files(root: &Path, pattern: &glob::Pattern) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            for inner in std::fs::read_dir(&path)? {
                let inner = inner?.path();
                if inner.is_file() && name_matches(&inner, pattern) {
                    found.push(inner);
                }
            }
        } else if path.is_file() && name_matches(&path, pattern) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn name_matches(path: &Path, pattern: &glob::Pattern) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| pattern.matches(n))
}

/// Classify every matching file under `root`
pub fn scan(
    root: &Path,
    pattern: &glob::Pattern,
    mask: Capabilities,
    source_extension: &str,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    for path in matching_files(root, pattern)? {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if ext == "json" || ext == source_extension {
            continue;
        }
        let mechanism = if is_library(&path) {
            Mechanism::Native
        } else if is_executable(&path) {
            Mechanism::Rpc
        } else {
            tracing::trace!(path = %path.display(), "Not loadable, skipping");
            continue;
        };
        let active = match mechanism {
            Mechanism::Native => mask.native,
            Mechanism::Rpc => mask.rpc,
        };
        if !active {
            tracing::debug!(path = %path.display(), %mechanism, "Mechanism inactive, skipping");
            continue;
        }

        let cache = path.with_extension("json");
        let cached_identity = if cache.is_file() {
            match Identity::load_identity(&cache) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    report
                        .warnings
                        .push(format!("ignoring identity cache {}: {e}", cache.display()));
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(path = %path.display(), %mechanism, "Discovered plugin");
        report.candidates.push(Candidate {
            path,
            mechanism,
            cached_identity,
        });
    }
    Ok(report)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn file(path: &Path, mode: u32) {
        std::fs::write(path, b"x").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    fn lib(name: &str) -> String {
        format!("{name}.{}", std::env::consts::DLL_EXTENSION)
    }

    #[test]
    fn test_scan_classifies_candidates() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        file(&root.join(lib("goplug-hello")), 0o644);
        file(&root.join("goplug-echo"), 0o755);
        file(&root.join("goplug-notes"), 0o644);
        file(&root.join("goplug-hello.rs"), 0o644);
        file(&root.join("other"), 0o755);
        std::fs::create_dir(root.join("goplug-nested")).unwrap();
        file(&root.join("goplug-nested").join("goplug-nested"), 0o755);

        let report = scan(root, &pattern("goplug-*").unwrap(), Capabilities::BOTH, "rs").unwrap();
        let found: Vec<(String, Mechanism)> = report
            .candidates
            .iter()
            .map(|c| {
                (
                    c.path.file_name().unwrap().to_string_lossy().into_owned(),
                    c.mechanism,
                )
            })
            .collect();
        assert_eq!(found.len(), 3, "{found:?}");
        assert!(found.contains(&(lib("goplug-hello"), Mechanism::Native)));
        assert!(found.contains(&("goplug-echo".to_string(), Mechanism::Rpc)));
        assert!(found.contains(&("goplug-nested".to_string(), Mechanism::Rpc)));
    }

    #[test]
    fn test_mask_filters_mechanisms() {
        let dir = TempDir::new().unwrap();
        file(&dir.path().join(lib("goplug-a")), 0o644);
        file(&dir.path().join("goplug-b"), 0o755);
        let report = scan(
            dir.path(),
            &pattern("goplug-*").unwrap(),
            Capabilities::RPC,
            "rs",
        )
        .unwrap();
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].mechanism, Mechanism::Rpc);
    }

    #[test]
    fn test_cached_identity_is_advisory() {
        let dir = TempDir::new().unwrap();
        file(&dir.path().join("goplug-a"), 0o755);
        std::fs::write(dir.path().join("goplug-a.json"), "{ not json").unwrap();
        file(&dir.path().join("goplug-b"), 0o755);
        Identity::new("b", "1.0.0")
            .rpc()
            .save_identity(&dir.path().join("goplug-b.json"))
            .unwrap();

        let report = scan(
            dir.path(),
            &pattern("goplug-*").unwrap(),
            Capabilities::BOTH,
            "rs",
        )
        .unwrap();
        assert_eq!(report.candidates.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        let b = report
            .candidates
            .iter()
            .find(|c| c.path.ends_with("goplug-b"))
            .unwrap();
        assert_eq!(b.cached_identity.as_ref().map(|i| i.name.as_str()), Some("b"));
    }

    #[test]
    fn test_bad_glob_is_config_error() {
        assert!(matches!(
            pattern("goplug-[").unwrap_err(),
            PluginHostError::Config(_)
        ));
    }
}
