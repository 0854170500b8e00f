//! Configuration for the plugin host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use goplug_plugin_api::Capabilities;
use goplug_plugin_api::rpc::HandshakeConfig;
use serde::{Deserialize, Serialize};

use crate::error::{PluginHostError, Result};

/// Default discovery glob
pub const DEFAULT_FILE_GLOB: &str = "goplug-*";

/// Host-wide settings shared by the manager and both mechanisms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Plugin root directory.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Glob matched against file names under the plugin root.
    #[serde(default = "default_file_glob")]
    pub file_glob: String,

    /// Bound on child spawn plus handshake.
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Per-call deadline for RPC requests. Unbounded when unset.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,

    /// How long an RPC child may take to exit after `Shutdown` before it is killed.
    #[serde(default = "default_unload_grace", with = "humantime_serde")]
    pub unload_grace: Duration,

    /// Write `<stem>.json` beside every successfully loaded artifact.
    #[serde(default)]
    pub cache_identities: bool,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub build: BuildConfig,

    /// Mechanisms the loader may use.
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Capabilities,
}

/// How the builder compiles plugin sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Compiler executable.
    #[serde(default = "default_build_program")]
    pub program: String,

    /// Arguments. `{source}` and `{artifact}` are substituted.
    #[serde(default = "default_build_args")]
    pub args: Vec<String>,

    /// Source file extension the builder looks for.
    #[serde(default = "default_source_extension")]
    pub source_extension: String,

    /// Load and unload every fresh artifact.
    #[serde(default = "default_true")]
    pub smoke_test: bool,

    /// Deadline for one compilation. Falls back to `startup_timeout`.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

fn default_plugin_dir() -> PathBuf {
    crate::paths::plugin_dir()
}

fn default_file_glob() -> String {
    DEFAULT_FILE_GLOB.to_string()
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_unload_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_mechanisms() -> Capabilities {
    Capabilities::BOTH
}

fn default_build_program() -> String {
    "rustc".to_string()
}

fn default_build_args() -> Vec<String> {
    [
        "--crate-type",
        "cdylib",
        "--edition",
        "2024",
        "-C",
        "opt-level=2",
        "-o",
        "{artifact}",
        "{source}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_source_extension() -> String {
    "rs".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: default_build_program(),
            args: default_build_args(),
            source_extension: default_source_extension(),
            smoke_test: true,
            timeout: None,
        }
    }
}

impl BuildConfig {
    /// Arguments with placeholders filled in
    pub fn render_args(&self, source: &Path, artifact: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source.to_string_lossy())
                    .replace("{artifact}", &artifact.to_string_lossy())
            })
            .collect()
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            file_glob: default_file_glob(),
            startup_timeout: default_startup_timeout(),
            call_timeout: None,
            unload_grace: default_unload_grace(),
            cache_identities: false,
            handshake: HandshakeConfig::default(),
            build: BuildConfig::default(),
            mechanisms: default_mechanisms(),
        }
    }
}

impl HostConfig {
    /// Create a new config rooted at `dir`.
    #[must_use]
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_mechanisms(mut self, mechanisms: Capabilities) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PluginHostError::Config(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PluginHostError::Config(e.to_string()))
    }

    /// Timeout applied to one compilation
    pub fn build_timeout(&self) -> Duration {
        self.build.timeout.unwrap_or(self.startup_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.file_glob, "goplug-*");
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.unload_grace, Duration::from_secs(5));
        assert!(config.call_timeout.is_none());
        assert_eq!(config.mechanisms, Capabilities::BOTH);
        assert_eq!(config.handshake.protocol_version, 1);
    }

    #[test]
    fn test_parse_humantime_durations() {
        let config = HostConfig::from_toml(
            r#"
            plugin_dir = "/srv/plugins"
            startup_timeout = "10s"
            call_timeout = "250ms"

            [mechanisms]
            native = true
            rpc = false
            "#,
        )
        .unwrap();
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.startup_timeout, Duration::from_secs(10));
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.mechanisms, Capabilities::NATIVE);
        assert_eq!(config.unload_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_toml_roundtrip_keeps_build_section() {
        let mut config = HostConfig::default().with_plugin_dir("/p");
        config.build.smoke_test = false;
        let text = config.to_toml().unwrap();
        let back = HostConfig::from_toml(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = HostConfig::from_toml("startup_timeout = 5").unwrap_err();
        assert!(matches!(err, PluginHostError::Config(_)));
    }

    #[test]
    fn test_render_build_args() {
        let build = BuildConfig::default();
        let args = build.render_args(Path::new("/p/x.rs"), Path::new("/p/x.so"));
        assert!(args.contains(&"/p/x.rs".to_string()));
        assert!(args.contains(&"/p/x.so".to_string()));
        assert!(!args.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn test_build_timeout_falls_back_to_startup() {
        let mut config = HostConfig::default();
        assert_eq!(config.build_timeout(), config.startup_timeout);
        config.build.timeout = Some(Duration::from_secs(120));
        assert_eq!(config.build_timeout(), Duration::from_secs(120));
    }
}
