use super::types::{Overrides, RawBuild, RawHandshake, RawHostConfig, RawMechanisms};
use anyhow::{Context, Result};
use goplug_core::HostConfig;
use goplug_core::paths;
use goplug_plugin_api::Capabilities;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration: defaults, user file, project file,
    /// environment, then command-line flags
    pub fn load(overrides: &Overrides) -> Result<HostConfig> {
        let mut raw = RawHostConfig::default();

        // Layer 1: User config
        let user_path = Self::user_config_path();
        if user_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        // Layer 3: Environment
        let raw = Self::apply_env(raw, |key| std::env::var(key).ok())?;

        let mut config = Self::finalize(raw);
        if let Some(dir) = &overrides.plugin_dir {
            config.plugin_dir = dir.clone();
        }
        if let Some(glob) = &overrides.file_glob {
            config.file_glob = glob.clone();
        }
        Ok(config)
    }

    /// `<config_dir>/config.toml`
    pub fn user_config_path() -> PathBuf {
        paths::config_dir().join("config.toml")
    }

    /// Get project config path
    /// Can be overridden with GOPLUG_PROJECT_CONFIG_DIR env var (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("GOPLUG_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".goplug/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<RawHostConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawHostConfig, overlay: RawHostConfig) -> RawHostConfig {
        RawHostConfig {
            plugin_dir: overlay.plugin_dir.or(base.plugin_dir),
            file_glob: overlay.file_glob.or(base.file_glob),
            startup_timeout: overlay.startup_timeout.or(base.startup_timeout),
            call_timeout: overlay.call_timeout.or(base.call_timeout),
            unload_grace: overlay.unload_grace.or(base.unload_grace),
            cache_identities: overlay.cache_identities.or(base.cache_identities),
            handshake: RawHandshake {
                protocol_version: overlay
                    .handshake
                    .protocol_version
                    .or(base.handshake.protocol_version),
                cookie_key: overlay.handshake.cookie_key.or(base.handshake.cookie_key),
                cookie_value: overlay.handshake.cookie_value.or(base.handshake.cookie_value),
            },
            build: RawBuild {
                program: overlay.build.program.or(base.build.program),
                args: overlay.build.args.or(base.build.args),
                source_extension: overlay
                    .build
                    .source_extension
                    .or(base.build.source_extension),
                smoke_test: overlay.build.smoke_test.or(base.build.smoke_test),
                timeout: overlay.build.timeout.or(base.build.timeout),
            },
            mechanisms: RawMechanisms {
                native: overlay.mechanisms.native.or(base.mechanisms.native),
                rpc: overlay.mechanisms.rpc.or(base.mechanisms.rpc),
            },
        }
    }

    /// Apply `GOPLUG_*` variables on top of the file layers
    fn apply_env(
        mut raw: RawHostConfig,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<RawHostConfig> {
        let duration = |key: &str| -> Result<Option<std::time::Duration>> {
            var(key)
                .map(|value| {
                    humantime_serde::re::humantime::parse_duration(&value)
                        .with_context(|| format!("{key}={value} is not a duration"))
                })
                .transpose()
        };

        if let Some(dir) = var("GOPLUG_PLUGIN_DIR") {
            raw.plugin_dir = Some(PathBuf::from(dir));
        }
        if let Some(glob) = var("GOPLUG_FILE_GLOB") {
            raw.file_glob = Some(glob);
        }
        if let Some(timeout) = duration("GOPLUG_STARTUP_TIMEOUT")? {
            raw.startup_timeout = Some(timeout);
        }
        if let Some(timeout) = duration("GOPLUG_CALL_TIMEOUT")? {
            raw.call_timeout = Some(timeout);
        }
        if let Some(grace) = duration("GOPLUG_UNLOAD_GRACE")? {
            raw.unload_grace = Some(grace);
        }
        if let Some(key) = var("GOPLUG_COOKIE_KEY") {
            raw.handshake.cookie_key = Some(key);
        }
        if let Some(value) = var("GOPLUG_COOKIE_VALUE") {
            raw.handshake.cookie_value = Some(value);
        }
        Ok(raw)
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawHostConfig) -> HostConfig {
        let mut config = HostConfig::default();
        if let Some(dir) = raw.plugin_dir {
            config.plugin_dir = dir;
        }
        if let Some(glob) = raw.file_glob {
            config.file_glob = glob;
        }
        if let Some(timeout) = raw.startup_timeout {
            config.startup_timeout = timeout;
        }
        config.call_timeout = raw.call_timeout.or(config.call_timeout);
        if let Some(grace) = raw.unload_grace {
            config.unload_grace = grace;
        }
        if let Some(cache) = raw.cache_identities {
            config.cache_identities = cache;
        }

        let handshake = &mut config.handshake;
        if let Some(version) = raw.handshake.protocol_version {
            handshake.protocol_version = version;
        }
        if let Some(key) = raw.handshake.cookie_key {
            handshake.cookie_key = key;
        }
        if let Some(value) = raw.handshake.cookie_value {
            handshake.cookie_value = value;
        }

        let build = &mut config.build;
        if let Some(program) = raw.build.program {
            build.program = program;
        }
        if let Some(args) = raw.build.args {
            build.args = args;
        }
        if let Some(ext) = raw.build.source_extension {
            build.source_extension = ext;
        }
        if let Some(smoke) = raw.build.smoke_test {
            build.smoke_test = smoke;
        }
        build.timeout = raw.build.timeout.or(build.timeout);

        config.mechanisms = Capabilities {
            native: raw.mechanisms.native.unwrap_or(config.mechanisms.native),
            rpc: raw.mechanisms.rpc.unwrap_or(config.mechanisms.rpc),
        };
        config
    }

    /// Load a single file layered over defaults
    pub fn load_from_path(path: &Path) -> Result<HostConfig> {
        Ok(Self::finalize(Self::read_raw(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn raw(toml: &str) -> RawHostConfig {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_empty_layer_gives_defaults() {
        let config = ConfigLoader::finalize(RawHostConfig::default());
        let defaults = HostConfig::default();
        assert_eq!(config, defaults);
    }

    #[test]
    fn test_merge_raw_overlay_overrides_base() {
        let base = raw(
            r#"
            file_glob = "goplug-*"
            unload_grace = "5s"
            [handshake]
            cookie_key = "BASE"
            cookie_value = "base"
            "#,
        );
        let overlay = raw(
            r#"
            unload_grace = "1s"
            [handshake]
            cookie_value = "overlay"
            [mechanisms]
            rpc = false
            "#,
        );
        let config = ConfigLoader::finalize(ConfigLoader::merge_raw(base, overlay));
        assert_eq!(config.file_glob, "goplug-*");
        assert_eq!(config.unload_grace, Duration::from_secs(1));
        assert_eq!(config.handshake.cookie_key, "BASE");
        assert_eq!(config.handshake.cookie_value, "overlay");
        assert!(config.mechanisms.native);
        assert!(!config.mechanisms.rpc);
    }

    #[test]
    fn test_merge_raw_none_preserves_base() {
        let base = raw(
            r#"
            call_timeout = "250ms"
            [build]
            program = "cc"
            smoke_test = false
            "#,
        );
        let config = ConfigLoader::finalize(ConfigLoader::merge_raw(base, RawHostConfig::default()));
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.build.program, "cc");
        assert!(!config.build.smoke_test);
    }

    #[test]
    fn test_env_overrides_files() {
        let env: HashMap<&str, &str> = [
            ("GOPLUG_PLUGIN_DIR", "/srv/plugins"),
            ("GOPLUG_STARTUP_TIMEOUT", "2s"),
            ("GOPLUG_COOKIE_VALUE", "from-env"),
        ]
        .into_iter()
        .collect();
        let base = raw("startup_timeout = \"1m\"\n");
        let merged = ConfigLoader::apply_env(base, |k| env.get(k).map(|v| v.to_string())).unwrap();
        let config = ConfigLoader::finalize(merged);
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.startup_timeout, Duration::from_secs(2));
        assert_eq!(config.handshake.cookie_value, "from-env");
    }

    #[test]
    fn test_bad_env_duration_is_error() {
        let result = ConfigLoader::apply_env(RawHostConfig::default(), |k| {
            (k == "GOPLUG_UNLOAD_GRACE").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "file_glob = \"plug-*\"\ncache_identities = true\n").unwrap();
        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.file_glob, "plug-*");
        assert!(config.cache_identities);
    }

    #[test]
    fn test_load_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "file_glob = [").unwrap();
        assert!(ConfigLoader::load_from_path(&path).is_err());
    }
}
