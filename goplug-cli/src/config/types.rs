use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Command-line flags that win over every file and environment layer
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub plugin_dir: Option<PathBuf>,
    pub file_glob: Option<String>,
}

/// One configuration layer as written. Unset fields fall through to the
/// layer below.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHostConfig {
    pub plugin_dir: Option<PathBuf>,
    pub file_glob: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub startup_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub call_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub unload_grace: Option<Duration>,
    pub cache_identities: Option<bool>,
    #[serde(default)]
    pub handshake: RawHandshake,
    #[serde(default)]
    pub build: RawBuild,
    #[serde(default)]
    pub mechanisms: RawMechanisms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHandshake {
    pub protocol_version: Option<u32>,
    pub cookie_key: Option<String>,
    pub cookie_value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBuild {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub source_extension: Option<String>,
    pub smoke_test: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMechanisms {
    pub native: Option<bool>,
    pub rpc: Option<bool>,
}
