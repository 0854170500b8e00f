//! XDG Base Directory paths for goplug.
//!
//! CLI tools should use XDG paths for cross-platform consistency,
//! not platform-native paths.

use std::path::PathBuf;

/// Environment variable that relocates the whole goplug home
pub const HOME_ENV: &str = "GOPLUG_HOME";

/// Get the goplug config directory.
///
/// Returns `$GOPLUG_HOME` if set, then `$XDG_CONFIG_HOME/goplug`, otherwise
/// `~/.config/goplug`.
pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV) {
        PathBuf::from(home)
    } else if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("goplug")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config/goplug")
    } else {
        PathBuf::from(".config/goplug")
    }
}

/// Default plugin root, `<config_dir>/plugins`
pub fn plugin_dir() -> PathBuf {
    config_dir().join("plugins")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_dir_is_under_config_dir() {
        assert_eq!(plugin_dir(), config_dir().join("plugins"));
    }

    #[test]
    fn test_config_dir_ends_with_goplug_unless_relocated() {
        if std::env::var(HOME_ENV).is_err() {
            assert!(config_dir().ends_with("goplug"));
        }
    }
}
