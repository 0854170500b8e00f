pub mod build;
pub mod config;
pub mod plugin;

use anyhow::Result;
use goplug_core::Manager;

use crate::config::{ConfigLoader, Overrides};

/// Manager built from the layered configuration
pub fn manager(overrides: &Overrides) -> Result<Manager> {
    let config = ConfigLoader::load(overrides)?;
    tracing::debug!(dir = %config.plugin_dir.display(), glob = %config.file_glob, "Configuration loaded");
    Ok(Manager::new(config)?)
}

/// Print every warning the last manager call produced
pub fn print_warnings(manager: &Manager) {
    for warning in manager.warnings() {
        eprintln!("warning: {warning}");
    }
}
