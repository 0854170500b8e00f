use crate::config::{ConfigLoader, Overrides};
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show {
        /// Show a single file layered over defaults instead
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show configuration file paths
    Path,
}

pub fn run(overrides: &Overrides, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { file } => show_config(overrides, file.as_deref()),
        ConfigCommands::Path => show_paths(),
    }
}

fn show_config(overrides: &Overrides, file: Option<&Path>) -> Result<()> {
    let config = match file {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load(overrides)?,
    };
    println!("{}", config.to_toml()?);
    Ok(())
}

fn show_paths() -> Result<()> {
    println!("User config:    {}", ConfigLoader::user_config_path().display());
    println!("Project config: {}", ConfigLoader::project_config_path().display());
    Ok(())
}
