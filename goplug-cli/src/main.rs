use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "goplug", about = "Discover, build, load and call goplug plugins")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Plugin root (overrides configuration)
    #[arg(long, global = true)]
    dir: Option<std::path::PathBuf>,

    /// Discovery glob (overrides configuration)
    #[arg(long, global = true)]
    glob: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every plugin under the plugin root and list them
    List(commands::plugin::ListArgs),
    /// Show which files would be loaded, without loading them
    Scan,
    /// Rebuild plugin sources newer than their artifacts
    Build,
    /// Load a single plugin file and print its snapshot
    Load(commands::plugin::LoadArgs),
    /// Call a hook on a plugin
    Call(commands::plugin::CallArgs),
    /// Print a plugin's identity JSON
    Identify(commands::plugin::LoadArgs),
    /// Show a loaded plugin's identity, hooks and value bag
    Info(commands::plugin::InfoArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let overrides = config::Overrides {
        plugin_dir: cli.dir,
        file_glob: cli.glob,
    };

    match cli.command {
        Commands::List(args) => commands::plugin::list(&overrides, args).await,
        Commands::Scan => commands::plugin::scan(&overrides),
        Commands::Build => commands::build::run(&overrides).await,
        Commands::Load(args) => commands::plugin::load(&overrides, args).await,
        Commands::Call(args) => commands::plugin::call(&overrides, args).await,
        Commands::Identify(args) => commands::plugin::identify(&overrides, args).await,
        Commands::Info(args) => commands::plugin::info(&overrides, args).await,
        Commands::Config(args) => commands::config::run(&overrides, args),
    }
}
