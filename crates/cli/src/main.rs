//! Busline CLI: the main entry point.
//!
//! Commands:
//! - `config`:   Show, validate or locate the configuration
//! - `simulate`: Run a producer and consumer against the in-memory broker

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "busline",
    about = "Busline: partitioned message bus client with retries and dead-lettering",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Simulate a publish/consume run with injected handler failures
    Simulate(commands::simulate::SimulateArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (file + environment)
    Show {
        /// Config file (defaults to ~/.busline/config.toml)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Validate the configuration and report warnings
    Validate {
        /// Config file (defaults to ~/.busline/config.toml)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print the config file location
    Path {
        /// Config file (defaults to ~/.busline/config.toml)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print a config file with every default filled in
    Defaults,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show { file } => commands::config_cmd::show(file).await?,
            ConfigAction::Validate { file } => commands::config_cmd::validate(file).await?,
            ConfigAction::Path { file } => commands::config_cmd::path(file).await?,
            ConfigAction::Defaults => commands::config_cmd::defaults().await?,
        },
        Commands::Simulate(args) => commands::simulate::run(args).await?,
    }

    Ok(())
}
