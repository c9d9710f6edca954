//! Skein CLI - Main Entry Point
//!
//! Applies mesh declarations, inspects recorded state and renders the
//! agent config deployed to an endpoint.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use skein_cli::commands::{config, deploy, render, state, Context};
use skein_cli::logging::{self, LogFormat};
use skein_cli::output::OutputFormat;
use skein_orchestrator::OrchestratorConfig;
use std::path::PathBuf;

fn default_config_path() -> PathBuf {
    skein_common::default_store_path().join("config.toml")
}

/// Skein - Declarative Overlay Mesh Provisioner
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "SKEIN_CONFIG", default_value_os_t = default_config_path(), global = true)]
    config: PathBuf,

    /// Store directory, overriding the configuration
    #[arg(long, env = "SKEIN_STORE", global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the deployment to a declaration
    Apply(deploy::DeclarationArgs),

    /// Show what apply would change
    Plan(deploy::DeclarationArgs),

    /// Tear down every recorded resource
    Destroy(deploy::DestroyArgs),

    /// Inspect recorded state
    #[command(subcommand)]
    State(state::StateCommands),

    /// Print the agent config deployed to an endpoint
    Render(render::RenderArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug, cli.log_format, "info");

    let mut config = OrchestratorConfig::load(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    let ctx = Context {
        config,
        config_path: cli.config,
        format: cli.output,
    };

    match cli.command {
        Commands::Apply(args) => deploy::apply(args, &ctx).await?,
        Commands::Plan(args) => deploy::plan(args, &ctx).await?,
        Commands::Destroy(args) => deploy::destroy(args, &ctx).await?,
        Commands::State(cmd) => state::execute(cmd, &ctx).await?,
        Commands::Render(args) => render::execute(args, &ctx).await?,
        Commands::Config(cmd) => config::execute(cmd, &ctx).await?,
        Commands::Version => {
            println!("Skein CLI v{}", skein_common::VERSION);
        }
    }

    Ok(())
}
