//! Command line interface of modelgen.
//!
//! # Usage
//!
//! ```bash
//! modelgen generate models/
//! modelgen build --config modelgen.toml models/lstorage/lstorage.toml
//! modelgen simulate decay --steps 10 --set control.k=0.5
//! ```

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Generate, build and simulate declaratively specified process models
#[derive(Parser, Debug)]
#[command(name = "modelgen")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Model-code generator for declaratively specified process models", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write generated units that are missing or stale
    Generate(commands::generate::GenerateArgs),
    /// Run the generation pipeline without writing anything
    Check(commands::check::CheckArgs),
    /// Generate units and hand them to the configured toolchain
    Build(commands::build::BuildArgs),
    /// Simulate a model with the reference runtime
    Simulate(commands::simulate::SimulateArgs),
    /// List the bundled models
    List(commands::list::ListArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = commands::load_config(cli.config.as_deref())?;
    let ignore: Vec<PathBuf> = cli.config.into_iter().collect();
    match cli.command {
        Commands::Generate(args) => commands::generate::execute(args, &config, &ignore),
        Commands::Check(args) => commands::check::execute(args, &config, &ignore),
        Commands::Build(args) => commands::build::execute(args, &config, &ignore),
        Commands::Simulate(args) => commands::simulate::execute(args, config),
        Commands::List(args) => commands::list::execute(args),
    }
}
