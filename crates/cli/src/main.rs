//! tradeflow CLI
//!
//! Runs the streaming aggregation engine against the configured log and
//! storage, and inspects its checkpoints.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{CheckpointCommand, RunCommand};
use std::path::PathBuf;
use tradeflow_config::{AppConfig, ObservabilityConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "tradeflow",
    version,
    about = "tradeflow - per-minute trade aggregation over a partitioned log",
    long_about = "Consumes binary trade envelopes, stores every trade and emits one\n\
                  aggregate per symbol and minute once the event-time watermark\n\
                  has passed the minute."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        env = "TRADEFLOW_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted
    #[command(name = "run", about = "Run the streaming pipeline")]
    Run(RunCommand),

    /// Checkpoint inspection
    #[command(name = "checkpoint", about = "Inspect committed checkpoints")]
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },

    /// Load and validate configuration
    #[command(name = "validate", about = "Validate configuration and exit")]
    Validate,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Checkpoint { command } => command.execute().await,
        Commands::Validate => {
            let config = AppConfig::load(cli.config)?;
            config.validate()?;
            commands::print_summary(&config);
            println!("{}", "Configuration is valid".green().bold());
            Ok(())
        }
        Commands::Run(command) => {
            let config = AppConfig::load(cli.config)?;
            config.validate()?;
            init_tracing(&config.observability, cli.verbose);
            command.execute(config).await
        }
    }
}

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(observability: &ObservabilityConfig, verbose: bool) {
    let default_level = if verbose {
        "debug"
    } else {
        observability.log_level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
