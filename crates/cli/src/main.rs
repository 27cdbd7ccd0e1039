//! ITF CLI - Main Entry Point
//!
//! Tools around the test framework: live DLT capture, DLT file decoding,
//! configuration checks and target capability inspection.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{capabilities, config, dlt};
use itf_common::Scope;

/// ITF - Integration Test Framework tools
#[derive(Parser)]
#[command(name = "itf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run configuration file
    #[arg(short, long, default_value = "itf.toml", env = "ITF_CONFIG", global = true)]
    config: PathBuf,

    /// Target scope, overriding the run configuration
    #[arg(long, env = "ITF_TARGET_SCOPE", global = true)]
    target_scope: Option<Scope>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture and decode DLT traffic
    #[command(subcommand)]
    Dlt(dlt::DltCommands),

    /// Inspect the run configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Build the configured target and list its capabilities
    Capabilities(capabilities::CapabilitiesArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Dlt(cmd) => dlt::execute(cmd, &cli.config, cli.format).await,
        Commands::Config(cmd) => config::execute(cmd, &cli.config, cli.format).await,
        Commands::Capabilities(args) => {
            capabilities::execute(args, &cli.config, cli.target_scope, cli.format).await
        }
        Commands::Version => {
            println!("itf {}", itf_common::VERSION);
            Ok(())
        }
    };

    if let Err(e) = &result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
