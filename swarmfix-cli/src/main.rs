//! Swarmfix CLI - Command-line interface
//!
//! Generates deterministic test content, runs helper services by hand and
//! drives an in-process swarm through the same fixtures the test suites use.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use swarmfix_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "swarmfix")]
#[command(about = "Fixtures for multi-node transfer engine tests")]
struct Cli {
    /// Console log level; the full trace always goes to the trace file
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory receiving swarmfix-last-run.log
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), Some(cli.logs_dir.as_path())) {
        eprintln!("Failed to initialize tracing: {e}");
    }

    commands::handle_command(cli.command).await
}
