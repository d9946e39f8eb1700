mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// Perch - a gateway bridging federated messaging users to a microblogging service
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway daemon
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "perch.yaml")]
        config: String,
    },

    /// Load the configuration and print the resolved settings
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "perch.yaml")]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => commands::serve::run(&config).await,
        Commands::Check { config } => commands::check::run(&config).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
