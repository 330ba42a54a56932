//! powerscope - power telemetry for inference workloads
//!
//! Thin front end over `powerscope-core`: checks that `powermetrics` can be
//! started, records runs to JSON reports, and decodes saved captures.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use powerscope_core::config::PowerscopeConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// powerscope - power telemetry for inference workloads
#[derive(Parser, Debug)]
#[command(name = "powerscope")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (optional; defaults apply when missing)
    #[arg(short, long, default_value = "powerscope.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that powermetrics can run without a password prompt
    Check,

    /// Record power samples for a fixed duration and write a run report
    Record(commands::record::RecordArgs),

    /// Decode a saved `powermetrics -f plist` capture
    Decode(commands::decode::DecodeArgs),
}

/// Load the configuration file, or defaults when it does not exist.
fn load_config(path: &Path) -> Result<PowerscopeConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(PowerscopeConfig::default());
    }
    PowerscopeConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            if !commands::check::run(&config)? {
                std::process::exit(1);
            }
            Ok(())
        },
        Commands::Record(args) => commands::record::run(&config, &args),
        Commands::Decode(args) => commands::decode::run(&config, &args),
    }
}
