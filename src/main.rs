//! CLI entry point for multilog.
//!
//! Run an acquisition:
//! ```bash
//! multilog run --config config/multilog.yml --duration 60
//! ```
//!
//! Check a configuration without touching hardware:
//! ```bash
//! multilog check --config config/multilog.yml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use multilog::config::Settings;
use multilog::{logging, AcquisitionSession};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "multilog")]
#[command(about = "Multi-instrument measurement logger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured devices and record until stopped
    Run {
        /// Configuration file (YAML or TOML)
        #[arg(long)]
        config: PathBuf,

        /// Parent directory of the measurement directory
        #[arg(long)]
        output: Option<PathBuf>,

        /// Run length in seconds (default: until Ctrl+C)
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Load and validate a configuration, then list the devices
    Check {
        /// Configuration file (YAML or TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            duration,
        } => run(config, output, duration).await,
        Commands::Check { config } => check(config),
    }
}

fn load(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

async fn run(config: PathBuf, output: Option<PathBuf>, duration: Option<f64>) -> Result<()> {
    let mut settings = load(&config)?;
    if let Some(output) = output {
        settings.acquisition.output_dir = output;
    }
    if duration.is_some() {
        settings.acquisition.duration = duration;
    }
    settings.validate().context("Invalid command line overrides")?;
    logging::init_from_settings(&settings)?;

    tracing::info!(
        config = %config.display(),
        interval_s = settings.acquisition.interval,
        duration_s = ?settings.acquisition.duration,
        "Starting {}",
        settings.application.name
    );

    let session = AcquisitionSession::from_settings(&settings).await?;
    println!("Recording to {}", session.directory().display());
    println!("Press Ctrl+C to stop");

    let summary = session
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    println!(
        "Recorded {} ticks from {} devices into {}",
        summary.ticks,
        summary.devices.len(),
        summary.directory.display()
    );
    Ok(())
}

fn check(config: PathBuf) -> Result<()> {
    let settings = load(&config)?;
    println!("Configuration {} is valid", config.display());
    println!(
        "  output: {}, interval: {} s, duration: {}",
        settings.acquisition.output_dir.display(),
        settings.acquisition.interval,
        settings
            .acquisition
            .duration
            .map_or_else(|| "until stopped".to_string(), |d| format!("{d} s"))
    );
    for (name, device) in settings.device_configs()? {
        println!("  {name}: {}", device.kind());
    }
    Ok(())
}
