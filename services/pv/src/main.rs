//! ---
//! pvsim_section: "05-services"
//! pvsim_subsection: "binary"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Binary entrypoint for the PV aggregator service."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pvsim_common::{init_tracing, sleep_or_cancel, spawn_shutdown_listener, AppConfig, LogFormat};
use pvsim_msg::AmqpTransport;
use pvsim_pv::PvAggregator;
use tracing::{info, Instrument};

const SERVICE: &str = "pvsim-pv";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Consumes meter readings, adds PV output and writes one record per simulated day",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to a TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the stdout log format")]
    log_format: Option<CliLogFormat>,

    #[arg(long, value_name = "FILE", help = "Override the output file template")]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    if let Some(output) = cli.output {
        config.aggregator.output_file = output;
    }
    let root = init_tracing(SERVICE, &config.environment, &config.logging)?;
    serve(config).instrument(root).await
}

async fn serve(config: AppConfig) -> Result<()> {
    info!(
        broker = %config.broker.endpoint(),
        output = %config.aggregator.output_file.display(),
        sign_convention = ?config.aggregator.sign_convention,
        "pv starting"
    );

    let mut shutdown = spawn_shutdown_listener();
    if !config.broker.initial_delay.is_zero() {
        info!(delay_secs = config.broker.initial_delay.as_secs(), "waiting for broker to come up");
        if sleep_or_cancel(config.broker.initial_delay, &mut shutdown).await {
            return Ok(());
        }
    }

    let transport = AmqpTransport::new(config.broker.clone(), SERVICE);
    let mut aggregator = PvAggregator::from_config(transport, &config)?;
    let stats = aggregator.run(shutdown).await?;
    info!(stats = %serde_json::to_string(&stats)?, "pv finished");
    Ok(())
}
