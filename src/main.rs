//! CLI Entry Point for genesys-psu
//!
//! Provides command-line access to one power supply:
//! - Reading and writing named channels
//! - Monitoring the measured readbacks
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! genesys-psu --config config/default.toml get volt_real
//! genesys-psu --emulate set volt_set 12.5
//! genesys-psu --emulate monitor --interval-ms 250
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genesys_psu::bridge::{ChannelName, Service};
use genesys_psu::config::{AppConfig, ConnectionConfig};
use genesys_psu::session::SessionState;
use genesys_psu::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "genesys-psu")]
#[command(about = "Control a TDK-Lambda Genesys power supply", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Talk to the built-in emulated unit instead of hardware
    #[arg(long)]
    emulate: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,

    /// How long to wait for the unit to become ready
    #[arg(long, default_value = "5000")]
    connect_wait_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one channel
    Get {
        /// Channel name, e.g. volt_real
        channel: ChannelName,
    },

    /// Write one channel
    Set {
        /// Channel name, e.g. volt_set
        channel: ChannelName,
        /// Value (number, or on/off for out_ena)
        value: String,
    },

    /// Poll volt_real and curr_real until interrupted
    Monitor {
        /// Poll interval; defaults to the configured one
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: Option<u64>,
    },

    /// List the available channels
    Channels,

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let tracing = TracingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    tracing_setup::init(tracing).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Channels => {
            for channel in ChannelName::ALL {
                let access = if channel.is_writable() { "rw" } else { "ro" };
                println!("{:<22} {}  {:?}", channel.as_str(), access, channel.kind());
            }
            Ok(())
        }
        Commands::ShowConfig => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", text);
            Ok(())
        }
        Commands::Get { channel } => {
            let service = connect(&config, cli.connect_wait_ms).await?;
            let result = service.bridge().get_channel(channel).await;
            service.shutdown().await;
            let value = result.with_context(|| format!("Reading {} failed", channel))?;
            println!("{} = {}", channel, value);
            Ok(())
        }
        Commands::Set { channel, value } => {
            let value = channel.parse_value(&value)?;
            let service = connect(&config, cli.connect_wait_ms).await?;
            let result = service.bridge().put_channel(channel, value.clone()).await;
            service.shutdown().await;
            result.with_context(|| format!("Writing {} failed", channel))?;
            println!("{} <- {}", channel, value);
            Ok(())
        }
        Commands::Monitor { interval_ms } => {
            let service = connect(&config, cli.connect_wait_ms).await?;
            monitor(&service, interval_ms.map(Duration::from_millis)).await;
            service.shutdown().await;
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AppConfig::emulated(),
    };
    if cli.emulate {
        let device_address = config.connection.device_address;
        config.connection = ConnectionConfig {
            device_address,
            ..ConnectionConfig::emulated()
        };
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: &AppConfig, wait_ms: u64) -> Result<Service> {
    let service = Service::start(config).await?;
    let ready = tokio::time::timeout(
        Duration::from_millis(wait_ms),
        service.session().wait_for(SessionState::Ready),
    )
    .await;
    match ready {
        Ok(Ok(())) => Ok(service),
        _ => {
            let state = service.session().state();
            service.shutdown().await;
            anyhow::bail!(
                "{} not ready after {} ms (state: {})",
                config.connection.describe(),
                wait_ms,
                state
            )
        }
    }
}

async fn monitor(service: &Service, interval: Option<Duration>) {
    let mut poller = service.poller();
    if let Some(interval) = interval {
        poller = genesys_psu::bridge::Poller::new(service.bridge().clone(), interval);
    }
    let handle = poller.spawn();
    let mut readings = handle.subscribe();

    loop {
        tokio::select! {
            changed = readings.changed() => {
                if changed.is_err() {
                    break;
                }
                match &*readings.borrow_and_update() {
                    Some(Ok(r)) => println!("{:>10.3} V {:>10.3} A", r.voltage, r.current),
                    Some(Err(e)) => eprintln!("poll failed: {}", e),
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    handle.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_interval_must_be_positive() {
        assert!(Cli::try_parse_from(["genesys-psu", "monitor", "--interval-ms", "0"]).is_err());

        let cli = Cli::try_parse_from(["genesys-psu", "monitor", "--interval-ms", "250"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Monitor {
                interval_ms: Some(250)
            }
        ));
    }
}
