//! sensorfuse-monitor - stream fused sensor records to the terminal.
//!
//! Run with: `cargo run -p sensorfuse-monitor`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sensorfuse_core::{BleDeviceFactory, BleRadio, ConnectionConfig};
use sensorfuse_monitor::{Config, Monitor, output};

/// Stream fused Oralable and Muscle Sense sensor data.
#[derive(Parser, Debug)]
#[command(name = "sensorfuse-monitor")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace).
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and stream records (default).
    Run {
        /// Device id or name fragment to connect to (overrides config).
        #[arg(short, long)]
        device: Option<String>,
    },

    /// List supported devices in range.
    Scan {
        /// Scan duration in seconds.
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = match &args.config {
        Some(path) => Config::load_validated(path)?,
        None => {
            let config = Config::load_default()?;
            config.validate()?;
            config
        }
    };

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match args.command {
        Some(Command::Scan { duration }) => {
            config.registry.auto_connect = false;
            scan(&config, Duration::from_secs(duration), cancel).await
        }
        Some(Command::Run { device }) => {
            if device.is_some() {
                config.registry.device = device;
            }
            run(&config, cancel).await
        }
        None => run(&config, cancel).await,
    }
}

fn init_logging(level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("sensorfuse_core={level},sensorfuse_monitor={level}")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
        cancel.cancel();
    });
}

async fn build(config: &Config) -> anyhow::Result<Monitor> {
    let radio = Arc::new(BleRadio::new().await?);
    let factory = Arc::new(BleDeviceFactory::new(
        radio.adapter().clone(),
        ConnectionConfig::default(),
    )?);
    Monitor::new(radio, factory, config)
}

async fn scan(config: &Config, duration: Duration, cancel: CancellationToken) -> anyhow::Result<()> {
    let monitor = build(config).await?;
    let devices = monitor.scan(duration, cancel).await?;
    if devices.is_empty() {
        println!("No supported devices found");
        return Ok(());
    }
    println!("Found {} supported device(s):", devices.len());
    for device in &devices {
        println!("  {}", output::format_device(device));
    }
    Ok(())
}

async fn run(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    if let Some(device) = &config.registry.device {
        info!("Looking for {}", device);
    }
    let monitor = build(config).await?;
    let mut stdout = std::io::stdout();
    let summary = monitor.run(&mut stdout, cancel).await?;
    info!(
        "Wrote {} of {} records ({:.0}% throttled)",
        summary.written,
        summary.records,
        summary.drop_rate * 100.0
    );
    Ok(())
}
