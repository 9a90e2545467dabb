//! Example: Streaming Fused Records
//!
//! This example connects to the first supported sensor found (optionally
//! matching a name fragment), reconnects automatically if the link drops,
//! and prints composite records at most twice per second.
//!
//! Run with: `cargo run --example stream_records -- [NAME_OR_ID]`

use std::env;
use std::sync::Arc;

use sensorfuse_core::{
    AggregatorConfig, BleDeviceFactory, BleRadio, Channel, ConnectionConfig, DeviceRegistry,
    ReconnectOptions, RegistryConfig, SensorAggregator, Throttle,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = RegistryConfig::new()
        .auto_connect(true)
        .reconnect(ReconnectOptions::unlimited());
    if let Some(filter) = env::args().nth(1) {
        config = config.device_filter(filter);
    }

    let radio = Arc::new(BleRadio::new().await?);
    let factory = Arc::new(BleDeviceFactory::new(
        radio.adapter().clone(),
        ConnectionConfig::default(),
    )?);
    let registry = DeviceRegistry::new(radio, factory, config)?;

    let aggregator = Arc::new(SensorAggregator::new(AggregatorConfig::default())?);
    let cancel = CancellationToken::new();
    let mut records = aggregator.records();
    aggregator.attach(registry.batches(), cancel.clone());

    let mut reconnections = registry.reconnection_events();
    tokio::spawn(async move {
        while let Ok(event) = reconnections.recv().await {
            println!("reconnection: {:?}", event);
        }
    });

    println!("Scanning... press Ctrl-C to stop");
    registry.start_scan().await?;

    let throttle = Throttle::per_second(2);
    loop {
        let due = throttle.next_due();
        let record = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep_until(due.unwrap_or_else(tokio::time::Instant::now)), if due.is_some() => {
                throttle.flush_due()
            }
            record = records.recv() => match record {
                Ok(record) => throttle.submit(record),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            },
        };
        if let Some(record) = record {
            println!(
                "{:?} red={:?} ir={:?} hr={:?} temp={:?}",
                record.group_key(),
                record.value(Channel::PpgRed),
                record.value(Channel::PpgInfrared),
                record.heart_rate(),
                record.value(Channel::Temperature),
            );
        }
    }

    cancel.cancel();
    registry.stop().await?;
    println!("{:?}", throttle.statistics());
    Ok(())
}
