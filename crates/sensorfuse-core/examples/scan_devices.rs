//! Example: Scanning for Supported Sensors
//!
//! This example scans for Oralable and ANR Muscle Sense devices using
//! Bluetooth Low Energy and lists the ones in range.
//!
//! Run with: `cargo run --example scan_devices`

use std::sync::Arc;
use std::time::Duration;

use sensorfuse_core::{
    BleDeviceFactory, BleRadio, ConnectionConfig, DeviceRegistry, RadioEventSource,
    RegistryConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let radio = Arc::new(BleRadio::new().await?);
    println!("Bluetooth radio: {}", radio.state());
    let factory = Arc::new(BleDeviceFactory::new(
        radio.adapter().clone(),
        ConnectionConfig::default(),
    )?);
    let registry = DeviceRegistry::new(radio, factory, RegistryConfig::default())?;

    println!("Scanning for 10 seconds...");
    println!();
    registry.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(10)).await;
    registry.stop_scan().await?;

    let devices = registry.discovered_devices().await?;
    if devices.is_empty() {
        println!("No supported devices found.");
        println!();
        println!("Make sure:");
        println!("  - The sensor is powered on and not paired elsewhere");
        println!("  - Bluetooth is enabled on this computer");
    } else {
        println!("Found {} device(s):", devices.len());
        println!();
        for device in &devices {
            let rssi = device
                .rssi
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "N/A".to_string());
            println!("  {} [{}]", device.display_name(), device.family);
            println!("    Identifier: {}", device.id);
            println!("    RSSI: {}", rssi);
            println!();
        }
    }

    registry.stop().await?;
    Ok(())
}
