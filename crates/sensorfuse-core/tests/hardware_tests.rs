//! Hardware integration tests for sensorfuse-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```
//! cargo test --package sensorfuse-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure devices via environment variables:
//! - `SENSORFUSE_ORALABLE`: Oralable device identifier or name fragment
//! - `SENSORFUSE_MUSCLESENSE`: ANR Muscle Sense device identifier or name fragment
//! - `SENSORFUSE_DEVICE`: Fallback for any device type
//!
//! Example:
//! ```
//! SENSORFUSE_ORALABLE="Oralable 7F21" cargo test --package sensorfuse-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use sensorfuse_core::{
    AggregatorConfig, BleDeviceFactory, BleRadio, ConnectionConfig, DeviceEvent, DeviceFamily,
    DeviceRegistry, RadioEventSource, RegistryConfig, SensorAggregator,
};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Get device filter from environment
fn get_device(family: DeviceFamily) -> Option<String> {
    let env_key = match family {
        DeviceFamily::Oralable => "SENSORFUSE_ORALABLE",
        DeviceFamily::MuscleSense => "SENSORFUSE_MUSCLESENSE",
        _ => "SENSORFUSE_DEVICE",
    };

    env::var(env_key)
        .ok()
        .or_else(|| env::var("SENSORFUSE_DEVICE").ok())
        .filter(|s| !s.is_empty())
}

async fn ble_registry(config: RegistryConfig) -> DeviceRegistry {
    let radio = Arc::new(BleRadio::new().await.expect("no Bluetooth adapter"));
    let factory = Arc::new(
        BleDeviceFactory::new(radio.adapter().clone(), ConnectionConfig::default())
            .expect("factory"),
    );
    DeviceRegistry::new(radio, factory, config).expect("registry")
}

async fn wait_connected(events: &mut broadcast::Receiver<DeviceEvent>) -> Option<String> {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Connected { device_id, family }) => {
                println!("Connected to {} ({})", device_id, family);
                return Some(device_id);
            }
            Ok(DeviceEvent::CollectionFailed { device_id, error }) => {
                println!("Collection failed on {}: {}", device_id, error);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

// =============================================================================
// Radio Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_radio_reports_state() {
    let radio = BleRadio::new().await.expect("no Bluetooth adapter");
    let state = radio.state();
    println!("Radio state: {}", state);
    assert!(state.is_available(), "Bluetooth radio is off");
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_discovers_devices() {
    let registry = ble_registry(RegistryConfig::default()).await;
    registry.start_scan().await.expect("scan");
    tokio::time::sleep(Duration::from_secs(15)).await;
    registry.stop_scan().await.expect("stop scan");

    let devices = registry.discovered_devices().await.expect("devices");
    println!("Scan discovered {} supported devices:", devices.len());
    for device in &devices {
        println!(
            "  - {} ({}) rssi {:?}",
            device.display_name(),
            device.family,
            device.rssi
        );
    }

    registry.stop().await.expect("stop");
}

// =============================================================================
// Streaming Tests
// =============================================================================

async fn stream_from(family: DeviceFamily) {
    let Some(filter) = get_device(family) else {
        println!("Skipping: no {} device configured", family);
        return;
    };

    let registry = ble_registry(
        RegistryConfig::new()
            .auto_connect(true)
            .device_filter(filter),
    )
    .await;
    let aggregator = Arc::new(SensorAggregator::new(AggregatorConfig::default()).unwrap());
    let cancel = CancellationToken::new();
    aggregator.attach(registry.batches(), cancel.clone());

    let mut events = registry.events();
    let mut records = aggregator.records();
    registry.start_scan().await.expect("scan");

    let connected = timeout(BLE_TIMEOUT, wait_connected(&mut events)).await;
    let Ok(Some(device_id)) = connected else {
        println!("Device not found within {:?}", BLE_TIMEOUT);
        registry.stop().await.expect("stop");
        return;
    };
    registry.stop_scan().await.expect("stop scan");

    let mut received = 0;
    while received < 10 {
        match timeout(BLE_TIMEOUT, records.recv()).await {
            Ok(Ok(record)) => {
                println!(
                    "  {:?} slots={} red={:?} ir={:?}",
                    record.group_key(),
                    record.populated_slots(),
                    record.value(sensorfuse_core::Channel::PpgRed),
                    record.value(sensorfuse_core::Channel::PpgInfrared),
                );
                received += 1;
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(received > 0, "no records from {}", device_id);
    println!("Stats: {:?}", aggregator.stats());

    cancel.cancel();
    registry.stop().await.expect("stop");
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_oralable_stream() {
    stream_from(DeviceFamily::Oralable).await;
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_muscle_sense_stream() {
    stream_from(DeviceFamily::MuscleSense).await;
}
