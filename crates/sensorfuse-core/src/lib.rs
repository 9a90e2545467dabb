//! BLE link layer for wearable biosignal sensors.
//!
//! This crate keeps Bluetooth Low Energy links to Oralable PPG sensors and
//! ANR Muscle Sense EMG sensors alive, and fuses their single-channel
//! sample streams into time-aligned composite records.
//!
//! # Features
//!
//! - **Radio wrapper**: btleplug adapter events as a plain [`RadioEvent`] stream
//! - **Auto-reconnection**: per-device exponential backoff, paused while the radio is off
//! - **Multi-device registry**: discovery, primary selection, merged batch stream
//! - **Sensor fusion**: frame-number or time-bucket grouping into [`CompositeRecord`]s
//! - **Throttling**: minimum-interval rate limiting for display or export
//! - **Mocks**: radio, device and factory stand-ins for hardware-free tests
//!
//! # Supported Devices
//!
//! | Device | Channels |
//! |--------|----------|
//! | Oralable | PPG red/infrared/green, accelerometer, temperature, battery, heart rate |
//! | ANR Muscle Sense | EMG |
//!
//! # Platform Differences
//!
//! Device identifiers come from btleplug. On macOS they are CoreBluetooth
//! UUIDs that differ between machines; on Linux and Windows they are MAC
//! addresses. The registry keys devices by whichever the platform reports.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorfuse_core::{
//!     AggregatorConfig, BleDeviceFactory, BleRadio, ConnectionConfig, DeviceRegistry,
//!     RegistryConfig, SensorAggregator,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BleRadio::new().await?);
//!     let factory = Arc::new(BleDeviceFactory::new(
//!         radio.adapter().clone(),
//!         ConnectionConfig::default(),
//!     )?);
//!     let registry = DeviceRegistry::new(radio, factory, RegistryConfig::new().auto_connect(true))?;
//!
//!     let aggregator = Arc::new(SensorAggregator::new(AggregatorConfig::default())?);
//!     let mut records = aggregator.records();
//!     aggregator.attach(registry.batches(), CancellationToken::new());
//!
//!     registry.start_scan().await?;
//!     while let Ok(record) = records.recv().await {
//!         println!("{:?}", record.heart_rate());
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod buffer;
pub mod device;
pub mod error;
pub mod events;
pub mod mock;
pub mod radio;
pub mod reconnect;
pub mod registry;
pub mod throttle;
pub mod traits;
pub mod util;
pub mod validation;

// Core exports
pub use aggregator::{AggregatorConfig, AggregatorStats, SensorAggregator};
pub use buffer::CircularBuffer;
pub use device::{BleDeviceFactory, BleSensorDevice, ConnectionConfig};
pub use error::{Error, Result};
pub use events::{DeviceEvent, DisconnectReason, EventDispatcher, ReconnectionEvent};
pub use mock::{MockDevice, MockDeviceFactory, MockRadio};
pub use radio::{BleRadio, ConnectionState, PeripheralHandle, RadioEvent, RadioEventSource, RadioState};
pub use reconnect::{
    ConnectionHealth, ReconnectOptions, ReconnectionAttempt, ReconnectionObserver,
    ReconnectionPhase, ReconnectionScheduler,
};
pub use registry::{DeviceRegistry, RegistryConfig};
pub use throttle::{Throttle, ThrottleStats};
pub use traits::{DeviceFactory, SensorDevice};
pub use util::format_peripheral_id;
pub use validation::{QualityGuard, QualityThresholds, QualityWarning};

// Re-export from sensorfuse-types
pub use sensorfuse_types::uuid as uuids;
pub use sensorfuse_types::{
    BatteryLevel, BatteryState, Channel, CompositeRecord, DeviceFamily, GroupKey, ReadingBatch,
    SensorReading,
};
