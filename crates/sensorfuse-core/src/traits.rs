//! Trait abstractions for sensor device drivers.
//!
//! This module provides the [`SensorDevice`] trait that abstracts over
//! real Bluetooth devices and mock devices for testing, and the
//! [`DeviceFactory`] the registry uses to create them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use sensorfuse_types::{DeviceFamily, ReadingBatch};

use crate::error::Result;
use crate::radio::PeripheralHandle;

/// Driver contract for one sensor device.
///
/// # Example
///
/// ```ignore
/// use sensorfuse_core::{SensorDevice, Result};
///
/// async fn collect<D: SensorDevice>(device: &D) -> Result<()> {
///     let mut batches = device.subscribe();
///     device.connect().await?;
///     device.discover_services().await?;
///     device.start_data_collection().await?;
///     while let Ok(batch) = batches.recv().await {
///         println!("{} readings", batch.len());
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SensorDevice: Send + Sync {
    // --- Identity ---

    /// Platform identifier.
    fn id(&self) -> &str;

    /// Advertised name, if known.
    fn name(&self) -> Option<&str>;

    /// Device family.
    fn family(&self) -> DeviceFamily;

    // --- Connection Management ---

    /// Check if the device is connected.
    async fn is_connected(&self) -> bool;

    /// Connect to the device. A no-op when already connected.
    async fn connect(&self) -> Result<()>;

    /// Disconnect from the device.
    async fn disconnect(&self) -> Result<()>;

    // --- Data Collection ---

    /// Discover services and characteristics.
    async fn discover_services(&self) -> Result<()>;

    /// Subscribe to the family's notify characteristics and start producing
    /// batches.
    async fn start_data_collection(&self) -> Result<()>;

    /// Stop producing batches.
    async fn stop_data_collection(&self) -> Result<()>;

    /// Receive decoded reading batches.
    fn subscribe(&self) -> broadcast::Receiver<ReadingBatch>;
}

/// Creates drivers for discovered peripherals.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Create a driver for `handle`.
    async fn create(&self, handle: &PeripheralHandle) -> Result<Arc<dyn SensorDevice>>;
}
