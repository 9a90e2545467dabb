//! btleplug-backed sensor driver.
//!
//! [`BleSensorDevice`] connects to one peripheral, subscribes to the notify
//! characteristics of its family and turns every notification into a
//! [`ReadingBatch`]. Malformed packets are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central as _, CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sensorfuse_types::{DecodeContext, DeviceFamily, PacketKind, ReadingBatch, packet};

use crate::error::{Error, Result};
use crate::radio::PeripheralHandle;
use crate::traits::{DeviceFactory, SensorDevice};
use crate::util::format_peripheral_id;

/// Default timeout for BLE connection operations.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-device batch channel.
const BATCH_CHANNEL_CAPACITY: usize = 128;

/// Configuration for BLE connection timeouts.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sensorfuse_core::device::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .discovery_timeout(Duration::from_secs(15));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Timeout for establishing the link.
    pub connection_timeout: Duration,
    /// Timeout for service discovery.
    pub discovery_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout.is_zero() {
            return Err(Error::invalid_config("connection_timeout must be > 0"));
        }
        if self.discovery_timeout.is_zero() {
            return Err(Error::invalid_config("discovery_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Decode one notification into a batch.
///
/// Returns `Ok(None)` for characteristics that carry no readings for this
/// family and for packets that decode to nothing (for example an absent
/// battery level).
pub fn batch_from_notification(
    device_id: &str,
    family: DeviceFamily,
    characteristic: Uuid,
    value: &[u8],
    received_at: OffsetDateTime,
) -> Result<Option<ReadingBatch>> {
    let Some(kind) = PacketKind::from_characteristic(characteristic) else {
        return Ok(None);
    };
    let ctx = DecodeContext::new(received_at, family);
    let readings = packet::decode(kind, value, &ctx)?;
    if readings.is_empty() {
        return Ok(None);
    }
    Ok(Some(ReadingBatch::new(device_id, family, readings)))
}

/// A sensor reached through btleplug.
///
/// # Cleanup
///
/// Call [`SensorDevice::disconnect`] before dropping the driver. Dropping
/// it only aborts the notification task; the link stays up until the
/// platform tears it down.
pub struct BleSensorDevice {
    peripheral: Peripheral,
    id: String,
    name: Option<String>,
    family: DeviceFamily,
    config: ConnectionConfig,
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
    sender: broadcast::Sender<ReadingBatch>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BleSensorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSensorDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("family", &self.family)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BleSensorDevice {
    /// Wrap a discovered peripheral. Does not connect.
    pub fn new(peripheral: Peripheral, handle: &PeripheralHandle, config: ConnectionConfig) -> Self {
        let (sender, _) = broadcast::channel(BATCH_CHANNEL_CAPACITY);
        Self {
            peripheral,
            id: handle.id.clone(),
            name: handle.name.clone(),
            family: handle.family,
            config,
            characteristics: RwLock::new(HashMap::new()),
            sender,
            collector: Mutex::new(None),
        }
    }

    /// Connection configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn abort_collector(&self) {
        if let Some(task) = self.collector.lock().await.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SensorDevice for BleSensorDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn family(&self) -> DeviceFamily {
        self.family
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    #[tracing::instrument(level = "info", skip(self), fields(device_id = %self.id))]
    async fn connect(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        info!("Connecting to device...");
        timeout(self.config.connection_timeout, self.peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", self.config.connection_timeout))??;
        info!("Connected!");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self), fields(device_id = %self.id))]
    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from device...");
        self.abort_collector().await;
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        timeout(
            self.config.discovery_timeout,
            self.peripheral.discover_services(),
        )
        .await
        .map_err(|_| Error::timeout("discover services", self.config.discovery_timeout))??;

        let services = self.peripheral.services();
        debug!("Found {} services", services.len());

        let mut cache = HashMap::new();
        for service in &services {
            for characteristic in &service.characteristics {
                cache.insert(characteristic.uuid, characteristic.clone());
            }
        }

        let expected = PacketKind::characteristics_for(self.family);
        if !expected.iter().any(|uuid| cache.contains_key(uuid)) {
            return Err(Error::characteristic_not_found(
                expected
                    .first()
                    .map(Uuid::to_string)
                    .unwrap_or_default(),
                services.len(),
            ));
        }

        *self.characteristics.write().await = cache;
        Ok(())
    }

    async fn start_data_collection(&self) -> Result<()> {
        self.abort_collector().await;

        let cache = self.characteristics.read().await;
        if cache.is_empty() {
            return Err(Error::NotConnected);
        }

        let mut subscribed = 0usize;
        for uuid in PacketKind::characteristics_for(self.family) {
            let Some(characteristic) = cache.get(uuid) else {
                debug!("{} does not expose {}", self.id, uuid);
                continue;
            };
            if !characteristic
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
            {
                debug!("{} is not notifiable on {}", uuid, self.id);
                continue;
            }
            self.peripheral.subscribe(characteristic).await?;
            subscribed += 1;
        }
        drop(cache);

        if subscribed == 0 {
            return Err(Error::characteristic_not_found(
                "notify characteristic",
                self.peripheral.services().len(),
            ));
        }

        let mut notifications = self.peripheral.notifications().await?;
        let sender = self.sender.clone();
        let device_id = self.id.clone();
        let family = self.family;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                match batch_from_notification(
                    &device_id,
                    family,
                    notification.uuid,
                    &notification.value,
                    OffsetDateTime::now_utc(),
                ) {
                    Ok(Some(batch)) => {
                        let _ = sender.send(batch);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping packet from {}: {}", device_id, e),
                }
            }
            debug!("Notification stream for {} ended", device_id);
        });
        *self.collector.lock().await = Some(task);

        info!("Collecting data from {} ({} characteristics)", self.id, subscribed);
        Ok(())
    }

    async fn stop_data_collection(&self) -> Result<()> {
        self.abort_collector().await;
        let cache = self.characteristics.read().await;
        for uuid in PacketKind::characteristics_for(self.family) {
            if let Some(characteristic) = cache.get(uuid)
                && let Err(e) = self.peripheral.unsubscribe(characteristic).await
            {
                debug!("Unsubscribe from {} failed: {}", uuid, e);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReadingBatch> {
        self.sender.subscribe()
    }
}

impl Drop for BleSensorDevice {
    fn drop(&mut self) {
        if let Ok(mut collector) = self.collector.try_lock()
            && let Some(task) = collector.take()
        {
            task.abort();
        }
    }
}

/// Creates [`BleSensorDevice`]s for peripherals known to an adapter.
#[derive(Clone)]
pub struct BleDeviceFactory {
    adapter: Adapter,
    config: ConnectionConfig,
}

impl BleDeviceFactory {
    /// Create a factory over `adapter`.
    pub fn new(adapter: Adapter, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { adapter, config })
    }
}

#[async_trait]
impl DeviceFactory for BleDeviceFactory {
    async fn create(&self, handle: &PeripheralHandle) -> Result<Arc<dyn SensorDevice>> {
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| format_peripheral_id(&p.id()) == handle.id)
            .ok_or_else(|| Error::device_not_found(handle.id.clone()))?;
        Ok(Arc::new(BleSensorDevice::new(
            peripheral,
            handle,
            self.config.clone(),
        )))
    }
}
