//! Mock radio and device implementations for testing.
//!
//! This module provides stand-ins for the platform radio and for sensor
//! drivers so the scheduler, registry and aggregator can be exercised
//! without Bluetooth hardware.
//!
//! # Features
//!
//! - **Failure injection**: Fail connects permanently or for the next N attempts
//! - **Latency simulation**: Add artificial connect delays (tokio time aware)
//! - **Data injection**: Push reading batches as if they arrived over the air

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use sensorfuse_types::{DeviceFamily, ReadingBatch, SensorReading};

use crate::error::{Error, Result};
use crate::radio::{PeripheralHandle, RadioEvent, RadioEventSource, RadioState};
use crate::traits::{DeviceFactory, SensorDevice};

/// A mock sensor device.
///
/// # Example
///
/// ```
/// use sensorfuse_core::{MockDevice, SensorDevice};
/// use sensorfuse_types::DeviceFamily;
///
/// #[tokio::main]
/// async fn main() {
///     let device = MockDevice::new("mock-1", DeviceFamily::Oralable).fail_connects(1);
///     assert!(device.connect().await.is_err());
///     assert!(device.connect().await.is_ok());
///     assert_eq!(device.connect_count(), 2);
/// }
/// ```
pub struct MockDevice {
    id: String,
    name: Option<String>,
    family: DeviceFamily,
    connected: AtomicBool,
    collecting: AtomicBool,
    should_fail: AtomicBool,
    fail_discovery: AtomicBool,
    remaining_failures: AtomicU32,
    connect_calls: AtomicU32,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    sender: broadcast::Sender<ReadingBatch>,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockDevice {
    /// Create a mock device that connects successfully.
    pub fn new(id: &str, family: DeviceFamily) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            id: id.to_string(),
            name: Some(format!("Mock {:?}", family)),
            family,
            connected: AtomicBool::new(false),
            collecting: AtomicBool::new(false),
            should_fail: AtomicBool::new(false),
            fail_discovery: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            connect_latency_ms: AtomicU64::new(0),
            sender,
        }
    }

    /// Fail the next `count` connects, then succeed.
    #[must_use]
    pub fn fail_connects(self, count: u32) -> Self {
        self.set_transient_failures(count);
        self
    }

    /// Fail every connect.
    #[must_use]
    pub fn always_fail(self, fail: bool) -> Self {
        self.set_should_fail(fail);
        self
    }

    /// Delay every connect.
    #[must_use]
    pub fn connect_latency(self, latency: Duration) -> Self {
        self.set_connect_latency(latency);
        self
    }

    /// Make service discovery fail.
    #[must_use]
    pub fn fail_discovery(self, fail: bool) -> Self {
        self.fail_discovery.store(fail, Ordering::Relaxed);
        self
    }

    // --- Test control methods ---

    /// Make every connect fail (or stop failing).
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `count` connects.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Set simulated connect latency. `Duration::ZERO` disables it.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of `connect` calls, including failed and timed-out ones.
    pub fn connect_count(&self) -> u32 {
        self.connect_calls.load(Ordering::Relaxed)
    }

    /// Whether data collection is running.
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Relaxed)
    }

    /// Simulate a link drop.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.collecting.store(false, Ordering::Relaxed);
    }

    /// Publish readings as a batch from this device.
    ///
    /// Returns the number of subscribers that received it.
    pub fn push_batch(&self, readings: Vec<SensorReading>) -> usize {
        let batch = ReadingBatch::new(self.id.clone(), self.family, readings);
        self.sender.send(batch).unwrap_or(0)
    }
}

#[async_trait]
impl SensorDevice for MockDevice {
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
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        // Transient failures first
        if self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::connection_failed(&self.id, "mock transient failure"));
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(&self.id, "mock failure"));
        }

        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.drop_link();
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        if self.fail_discovery.load(Ordering::Relaxed) {
            return Err(Error::characteristic_not_found("mock", 0));
        }
        Ok(())
    }

    async fn start_data_collection(&self) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        self.collecting.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_data_collection(&self) -> Result<()> {
        self.collecting.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReadingBatch> {
        self.sender.subscribe()
    }
}

/// A scriptable radio.
#[derive(Debug)]
pub struct MockRadio {
    state: RwLock<RadioState>,
    scanning: AtomicBool,
    sender: broadcast::Sender<RadioEvent>,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    /// Create a powered-on radio.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(RadioState::PoweredOn),
            scanning: AtomicBool::new(false),
            sender,
        }
    }

    /// Deliver an event to subscribers.
    pub fn emit(&self, event: RadioEvent) {
        let _ = self.sender.send(event);
    }

    /// Change the power state and announce it.
    pub fn set_state(&self, state: RadioState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        self.emit(RadioEvent::StateChanged { state });
    }

    /// Announce an advertisement.
    pub fn advertise(&self, id: &str, name: &str) {
        self.emit(RadioEvent::Discovered {
            id: id.to_string(),
            name: Some(name.to_string()),
            rssi: Some(-60),
        });
    }

    /// Announce an unexpected link drop.
    pub fn link_lost(&self, id: &str) {
        self.emit(RadioEvent::Disconnected {
            id: id.to_string(),
            error: Some("link supervision timeout".to_string()),
        });
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RadioEventSource for MockRadio {
    fn state(&self) -> RadioState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.sender.subscribe()
    }

    async fn start_scan(&self) -> Result<()> {
        let state = self.state();
        if !state.is_available() {
            return Err(Error::RadioUnavailable(state));
        }
        self.scanning.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Factory handing out [`MockDevice`]s.
///
/// Registered devices are returned as-is; unknown peripherals get a fresh
/// mock that is remembered for later inspection.
#[derive(Debug, Default)]
pub struct MockDeviceFactory {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
}

impl MockDeviceFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device to hand out for its id.
    pub fn register(&self, device: Arc<MockDevice>) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.id.clone(), device);
    }

    /// Device created or registered for `id`.
    pub fn device(&self, id: &str) -> Option<Arc<MockDevice>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl DeviceFactory for MockDeviceFactory {
    async fn create(&self, handle: &PeripheralHandle) -> Result<Arc<dyn SensorDevice>> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let device = devices
            .entry(handle.id.clone())
            .or_insert_with(|| Arc::new(MockDevice::new(&handle.id, handle.family)))
            .clone();
        Ok(device)
    }
}
