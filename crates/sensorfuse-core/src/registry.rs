//! Multi-device registry.
//!
//! The [`DeviceRegistry`] tracks every supported peripheral the radio
//! reports, drives connections through a [`DeviceFactory`], hands dropped
//! links to the [`ReconnectionScheduler`] and merges the reading batches of
//! all connected devices into one stream.
//!
//! The device table lives inside a single owner task. Public methods send
//! commands to it and wait for the reply; connection work runs in separate
//! tasks that report back to the owner when done.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensorfuse_types::{Channel, DeviceFamily, ReadingBatch, SensorReading};

use crate::buffer::CircularBuffer;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DisconnectReason, EventDispatcher, ReconnectionEvent};
use crate::radio::{ConnectionState, PeripheralHandle, RadioEvent, RadioEventSource};
use crate::reconnect::{ReconnectOptions, ReconnectionScheduler};
use crate::traits::{DeviceFactory, SensorDevice};

/// Configuration for the device registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Reconnection behaviour for dropped links.
    pub reconnect: ReconnectOptions,
    /// Raw readings kept in [`DeviceRegistry::raw_history`].
    pub history_capacity: usize,
    /// Event and batch channel capacity.
    pub event_capacity: usize,
    /// Connect to the first supported device discovered.
    pub auto_connect: bool,
    /// Restrict auto-connect to devices whose name contains this text
    /// (case-insensitive) or whose id equals it.
    pub device_filter: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectOptions::default(),
            history_capacity: 5000,
            event_capacity: 256,
            auto_connect: false,
            device_filter: None,
        }
    }
}

impl RegistryConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set reconnection options.
    #[must_use]
    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    /// Set raw history capacity.
    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Enable or disable auto-connect.
    #[must_use]
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Restrict auto-connect to matching devices.
    #[must_use]
    pub fn device_filter(mut self, filter: impl Into<String>) -> Self {
        self.device_filter = Some(filter.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate()?;
        if self.history_capacity == 0 {
            return Err(Error::invalid_config("history_capacity must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        Ok(())
    }

    fn matches_filter(&self, handle: &PeripheralHandle) -> bool {
        let Some(filter) = &self.device_filter else {
            return true;
        };
        let filter = filter.to_lowercase();
        handle.id.to_lowercase() == filter
            || handle
                .name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&filter))
    }
}

type Ack = oneshot::Sender<Result<()>>;

enum Command {
    Connect {
        device_id: String,
        ack: Ack,
    },
    Disconnect {
        device_id: String,
        ack: Ack,
    },
    Forget {
        device_id: String,
        ack: Ack,
    },
    SetPrimary {
        device_id: String,
        ack: Ack,
    },
    Primary {
        reply: oneshot::Sender<Option<PeripheralHandle>>,
    },
    Devices {
        connected_only: bool,
        reply: oneshot::Sender<Vec<PeripheralHandle>>,
    },
    DeviceState {
        device_id: String,
        reply: oneshot::Sender<Option<ConnectionState>>,
    },
    Latest {
        reply: oneshot::Sender<HashMap<Channel, SensorReading>>,
    },
    RawHistory {
        reply: oneshot::Sender<Vec<SensorReading>>,
    },
    Batch(ReadingBatch),
    LinkUp {
        device_id: String,
        connect: Result<()>,
        setup: Option<Result<()>>,
        ack: Option<Ack>,
    },
}

/// Registry of sensor devices seen by one radio.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use sensorfuse_core::{BleDeviceFactory, BleRadio, DeviceRegistry, RegistryConfig};
///
/// let radio = Arc::new(BleRadio::new().await?);
/// let factory = Arc::new(BleDeviceFactory::new(radio.adapter().clone(), Default::default())?);
/// let registry = DeviceRegistry::new(radio, factory, RegistryConfig::new().auto_connect(true))?;
/// let mut batches = registry.batches();
/// registry.start_scan().await?;
/// while let Ok(batch) = batches.recv().await {
///     println!("{} readings from {}", batch.len(), batch.device_id);
/// }
/// ```
pub struct DeviceRegistry {
    config: RegistryConfig,
    radio: Arc<dyn RadioEventSource>,
    scheduler: Arc<ReconnectionScheduler>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventDispatcher<DeviceEvent>,
    batches: broadcast::Sender<ReadingBatch>,
    readings: broadcast::Sender<SensorReading>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    /// Create a registry and spawn its owner task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        radio: Arc<dyn RadioEventSource>,
        factory: Arc<dyn DeviceFactory>,
        config: RegistryConfig,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Arc::new(ReconnectionScheduler::new(config.reconnect.clone())?);
        scheduler.radio_state_changed(radio.state())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventDispatcher::new(config.event_capacity);
        let (batches, _) = broadcast::channel(config.event_capacity);
        let (readings, _) = broadcast::channel(config.event_capacity * 16);
        let cancel = CancellationToken::new();

        let core = RegistryCore {
            config: config.clone(),
            factory,
            scheduler: Arc::clone(&scheduler),
            commands: tx.clone(),
            devices: HashMap::new(),
            primary: None,
            latest: HashMap::new(),
            history: CircularBuffer::new(config.history_capacity),
            events: events.clone(),
            batches: batches.clone(),
            readings: readings.clone(),
            tasks: JoinSet::new(),
        };
        let task = tokio::spawn(core.run(
            rx,
            radio.subscribe(),
            scheduler.events(),
            cancel.clone(),
        ));

        Ok(Self {
            config,
            radio,
            scheduler,
            commands: tx,
            events,
            batches,
            readings,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The reconnection scheduler driving dropped links.
    pub fn scheduler(&self) -> &Arc<ReconnectionScheduler> {
        &self.scheduler
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Start scanning for advertisements.
    pub async fn start_scan(&self) -> Result<()> {
        self.radio.start_scan().await
    }

    /// Stop scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.radio.stop_scan().await
    }

    /// Connect to a discovered device, discover its services and start
    /// collecting data.
    ///
    /// Returns once the link is up. Service discovery or collection
    /// failures are reported as [`DeviceEvent::CollectionFailed`], not as
    /// an error here.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.request(|ack| Command::Connect { device_id, ack })
            .await?
    }

    /// Disconnect a device on request. Cancels any pending reconnection.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.request(|ack| Command::Disconnect { device_id, ack })
            .await?
    }

    /// Disconnect a device and drop it from the registry.
    pub async fn forget(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.request(|ack| Command::Forget { device_id, ack })
            .await?
    }

    /// Make a known device the primary one.
    pub async fn set_primary(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.request(|ack| Command::SetPrimary { device_id, ack })
            .await?
    }

    /// The primary device, if any.
    pub async fn primary_device(&self) -> Result<Option<PeripheralHandle>> {
        self.request(|reply| Command::Primary { reply }).await
    }

    /// Every supported device seen so far, sorted by id.
    pub async fn discovered_devices(&self) -> Result<Vec<PeripheralHandle>> {
        self.request(|reply| Command::Devices {
            connected_only: false,
            reply,
        })
        .await
    }

    /// Devices whose link is up, sorted by id.
    pub async fn connected_devices(&self) -> Result<Vec<PeripheralHandle>> {
        self.request(|reply| Command::Devices {
            connected_only: true,
            reply,
        })
        .await
    }

    /// Connection state of a device.
    pub async fn device_state(&self, device_id: &str) -> Result<Option<ConnectionState>> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::DeviceState { device_id, reply })
            .await
    }

    /// Most recent reading per channel across all devices.
    pub async fn latest_readings(&self) -> Result<HashMap<Channel, SensorReading>> {
        self.request(|reply| Command::Latest { reply }).await
    }

    /// Bounded raw reading history, oldest first.
    pub async fn raw_history(&self) -> Result<Vec<SensorReading>> {
        self.request(|reply| Command::RawHistory { reply }).await
    }

    /// Subscribe to registry events.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the merged batch stream.
    pub fn batches(&self) -> broadcast::Receiver<ReadingBatch> {
        self.batches.subscribe()
    }

    /// Subscribe to individual readings from the merged stream.
    pub fn readings(&self) -> broadcast::Receiver<SensorReading> {
        self.readings.subscribe()
    }

    /// Subscribe to reconnection events.
    pub fn reconnection_events(&self) -> broadcast::Receiver<ReconnectionEvent> {
        self.scheduler.events()
    }

    /// Stop the owner task, disconnect every device and shut the scheduler
    /// down. All spawned tasks have finished when this returns.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        match self.scheduler.shutdown().await {
            Ok(()) | Err(Error::SchedulerStopped) => {}
            Err(e) => return Err(e),
        }
        info!("Device registry stopped");
        Ok(())
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Tracked {
    handle: PeripheralHandle,
    driver: Option<Arc<dyn SensorDevice>>,
    forwarder: Option<JoinHandle<()>>,
    manual_disconnect: bool,
}

impl Tracked {
    fn stop_forwarder(&mut self) -> Option<JoinHandle<()>> {
        let task = self.forwarder.take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }
}

struct RegistryCore {
    config: RegistryConfig,
    factory: Arc<dyn DeviceFactory>,
    scheduler: Arc<ReconnectionScheduler>,
    commands: mpsc::UnboundedSender<Command>,
    devices: HashMap<String, Tracked>,
    primary: Option<String>,
    latest: HashMap<Channel, SensorReading>,
    history: CircularBuffer<SensorReading>,
    events: EventDispatcher<DeviceEvent>,
    batches: broadcast::Sender<ReadingBatch>,
    readings: broadcast::Sender<SensorReading>,
    tasks: JoinSet<()>,
}

async fn bring_up(driver: &dyn SensorDevice) -> Result<()> {
    driver.discover_services().await?;
    driver.start_data_collection().await
}

impl RegistryCore {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut radio: broadcast::Receiver<RadioEvent>,
        mut reconnections: broadcast::Receiver<ReconnectionEvent>,
        cancel: CancellationToken,
    ) {
        let mut radio_open = true;
        let mut reconnections_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = radio.recv(), if radio_open => match event {
                    Ok(event) => self.handle_radio(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Registry lagged {} radio events", skipped);
                    }
                    Err(RecvError::Closed) => radio_open = false,
                },
                event = reconnections.recv(), if reconnections_open => match event {
                    Ok(event) => self.handle_reconnection(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Registry lagged {} reconnection events", skipped);
                    }
                    Err(RecvError::Closed) => reconnections_open = false,
                },
            }
            while self.tasks.try_join_next().is_some() {}
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { device_id, ack } => self.connect(device_id, ack).await,
            Command::Disconnect { device_id, ack } => {
                let result = self
                    .disconnect(&device_id, DisconnectReason::UserRequested)
                    .await;
                let _ = ack.send(result);
            }
            Command::Forget { device_id, ack } => {
                let result = self.disconnect(&device_id, DisconnectReason::Forgotten).await;
                if result.is_ok() {
                    self.devices.remove(&device_id);
                    info!("Forgot {}", device_id);
                }
                let _ = ack.send(result);
            }
            Command::SetPrimary { device_id, ack } => {
                let result = if self.devices.contains_key(&device_id) {
                    self.set_primary(Some(device_id));
                    Ok(())
                } else {
                    Err(Error::device_not_found(device_id))
                };
                let _ = ack.send(result);
            }
            Command::Primary { reply } => {
                let primary = self
                    .primary
                    .as_ref()
                    .and_then(|id| self.devices.get(id))
                    .map(|t| t.handle.clone());
                let _ = reply.send(primary);
            }
            Command::Devices {
                connected_only,
                reply,
            } => {
                let mut handles: Vec<PeripheralHandle> = self
                    .devices
                    .values()
                    .filter(|t| !connected_only || t.handle.state == ConnectionState::Connected)
                    .map(|t| t.handle.clone())
                    .collect();
                handles.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(handles);
            }
            Command::DeviceState { device_id, reply } => {
                let _ = reply.send(self.devices.get(&device_id).map(|t| t.handle.state));
            }
            Command::Latest { reply } => {
                let _ = reply.send(self.latest.clone());
            }
            Command::RawHistory { reply } => {
                let _ = reply.send(self.history.to_vec());
            }
            Command::Batch(batch) => self.merge_batch(batch),
            Command::LinkUp {
                device_id,
                connect,
                setup,
                ack,
            } => self.link_up(device_id, connect, setup, ack),
        }
    }

    async fn handle_radio(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Discovered { id, name, rssi } => self.discovered(id, name, rssi).await,
            RadioEvent::Connected { id } => {
                let pending = self.devices.get(&id).is_some_and(|t| {
                    t.handle.state == ConnectionState::Disconnected && !t.manual_disconnect
                });
                if pending {
                    let _ = self.scheduler.handle_connection_success(&id);
                } else {
                    debug!("Platform reports {} connected", id);
                }
            }
            RadioEvent::Disconnected { id, error } => self.link_lost(&id, error).await,
            RadioEvent::StateChanged { state } => {
                info!("Radio {}", state);
                let _ = self.scheduler.radio_state_changed(state);
                if !state.is_available() {
                    // Paused reconnections must not block a user connect.
                    for tracked in self.devices.values_mut() {
                        if tracked.handle.state == ConnectionState::Connecting {
                            tracked.handle.state = ConnectionState::Disconnected;
                        }
                    }
                }
                self.events.send(DeviceEvent::RadioStateChanged { state });
            }
        }
    }

    fn handle_reconnection(&mut self, event: ReconnectionEvent) {
        let Some(tracked) = self.devices.get_mut(event.device_id()) else {
            return;
        };
        match &event {
            ReconnectionEvent::Started { .. } => {
                tracked.handle.state = ConnectionState::Connecting;
            }
            ReconnectionEvent::AttemptFailed { .. } | ReconnectionEvent::GaveUp { .. } => {
                tracked.handle.state = ConnectionState::Disconnected;
            }
            ReconnectionEvent::Succeeded { device_id, .. } => {
                let Some(driver) = tracked.driver.clone() else {
                    return;
                };
                if tracked.forwarder.is_none() {
                    tracked.forwarder = Some(spawn_forwarder(driver.as_ref(), &self.commands));
                }
                let commands = self.commands.clone();
                let device_id = device_id.clone();
                self.tasks.spawn(async move {
                    let setup = bring_up(driver.as_ref()).await;
                    let _ = commands.send(Command::LinkUp {
                        device_id,
                        connect: Ok(()),
                        setup: Some(setup),
                        ack: None,
                    });
                });
            }
            ReconnectionEvent::Scheduled { .. } => {}
        }
    }

    async fn discovered(&mut self, id: String, name: Option<String>, rssi: Option<i16>) {
        if let Some(tracked) = self.devices.get_mut(&id) {
            if rssi.is_some() {
                tracked.handle.rssi = rssi;
            }
            if name.is_some() {
                tracked.handle.name = name;
            }
            return;
        }

        let Some(family) = name.as_deref().and_then(DeviceFamily::from_name) else {
            debug!("Ignoring unsupported peripheral {} ({:?})", id, name);
            return;
        };

        let mut handle = PeripheralHandle::new(id.clone(), name, family);
        handle.rssi = rssi;
        info!("Discovered {} ({})", handle.display_name(), family);
        self.events.send(DeviceEvent::Discovered {
            device: handle.clone(),
        });

        let auto_connect = self.config.auto_connect
            && self.config.matches_filter(&handle)
            && !self.devices.values().any(|t| {
                matches!(
                    t.handle.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            });
        self.devices.insert(
            id.clone(),
            Tracked {
                handle,
                driver: None,
                forwarder: None,
                manual_disconnect: false,
            },
        );

        if auto_connect {
            info!("Auto-connecting to {}", id);
            let (ack, _) = oneshot::channel();
            self.connect(id, ack).await;
        }
    }

    async fn connect(&mut self, device_id: String, ack: Ack) {
        let Some(tracked) = self.devices.get_mut(&device_id) else {
            let _ = ack.send(Err(Error::device_not_found(device_id)));
            return;
        };
        match tracked.handle.state {
            ConnectionState::Connected => {
                let _ = ack.send(Ok(()));
                return;
            }
            ConnectionState::Connecting => {
                let _ = ack.send(Err(Error::connection_failed(
                    device_id,
                    "connection already in progress",
                )));
                return;
            }
            _ => {}
        }

        let driver = if let Some(driver) = tracked.driver.clone() {
            driver
        } else {
            match self.factory.create(&tracked.handle).await {
                Ok(driver) => {
                    tracked.driver = Some(Arc::clone(&driver));
                    driver
                }
                Err(e) => {
                    warn!("Cannot create driver for {}: {}", device_id, e);
                    let _ = ack.send(Err(e));
                    return;
                }
            }
        };

        // A user-initiated connect supersedes a pending reconnection.
        let _ = self.scheduler.cancel_reconnection(&device_id).await;

        tracked.manual_disconnect = false;
        tracked.handle.state = ConnectionState::Connecting;
        if tracked.forwarder.is_none() {
            tracked.forwarder = Some(spawn_forwarder(driver.as_ref(), &self.commands));
        }

        let connect_timeout = self.config.reconnect.connection_timeout;
        let commands = self.commands.clone();
        self.tasks.spawn(async move {
            let connect = match timeout(connect_timeout, driver.connect()).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("connect", connect_timeout)),
            };
            let setup = match connect {
                Ok(()) => Some(bring_up(driver.as_ref()).await),
                Err(_) => None,
            };
            let _ = commands.send(Command::LinkUp {
                device_id,
                connect,
                setup,
                ack: Some(ack),
            });
        });
    }

    fn link_up(
        &mut self,
        device_id: String,
        connect: Result<()>,
        setup: Option<Result<()>>,
        ack: Option<Ack>,
    ) {
        let reply = |result: Result<()>| {
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
        };
        let Some(tracked) = self.devices.get_mut(&device_id) else {
            reply(Err(Error::device_not_found(device_id)));
            return;
        };
        if tracked.manual_disconnect {
            debug!("Ignoring late connection result for {}", device_id);
            reply(Err(Error::Cancelled));
            return;
        }

        match connect {
            Ok(()) => {
                tracked.handle.state = ConnectionState::Connected;
                let family = tracked.handle.family;
                info!("Connected to {}", tracked.handle.display_name());
                self.events.send(DeviceEvent::Connected {
                    device_id: device_id.clone(),
                    family,
                });
                if let Some(Err(e)) = setup {
                    warn!("Data collection setup failed for {}: {}", device_id, e);
                    self.events.send(DeviceEvent::CollectionFailed {
                        device_id: device_id.clone(),
                        error: e.to_string(),
                    });
                }
                if !self.primary_connected() {
                    self.set_primary(Some(device_id));
                }
                reply(Ok(()));
            }
            Err(e) => {
                tracked.handle.state = ConnectionState::Disconnected;
                tracked.stop_forwarder();
                warn!("Connection to {} failed: {}", device_id, e);
                reply(Err(e));
            }
        }
    }

    async fn link_lost(&mut self, device_id: &str, error: Option<String>) {
        let Some(tracked) = self.devices.get_mut(device_id) else {
            return;
        };
        if tracked.manual_disconnect || tracked.handle.state != ConnectionState::Connected {
            debug!("Ignoring disconnect for {}", device_id);
            return;
        }

        tracked.handle.state = ConnectionState::Disconnected;
        if let Some(task) = tracked.stop_forwarder() {
            let _ = task.await;
        }
        warn!("Lost link to {}: {:?}", device_id, error);
        let cause = error.clone().unwrap_or_else(|| "link lost".to_string());
        if let Some(driver) = tracked.driver.clone()
            && let Err(e) =
                self.scheduler
                    .schedule_reconnection(device_id, driver, false, Some(cause))
        {
            warn!("Cannot schedule reconnection for {}: {}", device_id, e);
        }
        self.events.send(DeviceEvent::Disconnected {
            device_id: device_id.to_string(),
            reason: DisconnectReason::LinkLost(error),
        });
        self.reselect_primary(device_id);
    }

    async fn disconnect(&mut self, device_id: &str, reason: DisconnectReason) -> Result<()> {
        let tracked = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::device_not_found(device_id))?;

        let _ = self.scheduler.cancel_reconnection(device_id).await;
        tracked.manual_disconnect = true;
        if let Some(task) = tracked.stop_forwarder() {
            let _ = task.await;
        }

        let was_up = matches!(
            tracked.handle.state,
            ConnectionState::Connected | ConnectionState::Connecting
        );
        if let Some(driver) = &tracked.driver
            && was_up
        {
            tracked.handle.state = ConnectionState::Disconnecting;
            if let Err(e) = driver.stop_data_collection().await {
                debug!("Stopping collection on {} failed: {}", device_id, e);
            }
            if let Err(e) = driver.disconnect().await {
                warn!("Disconnect from {} failed: {}", device_id, e);
            }
        }
        tracked.handle.state = ConnectionState::Disconnected;

        info!("Disconnected from {} ({:?})", device_id, reason);
        self.events.send(DeviceEvent::Disconnected {
            device_id: device_id.to_string(),
            reason,
        });
        self.reselect_primary(device_id);
        Ok(())
    }

    /// Hand the primary role to the connected device with the smallest id
    /// when `lost` held it. With nothing connected the role is cleared.
    fn reselect_primary(&mut self, lost: &str) {
        if self.primary.as_deref() != Some(lost) {
            return;
        }
        let next = self
            .devices
            .values()
            .filter(|t| t.handle.state == ConnectionState::Connected)
            .map(|t| t.handle.id.clone())
            .min();
        self.set_primary(next);
    }

    fn primary_connected(&self) -> bool {
        self.primary
            .as_ref()
            .and_then(|id| self.devices.get(id))
            .is_some_and(|t| t.handle.state == ConnectionState::Connected)
    }

    fn set_primary(&mut self, device_id: Option<String>) {
        if self.primary == device_id {
            return;
        }
        info!("Primary device: {:?}", device_id);
        self.primary = device_id.clone();
        self.events.send(DeviceEvent::PrimaryChanged { device_id });
    }

    fn merge_batch(&mut self, batch: ReadingBatch) {
        if batch.is_empty() {
            return;
        }
        for reading in &batch.readings {
            self.latest.insert(reading.channel, *reading);
            let _ = self.readings.send(*reading);
        }
        let evicted = self.history.extend_bulk(batch.readings.iter().copied());
        if evicted > 0 {
            debug!("Raw history evicted {} readings", evicted);
        }

        let _ = self.scheduler.record_data_received(&batch.device_id);
        self.events.send(DeviceEvent::Batch {
            device_id: batch.device_id.clone(),
            readings: batch.len(),
        });
        let _ = self.batches.send(batch);
    }

    async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
        let _ = self.scheduler.cancel_all_reconnections().await;
        for (id, tracked) in &mut self.devices {
            if let Some(task) = tracked.stop_forwarder() {
                let _ = task.await;
            }
            if tracked.handle.state != ConnectionState::Connected {
                continue;
            }
            if let Some(driver) = &tracked.driver {
                let _ = driver.stop_data_collection().await;
                if let Err(e) = driver.disconnect().await {
                    warn!("Disconnect from {} failed: {}", id, e);
                }
            }
            tracked.handle.state = ConnectionState::Disconnected;
        }
        debug!("Registry owner task stopped");
    }
}

fn spawn_forwarder(
    driver: &dyn SensorDevice,
    commands: &mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    let mut batches = driver.subscribe();
    let commands = commands.clone();
    let device_id = driver.id().to_string();
    tokio::spawn(async move {
        loop {
            match batches.recv().await {
                Ok(batch) => {
                    if commands.send(Command::Batch(batch)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} batches from {}", skipped, device_id);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
