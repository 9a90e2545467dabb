//! Radio and discovery wrapper.
//!
//! The platform Bluetooth stack is consumed through [`RadioEventSource`],
//! which reports discovery, connection changes and radio power state as a
//! stream of [`RadioEvent`]s. [`BleRadio`] implements it on top of btleplug;
//! [`crate::mock::MockRadio`] implements it for tests.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use sensorfuse_types::DeviceFamily;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::util::format_peripheral_id;

/// Power state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    /// State not yet reported by the platform.
    #[default]
    Unknown,
    /// Radio is on and usable.
    PoweredOn,
    /// Radio is switched off.
    PoweredOff,
    /// The application is not permitted to use Bluetooth.
    Unauthorized,
    /// No Bluetooth LE hardware.
    Unsupported,
    /// The platform stack is restarting.
    Resetting,
}

impl RadioState {
    /// Whether connection attempts may proceed.
    ///
    /// `Unknown` counts as available: several platforms never report a state
    /// until something changes.
    pub fn is_available(&self) -> bool {
        matches!(self, RadioState::PoweredOn | RadioState::Unknown)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RadioState::Unknown => "unknown",
            RadioState::PoweredOn => "powered on",
            RadioState::PoweredOff => "powered off",
            RadioState::Unauthorized => "unauthorized",
            RadioState::Unsupported => "unsupported",
            RadioState::Resetting => "resetting",
        };
        f.write_str(label)
    }
}

impl From<CentralState> for RadioState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => RadioState::PoweredOn,
            CentralState::PoweredOff => RadioState::PoweredOff,
            _ => RadioState::Unknown,
        }
    }
}

/// Connection state of one peripheral. A device has exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Seen in an advertisement, never connected.
    #[default]
    Discovered,
    /// A connection attempt is in flight.
    Connecting,
    /// Link is up.
    Connected,
    /// A user-requested disconnect is in flight.
    Disconnecting,
    /// Link is down.
    Disconnected,
}

/// A discovered, classified peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Platform identifier.
    pub id: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Last seen signal strength in dBm.
    pub rssi: Option<i16>,
    /// Family classified from the advertised name.
    pub family: DeviceFamily,
    /// Current connection state.
    pub state: ConnectionState,
}

impl PeripheralHandle {
    /// Create a handle in the [`ConnectionState::Discovered`] state.
    pub fn new(id: impl Into<String>, name: Option<String>, family: DeviceFamily) -> Self {
        Self {
            id: id.into(),
            name,
            rssi: None,
            family,
            state: ConnectionState::Discovered,
        }
    }

    /// Set the signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name if advertised, otherwise the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Events reported by the platform radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RadioEvent {
    /// A peripheral advertised (first sighting or update).
    Discovered {
        id: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// The platform reports a link as up.
    Connected { id: String },
    /// The platform reports a link as down.
    Disconnected { id: String, error: Option<String> },
    /// Radio power state changed.
    StateChanged { state: RadioState },
}

/// Source of radio events.
#[async_trait]
pub trait RadioEventSource: Send + Sync {
    /// Last known radio state.
    fn state(&self) -> RadioState;

    /// Subscribe to radio events.
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    /// Start scanning for advertisements.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;
}

/// btleplug-backed radio.
///
/// Owns a task translating the adapter's `CentralEvent` stream into
/// [`RadioEvent`]s. The task is cancelled when the radio is dropped.
pub struct BleRadio {
    adapter: Adapter,
    state: Arc<RwLock<RadioState>>,
    sender: broadcast::Sender<RadioEvent>,
    cancel: CancellationToken,
}

impl BleRadio {
    /// Open the first available adapter and start translating its events.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable(RadioState::Unsupported))?;
        Self::with_adapter(adapter).await
    }

    /// Wrap an existing adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (sender, _) = broadcast::channel(256);
        let state = Arc::new(RwLock::new(RadioState::Unknown));
        let cancel = CancellationToken::new();

        let events = adapter.events().await?;
        let pump = EventPump {
            adapter: adapter.clone(),
            state: Arc::clone(&state),
            sender: sender.clone(),
        };
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut events = events;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => pump.handle(event).await,
                        None => {
                            warn!("Adapter event stream ended");
                            break;
                        }
                    },
                }
            }
            debug!("Radio event pump stopped");
        });

        info!("Bluetooth radio ready");
        Ok(Self {
            adapter,
            state,
            sender,
            cancel,
        })
    }

    /// The underlying adapter, for creating device drivers.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl RadioEventSource for BleRadio {
    fn state(&self) -> RadioState {
        self.state.read().map(|s| *s).unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.sender.subscribe()
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        info!("Scan stopped");
        Ok(())
    }
}

struct EventPump {
    adapter: Adapter,
    state: Arc<RwLock<RadioState>>,
    sender: broadcast::Sender<RadioEvent>,
}

impl EventPump {
    async fn handle(&self, event: CentralEvent) {
        let translated = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let props = peripheral.properties().await.ok().flatten();
                RadioEvent::Discovered {
                    id: format_peripheral_id(&id),
                    name: props.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: props.as_ref().and_then(|p| p.rssi),
                }
            }
            CentralEvent::DeviceConnected(id) => RadioEvent::Connected {
                id: format_peripheral_id(&id),
            },
            CentralEvent::DeviceDisconnected(id) => RadioEvent::Disconnected {
                id: format_peripheral_id(&id),
                error: None,
            },
            CentralEvent::StateUpdate(state) => {
                let state = RadioState::from(state);
                if let Ok(mut current) = self.state.write() {
                    *current = state;
                }
                info!("Radio state changed: {}", state);
                RadioEvent::StateChanged { state }
            }
            _ => return,
        };
        let _ = self.sender.send(translated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_availability() {
        assert!(RadioState::PoweredOn.is_available());
        assert!(RadioState::Unknown.is_available());
        assert!(!RadioState::PoweredOff.is_available());
        assert!(!RadioState::Unauthorized.is_available());
        assert!(!RadioState::Resetting.is_available());
    }

    #[test]
    fn test_central_state_mapping() {
        assert_eq!(RadioState::from(CentralState::PoweredOn), RadioState::PoweredOn);
        assert_eq!(RadioState::from(CentralState::PoweredOff), RadioState::PoweredOff);
        assert_eq!(RadioState::from(CentralState::Unknown), RadioState::Unknown);
    }

    #[test]
    fn test_handle_display_name() {
        let handle = PeripheralHandle::new("AA:BB", None, DeviceFamily::Oralable);
        assert_eq!(handle.display_name(), "AA:BB");
        assert_eq!(handle.state, ConnectionState::Discovered);

        let named = PeripheralHandle::new("AA:BB", Some("Oralable 1".into()), DeviceFamily::Oralable)
            .with_rssi(-60);
        assert_eq!(named.display_name(), "Oralable 1");
        assert_eq!(named.rssi, Some(-60));
    }

    #[test]
    fn test_radio_event_serialization() {
        let json = serde_json::to_string(&RadioEvent::StateChanged {
            state: RadioState::PoweredOff,
        }).unwrap();
        assert!(json.contains("state_changed"));
        assert!(json.contains("powered_off"));
    }
}
