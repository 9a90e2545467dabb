//! Event system for device and reconnection notifications.
//!
//! Events are broadcast to any number of receivers through an
//! [`EventDispatcher`]. Sending never blocks and never fails when nobody is
//! listening.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use sensorfuse_types::DeviceFamily;

use crate::radio::{PeripheralHandle, RadioState};

/// Events emitted by the device registry.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// A supported device was discovered.
    Discovered { device: PeripheralHandle },
    /// Connected and collecting data.
    Connected {
        device_id: String,
        family: DeviceFamily,
    },
    /// Disconnected from device.
    Disconnected {
        device_id: String,
        reason: DisconnectReason,
    },
    /// A reading batch was merged into the combined stream.
    Batch { device_id: String, readings: usize },
    /// Service discovery or data collection setup failed.
    CollectionFailed { device_id: String, error: String },
    /// The primary device changed.
    PrimaryChanged { device_id: Option<String> },
    /// The radio power state changed.
    RadioStateChanged { state: RadioState },
}

/// Reason for disconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Disconnection requested by the user.
    UserRequested,
    /// Link dropped without a request.
    LinkLost(Option<String>),
    /// Device removed from the registry.
    Forgotten,
}

/// Events emitted by the reconnection scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReconnectionEvent {
    /// An attempt was scheduled after `delay`.
    Scheduled {
        device_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// A connection attempt is starting.
    Started {
        device_id: String,
        attempt: u32,
        error: Option<String>,
    },
    /// A connection attempt succeeded. `error` is the failure that started
    /// the cycle or the last failed attempt.
    Succeeded {
        device_id: String,
        attempt: u32,
        error: Option<String>,
    },
    /// A connection attempt failed.
    AttemptFailed {
        device_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    /// Attempts exhausted. Emitted exactly once per reconnection cycle.
    GaveUp {
        device_id: String,
        attempts: u32,
        error: String,
    },
}

impl ReconnectionEvent {
    /// Device the event concerns.
    pub fn device_id(&self) -> &str {
        match self {
            ReconnectionEvent::Scheduled { device_id, .. }
            | ReconnectionEvent::Started { device_id, .. }
            | ReconnectionEvent::Succeeded { device_id, .. }
            | ReconnectionEvent::AttemptFailed { device_id, .. }
            | ReconnectionEvent::GaveUp { device_id, .. } => device_id,
        }
    }
}

/// Broadcasts events of one type to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventDispatcher<E> {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: E) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_fans_out() {
        let dispatcher = EventDispatcher::<DeviceEvent>::default();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(DeviceEvent::PrimaryChanged {
            device_id: Some("a".into()),
        });

        assert!(matches!(a.recv().await, Ok(DeviceEvent::PrimaryChanged { .. })));
        assert!(matches!(b.recv().await, Ok(DeviceEvent::PrimaryChanged { .. })));
    }

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::<ReconnectionEvent>::new(4);
        dispatcher.send(ReconnectionEvent::Succeeded {
            device_id: "a".into(),
            attempt: 1,
            error: None,
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_reconnection_event_serialization() {
        let event = ReconnectionEvent::AttemptFailed {
            device_id: "oralable-1".into(),
            attempt: 2,
            error: "timed out".into(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"attempt_failed\""));
        assert!(json.contains("\"will_retry\":true"));
        assert_eq!(event.device_id(), "oralable-1");
    }
}
