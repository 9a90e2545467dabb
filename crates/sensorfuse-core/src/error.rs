//! Error types for sensorfuse-core.
//!
//! This module defines all error types that can occur while discovering,
//! connecting to and streaming from sensor devices.
//!
//! # Recovery
//!
//! | Error Type | Strategy | Rationale |
//! |------------|----------|-----------|
//! | [`Error::Timeout`] | Reconnect with backoff | Device busy or briefly out of range |
//! | [`Error::Bluetooth`] | Reconnect with backoff | May be transient or connection lost |
//! | [`Error::NotConnected`] | Reconnect | Connection was lost |
//! | [`Error::ConnectionFailed`] | Reconnect with backoff | Device may be temporarily busy |
//! | [`Error::CharacteristicNotFound`] | Reconnect | Service discovery raced the link |
//! | [`Error::RadioUnavailable`] | Wait for radio | Paused, never counted as a failure |
//! | [`Error::UnsupportedDevice`] | Do not retry | Name does not match a known family |
//! | [`Error::InvalidConfig`] | Do not retry | Fix configuration and restart |
//! | [`Error::Parse`] | Do not retry | Payload corruption |
//!
//! [`Error::is_recoverable`] encodes this table and is what decides whether a
//! failed connection attempt feeds the reconnection scheduler.

use std::time::Duration;

use sensorfuse_types::ParseError;
use thiserror::Error;

use crate::radio::RadioState;

/// Errors that can occur when communicating with sensor devices.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found in the registry or during scan.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Advertised name does not match any supported device family.
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection failed.
    #[error("Connection to {device_id} failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The radio is not powered on.
    #[error("Bluetooth radio unavailable ({0})")]
    RadioUnavailable(RadioState),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Notification payload could not be decoded.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The owning task has shut down.
    #[error("Scheduler stopped")]
    SchedulerStopped,
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(identifier.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a connection failure.
    pub fn connection_failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error should drive an automatic reconnection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Bluetooth(_)
                | Error::NotConnected
                | Error::CharacteristicNotFound { .. }
                | Error::Timeout { .. }
                | Error::ConnectionFailed { .. }
                | Error::RadioUnavailable(_)
        )
    }
}

/// Result type alias using sensorfuse-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found("oralable-1");
        assert!(err.to_string().contains("oralable-1"));

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::characteristic_not_found("0x2A19", 5);
        assert!(err.to_string().contains("0x2A19"));
        assert!(err.to_string().contains("5 services"));

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));

        let err = Error::RadioUnavailable(RadioState::PoweredOff);
        assert!(err.to_string().contains("powered off"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::NotConnected.is_recoverable());
        assert!(Error::timeout("connect", Duration::from_secs(1)).is_recoverable());
        assert!(Error::connection_failed("a", "refused").is_recoverable());
        assert!(!Error::UnsupportedDevice("Fitness Band".into()).is_recoverable());
        assert!(!Error::invalid_config("bad").is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = ParseError::InsufficientBytes {
            expected: 4,
            actual: 1,
        }
        .into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("requires 4 bytes"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }
}
