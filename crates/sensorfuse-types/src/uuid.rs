//! Bluetooth UUIDs for supported sensor families.
//!
//! This module contains the service and characteristic UUIDs needed to
//! subscribe to sensor notifications over Bluetooth Low Energy.

use uuid::{Uuid, uuid};

// --- Oralable (TGM firmware) ---

/// Oralable custom sensor service.
pub const ORALABLE_SERVICE: Uuid = uuid!("3a0ff000-98c4-46b2-94af-1aee0fd4c48e");

/// PPG samples (red, infrared, green) with frame counter. Notify.
pub const ORALABLE_PPG: Uuid = uuid!("3a0ff001-98c4-46b2-94af-1aee0fd4c48e");

/// Accelerometer samples (X, Y, Z) with frame counter. Notify.
pub const ORALABLE_ACCELEROMETER: Uuid = uuid!("3a0ff002-98c4-46b2-94af-1aee0fd4c48e");

/// Die temperature in hundredths of a degree. Notify.
pub const ORALABLE_TEMPERATURE: Uuid = uuid!("3a0ff003-98c4-46b2-94af-1aee0fd4c48e");

// --- ANR Muscle Sense (Nordic UART transport) ---

/// Nordic UART service used by Muscle Sense devices.
pub const MUSCLE_SENSE_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// UART TX characteristic carrying EMG frames. Notify.
pub const MUSCLE_SENSE_EMG: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

// --- Standard BLE services ---

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

// --- Standard BLE characteristics ---

/// Battery level characteristic (percent, `u8`).
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Heart Rate Measurement characteristic.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");
