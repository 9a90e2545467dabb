//! Platform-agnostic types for wearable biosignal sensors.
//!
//! This crate provides the data model and packet decoders shared by the
//! BLE link layer (sensorfuse-core) and any consumer of fused sensor data.
//!
//! # Features
//!
//! - Sensor readings, reading batches and fused composite records
//! - Device family classification from advertised names
//! - Per-family battery tracking
//! - Decoders for every notify characteristic
//! - UUID constants for BLE services and characteristics
//!
//! # Example
//!
//! ```
//! use sensorfuse_types::{Channel, DeviceFamily, packet};
//! use time::OffsetDateTime;
//!
//! let ctx = packet::DecodeContext::new(OffsetDateTime::UNIX_EPOCH, DeviceFamily::Oralable);
//! let reading = packet::decode_battery(&[88], &ctx).unwrap().unwrap();
//! assert_eq!(reading.channel, Channel::Battery);
//! assert_eq!(reading.value, 88.0);
//! ```

pub mod error;
pub mod packet;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use packet::{DecodeContext, PacketKind};
pub use types::{
    BatteryLevel, BatteryState, Channel, CompositeRecord, CompositeRecordBuilder, DeviceFamily,
    GroupKey, ReadingBatch, SensorReading,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;
    use ::time::OffsetDateTime;

    #[test]
    fn test_every_family_channel_has_unit() {
        for family in DeviceFamily::ALL {
            for channel in family.channels() {
                assert!(!channel.unit().is_empty());
            }
        }
    }

    #[test]
    fn test_decoded_packet_feeds_batch() {
        let ctx = DecodeContext::new(OffsetDateTime::UNIX_EPOCH, DeviceFamily::MuscleSense);
        let mut data = 2u32.to_le_bytes().to_vec();
        data.extend_from_slice(&300u16.to_le_bytes());

        let readings = packet::decode(PacketKind::Emg, &data, &ctx).unwrap();
        let batch = ReadingBatch::new("anr-1", DeviceFamily::MuscleSense, readings);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.readings[0].frame_number, Some(20));
    }

    #[test]
    fn test_batch_serialization() {
        let reading = SensorReading::new(
            Channel::HeartRate,
            64.0,
            OffsetDateTime::UNIX_EPOCH,
            DeviceFamily::Oralable,
        )
        .with_quality(0.9);
        let batch = ReadingBatch::new("oralable-1", DeviceFamily::Oralable, vec![reading]);

        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains("\"device_id\":\"oralable-1\""));
        assert!(json.contains("\"heart_rate\""));

        let back: ReadingBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
