//! Decoding of raw BLE notification payloads into [`SensorReading`]s.
//!
//! Every decoder follows the same rule: a payload too short to carry its
//! header is a [`ParseError`], while an individual sample that is truncated
//! or out of range is dropped and simply produces no reading. One corrupt
//! sample never discards the rest of its packet.
//!
//! # Layouts
//!
//! | Packet | Header | Sample |
//! |--------|--------|--------|
//! | PPG | `u32` LE frame counter | 3 × `u32` LE (red, IR, green) |
//! | Accelerometer | `u32` LE frame counter | 3 × `i16` LE (X, Y, Z) |
//! | EMG | `u32` LE frame counter | `u16` LE envelope |
//! | Temperature | none | `i16` LE, 0.01 °C |
//! | Battery | none | `u8` percent |
//! | Heart rate | flags `u8` | `u8` or `u16` LE bpm |
//!
//! Frame-counted packets carry a fixed number of samples; the frame number of
//! sample `i` is `counter * samples_per_packet + i`.

use bytes::Buf;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::types::{Channel, DeviceFamily, SensorReading};
use crate::uuid::{
    BATTERY_LEVEL, HEART_RATE_MEASUREMENT, MUSCLE_SENSE_EMG, ORALABLE_ACCELEROMETER, ORALABLE_PPG,
    ORALABLE_TEMPERATURE,
};

/// Size of the frame counter header.
pub const FRAME_HEADER_BYTES: usize = 4;

/// Bytes per PPG sample (three `u32` channels).
pub const PPG_SAMPLE_BYTES: usize = 12;

/// PPG samples per packet.
pub const PPG_SAMPLES_PER_PACKET: u64 = 20;

/// Largest valid PPG count (18-bit ADC). Higher values mean saturation.
pub const PPG_MAX_COUNT: u32 = 0x3_FFFF;

/// Bytes per accelerometer sample (three `i16` axes).
pub const ACCEL_SAMPLE_BYTES: usize = 6;

/// Accelerometer samples per packet.
pub const ACCEL_SAMPLES_PER_PACKET: u64 = 25;

/// Bytes per EMG sample.
pub const EMG_SAMPLE_BYTES: usize = 2;

/// EMG samples per packet.
pub const EMG_SAMPLES_PER_PACKET: u64 = 10;

/// Largest valid EMG envelope value (12-bit ADC).
pub const EMG_MAX_VALUE: u16 = 0x0FFF;

/// Valid temperature range in degrees Celsius.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = -40.0..=125.0;

/// Kind of notification payload, derived from the characteristic it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Oralable PPG samples.
    Ppg,
    /// Oralable accelerometer samples.
    Accelerometer,
    /// Oralable temperature.
    Temperature,
    /// Standard battery level.
    Battery,
    /// Muscle Sense EMG samples.
    Emg,
    /// Standard heart rate measurement.
    HeartRate,
}

impl PacketKind {
    /// Map a notify characteristic to its payload kind.
    pub fn from_characteristic(uuid: Uuid) -> Option<Self> {
        match uuid {
            u if u == ORALABLE_PPG => Some(PacketKind::Ppg),
            u if u == ORALABLE_ACCELEROMETER => Some(PacketKind::Accelerometer),
            u if u == ORALABLE_TEMPERATURE => Some(PacketKind::Temperature),
            u if u == BATTERY_LEVEL => Some(PacketKind::Battery),
            u if u == MUSCLE_SENSE_EMG => Some(PacketKind::Emg),
            u if u == HEART_RATE_MEASUREMENT => Some(PacketKind::HeartRate),
            _ => None,
        }
    }

    /// Notify characteristics a device family exposes.
    pub fn characteristics_for(family: DeviceFamily) -> &'static [Uuid] {
        match family {
            DeviceFamily::Oralable => &[
                ORALABLE_PPG,
                ORALABLE_ACCELEROMETER,
                ORALABLE_TEMPERATURE,
                BATTERY_LEVEL,
                HEART_RATE_MEASUREMENT,
            ],
            DeviceFamily::MuscleSense => &[MUSCLE_SENSE_EMG],
        }
    }
}

/// Context needed to timestamp decoded samples.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    /// When the notification was received. The last sample in a packet
    /// is stamped with this time.
    pub received_at: OffsetDateTime,
    /// Family of the sending device.
    pub family: DeviceFamily,
    /// Spacing between consecutive samples within one packet.
    pub sample_period: Duration,
}

impl DecodeContext {
    /// Create a context with a 20 ms (50 Hz) sample period.
    pub fn new(received_at: OffsetDateTime, family: DeviceFamily) -> Self {
        Self {
            received_at,
            family,
            sample_period: Duration::milliseconds(20),
        }
    }

    /// Override the sample period.
    #[must_use]
    pub fn with_sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period;
        self
    }

    fn sample_time(&self, index: usize, count: usize) -> OffsetDateTime {
        let behind = count.saturating_sub(index + 1) as i32;
        self.received_at - self.sample_period * behind
    }
}

/// Decode any payload kind.
pub fn decode(kind: PacketKind, data: &[u8], ctx: &DecodeContext) -> ParseResult<Vec<SensorReading>> {
    match kind {
        PacketKind::Ppg => decode_ppg(data, ctx),
        PacketKind::Accelerometer => decode_accelerometer(data, ctx),
        PacketKind::Emg => decode_emg(data, ctx),
        PacketKind::Temperature => Ok(decode_temperature(data, ctx)?.into_iter().collect()),
        PacketKind::Battery => Ok(decode_battery(data, ctx)?.into_iter().collect()),
        PacketKind::HeartRate => Ok(decode_heart_rate(data, ctx)?.into_iter().collect()),
    }
}

fn read_frame_counter(data: &[u8]) -> ParseResult<(u32, &[u8])> {
    if data.len() < FRAME_HEADER_BYTES {
        return Err(ParseError::InsufficientBytes {
            expected: FRAME_HEADER_BYTES,
            actual: data.len(),
        });
    }
    let mut buf = data;
    let counter = buf.get_u32_le();
    Ok((counter, buf))
}

/// Decode a PPG packet.
pub fn decode_ppg(data: &[u8], ctx: &DecodeContext) -> ParseResult<Vec<SensorReading>> {
    let (counter, body) = read_frame_counter(data)?;
    let samples: Vec<&[u8]> = body.chunks_exact(PPG_SAMPLE_BYTES).collect();
    let base_frame = u64::from(counter) * PPG_SAMPLES_PER_PACKET;

    let mut readings = Vec::with_capacity(samples.len() * 3);
    for (i, mut sample) in samples.iter().copied().enumerate() {
        let frame = base_frame + i as u64;
        let timestamp = ctx.sample_time(i, samples.len());
        for channel in [Channel::PpgRed, Channel::PpgInfrared, Channel::PpgGreen] {
            let count = sample.get_u32_le();
            if count > PPG_MAX_COUNT {
                continue;
            }
            readings.push(
                SensorReading::new(channel, f64::from(count), timestamp, ctx.family)
                    .with_frame(frame),
            );
        }
    }
    Ok(readings)
}

/// Decode an accelerometer packet.
///
/// Axis values are device-native integer units and are passed through as-is.
pub fn decode_accelerometer(data: &[u8], ctx: &DecodeContext) -> ParseResult<Vec<SensorReading>> {
    let (counter, body) = read_frame_counter(data)?;
    let samples: Vec<&[u8]> = body.chunks_exact(ACCEL_SAMPLE_BYTES).collect();
    let base_frame = u64::from(counter) * ACCEL_SAMPLES_PER_PACKET;

    let mut readings = Vec::with_capacity(samples.len() * 3);
    for (i, mut sample) in samples.iter().copied().enumerate() {
        let frame = base_frame + i as u64;
        let timestamp = ctx.sample_time(i, samples.len());
        for channel in [Channel::AccelX, Channel::AccelY, Channel::AccelZ] {
            let raw = sample.get_i16_le();
            readings.push(
                SensorReading::new(channel, f64::from(raw), timestamp, ctx.family)
                    .with_frame(frame),
            );
        }
    }
    Ok(readings)
}

/// Decode an EMG packet.
pub fn decode_emg(data: &[u8], ctx: &DecodeContext) -> ParseResult<Vec<SensorReading>> {
    let (counter, body) = read_frame_counter(data)?;
    let samples: Vec<&[u8]> = body.chunks_exact(EMG_SAMPLE_BYTES).collect();
    let base_frame = u64::from(counter) * EMG_SAMPLES_PER_PACKET;

    Ok(samples
        .iter()
        .copied()
        .enumerate()
        .filter_map(|(i, mut sample)| {
            let value = sample.get_u16_le();
            (value <= EMG_MAX_VALUE).then(|| {
                SensorReading::new(
                    Channel::Emg,
                    f64::from(value),
                    ctx.sample_time(i, samples.len()),
                    ctx.family,
                )
                .with_frame(base_frame + i as u64)
            })
        })
        .collect())
}

/// Decode a temperature payload. Out-of-range values yield `None`.
pub fn decode_temperature(data: &[u8], ctx: &DecodeContext) -> ParseResult<Option<SensorReading>> {
    if data.len() < 2 {
        return Err(ParseError::InsufficientBytes {
            expected: 2,
            actual: data.len(),
        });
    }
    let mut buf = data;
    let celsius = f64::from(buf.get_i16_le()) / 100.0;
    if !TEMPERATURE_RANGE.contains(&celsius) {
        return Ok(None);
    }
    Ok(Some(SensorReading::new(
        Channel::Temperature,
        celsius,
        ctx.received_at,
        ctx.family,
    )))
}

/// Decode a battery level payload. Values above 100 yield `None`.
pub fn decode_battery(data: &[u8], ctx: &DecodeContext) -> ParseResult<Option<SensorReading>> {
    let Some(&percent) = data.first() else {
        return Err(ParseError::InsufficientBytes {
            expected: 1,
            actual: 0,
        });
    };
    if percent > 100 {
        return Ok(None);
    }
    Ok(Some(SensorReading::new(
        Channel::Battery,
        f64::from(percent),
        ctx.received_at,
        ctx.family,
    )))
}

/// Decode a standard Heart Rate Measurement payload.
///
/// A zero rate yields `None`. When the sensor supports contact detection and
/// reports no contact, the reading carries a quality score of `0.0`.
pub fn decode_heart_rate(data: &[u8], ctx: &DecodeContext) -> ParseResult<Option<SensorReading>> {
    let Some(&flags) = data.first() else {
        return Err(ParseError::InsufficientBytes {
            expected: 2,
            actual: 0,
        });
    };
    let wide = flags & 0x01 != 0;
    let expected = if wide { 3 } else { 2 };
    if data.len() < expected {
        return Err(ParseError::InsufficientBytes {
            expected,
            actual: data.len(),
        });
    }

    let mut buf = &data[1..];
    let bpm = if wide {
        buf.get_u16_le()
    } else {
        u16::from(buf.get_u8())
    };
    if bpm == 0 {
        return Ok(None);
    }

    let mut reading =
        SensorReading::new(Channel::HeartRate, f64::from(bpm), ctx.received_at, ctx.family);
    let contact_supported = flags & 0x04 != 0;
    let contact_detected = flags & 0x02 != 0;
    if contact_supported {
        reading = reading.with_quality(if contact_detected { 1.0 } else { 0.0 });
    }
    Ok(Some(reading))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DecodeContext {
        DecodeContext::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            DeviceFamily::Oralable,
        )
    }

    fn ppg_packet(counter: u32, samples: &[[u32; 3]]) -> Vec<u8> {
        let mut data = counter.to_le_bytes().to_vec();
        for sample in samples {
            for value in sample {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        data
    }

    #[test]
    fn test_ppg_frame_numbers() {
        let data = ppg_packet(3, &[[100, 200, 300], [101, 201, 301]]);
        let readings = decode_ppg(&data, &ctx()).unwrap();

        assert_eq!(readings.len(), 6);
        assert!(readings[..3].iter().all(|r| r.frame_number == Some(60)));
        assert!(readings[3..].iter().all(|r| r.frame_number == Some(61)));
        assert_eq!(readings[1].channel, Channel::PpgInfrared);
        assert_eq!(readings[1].value, 200.0);
    }

    #[test]
    fn test_ppg_sample_timestamps_end_at_receipt() {
        let data = ppg_packet(0, &[[1, 1, 1], [2, 2, 2], [3, 3, 3]]);
        let readings = decode_ppg(&data, &ctx()).unwrap();

        assert_eq!(readings[8].timestamp, ctx().received_at);
        assert_eq!(
            readings[0].timestamp,
            ctx().received_at - Duration::milliseconds(40)
        );
    }

    #[test]
    fn test_ppg_saturated_channel_dropped() {
        let data = ppg_packet(0, &[[100, PPG_MAX_COUNT + 1, 300]]);
        let readings = decode_ppg(&data, &ctx()).unwrap();

        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.channel != Channel::PpgInfrared));
    }

    #[test]
    fn test_ppg_truncated_sample_dropped() {
        let mut data = ppg_packet(0, &[[1, 2, 3]]);
        data.extend_from_slice(&[0xAA; 7]);
        let readings = decode_ppg(&data, &ctx()).unwrap();
        assert_eq!(readings.len(), 3);
    }

    #[test]
    fn test_ppg_short_header_is_error() {
        let err = decode_ppg(&[1, 2], &ctx()).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientBytes {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_accelerometer_values_not_rescaled() {
        let mut data = 1u32.to_le_bytes().to_vec();
        for axis in [-16384i16, 0, 16384] {
            data.extend_from_slice(&axis.to_le_bytes());
        }
        let readings = decode_accelerometer(&data, &ctx()).unwrap();

        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].value, -16384.0);
        assert_eq!(readings[2].value, 16384.0);
        assert_eq!(readings[0].frame_number, Some(ACCEL_SAMPLES_PER_PACKET));
    }

    #[test]
    fn test_emg_out_of_range_dropped() {
        let mut data = 0u32.to_le_bytes().to_vec();
        data.extend_from_slice(&100u16.to_le_bytes());
        data.extend_from_slice(&0xFFFFu16.to_le_bytes());
        data.extend_from_slice(&200u16.to_le_bytes());
        let ctx = DecodeContext::new(ctx().received_at, DeviceFamily::MuscleSense);
        let readings = decode_emg(&data, &ctx).unwrap();

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].frame_number, Some(2));
        assert_eq!(readings[1].device_family, DeviceFamily::MuscleSense);
    }

    #[test]
    fn test_temperature_decoding() {
        let reading = decode_temperature(&3650i16.to_le_bytes(), &ctx())
            .unwrap()
            .unwrap();
        assert!((reading.value - 36.5).abs() < 1e-9);
        assert_eq!(reading.frame_number, None);

        assert!(decode_temperature(&20000i16.to_le_bytes(), &ctx())
            .unwrap()
            .is_none());
        assert!(decode_temperature(&[1], &ctx()).is_err());
    }

    #[test]
    fn test_battery_decoding() {
        assert_eq!(decode_battery(&[77], &ctx()).unwrap().unwrap().value, 77.0);
        assert!(decode_battery(&[101], &ctx()).unwrap().is_none());
        assert!(decode_battery(&[], &ctx()).is_err());
    }

    #[test]
    fn test_heart_rate_formats() {
        let narrow = decode_heart_rate(&[0x00, 72], &ctx()).unwrap().unwrap();
        assert_eq!(narrow.value, 72.0);
        assert_eq!(narrow.quality, None);

        let wide = decode_heart_rate(&[0x01, 0x2C, 0x01], &ctx()).unwrap().unwrap();
        assert_eq!(wide.value, 300.0);

        let no_contact = decode_heart_rate(&[0x04, 80], &ctx()).unwrap().unwrap();
        assert_eq!(no_contact.quality, Some(0.0));

        assert!(decode_heart_rate(&[0x00, 0], &ctx()).unwrap().is_none());
        assert!(decode_heart_rate(&[0x01, 0x2C], &ctx()).is_err());
    }

    #[test]
    fn test_characteristic_mapping() {
        assert_eq!(PacketKind::from_characteristic(ORALABLE_PPG), Some(PacketKind::Ppg));
        assert_eq!(PacketKind::from_characteristic(MUSCLE_SENSE_EMG), Some(PacketKind::Emg));
        assert_eq!(PacketKind::from_characteristic(Uuid::nil()), None);
        assert_eq!(
            PacketKind::characteristics_for(DeviceFamily::MuscleSense),
            &[MUSCLE_SENSE_EMG]
        );
    }
}

/// Property-based tests for the decoders.
///
/// These verify that decoding arbitrary bytes never panics.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn ctx() -> DecodeContext {
        DecodeContext::new(OffsetDateTime::UNIX_EPOCH, DeviceFamily::Oralable)
    }

    proptest! {
        #[test]
        fn decode_ppg_never_panics(data in proptest::collection::vec(any::<u8>(), 0..300)) {
            let _ = decode_ppg(&data, &ctx());
        }

        #[test]
        fn decode_accelerometer_never_panics(data in proptest::collection::vec(any::<u8>(), 0..200)) {
            let _ = decode_accelerometer(&data, &ctx());
        }

        #[test]
        fn decode_heart_rate_never_panics(data in proptest::collection::vec(any::<u8>(), 0..8)) {
            let _ = decode_heart_rate(&data, &ctx());
        }

        #[test]
        fn ppg_readings_never_exceed_max(data in proptest::collection::vec(any::<u8>(), 4..300)) {
            let readings = decode_ppg(&data, &ctx()).unwrap();
            prop_assert!(readings.iter().all(|r| r.value <= f64::from(PPG_MAX_COUNT)));
            prop_assert!(readings.len() <= (data.len() - 4) / PPG_SAMPLE_BYTES * 3);
        }
    }
}
