//! Core types for biosignal sensor data.

use core::fmt;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Class of physical sensor hardware.
///
/// Each family has its own channel set and battery-reporting behaviour.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new families
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum DeviceFamily {
    /// Oralable intra-oral PPG sensor (optical, accelerometer, temperature, battery).
    Oralable,
    /// ANR Muscle Sense surface EMG sensor.
    MuscleSense,
}

impl DeviceFamily {
    /// Every supported family.
    pub const ALL: [DeviceFamily; 2] = [DeviceFamily::Oralable, DeviceFamily::MuscleSense];

    /// Classify an advertised device name.
    ///
    /// Matching is case-insensitive and word-boundary aware, so
    /// `"Oralable-7F"` matches while `"NotOralableX"` does not.
    ///
    /// # Examples
    ///
    /// ```
    /// use sensorfuse_types::DeviceFamily;
    ///
    /// assert_eq!(DeviceFamily::from_name("Oralable 7F21"), Some(DeviceFamily::Oralable));
    /// assert_eq!(DeviceFamily::from_name("TGM"), Some(DeviceFamily::Oralable));
    /// assert_eq!(DeviceFamily::from_name("ANR M40"), Some(DeviceFamily::MuscleSense));
    /// assert_eq!(DeviceFamily::from_name("Muscle Sense 2"), Some(DeviceFamily::MuscleSense));
    /// assert_eq!(DeviceFamily::from_name("Fitness Band"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name_lower = name.to_lowercase();

        if Self::contains_word(&name_lower, "oralable") || Self::contains_word(&name_lower, "tgm")
        {
            return Some(DeviceFamily::Oralable);
        }

        if Self::contains_word(&name_lower, "anr")
            || Self::contains_word(&name_lower, "muscle sense")
            || Self::contains_word(&name_lower, "musclesense")
            || Self::contains_word(&name_lower, "m40")
        {
            return Some(DeviceFamily::MuscleSense);
        }

        None
    }

    /// Check if a string contains a word at a word boundary.
    fn contains_word(haystack: &str, needle: &str) -> bool {
        haystack.match_indices(needle).any(|(pos, _)| {
            let before_ok = haystack[..pos]
                .chars()
                .last()
                .is_none_or(|c| !c.is_alphanumeric());
            let after_ok = haystack[pos + needle.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric());
            before_ok && after_ok
        })
    }

    /// Whether this family ever reports a battery level.
    #[must_use]
    pub fn reports_battery(&self) -> bool {
        matches!(self, DeviceFamily::Oralable)
    }

    /// Channels this family produces.
    #[must_use]
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            DeviceFamily::Oralable => &[
                Channel::PpgRed,
                Channel::PpgInfrared,
                Channel::PpgGreen,
                Channel::AccelX,
                Channel::AccelY,
                Channel::AccelZ,
                Channel::Temperature,
                Channel::Battery,
                Channel::HeartRate,
                Channel::Spo2,
            ],
            DeviceFamily::MuscleSense => &[Channel::Emg],
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Oralable => write!(f, "Oralable"),
            DeviceFamily::MuscleSense => write!(f, "Muscle Sense"),
        }
    }
}

/// A single measurement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Channel {
    /// Red PPG photodiode count.
    PpgRed,
    /// Infrared PPG photodiode count.
    PpgInfrared,
    /// Green PPG photodiode count.
    PpgGreen,
    /// Accelerometer X axis, device-native units.
    AccelX,
    /// Accelerometer Y axis, device-native units.
    AccelY,
    /// Accelerometer Z axis, device-native units.
    AccelZ,
    /// Temperature in degrees Celsius.
    Temperature,
    /// Battery level in percent.
    Battery,
    /// Computed heart rate in bpm.
    HeartRate,
    /// Computed blood oxygen saturation in percent.
    Spo2,
    /// Surface EMG envelope.
    Emg,
}

impl Channel {
    /// Every channel, in display order.
    pub const ALL: [Channel; 11] = [
        Channel::PpgRed,
        Channel::PpgInfrared,
        Channel::PpgGreen,
        Channel::AccelX,
        Channel::AccelY,
        Channel::AccelZ,
        Channel::Temperature,
        Channel::Battery,
        Channel::HeartRate,
        Channel::Spo2,
        Channel::Emg,
    ];

    /// Whether the hardware tags samples on this channel with a frame number.
    ///
    /// Frameless channels are slow, asynchronous signals that are grouped
    /// by timestamp instead.
    #[must_use]
    pub fn carries_frame_number(&self) -> bool {
        matches!(
            self,
            Channel::PpgRed
                | Channel::PpgInfrared
                | Channel::PpgGreen
                | Channel::AccelX
                | Channel::AccelY
                | Channel::AccelZ
                | Channel::Emg
        )
    }

    /// The composite record slot this channel is written into.
    ///
    /// EMG shares the infrared slot: downstream consumers treat the two as
    /// interchangeable muscle-activity signals.
    #[must_use]
    pub fn slot(&self) -> Channel {
        match self {
            Channel::Emg => Channel::PpgInfrared,
            other => *other,
        }
    }

    /// Short unit label for display.
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            Channel::PpgRed | Channel::PpgInfrared | Channel::PpgGreen => "counts",
            Channel::AccelX | Channel::AccelY | Channel::AccelZ => "raw",
            Channel::Temperature => "°C",
            Channel::Battery | Channel::Spo2 => "%",
            Channel::HeartRate => "bpm",
            Channel::Emg => "µV",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Channel::PpgRed => "PPG red",
            Channel::PpgInfrared => "PPG infrared",
            Channel::PpgGreen => "PPG green",
            Channel::AccelX => "Accel X",
            Channel::AccelY => "Accel Y",
            Channel::AccelZ => "Accel Z",
            Channel::Temperature => "Temperature",
            Channel::Battery => "Battery",
            Channel::HeartRate => "Heart rate",
            Channel::Spo2 => "SpO2",
            Channel::Emg => "EMG",
        };
        f.write_str(label)
    }
}

/// One scalar sample on one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorReading {
    /// Channel the sample belongs to.
    pub channel: Channel,
    /// Sample value in the channel's unit.
    pub value: f64,
    /// When the sample was taken.
    pub timestamp: OffsetDateTime,
    /// Hardware sequence id shared by co-sampled channels.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub frame_number: Option<u64>,
    /// Signal quality score in `0.0..=1.0`, if the source computes one.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub quality: Option<f32>,
    /// Family of the device that produced the sample.
    pub device_family: DeviceFamily,
}

impl SensorReading {
    /// Create a reading without frame number or quality score.
    pub fn new(
        channel: Channel,
        value: f64,
        timestamp: OffsetDateTime,
        device_family: DeviceFamily,
    ) -> Self {
        Self {
            channel,
            value,
            timestamp,
            frame_number: None,
            quality: None,
            device_family,
        }
    }

    /// Attach a hardware frame number.
    #[must_use]
    pub fn with_frame(mut self, frame_number: u64) -> Self {
        self.frame_number = Some(frame_number);
        self
    }

    /// Attach a quality score.
    #[must_use]
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// All readings delivered by one device in one notification cycle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReadingBatch {
    /// Identifier of the device that produced the batch.
    pub device_id: String,
    /// Family of that device.
    pub device_family: DeviceFamily,
    /// Decoded readings, in arrival order.
    pub readings: Vec<SensorReading>,
}

impl ReadingBatch {
    /// Create a new batch.
    pub fn new(
        device_id: impl Into<String>,
        device_family: DeviceFamily,
        readings: Vec<SensorReading>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_family,
            readings,
        }
    }

    /// Number of readings in the batch.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether the batch carries no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Key used to group readings into one composite record.
///
/// Frame keys order before bucket keys, so within a processed batch all
/// frame-aligned records precede the timestamp-bucketed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GroupKey {
    /// Hardware frame number.
    Frame(u64),
    /// Timestamp floor-divided by the bucket width.
    Bucket(i64),
}

/// One fused multi-channel reading at a single time point.
///
/// Records are built once through [`CompositeRecordBuilder`] and are
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompositeRecord {
    timestamp: OffsetDateTime,
    group_key: GroupKey,
    device_family: DeviceFamily,
    ppg_red: Option<f64>,
    ppg_infrared: Option<f64>,
    ppg_green: Option<f64>,
    accel_x: Option<f64>,
    accel_y: Option<f64>,
    accel_z: Option<f64>,
    temperature: Option<f64>,
    battery: Option<f64>,
    heart_rate: Option<f64>,
    spo2: Option<f64>,
}

impl CompositeRecord {
    /// Start building a record.
    pub fn builder(
        timestamp: OffsetDateTime,
        group_key: GroupKey,
        device_family: DeviceFamily,
    ) -> CompositeRecordBuilder {
        CompositeRecordBuilder {
            record: CompositeRecord {
                timestamp,
                group_key,
                device_family,
                ppg_red: None,
                ppg_infrared: None,
                ppg_green: None,
                accel_x: None,
                accel_y: None,
                accel_z: None,
                temperature: None,
                battery: None,
                heart_rate: None,
                spo2: None,
            },
        }
    }

    /// Timestamp of the earliest reading merged into this record.
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// Key the record was grouped under.
    pub fn group_key(&self) -> GroupKey {
        self.group_key
    }

    /// Family of the device that produced the first merged reading.
    pub fn device_family(&self) -> DeviceFamily {
        self.device_family
    }

    /// Value stored for a channel, following the slot mapping of
    /// [`Channel::slot`].
    pub fn value(&self, channel: Channel) -> Option<f64> {
        match channel.slot() {
            Channel::PpgRed => self.ppg_red,
            Channel::PpgInfrared => self.ppg_infrared,
            Channel::PpgGreen => self.ppg_green,
            Channel::AccelX => self.accel_x,
            Channel::AccelY => self.accel_y,
            Channel::AccelZ => self.accel_z,
            Channel::Temperature => self.temperature,
            Channel::Battery => self.battery,
            Channel::HeartRate => self.heart_rate,
            Channel::Spo2 => self.spo2,
            Channel::Emg => None,
        }
    }

    /// Computed heart rate, if one was merged.
    pub fn heart_rate(&self) -> Option<f64> {
        self.heart_rate
    }

    /// Computed SpO2, if one was merged.
    pub fn spo2(&self) -> Option<f64> {
        self.spo2
    }

    /// Number of populated slots.
    pub fn populated_slots(&self) -> usize {
        [
            self.ppg_red,
            self.ppg_infrared,
            self.ppg_green,
            self.accel_x,
            self.accel_y,
            self.accel_z,
            self.temperature,
            self.battery,
            self.heart_rate,
            self.spo2,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
    }
}

/// Builder for [`CompositeRecord`].
#[derive(Debug, Clone)]
pub struct CompositeRecordBuilder {
    record: CompositeRecord,
}

impl CompositeRecordBuilder {
    /// Write a value into the slot for `channel`. A later value for the same
    /// slot replaces an earlier one.
    #[must_use]
    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        let slot = match channel.slot() {
            Channel::PpgRed => &mut self.record.ppg_red,
            Channel::PpgInfrared | Channel::Emg => &mut self.record.ppg_infrared,
            Channel::PpgGreen => &mut self.record.ppg_green,
            Channel::AccelX => &mut self.record.accel_x,
            Channel::AccelY => &mut self.record.accel_y,
            Channel::AccelZ => &mut self.record.accel_z,
            Channel::Temperature => &mut self.record.temperature,
            Channel::Battery => &mut self.record.battery,
            Channel::HeartRate => &mut self.record.heart_rate,
            Channel::Spo2 => &mut self.record.spo2,
        };
        *slot = Some(value);
        self
    }

    /// Move the record timestamp earlier if `timestamp` precedes it.
    #[must_use]
    pub fn earliest(mut self, timestamp: OffsetDateTime) -> Self {
        if timestamp < self.record.timestamp {
            self.record.timestamp = timestamp;
        }
        self
    }

    /// Finish the record.
    #[must_use]
    pub fn build(self) -> CompositeRecord {
        self.record
    }
}

/// Battery level as reported by one device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BatteryLevel {
    /// The family has never reported a level (or never does).
    #[default]
    NotReported,
    /// Last reported level in percent (0-100).
    Percent(u8),
}

impl BatteryLevel {
    /// The percentage, if reported.
    pub fn percent(&self) -> Option<u8> {
        match self {
            BatteryLevel::NotReported => None,
            BatteryLevel::Percent(p) => Some(*p),
        }
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryLevel::NotReported => write!(f, "not reported"),
            BatteryLevel::Percent(p) => write!(f, "{}%", p),
        }
    }
}

/// Last known battery level per device family.
///
/// A family's slot is only ever written by readings from that same family,
/// and only if the family reports battery at all.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatteryState {
    levels: BTreeMap<DeviceFamily, BatteryLevel>,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self::new()
    }
}

impl BatteryState {
    /// All families start as [`BatteryLevel::NotReported`].
    pub fn new() -> Self {
        Self {
            levels: DeviceFamily::ALL
                .iter()
                .map(|f| (*f, BatteryLevel::NotReported))
                .collect(),
        }
    }

    /// Last known level for a family.
    pub fn get(&self, family: DeviceFamily) -> BatteryLevel {
        self.levels.get(&family).copied().unwrap_or_default()
    }

    /// Record a level reported by `family`.
    ///
    /// Returns `false` (and changes nothing) when the family does not report
    /// battery or the value is outside 0-100.
    pub fn update(&mut self, family: DeviceFamily, value: f64) -> bool {
        if !family.reports_battery() || !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return false;
        }
        self.levels
            .insert(family, BatteryLevel::Percent(value.round() as u8));
        true
    }

    /// Iterate over every family and its level.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceFamily, BatteryLevel)> + '_ {
        self.levels.iter().map(|(f, l)| (*f, *l))
    }
}
