//! Record and device formatting for terminal output.

use time::format_description::well_known::Rfc3339;

use sensorfuse_core::{Channel, CompositeRecord, DeviceFamily, GroupKey, PeripheralHandle};

use crate::config::OutputFormat;

/// Format one composite record.
pub fn format_record(record: &CompositeRecord, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string(record)?),
        OutputFormat::Text => Ok(format_record_text(record)),
    }
}

fn format_record_text(record: &CompositeRecord) -> String {
    let timestamp = record
        .timestamp()
        .format(&Rfc3339)
        .unwrap_or_else(|_| record.timestamp().to_string());
    let key = match record.group_key() {
        GroupKey::Frame(frame) => format!("frame {}", frame),
        GroupKey::Bucket(bucket) => format!("bucket {}", bucket),
    };

    let mut line = format!("{} [{}] {}", timestamp, record.device_family(), key);
    for channel in Channel::ALL {
        // EMG values live in the infrared slot.
        if channel == Channel::Emg {
            continue;
        }
        let Some(value) = record.value(channel) else {
            continue;
        };
        let label = if channel == Channel::PpgInfrared
            && record.device_family() == DeviceFamily::MuscleSense
        {
            Channel::Emg
        } else {
            channel
        };
        line.push_str(&format!("  {}={:.2} {}", label, value, label.unit()));
    }
    line
}

/// Format a discovered device for the scan listing.
pub fn format_device(device: &PeripheralHandle) -> String {
    let rssi = device
        .rssi
        .map(|r| format!("{} dBm", r))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<24} {:<12} {:>8}  {}",
        device.display_name(),
        device.family.to_string(),
        rssi,
        device.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn record() -> CompositeRecord {
        CompositeRecord::builder(
            OffsetDateTime::UNIX_EPOCH,
            GroupKey::Frame(12),
            DeviceFamily::Oralable,
        )
        .with(Channel::PpgRed, 1200.0)
        .with(Channel::HeartRate, 72.0)
        .build()
    }

    #[test]
    fn test_text_record() {
        let line = format_record(&record(), OutputFormat::Text).unwrap();
        assert!(line.starts_with("1970-01-01T00:00:00Z"));
        assert!(line.contains("frame 12"));
        assert!(line.contains("PPG red=1200.00 counts"));
        assert!(line.contains("Heart rate=72.00 bpm"));
        assert!(!line.contains("Temperature"));
    }

    #[test]
    fn test_text_record_labels_emg() {
        let record = CompositeRecord::builder(
            OffsetDateTime::UNIX_EPOCH,
            GroupKey::Frame(3),
            DeviceFamily::MuscleSense,
        )
        .with(Channel::Emg, 412.0)
        .build();
        let line = format_record(&record, OutputFormat::Text).unwrap();
        assert!(line.contains("EMG=412.00"));
        assert!(!line.contains("PPG infrared"));
    }

    #[test]
    fn test_json_record() {
        let line = format_record(&record(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["ppg_red"], 1200.0);
        assert_eq!(value["heart_rate"], 72.0);
        assert!(value["temperature"].is_null());
    }

    #[test]
    fn test_format_device() {
        let device =
            PeripheralHandle::new("AA:BB", Some("Oralable 01".into()), DeviceFamily::Oralable)
                .with_rssi(-61);
        let line = format_device(&device);
        assert!(line.starts_with("Oralable 01"));
        assert!(line.contains("-61 dBm"));
        assert!(line.ends_with("AA:BB"));
    }
}
