//! Signal quality checks for incoming readings.
//!
//! The quality guard flags physiologically implausible or low-confidence
//! readings. A warning is diagnostic only: flagged readings are still
//! aggregated.
//!
//! # Example
//!
//! ```
//! use sensorfuse_core::validation::{QualityGuard, QualityWarning};
//! use sensorfuse_types::{Channel, DeviceFamily, SensorReading};
//! use time::OffsetDateTime;
//!
//! let guard = QualityGuard::default();
//! let reading = SensorReading::new(
//!     Channel::HeartRate,
//!     230.0,
//!     OffsetDateTime::UNIX_EPOCH,
//!     DeviceFamily::Oralable,
//! );
//!
//! let warnings = guard.check(&reading);
//! assert!(matches!(warnings[0], QualityWarning::HeartRateOutOfRange { .. }));
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use sensorfuse_types::{Channel, SensorReading};

use crate::error::{Error, Result};

/// Quality issues the guard can raise.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new warning types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum QualityWarning {
    /// Heart rate outside the plausible range.
    HeartRateOutOfRange { value: f64, min: f64, max: f64 },
    /// Oxygen saturation below the minimum.
    Spo2TooLow { value: f64, min: f64 },
    /// The source's own quality score is too low.
    LowQuality {
        channel: Channel,
        score: f32,
        min: f32,
    },
}

impl std::fmt::Display for QualityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityWarning::HeartRateOutOfRange { value, min, max } => {
                write!(
                    f,
                    "Heart rate {} bpm is outside {}-{} bpm",
                    value, min, max
                )
            }
            QualityWarning::Spo2TooLow { value, min } => {
                write!(f, "SpO2 {}% is below minimum {}%", value, min)
            }
            QualityWarning::LowQuality {
                channel,
                score,
                min,
            } => {
                write!(
                    f,
                    "{} quality score {:.2} is below {:.2}",
                    channel, score, min
                )
            }
        }
    }
}

/// Thresholds used by [`QualityGuard`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Lowest plausible heart rate (bpm).
    pub heart_rate_min: f64,
    /// Highest plausible heart rate (bpm).
    pub heart_rate_max: f64,
    /// Lowest acceptable SpO2 (%).
    pub spo2_min: f64,
    /// Lowest acceptable quality score.
    pub quality_min: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            heart_rate_min: 40.0,
            heart_rate_max: 200.0,
            spo2_min: 90.0,
            quality_min: 0.5,
        }
    }
}

impl QualityThresholds {
    /// Create thresholds with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set heart rate range (min, max).
    #[must_use]
    pub fn heart_rate_range(mut self, min: f64, max: f64) -> Self {
        self.heart_rate_min = min;
        self.heart_rate_max = max;
        self
    }

    /// Set minimum SpO2.
    #[must_use]
    pub fn spo2_min(mut self, min: f64) -> Self {
        self.spo2_min = min;
        self
    }

    /// Set minimum quality score.
    #[must_use]
    pub fn quality_min(mut self, min: f32) -> Self {
        self.quality_min = min;
        self
    }

    /// Validate the thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.heart_rate_min.partial_cmp(&self.heart_rate_max) != Some(Ordering::Less) {
            return Err(Error::invalid_config(format!(
                "heart_rate_min ({}) must be below heart_rate_max ({})",
                self.heart_rate_min, self.heart_rate_max
            )));
        }
        if !(0.0..=100.0).contains(&self.spo2_min) {
            return Err(Error::invalid_config("spo2_min must be within 0-100"));
        }
        if !(0.0..=1.0).contains(&self.quality_min) {
            return Err(Error::invalid_config("quality_min must be within 0.0-1.0"));
        }
        Ok(())
    }
}

/// Checks readings against [`QualityThresholds`].
#[derive(Debug, Clone, Default)]
pub struct QualityGuard {
    thresholds: QualityThresholds,
}

impl QualityGuard {
    /// Create a guard with custom thresholds.
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    /// Thresholds in use.
    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Check one reading. Returns every issue found; empty means clean.
    pub fn check(&self, reading: &SensorReading) -> Vec<QualityWarning> {
        let t = &self.thresholds;
        let mut warnings = Vec::new();

        match reading.channel {
            Channel::HeartRate
                if reading.value < t.heart_rate_min || reading.value > t.heart_rate_max =>
            {
                warnings.push(QualityWarning::HeartRateOutOfRange {
                    value: reading.value,
                    min: t.heart_rate_min,
                    max: t.heart_rate_max,
                });
            }
            Channel::Spo2 if reading.value < t.spo2_min => {
                warnings.push(QualityWarning::Spo2TooLow {
                    value: reading.value,
                    min: t.spo2_min,
                });
            }
            _ => {}
        }

        if let Some(score) = reading.quality
            && score < t.quality_min
        {
            warnings.push(QualityWarning::LowQuality {
                channel: reading.channel,
                score,
                min: t.quality_min,
            });
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorfuse_types::DeviceFamily;
    use time::OffsetDateTime;

    fn reading(channel: Channel, value: f64) -> SensorReading {
        SensorReading::new(channel, value, OffsetDateTime::UNIX_EPOCH, DeviceFamily::Oralable)
    }

    #[test]
    fn test_heart_rate_bounds_inclusive() {
        let guard = QualityGuard::default();
        assert!(guard.check(&reading(Channel::HeartRate, 40.0)).is_empty());
        assert!(guard.check(&reading(Channel::HeartRate, 200.0)).is_empty());
        assert_eq!(guard.check(&reading(Channel::HeartRate, 39.9)).len(), 1);
        assert_eq!(guard.check(&reading(Channel::HeartRate, 201.0)).len(), 1);
    }

    #[test]
    fn test_spo2_minimum() {
        let guard = QualityGuard::default();
        assert!(guard.check(&reading(Channel::Spo2, 90.0)).is_empty());
        let warnings = guard.check(&reading(Channel::Spo2, 85.0));
        assert_eq!(
            warnings,
            vec![QualityWarning::Spo2TooLow {
                value: 85.0,
                min: 90.0
            }]
        );
    }

    #[test]
    fn test_low_quality_on_any_channel() {
        let guard = QualityGuard::default();
        let r = reading(Channel::PpgRed, 1000.0).with_quality(0.2);
        let warnings = guard.check(&r);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("PPG red"));

        let r = reading(Channel::HeartRate, 250.0).with_quality(0.1);
        assert_eq!(guard.check(&r).len(), 2);
    }

    #[test]
    fn test_other_channels_unchecked() {
        let guard = QualityGuard::default();
        assert!(guard.check(&reading(Channel::AccelX, -30000.0)).is_empty());
        assert!(guard.check(&reading(Channel::Temperature, 80.0)).is_empty());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(QualityThresholds::default().validate().is_ok());
        assert!(
            QualityThresholds::new()
                .heart_rate_range(120.0, 60.0)
                .validate()
                .is_err()
        );
        assert!(QualityThresholds::new().spo2_min(120.0).validate().is_err());
        assert!(QualityThresholds::new().quality_min(1.5).validate().is_err());
    }

    #[test]
    fn test_warning_display() {
        let w = QualityWarning::HeartRateOutOfRange {
            value: 220.0,
            min: 40.0,
            max: 200.0,
        };
        assert_eq!(w.to_string(), "Heart rate 220 bpm is outside 40-200 bpm");
    }
}
