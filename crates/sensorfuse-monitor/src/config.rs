//! Monitor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sensorfuse_core::{AggregatorConfig, QualityThresholds, ReconnectOptions, RegistryConfig};

/// Monitor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// Device registry settings.
    pub registry: RegistrySection,
    /// Sensor fusion settings.
    pub fusion: FusionConfig,
    /// Record output settings.
    pub display: DisplayConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate every section and collect all problems.
    ///
    /// # Example
    ///
    /// ```
    /// use sensorfuse_monitor::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.reconnect.validate());
        errors.extend(self.registry.validate());
        errors.extend(self.fusion.validate());
        errors.extend(self.display.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Registry options, including the reconnection policy.
    pub fn registry_config(&self) -> RegistryConfig {
        let mut config = RegistryConfig::new()
            .reconnect(self.reconnect.options())
            .history_capacity(self.registry.history_capacity)
            .event_capacity(self.registry.event_capacity)
            .auto_connect(self.registry.auto_connect);
        if let Some(device) = &self.registry.device {
            config = config.device_filter(device.clone());
        }
        config
    }

    /// Aggregator options.
    pub fn aggregator_config(&self) -> AggregatorConfig {
        self.fusion.options()
    }
}

/// `[reconnect]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Failed attempts before giving up; `0` retries forever.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per failed attempt.
    pub backoff_multiplier: f64,
    /// Randomise delays by up to 25%.
    pub jitter: bool,
    /// Timeout for a single connection attempt, in seconds.
    pub connection_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
            connection_timeout_secs: 10,
        }
    }
}

impl ReconnectConfig {
    /// Validate reconnection settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.initial_delay_ms == 0 {
            errors.push(ValidationError::new(
                "reconnect.initial_delay_ms",
                "initial delay must be greater than 0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            errors.push(ValidationError::new(
                "reconnect.max_delay_ms",
                format!(
                    "max delay {} ms is shorter than initial delay {} ms",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            errors.push(ValidationError::new(
                "reconnect.backoff_multiplier",
                format!(
                    "backoff multiplier {} must be a number >= 1.0",
                    self.backoff_multiplier
                ),
            ));
        }
        if self.connection_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "reconnect.connection_timeout_secs",
                "connection timeout must be greater than 0",
            ));
        }

        errors
    }

    /// Convert into library options.
    pub fn options(&self) -> ReconnectOptions {
        let options = if self.max_attempts == 0 {
            ReconnectOptions::unlimited()
        } else {
            ReconnectOptions::new().max_attempts(self.max_attempts)
        };
        options
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .backoff_multiplier(self.backoff_multiplier)
            .jitter(self.jitter)
            .connection_timeout(Duration::from_secs(self.connection_timeout_secs))
    }
}

/// `[registry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Connect to the first supported device discovered.
    pub auto_connect: bool,
    /// Only auto-connect to a device whose id equals, or whose name contains,
    /// this text.
    pub device: Option<String>,
    /// Raw readings kept in memory.
    pub history_capacity: usize,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            auto_connect: true,
            device: None,
            history_capacity: 5000,
            event_capacity: 256,
        }
    }
}

impl RegistrySection {
    /// Validate registry settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(device) = &self.device
            && device.trim().is_empty()
        {
            errors.push(ValidationError::new(
                "registry.device",
                "device cannot be empty string (omit it instead)",
            ));
        }
        if self.history_capacity == 0 {
            errors.push(ValidationError::new(
                "registry.history_capacity",
                "history capacity must be greater than 0",
            ));
        }
        if self.event_capacity == 0 {
            errors.push(ValidationError::new(
                "registry.event_capacity",
                "event capacity must be greater than 0",
            ));
        }

        errors
    }
}

/// `[fusion]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Bucket width for readings without a frame number, in milliseconds.
    pub bucket_width_ms: u64,
    /// Frames a silent or missing channel may fall behind before its
    /// frame groups close without it.
    pub frame_window: u64,
    /// Composite records kept in memory.
    pub history_capacity: usize,
    /// Samples kept per channel.
    pub channel_capacity: usize,
    /// Lowest plausible heart rate (bpm).
    pub heart_rate_min: f64,
    /// Highest plausible heart rate (bpm).
    pub heart_rate_max: f64,
    /// Lowest acceptable SpO2 (%).
    pub spo2_min: f64,
    /// Lowest acceptable quality score.
    pub quality_min: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        let aggregator = AggregatorConfig::default();
        let thresholds = QualityThresholds::default();
        Self {
            bucket_width_ms: aggregator.bucket_width.as_millis() as u64,
            frame_window: aggregator.frame_window,
            history_capacity: aggregator.history_capacity,
            channel_capacity: aggregator.channel_capacity,
            heart_rate_min: thresholds.heart_rate_min,
            heart_rate_max: thresholds.heart_rate_max,
            spo2_min: thresholds.spo2_min,
            quality_min: thresholds.quality_min,
        }
    }
}

impl FusionConfig {
    /// Validate fusion settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bucket_width_ms == 0 {
            errors.push(ValidationError::new(
                "fusion.bucket_width_ms",
                "bucket width must be greater than 0",
            ));
        }
        if self.frame_window == 0 {
            errors.push(ValidationError::new(
                "fusion.frame_window",
                "frame window must be greater than 0",
            ));
        }
        if self.history_capacity == 0 {
            errors.push(ValidationError::new(
                "fusion.history_capacity",
                "history capacity must be greater than 0",
            ));
        }
        if self.channel_capacity == 0 {
            errors.push(ValidationError::new(
                "fusion.channel_capacity",
                "channel capacity must be greater than 0",
            ));
        }
        if self.heart_rate_min >= self.heart_rate_max {
            errors.push(ValidationError::new(
                "fusion.heart_rate_min",
                format!(
                    "heart rate range {}-{} is empty",
                    self.heart_rate_min, self.heart_rate_max
                ),
            ));
        }
        if !(0.0..=100.0).contains(&self.spo2_min) {
            errors.push(ValidationError::new(
                "fusion.spo2_min",
                format!("SpO2 minimum {} must be between 0 and 100", self.spo2_min),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_min) {
            errors.push(ValidationError::new(
                "fusion.quality_min",
                format!(
                    "quality minimum {} must be between 0 and 1",
                    self.quality_min
                ),
            ));
        }

        errors
    }

    /// Convert into library options.
    pub fn options(&self) -> AggregatorConfig {
        AggregatorConfig::new()
            .bucket_width(Duration::from_millis(self.bucket_width_ms))
            .frame_window(self.frame_window)
            .history_capacity(self.history_capacity)
            .channel_capacity(self.channel_capacity)
            .thresholds(
                QualityThresholds::new()
                    .heart_rate_range(self.heart_rate_min, self.heart_rate_max)
                    .spo2_min(self.spo2_min)
                    .quality_min(self.quality_min),
            )
    }
}

/// Output format for fused records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One human-readable line per record.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// `[display]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Maximum records printed per second.
    pub records_per_second: u32,
    /// Output format.
    pub format: OutputFormat,
}

/// Highest display rate accepted.
pub const MAX_RECORDS_PER_SECOND: u32 = 100;

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            records_per_second: 4,
            format: OutputFormat::Text,
        }
    }
}

impl DisplayConfig {
    /// Validate display settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.records_per_second == 0 || self.records_per_second > MAX_RECORDS_PER_SECOND {
            errors.push(ValidationError::new(
                "display.records_per_second",
                format!(
                    "display rate {} must be between 1 and {}",
                    self.records_per_second, MAX_RECORDS_PER_SECOND
                ),
            ));
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The field path (e.g., `reconnect.max_delay_ms`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensorfuse")
        .join("monitor.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.registry.auto_connect);
        assert_eq!(config.display.records_per_second, 4);
        assert_eq!(config.display.format, OutputFormat::Text);
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_default_sections_match_library_defaults() {
        let config = Config::default();
        assert_eq!(config.reconnect.options(), ReconnectOptions::default());
        assert_eq!(config.aggregator_config(), AggregatorConfig::default());
        assert_eq!(
            config.registry_config(),
            RegistryConfig::new().auto_connect(true)
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [reconnect]
            max_attempts = 0
            initial_delay_ms = 500

            [display]
            format = "json"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
        assert_eq!(config.display.format, OutputFormat::Json);
        assert_eq!(config.display.records_per_second, 4);
        assert_eq!(config.fusion, FusionConfig::default());

        let options = config.reconnect.options();
        assert_eq!(options.max_attempts, None);
        assert_eq!(options.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_full_toml() {
        let toml = r#"
            [reconnect]
            max_attempts = 3
            initial_delay_ms = 250
            max_delay_ms = 4000
            backoff_multiplier = 1.5
            jitter = false
            connection_timeout_secs = 5

            [registry]
            auto_connect = false
            device = "Oralable 7F21"
            history_capacity = 100
            event_capacity = 32

            [fusion]
            bucket_width_ms = 40
            heart_rate_min = 30.0
            heart_rate_max = 220.0

            [display]
            records_per_second = 10
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let registry = config.registry_config();
        assert!(!registry.auto_connect);
        assert_eq!(registry.device_filter.as_deref(), Some("Oralable 7F21"));
        assert_eq!(registry.history_capacity, 100);
        assert_eq!(registry.event_capacity, 32);
        assert_eq!(registry.reconnect.max_attempts, Some(3));
        assert_eq!(registry.reconnect.max_delay, Duration::from_secs(4));
        assert!(!registry.reconnect.jitter);
        assert_eq!(
            registry.reconnect.connection_timeout,
            Duration::from_secs(5)
        );

        let fusion = config.aggregator_config();
        assert_eq!(fusion.bucket_width, Duration::from_millis(40));
        assert_eq!(fusion.thresholds.heart_rate_min, 30.0);
        assert_eq!(fusion.thresholds.heart_rate_max, 220.0);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("monitor.toml");

        let mut config = Config::default();
        config.registry.device = Some("ANR M40".to_string());
        config.display.format = OutputFormat::Json;
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/monitor.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("sensorfuse/monitor.toml"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Read {
            path: PathBuf::from("/test/path"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let display = format!("{}", error);
        assert!(display.contains("/test/path"));
        assert!(display.contains("not found"));
    }

    // ==========================================================================
    // Validation tests
    // ==========================================================================

    #[test]
    fn test_reconnect_validation() {
        let config = ReconnectConfig {
            initial_delay_ms: 0,
            backoff_multiplier: 0.5,
            connection_timeout_secs: 0,
            ..Default::default()
        };
        let errors = config.validate();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "reconnect.initial_delay_ms",
                "reconnect.backoff_multiplier",
                "reconnect.connection_timeout_secs",
            ]
        );

        let inverted = ReconnectConfig {
            initial_delay_ms: 5000,
            max_delay_ms: 1000,
            ..Default::default()
        };
        let errors = inverted.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("shorter than initial delay"));

        let nan = ReconnectConfig {
            backoff_multiplier: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.validate().len(), 1);
    }

    #[test]
    fn test_registry_validation() {
        let config = RegistrySection {
            device: Some("  ".to_string()),
            history_capacity: 0,
            event_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn test_fusion_validation() {
        let config = FusionConfig {
            heart_rate_min: 120.0,
            heart_rate_max: 60.0,
            spo2_min: 101.0,
            quality_min: 1.5,
            ..Default::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].message.contains("is empty"));
    }

    #[test]
    fn test_frame_window_reaches_aggregator() {
        let config = FusionConfig {
            frame_window: 8,
            ..Default::default()
        };
        assert!(config.validate().is_empty());
        assert_eq!(config.options().frame_window, 8);

        let zero = FusionConfig {
            frame_window: 0,
            ..Default::default()
        };
        let errors = zero.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "fusion.frame_window");
    }

    #[test]
    fn test_display_validation() {
        let zero = DisplayConfig {
            records_per_second: 0,
            ..Default::default()
        };
        assert_eq!(zero.validate().len(), 1);

        let too_fast = DisplayConfig {
            records_per_second: MAX_RECORDS_PER_SECOND + 1,
            ..Default::default()
        };
        assert_eq!(too_fast.validate().len(), 1);
    }

    #[test]
    fn test_validation_collects_across_sections() {
        let mut config = Config::default();
        config.reconnect.initial_delay_ms = 0;
        config.display.records_per_second = 0;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 2);

        let display = ConfigError::Validation(errors).to_string();
        assert!(display.contains("reconnect.initial_delay_ms"));
        assert!(display.contains("display.records_per_second"));
    }

    #[test]
    fn test_load_validated_rejects_invalid() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        std::fs::write(&config_path, "[fusion]\nbucket_width_ms = 0\n").unwrap();

        let result = Config::load_validated(&config_path);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
