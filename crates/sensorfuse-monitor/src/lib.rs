//! Command-line monitor for Oralable and ANR Muscle Sense sensors.
//!
//! The monitor:
//! - Scans for supported sensors and connects to the first match
//! - Reconnects dropped links with exponential backoff
//! - Fuses per-channel samples into composite records
//! - Prints records at a bounded display rate
//!
//! # Configuration
//!
//! The monitor reads configuration from `~/.config/sensorfuse/monitor.toml`:
//!
//! ```toml
//! [reconnect]
//! max_attempts = 5          # 0 retries forever
//! initial_delay_ms = 1000
//! max_delay_ms = 60000
//! backoff_multiplier = 2.0
//! jitter = true
//! connection_timeout_secs = 10
//!
//! [registry]
//! auto_connect = true
//! device = "Oralable 7F21"  # optional id or name fragment
//!
//! [fusion]
//! bucket_width_ms = 25
//! frame_window = 64
//!
//! [display]
//! records_per_second = 4
//! format = "text"           # or "json"
//! ```

pub mod config;
pub mod monitor;
pub mod output;

pub use config::{
    Config, ConfigError, DisplayConfig, FusionConfig, OutputFormat, ReconnectConfig,
    RegistrySection, ValidationError,
};
pub use monitor::{Monitor, RunSummary};
