//! Wiring of radio, registry, aggregator and display throttle.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensorfuse_core::{
    DeviceEvent, DeviceFactory, DeviceRegistry, PeripheralHandle, RadioEventSource,
    ReconnectionEvent, SensorAggregator, Throttle,
};

use crate::config::{Config, DisplayConfig};
use crate::output::format_record;

/// Counters reported when [`Monitor::run`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Composite records produced by the aggregator.
    pub records: u64,
    /// Records written to the output.
    pub written: u64,
    /// Fraction of records suppressed by the display throttle.
    pub drop_rate: f64,
}

/// A registry and aggregator configured from a [`Config`].
pub struct Monitor {
    registry: DeviceRegistry,
    aggregator: Arc<SensorAggregator>,
    display: DisplayConfig,
}

impl Monitor {
    /// Build the registry and aggregator. Nothing runs until [`Monitor::run`]
    /// or [`Monitor::scan`].
    pub fn new(
        radio: Arc<dyn RadioEventSource>,
        factory: Arc<dyn DeviceFactory>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let registry = DeviceRegistry::new(radio, factory, config.registry_config())?;
        let aggregator = Arc::new(SensorAggregator::new(config.aggregator_config())?);
        Ok(Self {
            registry,
            aggregator,
            display: config.display.clone(),
        })
    }

    /// The device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The aggregator fed by the registry.
    pub fn aggregator(&self) -> &Arc<SensorAggregator> {
        &self.aggregator
    }

    /// Scan for `duration` (or until cancelled) and return the supported
    /// devices seen.
    pub async fn scan(
        self,
        duration: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<Vec<PeripheralHandle>> {
        self.registry.start_scan().await?;
        info!("Scanning for {:?}", duration);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => debug!("Scan cancelled"),
        }
        self.registry.stop_scan().await?;

        let mut devices = self.registry.discovered_devices().await?;
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        self.registry.stop().await?;
        Ok(devices)
    }

    /// Stream throttled records to `out` until `cancel` fires, then shut
    /// everything down.
    ///
    /// A record held back by the throttle is written once its interval has
    /// passed, even if nothing newer arrives.
    pub async fn run<W: Write>(
        self,
        out: &mut W,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunSummary> {
        let tasks = cancel.child_token();
        let mut records = self.aggregator.records();
        let feeder = self.aggregator.attach(self.registry.batches(), tasks.clone());
        let loggers = [
            spawn_device_logger(&self.registry, tasks.clone()),
            spawn_reconnection_logger(&self.registry, tasks.clone()),
            spawn_warning_logger(&self.aggregator, tasks.clone()),
        ];

        self.registry.start_scan().await?;
        info!("Waiting for sensors");

        let throttle = Throttle::per_second(self.display.records_per_second);
        loop {
            let due = throttle.next_due();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                    if let Some(record) = throttle.flush_due() {
                        writeln!(out, "{}", format_record(&record, self.display.format)?)?;
                    }
                }
                received = records.recv() => match received {
                    Ok(record) => {
                        if let Some(record) = throttle.submit(record) {
                            writeln!(out, "{}", format_record(&record, self.display.format)?)?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Display lagged by {} records", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        // The feeder flushes groups still open in the aggregator.
        tasks.cancel();
        let _ = feeder.await;
        loop {
            match records.try_recv() {
                Ok(record) => {
                    if let Some(record) = throttle.submit(record) {
                        writeln!(out, "{}", format_record(&record, self.display.format)?)?;
                    }
                }
                Err(TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        if let Some(record) = throttle.flush() {
            writeln!(out, "{}", format_record(&record, self.display.format)?)?;
        }
        out.flush()?;

        for logger in loggers {
            let _ = logger.await;
        }
        if let Err(e) = self.registry.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }
        self.registry.stop().await?;

        let stats = throttle.statistics();
        let summary = RunSummary {
            records: self.aggregator.stats().records,
            written: stats.emissions,
            drop_rate: stats.drop_rate,
        };
        info!(
            "Monitor stopped: {} records, {} written",
            summary.records, summary.written
        );
        Ok(summary)
    }
}

fn spawn_device_logger(
    registry: &DeviceRegistry,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = registry.events();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(DeviceEvent::Discovered { device }) => {
                    info!("Found {} ({})", device.display_name(), device.family);
                }
                Ok(DeviceEvent::Connected { device_id, family }) => {
                    info!("Streaming from {} ({})", device_id, family);
                }
                Ok(DeviceEvent::Disconnected { device_id, reason }) => {
                    warn!("{} disconnected: {:?}", device_id, reason);
                }
                Ok(DeviceEvent::CollectionFailed { device_id, error }) => {
                    warn!("No data from {}: {}", device_id, error);
                }
                Ok(DeviceEvent::RadioStateChanged { state }) => {
                    info!("Bluetooth {}", state);
                }
                Ok(other) => debug!("{:?}", other),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_reconnection_logger(
    registry: &DeviceRegistry,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut stream = Box::pin(registry.scheduler().event_stream());
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                ReconnectionEvent::Scheduled {
                    device_id,
                    attempt,
                    delay,
                } => info!("Reconnecting to {} (attempt {}) in {:?}", device_id, attempt, delay),
                ReconnectionEvent::AttemptFailed {
                    device_id,
                    attempt,
                    error,
                    will_retry,
                } => warn!(
                    "Reconnection attempt {} for {} failed: {} (retry: {})",
                    attempt, device_id, error, will_retry
                ),
                ReconnectionEvent::GaveUp {
                    device_id,
                    attempts,
                    error,
                } => warn!(
                    "Gave up on {} after {} attempts: {}",
                    device_id, attempts, error
                ),
                other => info!("{:?}", other),
            }
        }
    })
}

fn spawn_warning_logger(
    aggregator: &SensorAggregator,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut warnings = aggregator.warnings();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                warning = warnings.recv() => match warning {
                    Ok(warning) => debug!("Signal quality: {}", warning),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorfuse_core::{
        Channel, DeviceFamily, MockDevice, MockDeviceFactory, MockRadio, SensorReading,
    };
    use time::OffsetDateTime;

    /// Every Oralable frame channel, so the frame closes at once.
    fn frame(frame: u64) -> Vec<SensorReading> {
        [
            Channel::PpgRed,
            Channel::PpgInfrared,
            Channel::PpgGreen,
            Channel::AccelX,
            Channel::AccelY,
            Channel::AccelZ,
        ]
        .into_iter()
        .map(|channel| {
            SensorReading::new(
                channel,
                1000.0 + frame as f64,
                OffsetDateTime::UNIX_EPOCH,
                DeviceFamily::Oralable,
            )
            .with_frame(frame)
        })
        .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_writes_throttled_records() {
        let radio = Arc::new(MockRadio::new());
        let factory = Arc::new(MockDeviceFactory::new());
        let device = Arc::new(MockDevice::new("oral-1", DeviceFamily::Oralable));
        factory.register(device.clone());

        let mut config = Config::default();
        config.display.records_per_second = 2;
        let monitor = Monitor::new(radio.clone(), factory, &config).unwrap();
        let mut events = monitor.registry().events();
        let mut records = monitor.aggregator().records();

        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        let driver = async {
            radio.advertise("oral-1", "Oralable 01");
            loop {
                if let DeviceEvent::Connected { .. } = events.recv().await.unwrap() {
                    break;
                }
            }
            for n in 0..10 {
                device.push_batch(frame(n));
                records.recv().await.unwrap();
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
            cancel.cancel();
        };
        let (summary, ()) = tokio::join!(monitor.run(&mut out, cancel.clone()), driver);
        let summary = summary.unwrap();

        // Records every 120 ms at 2/s: frame 0 at once, frames 4 and 8 when
        // their interval runs out, frame 9 on shutdown.
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("frame 0"));
        assert!(lines[1].contains("frame 4"));
        assert!(lines[2].contains("frame 8"));
        assert!(lines[3].contains("frame 9"));
        assert_eq!(summary.records, 10);
        assert_eq!(summary.written, 4);
        assert!(!radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_lists_supported_devices() {
        let radio = Arc::new(MockRadio::new());
        let factory = Arc::new(MockDeviceFactory::new());
        let mut config = Config::default();
        config.registry.auto_connect = false;
        let monitor = Monitor::new(radio.clone(), factory, &config).unwrap();

        let cancel = CancellationToken::new();
        let scan = monitor.scan(Duration::from_secs(5), cancel);
        let advertise = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            radio.advertise("emg-1", "ANR M40");
            radio.advertise("band-1", "Fitness Band");
            radio.advertise("oral-1", "Oralable 01");
        };
        let (devices, ()) = tokio::join!(scan, advertise);
        let devices = devices.unwrap();

        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(devices.len(), 2);
        assert!(ids.contains(&"emg-1"));
        assert!(ids.contains(&"oral-1"));
    }
}
