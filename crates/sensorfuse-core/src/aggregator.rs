//! Sensor fusion: grouping single-channel readings into composite records.
//!
//! Each reading is keyed by its hardware frame number when it carries one.
//! Frameless readings (temperature, battery, computed heart rate and SpO2)
//! are keyed by their timestamp floor-divided into fixed-width buckets.
//!
//! PPG and accelerometer samples of one frame arrive in separate
//! notifications, so groups stay open across batches. Every device has its
//! own window of open groups:
//!
//! - A frame group closes once every frame channel of the device family has
//!   delivered that frame or a later one. A channel silent for
//!   [`AggregatorConfig::frame_window`] frames no longer holds groups open,
//!   and no group stays open once the device is that many frames ahead.
//! - A bucket group closes when the device delivers a reading from a later
//!   bucket.
//! - A reading whose group already closed is buffered per channel but not
//!   fused again, so every key yields one [`CompositeRecord`]. A frame
//!   number far behind the window means the counter restarted.
//!
//! Closed groups are emitted in ascending key order and appended once to a
//! bounded history. [`SensorAggregator::flush`] closes whatever is still open.
//!
//! Alongside the combined history, every channel keeps its own bounded ring
//! buffer so single-channel consumers never pay for full records.
//!
//! # Example
//!
//! ```
//! use sensorfuse_core::{AggregatorConfig, SensorAggregator};
//! use sensorfuse_types::{Channel, DeviceFamily, ReadingBatch, SensorReading};
//! use time::OffsetDateTime;
//!
//! let aggregator = SensorAggregator::new(AggregatorConfig::default()).unwrap();
//! let ts = OffsetDateTime::UNIX_EPOCH;
//! let batch = ReadingBatch::new(
//!     "oralable-1",
//!     DeviceFamily::Oralable,
//!     vec![
//!         SensorReading::new(Channel::PpgRed, 1200.0, ts, DeviceFamily::Oralable).with_frame(9),
//!         SensorReading::new(Channel::AccelZ, 16384.0, ts, DeviceFamily::Oralable).with_frame(9),
//!     ],
//! );
//!
//! // The remaining Oralable frame channels have not reported frame 9 yet.
//! assert!(aggregator.process_batch(&batch).is_empty());
//!
//! let records = aggregator.flush();
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].value(Channel::AccelZ), Some(16384.0));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sensorfuse_types::{
    BatteryLevel, BatteryState, Channel, CompositeRecord, CompositeRecordBuilder, DeviceFamily,
    GroupKey, ReadingBatch, SensorReading,
};

use crate::buffer::CircularBuffer;
use crate::error::{Error, Result};
use crate::events::EventDispatcher;
use crate::validation::{QualityGuard, QualityThresholds, QualityWarning};

/// Configuration for [`SensorAggregator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Width of the timestamp buckets used for frameless readings.
    pub bucket_width: Duration,
    /// How many frames a device may run ahead of an open frame group.
    pub frame_window: u64,
    /// Capacity of the combined composite-record history.
    pub history_capacity: usize,
    /// Capacity of each per-channel buffer.
    pub channel_capacity: usize,
    /// Quality guard thresholds.
    pub thresholds: QualityThresholds,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_millis(25),
            frame_window: 64,
            history_capacity: 1000,
            channel_capacity: 500,
            thresholds: QualityThresholds::default(),
        }
    }
}

impl AggregatorConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket width.
    #[must_use]
    pub fn bucket_width(mut self, width: Duration) -> Self {
        self.bucket_width = width;
        self
    }

    /// Set the frame window.
    #[must_use]
    pub fn frame_window(mut self, frames: u64) -> Self {
        self.frame_window = frames;
        self
    }

    /// Set the composite history capacity.
    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the per-channel buffer capacity.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the quality thresholds.
    #[must_use]
    pub fn thresholds(mut self, thresholds: QualityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_width.is_zero() {
            return Err(Error::invalid_config("bucket_width must be > 0"));
        }
        if self.frame_window == 0 {
            return Err(Error::invalid_config("frame_window must be > 0"));
        }
        if self.history_capacity == 0 {
            return Err(Error::invalid_config("history_capacity must be > 0"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::invalid_config("channel_capacity must be > 0"));
        }
        self.thresholds.validate()
    }
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    /// Batches processed.
    pub batches: u64,
    /// Readings accepted.
    pub readings: u64,
    /// Readings rejected (non-finite value or battery from a non-reporting family).
    pub rejected: u64,
    /// Composite records produced.
    pub records: u64,
    /// Readings that arrived after their group closed.
    pub late: u64,
    /// Quality warnings raised.
    pub warnings: u64,
}

/// Open groups of one device.
#[derive(Default)]
struct DeviceWindow {
    open: BTreeMap<GroupKey, CompositeRecordBuilder>,
    /// Newest frame delivered per frame channel.
    watermarks: HashMap<Channel, u64>,
    first_frame: Option<u64>,
    newest_frame: Option<u64>,
    newest_bucket: Option<i64>,
    /// Frames below this have been closed.
    frame_floor: u64,
    /// Buckets below this have been closed.
    bucket_floor: Option<i64>,
}

impl DeviceWindow {
    /// Whether `key` was already closed.
    fn is_closed(&self, key: GroupKey) -> bool {
        match key {
            GroupKey::Frame(frame) => frame < self.frame_floor,
            GroupKey::Bucket(bucket) => self.bucket_floor.is_some_and(|floor| bucket < floor),
        }
    }

    /// Forget frame tracking after a counter restart, returning the frame
    /// groups that were still open.
    fn restart_frames(&mut self) -> Vec<CompositeRecordBuilder> {
        let frames: Vec<GroupKey> = self
            .open
            .keys()
            .filter(|key| matches!(key, GroupKey::Frame(_)))
            .copied()
            .collect();
        self.watermarks.clear();
        self.first_frame = None;
        self.newest_frame = None;
        self.frame_floor = 0;
        frames
            .into_iter()
            .filter_map(|key| self.open.remove(&key))
            .collect()
    }

    /// Record an accepted reading. Every reading advances the bucket clock,
    /// frame-carrying or not.
    fn observe(&mut self, channel: Channel, key: GroupKey, bucket: i64) {
        if let GroupKey::Frame(frame) = key {
            let mark = self.watermarks.entry(channel).or_insert(frame);
            *mark = (*mark).max(frame);
            self.first_frame.get_or_insert(frame);
            self.newest_frame = Some(self.newest_frame.map_or(frame, |n| n.max(frame)));
        }
        self.newest_bucket = Some(self.newest_bucket.map_or(bucket, |n| n.max(bucket)));
    }

    /// Highest frame every live channel has moved past, or that the device
    /// has outrun by `window` frames.
    fn settled_frame(&self, expected: &[Channel], window: u64) -> Option<u64> {
        let newest = self.newest_frame?;
        let first = self.first_frame.unwrap_or(newest);
        let forced = newest.checked_sub(window);

        let mut settled = Some(newest);
        let channels = expected
            .iter()
            .copied()
            .filter(Channel::carries_frame_number)
            .chain(self.watermarks.keys().copied());
        for channel in channels {
            match self.watermarks.get(&channel) {
                Some(&mark) if newest - mark < window => {
                    settled = settled.map(|s| s.min(mark));
                }
                Some(_) => {}
                None if newest - first < window => settled = None,
                None => {}
            }
        }
        settled.max(forced)
    }

    /// Remove and return the groups that can no longer grow.
    fn close_ready(&mut self, expected: &[Channel], window: u64) -> Vec<CompositeRecordBuilder> {
        let settled = self.settled_frame(expected, window);
        if let Some(frame) = settled {
            self.frame_floor = self.frame_floor.max(frame.saturating_add(1));
        }
        if let Some(bucket) = self.newest_bucket {
            self.bucket_floor = Some(self.bucket_floor.map_or(bucket, |f| f.max(bucket)));
        }

        let ready: Vec<GroupKey> = self
            .open
            .keys()
            .filter(|key| self.is_closed(**key))
            .copied()
            .collect();
        ready
            .into_iter()
            .filter_map(|key| self.open.remove(&key))
            .collect()
    }
}

struct AggregatorState {
    channels: HashMap<Channel, CircularBuffer<SensorReading>>,
    windows: HashMap<String, DeviceWindow>,
    history: CircularBuffer<CompositeRecord>,
    battery: BatteryState,
    stats: AggregatorStats,
}

impl AggregatorState {
    fn new(config: &AggregatorConfig) -> Self {
        Self {
            channels: HashMap::new(),
            windows: HashMap::new(),
            history: CircularBuffer::new(config.history_capacity),
            battery: BatteryState::new(),
            stats: AggregatorStats::default(),
        }
    }

    /// Build closed groups in ascending key order and append them to the
    /// history once.
    fn finish(&mut self, closed: Vec<CompositeRecordBuilder>) -> Vec<CompositeRecord> {
        let mut records: Vec<CompositeRecord> =
            closed.into_iter().map(CompositeRecordBuilder::build).collect();
        records.sort_by_key(CompositeRecord::group_key);
        let evicted = self.history.extend_bulk(records.iter().cloned());
        if evicted > 0 {
            debug!("Evicted {} composite records from history", evicted);
        }
        self.stats.records += records.len() as u64;
        records
    }
}

/// Fuses reading batches into composite records.
///
/// All mutation happens under one write lock per batch, so readers never
/// observe a half-processed batch. Groups still open when the aggregator is
/// dropped are lost unless [`SensorAggregator::flush`] is called first.
pub struct SensorAggregator {
    config: AggregatorConfig,
    guard: QualityGuard,
    state: RwLock<AggregatorState>,
    warnings: EventDispatcher<QualityWarning>,
    records: EventDispatcher<CompositeRecord>,
}

impl SensorAggregator {
    /// Create an aggregator.
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            guard: QualityGuard::new(config.thresholds.clone()),
            state: RwLock::new(AggregatorState::new(&config)),
            warnings: EventDispatcher::new(64),
            records: EventDispatcher::new(256),
            config,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, AggregatorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AggregatorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket(&self, timestamp: OffsetDateTime) -> i64 {
        let width = self.config.bucket_width.as_nanos().max(1) as i128;
        let bucket = timestamp.unix_timestamp_nanos().div_euclid(width);
        bucket.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    fn group_key(&self, reading: &SensorReading) -> GroupKey {
        match reading.frame_number {
            Some(frame) => GroupKey::Frame(frame),
            None => GroupKey::Bucket(self.bucket(reading.timestamp)),
        }
    }

    /// Process one batch and return the records it closed, in ascending
    /// group-key order. Groups the batch leaves open are returned by a later
    /// batch or by [`SensorAggregator::flush`].
    pub fn process_batch(&self, batch: &ReadingBatch) -> Vec<CompositeRecord> {
        let mut raised = Vec::new();
        let window = self.config.frame_window;

        let records = {
            let mut guard = self.write();
            let state = &mut *guard;
            state.stats.batches += 1;
            let device = state.windows.entry(batch.device_id.clone()).or_default();
            let mut closed = Vec::new();

            for reading in &batch.readings {
                if !reading.value.is_finite() {
                    debug!(
                        "Rejected non-finite {} sample from {}",
                        reading.channel, batch.device_id
                    );
                    state.stats.rejected += 1;
                    continue;
                }
                if reading.channel == Channel::Battery
                    && !state.battery.update(reading.device_family, reading.value)
                {
                    debug!(
                        "Ignored battery value {} from {}",
                        reading.value, reading.device_family
                    );
                    state.stats.rejected += 1;
                    continue;
                }

                for warning in self.guard.check(reading) {
                    warn!(device = %batch.device_id, "Quality warning: {}", warning);
                    raised.push(warning);
                }

                let capacity = self.config.channel_capacity;
                state
                    .channels
                    .entry(reading.channel)
                    .or_insert_with(|| CircularBuffer::new(capacity))
                    .push(*reading);
                state.stats.readings += 1;

                let key = self.group_key(reading);
                if let GroupKey::Frame(frame) = key
                    && frame.saturating_add(window) < device.frame_floor
                {
                    debug!(
                        "Frame counter of {} restarted at {}",
                        batch.device_id, frame
                    );
                    closed.extend(device.restart_frames());
                }
                if device.is_closed(key) {
                    debug!("Late {} sample for {:?} from {}", reading.channel, key, batch.device_id);
                    state.stats.late += 1;
                    continue;
                }

                device.observe(reading.channel, key, self.bucket(reading.timestamp));
                let builder = device.open.remove(&key).unwrap_or_else(|| {
                    CompositeRecord::builder(reading.timestamp, key, reading.device_family)
                });
                device.open.insert(
                    key,
                    builder
                        .with(reading.channel, reading.value)
                        .earliest(reading.timestamp),
                );
            }

            closed.extend(device.close_ready(batch.device_family.channels(), window));
            state.stats.warnings += raised.len() as u64;
            state.finish(closed)
        };

        for warning in raised {
            self.warnings.send(warning);
        }
        for record in &records {
            self.records.send(record.clone());
        }
        records
    }

    /// Close every open group and return the records, in ascending
    /// group-key order.
    pub fn flush(&self) -> Vec<CompositeRecord> {
        let records = {
            let mut state = self.write();
            let closed: Vec<CompositeRecordBuilder> = state
                .windows
                .values_mut()
                .flat_map(|device| {
                    device.frame_floor = device
                        .open
                        .keys()
                        .filter_map(|key| match key {
                            GroupKey::Frame(frame) => Some(frame.saturating_add(1)),
                            GroupKey::Bucket(_) => None,
                        })
                        .fold(device.frame_floor, u64::max);
                    if let Some(GroupKey::Bucket(bucket)) = device.open.keys().next_back() {
                        device.bucket_floor = Some(bucket.saturating_add(1));
                    }
                    std::mem::take(&mut device.open).into_values()
                })
                .collect();
            state.finish(closed)
        };
        if !records.is_empty() {
            debug!("Flushed {} open groups", records.len());
        }
        for record in &records {
            self.records.send(record.clone());
        }
        records
    }

    /// Spawn a task feeding every batch from `batches` into the aggregator
    /// until `cancel` fires or the channel closes. Open groups are flushed
    /// on the way out.
    pub fn attach(
        self: &Arc<Self>,
        mut batches: broadcast::Receiver<ReadingBatch>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = batches.recv() => match batch {
                        Ok(batch) => {
                            aggregator.process_batch(&batch);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Aggregator lagged, skipped {} batches", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            aggregator.flush();
            debug!("Aggregator task stopped");
        })
    }

    /// Buffered samples for one channel, oldest first.
    pub fn channel_samples(&self, channel: Channel) -> Vec<SensorReading> {
        self.read()
            .channels
            .get(&channel)
            .map(CircularBuffer::to_vec)
            .unwrap_or_default()
    }

    /// Latest sample for one channel.
    pub fn latest(&self, channel: Channel) -> Option<SensorReading> {
        self.read()
            .channels
            .get(&channel)
            .and_then(|buf| buf.latest().copied())
    }

    /// Combined composite history, oldest first.
    pub fn history(&self) -> Vec<CompositeRecord> {
        self.read().history.to_vec()
    }

    /// The newest `n` composite records, oldest first.
    pub fn recent_records(&self, n: usize) -> Vec<CompositeRecord> {
        self.read().history.recent(n)
    }

    /// Most recent composite record.
    pub fn latest_record(&self) -> Option<CompositeRecord> {
        self.read().history.latest().cloned()
    }

    /// Last known battery level for a family.
    pub fn battery(&self, family: DeviceFamily) -> BatteryLevel {
        self.read().battery.get(family)
    }

    /// Battery levels for every family.
    pub fn battery_state(&self) -> BatteryState {
        self.read().battery.clone()
    }

    /// Subscribe to quality warnings.
    pub fn warnings(&self) -> broadcast::Receiver<QualityWarning> {
        self.warnings.subscribe()
    }

    /// Subscribe to composite records as they are produced.
    pub fn records(&self) -> broadcast::Receiver<CompositeRecord> {
        self.records.subscribe()
    }

    /// Running counters.
    pub fn stats(&self) -> AggregatorStats {
        self.read().stats
    }

    /// Drop all buffered data, battery state and counters.
    pub fn clear(&self) {
        *self.write() = AggregatorState::new(&self.config);
        debug!("Aggregator cleared");
    }
}
