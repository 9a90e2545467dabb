//! Automatic reconnection scheduling.
//!
//! [`ReconnectionScheduler`] owns one retry state machine per device:
//!
//! ```text
//! Idle -> Scheduled -> Connecting -> Connected (entry removed)
//!                          |
//!                          +-> Failed -> Scheduled (next backoff)
//!                          +-> GaveUp (entry removed, after max attempts)
//! Scheduled / Connecting -> Paused (radio off) -> Connecting (radio on)
//! ```
//!
//! All state lives inside a single actor task fed by an `mpsc` channel, so
//! the reconnection table is never touched from two places at once. Every
//! backoff timer and connection attempt is a separate tokio task tagged with
//! a generation number; a timer that fires after it was cancelled or
//! superseded carries a stale generation and is ignored.
//!
//! Radio-off pauses pending entries without counting a failure. Radio-on
//! resumes each paused entry with an immediate attempt that does not consume
//! an extra retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventDispatcher, ReconnectionEvent};
use crate::radio::RadioState;
use crate::traits::SensorDevice;

/// Options for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectOptions {
    /// Maximum number of failed attempts before giving up (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first automatic attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to scale delays by a random factor in `1.0..1.25`.
    pub jitter: bool,
    /// Timeout for a single connection attempt.
    pub connection_timeout: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options with unlimited retry attempts.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Set maximum number of failed attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set delay before the first automatic attempt.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between attempts.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Set the per-attempt connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Delay before the attempt that follows `failed` failures:
    /// `min(initial * multiplier^failed * jitter, max)`.
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        let exponent = failed.min(i32::MAX as u32) as i32;
        let mut delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        if self.jitter {
            // Up to 25% jitter
            delay *= 1.0 + rand::rng().random::<f64>() * 0.25;
        }

        let capped = delay.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(Error::invalid_config("backoff_multiplier must be >= 1.0"));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::invalid_config("initial_delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config("max_delay must be >= initial_delay"));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::invalid_config("connection_timeout must be > 0"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// Link health as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    /// Data is flowing or the last connection succeeded.
    Healthy,
    /// A reconnection is pending.
    Degraded,
    /// Reconnection gave up.
    Lost,
}

/// Where a device is in its reconnection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionPhase {
    /// Waiting for the backoff timer.
    Scheduled,
    /// A connection attempt is in flight.
    Connecting,
    /// Suspended while the radio is unavailable.
    Paused,
}

/// Snapshot of one device's reconnection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionAttempt {
    /// Device identifier.
    pub device_id: String,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Delay remaining (scheduled, paused) or last scheduled delay.
    pub next_delay: Duration,
    /// Link health.
    pub health: ConnectionHealth,
    /// Current phase.
    pub phase: ReconnectionPhase,
}

/// Push-style receiver of reconnection notifications.
///
/// All methods default to no-ops so implementors override only what they
/// need. Calls happen on the scheduler task and must not block.
pub trait ReconnectionObserver: Send + Sync {
    /// A connection attempt is starting. `error` is the failure that led to
    /// it: the link loss for attempt 1, the previous attempt's error after.
    fn reconnection_started(&self, _device_id: &str, _attempt: u32, _error: Option<&str>) {}

    /// A connection attempt succeeded.
    fn reconnection_succeeded(&self, _device_id: &str, _attempt: u32, _error: Option<&str>) {}

    /// A connection attempt failed.
    fn reconnection_attempt_failed(
        &self,
        _device_id: &str,
        _attempt: u32,
        _error: &str,
        _will_retry: bool,
    ) {
    }

    /// Attempts exhausted.
    fn reconnection_gave_up(&self, _device_id: &str, _attempts: u32, _error: &str) {}
}

enum Command {
    Schedule {
        device_id: String,
        device: Arc<dyn SensorDevice>,
        immediate: bool,
        error: Option<String>,
    },
    Cancel {
        device_id: String,
        ack: oneshot::Sender<bool>,
    },
    CancelAll {
        ack: oneshot::Sender<usize>,
    },
    DataReceived {
        device_id: String,
    },
    ConnectionSucceeded {
        device_id: String,
    },
    RadioChanged(RadioState),
    TimerFired {
        device_id: String,
        generation: u64,
    },
    AttemptFinished {
        device_id: String,
        generation: u64,
        result: Result<()>,
    },
    AddObserver(Arc<dyn ReconnectionObserver>),
    Snapshot {
        device_id: String,
        reply: oneshot::Sender<Option<ReconnectionAttempt>>,
    },
    Health {
        device_id: String,
        reply: oneshot::Sender<Option<ConnectionHealth>>,
    },
    Pending {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Per-device exponential-backoff reconnection scheduler.
///
/// # Example
///
/// ```ignore
/// use sensorfuse_core::{ReconnectOptions, ReconnectionScheduler};
///
/// let scheduler = ReconnectionScheduler::new(ReconnectOptions::default())?;
/// let mut events = scheduler.events();
/// scheduler.schedule_reconnection(device.id(), device.clone(), false, Some("link lost".into()))?;
/// while let Ok(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// ```
pub struct ReconnectionScheduler {
    options: ReconnectOptions,
    commands: mpsc::UnboundedSender<Command>,
    events: EventDispatcher<ReconnectionEvent>,
    cancel: CancellationToken,
}

impl ReconnectionScheduler {
    /// Create a scheduler and spawn its actor task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: ReconnectOptions) -> Result<Self> {
        options.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventDispatcher::new(256);
        let cancel = CancellationToken::new();

        let core = SchedulerCore {
            options: options.clone(),
            entries: HashMap::new(),
            health: HashMap::new(),
            radio: RadioState::Unknown,
            next_generation: 0,
            commands: tx.clone(),
            events: events.clone(),
            observers: Vec::new(),
        };
        tokio::spawn(core.run(rx, cancel.clone()));

        Ok(Self {
            options,
            commands: tx,
            events,
            cancel,
        })
    }

    /// Options in use.
    pub fn options(&self) -> &ReconnectOptions {
        &self.options
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SchedulerStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Start reconnecting to a device.
    ///
    /// With `immediate`, the first attempt starts without delay; later
    /// attempts follow the normal backoff. Scheduling a device that already
    /// has a pending reconnection is a no-op, except that `immediate`
    /// short-circuits a pending backoff timer.
    ///
    /// `error` is what dropped the link. It is reported with the first
    /// attempt's events.
    pub fn schedule_reconnection(
        &self,
        device_id: impl Into<String>,
        device: Arc<dyn SensorDevice>,
        immediate: bool,
        error: Option<String>,
    ) -> Result<()> {
        self.send(Command::Schedule {
            device_id: device_id.into(),
            device,
            immediate,
            error,
        })
    }

    /// Cancel a device's reconnection and reset its attempt counter.
    ///
    /// Any timer or in-flight attempt has been stopped when this returns.
    /// Returns whether a reconnection was pending.
    pub async fn cancel_reconnection(&self, device_id: &str) -> Result<bool> {
        let device_id = device_id.to_string();
        self.request(|ack| Command::Cancel { device_id, ack }).await
    }

    /// Cancel every pending reconnection. Returns how many were cancelled.
    pub async fn cancel_all_reconnections(&self) -> Result<usize> {
        self.request(|ack| Command::CancelAll { ack }).await
    }

    /// Mark a device's link healthy because data arrived.
    pub fn record_data_received(&self, device_id: &str) -> Result<()> {
        self.send(Command::DataReceived {
            device_id: device_id.to_string(),
        })
    }

    /// Clear a device's reconnection state after a successful connection
    /// made outside the scheduler.
    pub fn handle_connection_success(&self, device_id: &str) -> Result<()> {
        self.send(Command::ConnectionSucceeded {
            device_id: device_id.to_string(),
        })
    }

    /// Report a radio power state change.
    pub fn radio_state_changed(&self, state: RadioState) -> Result<()> {
        self.send(Command::RadioChanged(state))
    }

    /// Register a push-style observer.
    pub fn add_observer(&self, observer: Arc<dyn ReconnectionObserver>) -> Result<()> {
        self.send(Command::AddObserver(observer))
    }

    /// Snapshot of a device's reconnection state, if one is pending.
    pub async fn attempt_state(&self, device_id: &str) -> Result<Option<ReconnectionAttempt>> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::Snapshot { device_id, reply })
            .await
    }

    /// Link health of a device the scheduler has seen.
    pub async fn health(&self, device_id: &str) -> Result<Option<ConnectionHealth>> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::Health { device_id, reply })
            .await
    }

    /// Identifiers of devices with a pending reconnection.
    pub async fn pending(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::Pending { reply }).await
    }

    /// Subscribe to reconnection events.
    pub fn events(&self) -> broadcast::Receiver<ReconnectionEvent> {
        self.events.subscribe()
    }

    /// Reconnection events as a `Stream`. Lagged events are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = ReconnectionEvent> + Send + 'static {
        futures::stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Reconnection event stream lagged by {}", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Cancel everything and stop the actor task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|ack| Command::Shutdown { ack }).await
    }
}

impl Drop for ReconnectionScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Entry {
    device: Arc<dyn SensorDevice>,
    failed: u32,
    phase: ReconnectionPhase,
    next_delay: Duration,
    deadline: Option<Instant>,
    generation: u64,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl Entry {
    fn stop_task(&mut self) -> Option<JoinHandle<()>> {
        let task = self.task.take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }
}

struct SchedulerCore {
    options: ReconnectOptions,
    entries: HashMap<String, Entry>,
    health: HashMap<String, ConnectionHealth>,
    radio: RadioState,
    next_generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    events: EventDispatcher<ReconnectionEvent>,
    observers: Vec<Arc<dyn ReconnectionObserver>>,
}

impl SchedulerCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_all().await;
                    break;
                }
                command = rx.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        self.stop_all().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        debug!("Reconnection scheduler stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule {
                device_id,
                device,
                immediate,
                error,
            } => self.schedule(device_id, device, immediate, error),
            Command::Cancel { device_id, ack } => {
                let existed = self.remove(&device_id).await;
                if existed {
                    info!("Reconnection cancelled for {}", device_id);
                }
                let _ = ack.send(existed);
            }
            Command::CancelAll { ack } => {
                let count = self.stop_all().await;
                if count > 0 {
                    info!("Cancelled {} pending reconnections", count);
                }
                let _ = ack.send(count);
            }
            Command::DataReceived { device_id } => {
                self.health.insert(device_id, ConnectionHealth::Healthy);
            }
            Command::ConnectionSucceeded { device_id } => {
                let pending = self
                    .entries
                    .get(&device_id)
                    .map(|e| (e.failed + 1, e.last_error.clone()));
                self.remove(&device_id).await;
                self.health.insert(device_id.clone(), ConnectionHealth::Healthy);
                if let Some((attempt, error)) = pending {
                    info!("{} reconnected externally", device_id);
                    self.emit(ReconnectionEvent::Succeeded {
                        device_id,
                        attempt,
                        error,
                    });
                }
            }
            Command::RadioChanged(state) => self.radio_changed(state).await,
            Command::TimerFired {
                device_id,
                generation,
            } => {
                let due = self.entries.get(&device_id).is_some_and(|e| {
                    e.generation == generation && e.phase == ReconnectionPhase::Scheduled
                });
                if due {
                    self.start_attempt(&device_id);
                } else {
                    debug!("Ignoring stale timer for {}", device_id);
                }
            }
            Command::AttemptFinished {
                device_id,
                generation,
                result,
            } => self.attempt_finished(device_id, generation, result),
            Command::AddObserver(observer) => self.observers.push(observer),
            Command::Snapshot { device_id, reply } => {
                let _ = reply.send(self.snapshot(&device_id));
            }
            Command::Health { device_id, reply } => {
                let _ = reply.send(self.health.get(&device_id).copied());
            }
            Command::Pending { reply } => {
                let mut ids: Vec<String> = self.entries.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
            Command::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }

    fn schedule(
        &mut self,
        device_id: String,
        device: Arc<dyn SensorDevice>,
        immediate: bool,
        error: Option<String>,
    ) {
        if let Some(entry) = self.entries.get_mut(&device_id) {
            if error.is_some() {
                entry.last_error = error;
            }
            if immediate && entry.phase == ReconnectionPhase::Scheduled {
                debug!("Immediate reconnect requested for {}", device_id);
                self.start_attempt(&device_id);
            } else {
                debug!("Reconnection already pending for {}", device_id);
            }
            return;
        }

        let delay = if immediate {
            Duration::ZERO
        } else {
            self.options.delay_for_attempt(0)
        };
        self.entries.insert(
            device_id.clone(),
            Entry {
                device,
                failed: 0,
                phase: ReconnectionPhase::Scheduled,
                next_delay: delay,
                deadline: None,
                generation: 0,
                task: None,
                last_error: error,
            },
        );
        self.health.insert(device_id.clone(), ConnectionHealth::Degraded);
        info!("Scheduling reconnection for {} in {:?}", device_id, delay);
        self.arm(&device_id, delay);
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Put an entry in the Scheduled phase with a timer, or Paused when the
    /// radio is down. A zero delay starts the attempt right away.
    fn arm(&mut self, device_id: &str, delay: Duration) {
        let radio_available = self.radio.is_available();
        let generation = self.generation();
        let Some(entry) = self.entries.get_mut(device_id) else {
            return;
        };
        let attempt = entry.failed + 1;
        entry.generation = generation;
        entry.next_delay = delay;
        entry.stop_task();

        if !radio_available {
            entry.phase = ReconnectionPhase::Paused;
            entry.deadline = None;
            debug!("Radio unavailable, {} paused", device_id);
            return;
        }

        self.emit(ReconnectionEvent::Scheduled {
            device_id: device_id.to_string(),
            attempt,
            delay,
        });

        if delay.is_zero() {
            self.start_attempt(device_id);
            return;
        }

        let Some(entry) = self.entries.get_mut(device_id) else {
            return;
        };
        entry.phase = ReconnectionPhase::Scheduled;
        entry.deadline = Some(Instant::now() + delay);
        let commands = self.commands.clone();
        let id = device_id.to_string();
        entry.task = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = commands.send(Command::TimerFired {
                device_id: id,
                generation,
            });
        }));
    }

    fn start_attempt(&mut self, device_id: &str) {
        let generation = self.generation();
        let connection_timeout = self.options.connection_timeout;
        let Some(entry) = self.entries.get_mut(device_id) else {
            return;
        };
        entry.stop_task();
        entry.generation = generation;
        entry.phase = ReconnectionPhase::Connecting;
        entry.deadline = None;

        let attempt = entry.failed + 1;
        let error = entry.last_error.clone();
        let device = Arc::clone(&entry.device);
        let commands = self.commands.clone();
        let id = device_id.to_string();
        entry.task = Some(tokio::spawn(async move {
            let result = match timeout(connection_timeout, device.connect()).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("connect", connection_timeout)),
            };
            let _ = commands.send(Command::AttemptFinished {
                device_id: id,
                generation,
                result,
            });
        }));

        info!("Reconnection attempt {} for {}", attempt, device_id);
        self.emit(ReconnectionEvent::Started {
            device_id: device_id.to_string(),
            attempt,
            error,
        });
    }

    fn attempt_finished(&mut self, device_id: String, generation: u64, result: Result<()>) {
        let Some(entry) = self.entries.get_mut(&device_id) else {
            return;
        };
        if entry.generation != generation || entry.phase != ReconnectionPhase::Connecting {
            debug!("Ignoring stale attempt result for {}", device_id);
            return;
        }
        entry.task = None;

        match result {
            Ok(()) => {
                let attempt = entry.failed + 1;
                let error = entry.last_error.take();
                self.entries.remove(&device_id);
                self.health.insert(device_id.clone(), ConnectionHealth::Healthy);
                info!("Reconnected to {} on attempt {}", device_id, attempt);
                self.emit(ReconnectionEvent::Succeeded {
                    device_id,
                    attempt,
                    error,
                });
            }
            Err(e) => {
                entry.failed += 1;
                let failed = entry.failed;
                let message = e.to_string();
                entry.last_error = Some(message.clone());

                let will_retry = e.is_recoverable()
                    && self.options.max_attempts.is_none_or(|max| failed < max);
                warn!(
                    "Reconnection attempt {} for {} failed: {}",
                    failed, device_id, message
                );
                self.emit(ReconnectionEvent::AttemptFailed {
                    device_id: device_id.clone(),
                    attempt: failed,
                    error: message.clone(),
                    will_retry,
                });

                if will_retry {
                    let delay = self.options.delay_for_attempt(failed);
                    self.arm(&device_id, delay);
                } else {
                    self.entries.remove(&device_id);
                    self.health.insert(device_id.clone(), ConnectionHealth::Lost);
                    warn!("Giving up on {} after {} attempts", device_id, failed);
                    self.emit(ReconnectionEvent::GaveUp {
                        device_id,
                        attempts: failed,
                        error: message,
                    });
                }
            }
        }
    }

    async fn radio_changed(&mut self, state: RadioState) {
        let was_available = self.radio.is_available();
        self.radio = state;
        let available = state.is_available();

        if was_available && !available {
            let now = Instant::now();
            let generation = self.generation();
            let mut stopped = Vec::new();
            for entry in self.entries.values_mut() {
                match entry.phase {
                    ReconnectionPhase::Scheduled => {
                        entry.next_delay = entry
                            .deadline
                            .map(|d| d.saturating_duration_since(now))
                            .unwrap_or(entry.next_delay);
                    }
                    // The aborted attempt is not counted.
                    ReconnectionPhase::Connecting => entry.next_delay = Duration::ZERO,
                    ReconnectionPhase::Paused => continue,
                }
                entry.phase = ReconnectionPhase::Paused;
                entry.deadline = None;
                entry.generation = generation;
                stopped.extend(entry.stop_task());
            }
            for task in stopped {
                let _ = task.await;
            }
            info!(
                "Radio {}: paused {} reconnections",
                state,
                self.entries.len()
            );
        } else if !was_available && available {
            let paused: Vec<String> = self
                .entries
                .iter()
                .filter(|(_, e)| e.phase == ReconnectionPhase::Paused)
                .map(|(id, _)| id.clone())
                .collect();
            info!("Radio {}: resuming {} reconnections", state, paused.len());
            for device_id in paused {
                self.start_attempt(&device_id);
            }
        }
    }

    fn snapshot(&self, device_id: &str) -> Option<ReconnectionAttempt> {
        let entry = self.entries.get(device_id)?;
        let next_delay = match (entry.phase, entry.deadline) {
            (ReconnectionPhase::Scheduled, Some(deadline)) => {
                deadline.saturating_duration_since(Instant::now())
            }
            _ => entry.next_delay,
        };
        Some(ReconnectionAttempt {
            device_id: device_id.to_string(),
            attempt: entry.failed,
            next_delay,
            health: self
                .health
                .get(device_id)
                .copied()
                .unwrap_or(ConnectionHealth::Degraded),
            phase: entry.phase,
        })
    }

    async fn remove(&mut self, device_id: &str) -> bool {
        match self.entries.remove(device_id) {
            Some(mut entry) => {
                if let Some(task) = entry.stop_task() {
                    let _ = task.await;
                }
                true
            }
            None => false,
        }
    }

    async fn stop_all(&mut self) -> usize {
        let count = self.entries.len();
        let tasks: Vec<JoinHandle<()>> = self
            .entries
            .drain()
            .filter_map(|(_, mut entry)| entry.stop_task())
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        count
    }

    fn emit(&self, event: ReconnectionEvent) {
        for observer in &self.observers {
            match &event {
                ReconnectionEvent::Started {
                    device_id,
                    attempt,
                    error,
                } => observer.reconnection_started(device_id, *attempt, error.as_deref()),
                ReconnectionEvent::Succeeded {
                    device_id,
                    attempt,
                    error,
                } => observer.reconnection_succeeded(device_id, *attempt, error.as_deref()),
                ReconnectionEvent::AttemptFailed {
                    device_id,
                    attempt,
                    error,
                    will_retry,
                } => observer.reconnection_attempt_failed(device_id, *attempt, error, *will_retry),
                ReconnectionEvent::GaveUp {
                    device_id,
                    attempts,
                    error,
                } => observer.reconnection_gave_up(device_id, *attempts, error),
                ReconnectionEvent::Scheduled { .. } => {}
            }
        }
        self.events.send(event);
    }
}
