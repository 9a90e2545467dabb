//! End-to-end tests for sensorfuse-core using the mock radio and devices.
//!
//! These run without Bluetooth hardware:
//! `cargo test --package sensorfuse-core --test integration`

use std::sync::Arc;
use std::time::Duration;

use sensorfuse_core::{
    AggregatorConfig, BatteryLevel, Channel, DeviceEvent, DeviceFamily, DeviceRegistry,
    DisconnectReason, MockDevice, MockDeviceFactory, MockRadio, RadioState, ReconnectOptions,
    ReconnectionEvent, RegistryConfig, SensorAggregator, SensorReading, Throttle,
};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn options() -> ReconnectOptions {
    ReconnectOptions::new()
        .initial_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(4))
        .max_attempts(3)
        .jitter(false)
}

async fn wait_for<E: Clone>(rx: &mut broadcast::Receiver<E>, pred: impl Fn(&E) -> bool) -> E {
    loop {
        let event = rx.recv().await.expect("channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// One Oralable frame with every frame channel present.
fn oralable_frame(frame: u64, red: f64, infrared: f64) -> Vec<SensorReading> {
    let at = OffsetDateTime::UNIX_EPOCH;
    [
        (Channel::PpgRed, red),
        (Channel::PpgInfrared, infrared),
        (Channel::PpgGreen, 500.0),
        (Channel::AccelX, 0.0),
        (Channel::AccelY, 0.0),
        (Channel::AccelZ, 16384.0),
    ]
    .into_iter()
    .map(|(channel, value)| {
        SensorReading::new(channel, value, at, DeviceFamily::Oralable).with_frame(frame)
    })
    .collect()
}

struct Rig {
    radio: Arc<MockRadio>,
    factory: Arc<MockDeviceFactory>,
    registry: DeviceRegistry,
    aggregator: Arc<SensorAggregator>,
    cancel: CancellationToken,
}

impl Rig {
    fn new(config: RegistryConfig) -> Self {
        let radio = Arc::new(MockRadio::new());
        let factory = Arc::new(MockDeviceFactory::new());
        let registry = DeviceRegistry::new(radio.clone(), factory.clone(), config).unwrap();
        let aggregator = Arc::new(SensorAggregator::new(AggregatorConfig::default()).unwrap());
        let cancel = CancellationToken::new();
        aggregator.attach(registry.batches(), cancel.clone());
        Self {
            radio,
            factory,
            registry,
            aggregator,
            cancel,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.registry.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_batches_flow_into_composite_records() {
    let rig = Rig::new(RegistryConfig::new().auto_connect(true));
    let device = Arc::new(MockDevice::new("oral-1", DeviceFamily::Oralable));
    rig.factory.register(device.clone());

    let mut events = rig.registry.events();
    let mut records = rig.aggregator.records();
    rig.registry.start_scan().await.unwrap();
    assert!(rig.radio.is_scanning());
    rig.radio.advertise("oral-1", "Oralable 7F21");
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Connected { .. })).await;

    let mut readings = oralable_frame(40, 1200.0, 900.0);
    readings.extend(oralable_frame(41, 1210.0, 905.0));
    device.push_batch(readings);

    let first = records.recv().await.unwrap();
    let second = records.recv().await.unwrap();
    assert_eq!(first.value(Channel::PpgRed), Some(1200.0));
    assert_eq!(first.value(Channel::PpgInfrared), Some(900.0));
    assert_eq!(second.value(Channel::PpgRed), Some(1210.0));
    assert_eq!(rig.aggregator.history().len(), 2);
    assert_eq!(rig.aggregator.channel_samples(Channel::PpgRed).len(), 2);

    rig.shutdown().await;
}

#[tokio::test]
async fn test_battery_isolated_per_family() {
    let rig = Rig::new(RegistryConfig::default());
    let oralable = Arc::new(MockDevice::new("oral-1", DeviceFamily::Oralable));
    let emg = Arc::new(MockDevice::new("emg-1", DeviceFamily::MuscleSense));
    rig.factory.register(oralable.clone());
    rig.factory.register(emg.clone());

    let mut events = rig.registry.events();
    rig.radio.advertise("oral-1", "Oralable 01");
    rig.radio.advertise("emg-1", "ANR M40");
    wait_for(&mut events, |e| {
        matches!(e, DeviceEvent::Discovered { device } if device.id == "emg-1")
    })
    .await;
    rig.registry.connect("oral-1").await.unwrap();
    rig.registry.connect("emg-1").await.unwrap();

    let mut batches = rig.registry.batches();
    let at = OffsetDateTime::UNIX_EPOCH;
    oralable.push_batch(vec![SensorReading::new(
        Channel::Battery,
        81.0,
        at,
        DeviceFamily::Oralable,
    )]);
    batches.recv().await.unwrap();
    emg.push_batch(vec![
        SensorReading::new(Channel::Battery, 12.0, at, DeviceFamily::MuscleSense),
        SensorReading::new(Channel::Emg, 300.0, at, DeviceFamily::MuscleSense).with_frame(7),
    ]);
    batches.recv().await.unwrap();

    // The aggregator task runs independently; wait until it has seen both.
    while rig.aggregator.stats().batches < 2 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        rig.aggregator.battery(DeviceFamily::Oralable),
        BatteryLevel::Percent(81)
    );
    let emg_record = rig.aggregator.latest_record().unwrap();
    assert_eq!(emg_record.value(Channel::PpgInfrared), Some(300.0));

    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_recovery_and_give_up() {
    let rig = Rig::new(RegistryConfig::new().reconnect(options()));
    let device = Arc::new(MockDevice::new("oral-1", DeviceFamily::Oralable));
    rig.factory.register(device.clone());

    let mut events = rig.registry.events();
    let mut reconnections = rig.registry.reconnection_events();
    rig.radio.advertise("oral-1", "Oralable 01");
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Discovered { .. })).await;
    rig.registry.connect("oral-1").await.unwrap();
    let mut events = rig.registry.events();

    // First drop: two failures, then success.
    device.drop_link();
    device.set_transient_failures(2);
    rig.radio.link_lost("oral-1");
    let event = wait_for(&mut reconnections, |e| {
        matches!(e, ReconnectionEvent::Succeeded { .. })
    })
    .await;
    assert_eq!(
        event,
        ReconnectionEvent::Succeeded {
            device_id: "oral-1".into(),
            attempt: 3,
            error: Some("Connection to oral-1 failed: mock transient failure".into()),
        }
    );
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Connected { .. })).await;

    // Second drop: every attempt fails.
    device.drop_link();
    device.set_should_fail(true);
    rig.radio.link_lost("oral-1");
    let mut failures = 0;
    loop {
        match reconnections.recv().await.unwrap() {
            ReconnectionEvent::AttemptFailed { .. } => failures += 1,
            ReconnectionEvent::GaveUp { attempts, .. } => {
                assert_eq!(attempts, 3);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(failures, 3);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(matches!(
        reconnections.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_radio_off_pauses_reconnection() {
    let rig = Rig::new(RegistryConfig::new().reconnect(options()));
    let device = Arc::new(MockDevice::new("oral-1", DeviceFamily::Oralable));
    rig.factory.register(device.clone());

    let mut events = rig.registry.events();
    rig.radio.advertise("oral-1", "Oralable 01");
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Discovered { .. })).await;
    rig.registry.connect("oral-1").await.unwrap();

    device.drop_link();
    rig.radio.set_state(RadioState::PoweredOff);
    rig.radio.link_lost("oral-1");
    let event = wait_for(&mut events, |e| matches!(e, DeviceEvent::Disconnected { .. })).await;
    assert!(matches!(
        event,
        DeviceEvent::Disconnected {
            reason: DisconnectReason::LinkLost(_),
            ..
        }
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(device.connect_count(), 1);

    let mut reconnections = rig.registry.reconnection_events();
    rig.radio.set_state(RadioState::PoweredOn);
    let started = wait_for(&mut reconnections, |e| {
        matches!(e, ReconnectionEvent::Started { .. })
    })
    .await;
    assert!(matches!(started, ReconnectionEvent::Started { attempt: 1, .. }));
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Connected { .. })).await;
    assert_eq!(device.connect_count(), 2);

    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_throttled_display_of_records() {
    let rig = Rig::new(RegistryConfig::new().auto_connect(true));
    let device = Arc::new(MockDevice::new("oral-1", DeviceFamily::Oralable));
    rig.factory.register(device.clone());

    let mut events = rig.registry.events();
    let mut records = rig.aggregator.records();
    rig.radio.advertise("oral-1", "Oralable 01");
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Connected { .. })).await;

    let throttle = Throttle::per_second(10);
    let mut shown = Vec::new();
    for frame in 0..20u64 {
        device.push_batch(oralable_frame(frame, 1000.0 + frame as f64, 800.0));
        let record = records.recv().await.unwrap();
        if let Some(record) = throttle.submit(record) {
            shown.push(record);
        }
        tokio::time::advance(Duration::from_millis(25)).await;
    }
    if let Some(record) = throttle.flush() {
        shown.push(record);
    }

    // 20 records over 500 ms at 10/s: one every 4th record plus the flush.
    assert_eq!(shown.len(), 6);
    assert_eq!(shown.last().unwrap().value(Channel::PpgRed), Some(1019.0));
    let stats = throttle.statistics();
    assert_eq!(stats.submissions, 20);
    assert_eq!(stats.emissions, 6);

    rig.shutdown().await;
}
