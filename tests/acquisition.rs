//! Acquisition loop against simulated instruments.

use std::sync::Arc;
use std::time::Duration;

use labsync::AcquisitionLoop;
use labsync_core::{ConnectionState, DeviceId, ErrorKind, StatusEvent};
use labsync_hardware::{DeviceConfig, DeviceRegistry, DriverType, RegistrySettings, SimBehavior, SimulatedConnector};

fn device(id: &str, driver: DriverType) -> DeviceConfig {
    DeviceConfig {
        id: DeviceId::new(id),
        name: id.to_string(),
        driver,
        simulated: true,
    }
}

async fn bench(generator: SimBehavior) -> Arc<DeviceRegistry> {
    bench_with(generator, RegistrySettings::default()).await
}

async fn bench_with(generator: SimBehavior, settings: RegistrySettings) -> Arc<DeviceRegistry> {
    let connector = Arc::new(SimulatedConnector::new());
    connector.set_behavior("gen", generator);
    let registry = DeviceRegistry::with_connector(connector).with_settings(settings);
    registry
        .register(device("stage0", DriverType::EcoVario { port: "/dev/ttyS0".into() }))
        .unwrap();
    registry
        .register(device("gen", DriverType::Tga1244 { port: "/dev/ttyS1".into() }))
        .unwrap();
    registry
        .register(device("laser0", DriverType::LuxxPlus { port: "/dev/ttyUSB0".into() }))
        .unwrap();
    registry.connect(&DeviceId::new("stage0")).await.unwrap();
    registry.connect(&DeviceId::new("gen")).await.unwrap();
    Arc::new(registry)
}

async fn collect(events: &mut tokio::sync::broadcast::Receiver<StatusEvent>, window: Duration) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => seen.push(event),
                Err(_) => break,
            },
        }
    }
    seen
}

#[tokio::test]
async fn slow_device_does_not_hold_back_the_others() {
    let registry = bench(SimBehavior::default().with_latency(Duration::from_millis(600))).await;
    let acquisition = AcquisitionLoop::new(registry, Duration::from_millis(50), Duration::from_secs(2));
    let mut events = acquisition.subscribe();
    let running = acquisition.start();

    let seen = collect(&mut events, Duration::from_millis(500)).await;
    running.stop().await;

    let stage = DeviceId::new("stage0");
    let stage_snapshots = seen
        .iter()
        .filter(|e| matches!(e, StatusEvent::Snapshot(s) if s.device == stage))
        .count();
    let generator_events = seen.iter().filter(|e| e.device().as_str() == "gen").count();

    assert!(stage_snapshots >= 5, "only {} stage snapshots", stage_snapshots);
    // The generator answers once at most in the window.
    assert!(generator_events <= 1, "{} generator events", generator_events);
    assert!(acquisition.latest(&stage).is_some());
}

fn faults(seen: &[StatusEvent]) -> Vec<(&str, ErrorKind)> {
    seen.iter()
        .filter_map(|e| match e {
            StatusEvent::Fault { device, kind, .. } => Some((device.as_str(), *kind)),
            StatusEvent::Snapshot(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn repeated_read_timeouts_move_the_device_to_error() {
    let registry = bench(SimBehavior::default().with_latency(Duration::from_millis(1000))).await;
    let acquisition = AcquisitionLoop::new(registry.clone(), Duration::from_millis(50), Duration::from_millis(100));
    let mut events = acquisition.subscribe();
    let running = acquisition.start();

    let seen = collect(&mut events, Duration::from_millis(700)).await;
    running.stop().await;

    let faults = faults(&seen);
    assert_eq!(faults.len(), 3, "{:?}", faults);
    assert!(faults.iter().all(|(device, kind)| *device == "gen" && *kind == ErrorKind::Timeout));

    let stage_snapshots = seen
        .iter()
        .filter(|e| matches!(e, StatusEvent::Snapshot(s) if s.device.as_str() == "stage0"))
        .count();
    assert!(stage_snapshots >= 5);
    assert!(acquisition.latest(&DeviceId::new("gen")).is_none());
    assert!(matches!(
        registry.state(&DeviceId::new("gen")).unwrap(),
        ConnectionState::Error { .. }
    ));
    assert!(registry.state(&DeviceId::new("stage0")).unwrap().is_open());
}

#[tokio::test]
async fn timed_out_reads_do_not_queue_up_behind_a_slow_device() {
    let settings = RegistrySettings {
        max_consecutive_failures: 1000,
        ..RegistrySettings::default()
    };
    let registry = bench_with(SimBehavior::default().with_latency(Duration::from_millis(1500)), settings).await;
    let acquisition = AcquisitionLoop::new(registry.clone(), Duration::from_millis(20), Duration::from_millis(50));
    let mut events = acquisition.subscribe();
    let running = acquisition.start();

    let seen = collect(&mut events, Duration::from_secs(1)).await;
    running.stop().await;

    let timeouts = faults(&seen)
        .into_iter()
        .filter(|(device, kind)| *device == "gen" && *kind == ErrorKind::Timeout)
        .count();
    assert!(timeouts >= 5, "only {} timeouts", timeouts);

    let generator = DeviceId::new("gen");
    assert!(registry.state(&generator).unwrap().is_open());
    let write = tokio::time::timeout(Duration::from_secs(1), registry.set_frequency(&generator, 1000.0, 1)).await;
    assert!(matches!(write, Ok(Ok(()))), "{:?}", write);
}

#[tokio::test]
async fn only_open_devices_are_polled() {
    let registry = bench(SimBehavior::default()).await;
    let acquisition = AcquisitionLoop::new(registry, Duration::from_millis(50), Duration::from_secs(1));
    let mut events = acquisition.subscribe();
    let running = acquisition.start();

    let seen = collect(&mut events, Duration::from_millis(300)).await;
    running.stop().await;

    assert!(!seen.is_empty());
    assert!(seen.iter().all(|e| e.device().as_str() != "laser0"));
    let snapshots = acquisition.snapshots();
    assert_eq!(
        snapshots.keys().map(DeviceId::as_str).collect::<Vec<_>>(),
        vec!["gen", "stage0"]
    );
}

#[tokio::test]
async fn stop_ends_the_event_stream() {
    let registry = bench(SimBehavior::default()).await;
    let acquisition = AcquisitionLoop::new(registry, Duration::from_millis(20), Duration::from_secs(1));
    let mut events = acquisition.subscribe();
    let running = acquisition.start();

    assert!(events.recv().await.is_ok());
    running.stop().await;

    // Drain what was published before the stop; nothing follows.
    while events.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}
