//! Registry lifecycle against simulated instruments.

use std::sync::Arc;
use std::time::Duration;

use labsync_core::{ConnectionState, DeviceId, LabError, ParameterValue};
use labsync_hardware::sim::low_pass_response;
use labsync_hardware::{
    Action, DeviceConfig, DeviceRegistry, DriverType, RegistrySettings, SimBehavior, SimulatedConnector,
};

fn config(id: &str, driver: DriverType) -> DeviceConfig {
    DeviceConfig {
        id: DeviceId::new(id),
        name: id.to_string(),
        driver,
        simulated: true,
    }
}

fn bench() -> (Arc<SimulatedConnector>, DeviceRegistry) {
    let connector = Arc::new(SimulatedConnector::new());
    let registry = DeviceRegistry::with_connector(connector.clone());
    registry
        .register(config("stage0", DriverType::EcoVario { port: "/dev/ttyS0".into() }))
        .unwrap();
    registry
        .register(config("laser0", DriverType::LuxxPlus { port: "/dev/ttyUSB0".into() }))
        .unwrap();
    registry
        .register(config("gen", DriverType::Tga1244 { port: "/dev/ttyS1".into() }))
        .unwrap();
    registry
        .register(config(
            "fsv",
            DriverType::Fsv3000 {
                host: "127.0.0.1".into(),
                port: 5025,
            },
        ))
        .unwrap();
    (connector, registry)
}

#[tokio::test]
async fn connect_moves_through_opening_to_open() {
    let (_connector, registry) = bench();
    let id = DeviceId::new("laser0");
    let mut events = registry.subscribe();

    registry.connect(&id).await.unwrap();

    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Opening);
    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Open);
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Open);
    assert_eq!(registry.open_devices(), vec![id]);
}

#[tokio::test]
async fn commands_to_closed_device_are_refused() {
    let (_connector, registry) = bench();

    let err = registry.read_status(&DeviceId::new("stage0")).await.unwrap_err();
    assert!(matches!(err, LabError::NotOpen { .. }));

    let err = registry.read_status(&DeviceId::new("nope")).await.unwrap_err();
    assert!(matches!(err, LabError::NotFound(_)));
}

#[tokio::test]
async fn disconnect_fails_in_flight_command_and_closes() {
    let (connector, registry) = bench();
    let registry = Arc::new(registry);
    let id = DeviceId::new("gen");
    connector.set_behavior("gen", SimBehavior::default().with_latency(Duration::from_millis(300)));
    registry.connect(&id).await.unwrap();

    let pending = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move { registry.read_status(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.disconnect(&id).await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(LabError::NotOpen { .. })), "{:?}", result);
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Closed);

    // Safe to repeat.
    registry.disconnect(&id).await;
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Closed);
}

#[tokio::test]
async fn invalid_value_sends_no_frame() {
    let (connector, registry) = bench();
    let id = DeviceId::new("stage0");
    registry.connect(&id).await.unwrap();
    let handle = connector.handle(&id).unwrap();
    let frames = handle.frames_received();

    let err = registry
        .write_parameter(&id, "target_position", ParameterValue::Float(2000.0))
        .await
        .unwrap_err();

    assert!(matches!(err, LabError::Validation { .. }));
    assert_eq!(handle.frames_received(), frames);
    assert_eq!(
        registry.parameters(&id).unwrap().get("target_position"),
        Some(&ParameterValue::Float(0.0))
    );
}

#[tokio::test]
async fn refused_port_leaves_error_until_reconnect() {
    let (connector, registry) = bench();
    let id = DeviceId::new("laser0");
    connector.refuse("laser0");

    let err = registry.connect(&id).await.unwrap_err();
    assert!(matches!(err, LabError::Connection { .. }));
    assert!(matches!(registry.state(&id).unwrap(), ConnectionState::Error { .. }));

    connector.allow(&id);
    registry.connect(&id).await.unwrap();
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Open);
}

#[tokio::test]
async fn silent_instrument_fails_the_handshake() {
    let connector = Arc::new(SimulatedConnector::new());
    connector.set_behavior("fsv", SimBehavior::default().silent());
    let registry = DeviceRegistry::with_connector(connector.clone()).with_settings(RegistrySettings {
        command_timeout: Duration::from_millis(100),
        max_consecutive_failures: 3,
    });
    registry
        .register(config(
            "fsv",
            DriverType::Fsv3000 {
                host: "127.0.0.1".into(),
                port: 5025,
            },
        ))
        .unwrap();
    let id = DeviceId::new("fsv");

    let err = registry.connect(&id).await.unwrap_err();

    assert!(matches!(err, LabError::Connection { .. }), "{:?}", err);
    assert!(matches!(registry.state(&id).unwrap(), ConnectionState::Error { .. }));
    assert_eq!(connector.handle(&id).unwrap().frames_received(), 1);
}

#[tokio::test]
async fn generator_writes_follow_channel_selector() {
    let (connector, registry) = bench();
    let id = DeviceId::new("gen");
    registry.connect(&id).await.unwrap();
    let handle = connector.handle(&id).unwrap();

    registry.write_parameter(&id, "channel", ParameterValue::Int(2)).await.unwrap();
    registry
        .write_parameter(&id, "frequency", ParameterValue::Int(5000))
        .await
        .unwrap();

    assert_eq!(handle.register("WAVFREQ[2]").as_deref(), Some("5000"));
    assert_eq!(handle.register("WAVFREQ[1]"), None);
    let parameters = registry.parameters(&id).unwrap();
    assert_eq!(parameters.get("frequency[2]"), Some(&ParameterValue::Float(5000.0)));

    // Channel 0 addresses every channel.
    registry.write_parameter(&id, "channel", ParameterValue::Int(0)).await.unwrap();
    registry
        .write_parameter(&id, "amplitude", ParameterValue::Float(2.5))
        .await
        .unwrap();
    for ch in 1..=4 {
        assert_eq!(handle.register(&format!("AMPL[{}]", ch)).as_deref(), Some("2.5"));
    }
}

#[tokio::test]
async fn staged_parameters_reach_hardware_only_when_applied() {
    let (connector, registry) = bench();
    let id = DeviceId::new("stage0");
    registry.connect(&id).await.unwrap();
    let handle = connector.handle(&id).unwrap();

    registry
        .stage_parameter(&id, "target_position", ParameterValue::Float(12.5))
        .unwrap();
    assert_eq!(handle.register("target_position_counts").as_deref(), Some("0"));

    registry.apply_parameters(&id).await.unwrap();
    assert_eq!(handle.register("target_position_counts").as_deref(), Some("9974"));

    registry.action(&id, Action::Start).await.unwrap();
    assert_eq!(handle.register("position_counts").as_deref(), Some("9974"));
}

#[tokio::test]
async fn repeated_device_errors_move_to_error_state() {
    let connector = Arc::new(SimulatedConnector::new());
    let registry = DeviceRegistry::with_connector(connector.clone()).with_settings(RegistrySettings {
        command_timeout: Duration::from_millis(500),
        max_consecutive_failures: 1,
    });
    registry
        .register(config(
            "fsv",
            DriverType::Fsv3000 {
                host: "localhost".into(),
                port: 5025,
            },
        ))
        .unwrap();
    let id = DeviceId::new("fsv");
    connector.set_behavior("fsv", SimBehavior::default().failing_measurement_at(0));
    registry.connect(&id).await.unwrap();

    let err = registry.measure_at(&id, 1.0e3).await.unwrap_err();
    assert!(matches!(err, LabError::Device { .. }));
    assert!(matches!(registry.state(&id).unwrap(), ConnectionState::Error { .. }));

    let err = registry.measure_at(&id, 1.0e3).await.unwrap_err();
    assert!(matches!(err, LabError::NotOpen { .. }));
}

#[tokio::test]
async fn unsupported_action_is_reported() {
    let (_connector, registry) = bench();
    let id = DeviceId::new("fsv");
    registry.connect(&id).await.unwrap();

    let err = registry.action(&id, Action::Home).await.unwrap_err();
    assert!(matches!(err, LabError::Unsupported { .. }));
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Open);
}

#[tokio::test]
async fn failed_apply_keeps_memory_and_stops_before_emission() {
    let (connector, registry) = bench();
    let id = DeviceId::new("laser0");
    connector.set_behavior("laser0", SimBehavior::default().rejecting("TPP"));
    registry.connect(&id).await.unwrap();
    let handle = connector.handle(&id).unwrap();

    registry.stage_parameter(&id, "modulation_mode", "cw".into()).unwrap();
    registry.stage_parameter(&id, "control_mode", "apc".into()).unwrap();
    registry.stage_parameter(&id, "power", ParameterValue::Float(40.0)).unwrap();
    registry.stage_parameter(&id, "emission", ParameterValue::Bool(true)).unwrap();
    let staged = registry.parameters(&id).unwrap();

    let err = registry.apply_parameters(&id).await.unwrap_err();
    assert!(matches!(err, LabError::Device { .. }), "{:?}", err);

    // The operating mode went through and matches memory.
    assert_eq!(handle.register("operating_mode").as_deref(), Some("2"));
    // The rejected power and everything after it never took effect.
    assert_eq!(handle.register("power").as_deref(), Some("0"));
    assert_eq!(handle.register("emission").as_deref(), Some("false"));
    let log = handle.frame_log();
    assert_eq!(log.last().map(String::as_str), Some("?TPP40"));
    assert!(!log.iter().any(|frame| frame == "?LOn"), "{:?}", log);

    assert_eq!(registry.parameters(&id).unwrap(), staged);
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Open);
}

#[tokio::test]
async fn controller_reset_outlasts_the_command_timeout() {
    let (connector, registry) = bench();
    let id = DeviceId::new("laser0");
    connector.set_behavior("laser0", SimBehavior::default().with_reset_delay(Duration::from_millis(2500)));
    registry.connect(&id).await.unwrap();
    registry.write_parameter(&id, "emission", ParameterValue::Bool(true)).await.unwrap();

    let started = tokio::time::Instant::now();
    registry.action(&id, Action::ResetController).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(2500));
    assert_eq!(registry.state(&id).unwrap(), ConnectionState::Open);
    assert_eq!(
        connector.handle(&id).unwrap().register("emission").as_deref(),
        Some("false")
    );
}

#[tokio::test]
async fn analyzer_trace_single_and_averaged() {
    let (connector, registry) = bench();
    let id = DeviceId::new("fsv");
    registry.connect(&id).await.unwrap();
    let handle = connector.handle(&id).unwrap();

    let single = registry.acquire_trace(&id, false).await.unwrap();
    assert_eq!(single.len(), 2001);
    assert_eq!(single.first().map(|(f, _)| *f), Some(500.0));
    assert_eq!(single.last().map(|(f, _)| *f), Some(1500.0));
    let (_, amplitude) = single[1000];
    assert!((amplitude - low_pass_response(1000.0)).abs() < 1e-3, "{}", amplitude);
    assert_eq!(handle.register("trace_mode").as_deref(), Some("WRIT"));

    registry
        .write_parameter(&id, "average_count", ParameterValue::Int(8))
        .await
        .unwrap();
    let averaged = registry.acquire_trace(&id, true).await.unwrap();
    assert_eq!(averaged.len(), 2001);
    assert_eq!(handle.register("trace_mode").as_deref(), Some("AVER"));
    assert_eq!(handle.register("sweep_count").as_deref(), Some("8"));

    let err = registry
        .acquire_trace(&DeviceId::new("stage0"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::NotOpen { .. }));
}
