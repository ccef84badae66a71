//! Preset store against a registry of simulated instruments.

use std::sync::Arc;

use labsync::PresetStore;
use labsync_core::{DeviceId, LabError, ParameterValue};
use labsync_hardware::{DeviceConfig, DeviceRegistry, DriverType, SimulatedConnector};

fn device(id: &str, driver: DriverType) -> DeviceConfig {
    DeviceConfig {
        id: DeviceId::new(id),
        name: id.to_string(),
        driver,
        simulated: true,
    }
}

fn bench() -> (Arc<SimulatedConnector>, Arc<DeviceRegistry>) {
    let connector = Arc::new(SimulatedConnector::new());
    let registry = DeviceRegistry::with_connector(connector.clone());
    for config in [
        device("stage0", DriverType::EcoVario { port: "/dev/ttyS0".into() }),
        device("laser0", DriverType::LuxxPlus { port: "/dev/ttyUSB0".into() }),
        device("gen", DriverType::Tga1244 { port: "/dev/ttyS1".into() }),
        device(
            "fsv",
            DriverType::Fsv3000 {
                host: "192.168.1.20".into(),
                port: 5025,
            },
        ),
    ] {
        registry.register(config).unwrap();
    }
    (connector, Arc::new(registry))
}

#[tokio::test]
async fn save_load_save_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let (_connector, registry) = bench();
    let stage = DeviceId::new("stage0");
    let generator = DeviceId::new("gen");
    registry
        .stage_parameter(&stage, "target_position", ParameterValue::Float(12.5))
        .unwrap();
    registry
        .stage_parameter(&generator, "frequency[3]", ParameterValue::Int(25_000))
        .unwrap();
    registry
        .stage_parameter(&generator, "waveform[2]", ParameterValue::Text("Square".into()))
        .unwrap();
    registry
        .stage_parameter(&DeviceId::new("laser0"), "emission", ParameterValue::Bool(true))
        .unwrap();

    let store = PresetStore::new(registry.clone(), dir.path());
    let first_path = store.save("bench").await.unwrap();
    let first = std::fs::read(&first_path).unwrap();

    // Load into a fresh registry and save again.
    let (_connector, fresh) = bench();
    let reloaded = PresetStore::new(fresh.clone(), dir.path());
    reloaded.load("bench").await.unwrap();
    assert_eq!(
        fresh.parameters(&stage).unwrap().get("target_position"),
        Some(&ParameterValue::Float(12.5))
    );
    assert_eq!(
        fresh.parameters(&generator).unwrap().get("waveform[2]"),
        Some(&ParameterValue::Text("square".into()))
    );

    let second_path = reloaded.save("bench").await.unwrap();
    assert_eq!(first_path, second_path);
    assert_eq!(std::fs::read(&second_path).unwrap(), first);
    assert!(!dir.path().join("bench.toml.tmp").exists());
}

#[tokio::test]
async fn loading_a_preset_sends_nothing_to_hardware() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("focus.toml"),
        r#"name = "focus"
version = 1

[devices.laser0]
power = 40.0

[devices.stage0]
target_position = 12.5
"#,
    )
    .unwrap();

    let (connector, registry) = bench();
    let stage = DeviceId::new("stage0");
    let laser = DeviceId::new("laser0");
    registry.connect(&stage).await.unwrap();
    registry.connect(&laser).await.unwrap();
    let stage_sim = connector.handle(&stage).unwrap();
    let laser_sim = connector.handle(&laser).unwrap();
    let stage_frames = stage_sim.frames_received();
    let laser_frames = laser_sim.frames_received();
    let stage_registers = stage_sim.registers();
    let laser_registers = laser_sim.registers();

    PresetStore::new(registry.clone(), dir.path()).load("focus").await.unwrap();

    assert_eq!(stage_sim.frames_received(), stage_frames);
    assert_eq!(laser_sim.frames_received(), laser_frames);
    assert_eq!(stage_sim.registers(), stage_registers);
    assert_eq!(laser_sim.registers(), laser_registers);
    assert_eq!(
        registry.parameters(&laser).unwrap().get("power"),
        Some(&ParameterValue::Float(40.0))
    );

    // Hardware follows only on an explicit apply.
    registry.apply_parameters(&stage).await.unwrap();
    assert_eq!(stage_sim.register("target_position_counts").as_deref(), Some("9974"));
}

#[tokio::test]
async fn invalid_value_leaves_every_device_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("broken.toml"),
        r#"name = "broken"
version = 1

[devices.laser0]
power = 40.0

[devices.stage0]
target_position = 5000.0
"#,
    )
    .unwrap();
    let (_connector, registry) = bench();

    let err = PresetStore::new(registry.clone(), dir.path())
        .load("broken")
        .await
        .unwrap_err();

    assert!(matches!(err, LabError::Validation { .. }), "{:?}", err);
    assert_eq!(
        registry.parameters(&DeviceId::new("laser0")).unwrap().get("power"),
        Some(&ParameterValue::Float(0.0))
    );
}

#[tokio::test]
async fn later_invalid_device_rolls_back_earlier_valid_ones() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("half_valid.toml"),
        r#"name = "half_valid"
version = 1

[devices.gen]
"frequency[1]" = 2500.0

[devices.laser0]
emission = true
power = 40.0

[devices.stage0]
speed = 10.0
target_position = -1.0
"#,
    )
    .unwrap();
    let (_connector, registry) = bench();
    let ids = ["gen", "laser0", "stage0"].map(DeviceId::new);
    let before: Vec<_> = ids.iter().map(|id| registry.parameters(id).unwrap()).collect();

    let err = PresetStore::new(registry.clone(), dir.path())
        .load("half_valid")
        .await
        .unwrap_err();

    assert!(matches!(err, LabError::Validation { .. }), "{:?}", err);
    let after: Vec<_> = ids.iter().map(|id| registry.parameters(id).unwrap()).collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn applied_preset_switches_laser_emission_on_last() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("laser_on.toml"),
        r#"name = "laser_on"
version = 1

[devices.laser0]
control_mode = "apc"
emission = true
modulation_mode = "cw"
power = 40.0
"#,
    )
    .unwrap();
    let (connector, registry) = bench();
    let laser = DeviceId::new("laser0");
    registry.connect(&laser).await.unwrap();
    let sim = connector.handle(&laser).unwrap();
    let handshake = sim.frame_log().len();

    PresetStore::new(registry.clone(), dir.path()).load("laser_on").await.unwrap();
    registry.apply_parameters(&laser).await.unwrap();

    assert_eq!(sim.frame_log()[handshake..], ["?ROM1", "?ROM2", "?TPP40", "?LOn"]);
    assert_eq!(sim.register("emission").as_deref(), Some("true"));
}

#[tokio::test]
async fn unknown_devices_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("other_bench.toml"),
        r#"name = "other_bench"
version = 1

[devices.camera0]
exposure = 10.0

[devices.stage0]
speed = 10.0
"#,
    )
    .unwrap();
    let (_connector, registry) = bench();

    PresetStore::new(registry.clone(), dir.path())
        .load("other_bench")
        .await
        .unwrap();

    assert_eq!(
        registry.parameters(&DeviceId::new("stage0")).unwrap().get("speed"),
        Some(&ParameterValue::Float(10.0))
    );
}

#[tokio::test]
async fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("junk.toml"), "name = \n").unwrap();
    let (_connector, registry) = bench();

    let err = PresetStore::new(registry, dir.path()).load("junk").await.unwrap_err();
    assert!(matches!(err, LabError::Parse(_)));
}
