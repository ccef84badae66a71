//! Device Registry
//!
//! The registry is the single owner of device descriptors and the only place
//! where connection state changes. Every other component (acquisition loop,
//! sweep coordinator, preset store, CLI) looks devices up by id and goes
//! through it for each operation.
//!
//! # Lifecycle
//!
//! - [`DeviceRegistry::register`] adds a descriptor in `Closed` with the
//!   default parameter set of its instrument class.
//! - [`DeviceRegistry::connect`] moves `Closed`/`Error` → `Opening`, opens the
//!   transport through the [`Connector`], runs the driver handshake and spawns
//!   the device worker → `Open`. Any failure lands in `Error`.
//! - [`DeviceRegistry::disconnect`] stops the worker (failing any in-flight
//!   command with `NotOpen`) and lands in `Closed`. It never fails.
//! - A transport fault during a command moves the device to `Error`
//!   immediately; timeouts and device errors do so after
//!   `max_consecutive_failures` in a row.
//!
//! Connect, disconnect and fault teardown of one device are serialized by a
//! per-device lifecycle lock. A generation counter keeps a late fault report
//! from tearing down a newer connection.
//!
//! # Parameters
//!
//! The registry keeps the in-memory [`ParameterSet`] of every device.
//! [`DeviceRegistry::write_parameter`] validates, transmits and then records
//! the value; [`DeviceRegistry::stage_parameter`] and
//! [`DeviceRegistry::replace_parameters`] only touch memory, and
//! [`DeviceRegistry::apply_parameters`] pushes the in-memory set to hardware.
//!
//! # Configuration
//!
//! ```toml
//! [[devices]]
//! id = "stage0"
//! name = "Linear stage"
//! [devices.driver]
//! type = "eco_vario"
//! port = "/dev/ttyS0"
//!
//! [[devices]]
//! id = "fsv"
//! name = "Spectrum analyzer"
//! [devices.driver]
//! type = "fsv3000"
//! host = "192.168.1.20"
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use labsync_core::error::{LabError, LabResult};
use labsync_core::limits::{ANALYZER_TCP_PORT, COMMAND_TIMEOUT, MAX_CONSECUTIVE_FAILURES};
use labsync_core::parameter::{ParameterKey, ParameterSet, ParameterValue};
use labsync_core::status::StatusSnapshot;
use labsync_core::{ConnectionState, DeviceId, InstrumentClass};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::drivers::{self, Action, Command, Driver, Reply};
use crate::transport::{Connector, SystemConnector};
use crate::worker::WorkerHandle;

/// Capacity of the registry event channel.
const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Driver Types (Configuration)
// =============================================================================

fn default_analyzer_port() -> u16 {
    ANALYZER_TCP_PORT
}

/// Driver configuration for instantiating hardware.
///
/// Each variant corresponds to one supported instrument with the link
/// parameters it needs; baud rates are fixed per class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// EcoVario servo stage
    EcoVario {
        /// Serial port path (e.g., "/dev/ttyS0")
        port: String,
    },
    /// Omicron LuxX+ diode laser
    LuxxPlus {
        /// USB serial port path (e.g., "/dev/ttyUSB0")
        port: String,
    },
    /// TTi TGA1244 function generator
    Tga1244 {
        /// Serial port path (e.g., "/dev/ttyS1")
        port: String,
    },
    /// R&S FSV3000 spectrum analyzer
    Fsv3000 {
        /// Host name or address
        host: String,
        /// SCPI raw socket port
        #[serde(default = "default_analyzer_port")]
        port: u16,
    },
}

impl DriverType {
    /// Instrument class driven by this variant.
    pub fn class(&self) -> InstrumentClass {
        match self {
            DriverType::EcoVario { .. } => InstrumentClass::Stage,
            DriverType::LuxxPlus { .. } => InstrumentClass::Laser,
            DriverType::Tga1244 { .. } => InstrumentClass::FrequencyGenerator,
            DriverType::Fsv3000 { .. } => InstrumentClass::SpectrumAnalyzer,
        }
    }

    /// Human-readable driver type name.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::EcoVario { .. } => "eco_vario",
            DriverType::LuxxPlus { .. } => "luxx_plus",
            DriverType::Tga1244 { .. } => "tga1244",
            DriverType::Fsv3000 { .. } => "fsv3000",
        }
    }

    /// Physical resource claimed by the device.
    pub fn resource(&self) -> String {
        match self {
            DriverType::EcoVario { port } | DriverType::LuxxPlus { port } | DriverType::Tga1244 { port } => {
                format!("serial:{}", port)
            }
            DriverType::Fsv3000 { host, port } => format!("tcp:{}:{}", host, port),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for registering a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier (e.g., "stage0", "fsv")
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type and link configuration
    pub driver: DriverType,
    /// Attach to a simulated instrument instead of the real link
    #[serde(default)]
    pub simulated: bool,
}

/// Information about a registered device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Unique identifier
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type name (e.g., "tga1244")
    pub driver_type: String,
    /// Instrument class
    pub class: InstrumentClass,
    /// Claimed physical resource
    pub resource: String,
    /// Attached to a simulated instrument
    pub simulated: bool,
    /// Current connection state
    pub state: ConnectionState,
}

/// Connection state change published by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEvent {
    /// Device whose state changed
    pub device: DeviceId,
    /// New state
    pub state: ConnectionState,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

/// Tunables of the registry.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Reply bound for a single driver transaction
    pub command_timeout: Duration,
    /// Consecutive timeouts or device errors before a device goes to Error
    pub max_consecutive_failures: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }
}

// =============================================================================
// Registered Device (Internal)
// =============================================================================

struct DeviceSlot {
    config: DeviceConfig,
    /// Serializes connect, disconnect and fault teardown
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<SlotState>,
}

struct SlotState {
    state: ConnectionState,
    parameters: ParameterSet,
    worker: Option<WorkerHandle>,
    /// Incremented on every successful connect
    generation: u64,
    failures: u32,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry for device lifecycle, parameters and command routing.
pub struct DeviceRegistry {
    connector: Arc<dyn Connector>,
    settings: RegistrySettings,
    devices: RwLock<BTreeMap<DeviceId, Arc<DeviceSlot>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Registry opening real serial ports and sockets.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SystemConnector::default()))
    }

    /// Registry using a custom [`Connector`].
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            settings: RegistrySettings::default(),
            devices: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Replace the default tunables.
    pub fn with_settings(mut self, settings: RegistrySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Add a device in the `Closed` state with default parameters.
    pub fn register(&self, config: DeviceConfig) -> LabResult<()> {
        if !config.id.is_well_formed() {
            return Err(LabError::Config(format!(
                "device id '{}' must be lowercase letters, digits or '_'",
                config.id
            )));
        }

        let mut devices = self.devices.write();
        if devices.contains_key(&config.id) {
            return Err(LabError::Config(format!("device '{}' is already registered", config.id)));
        }
        let resource = config.driver.resource();
        if let Some(other) = devices.values().find(|d| d.config.driver.resource() == resource) {
            return Err(LabError::Config(format!(
                "{} is already claimed by '{}'",
                resource, other.config.id
            )));
        }

        let parameters = ParameterSet::with_defaults(config.id.clone(), drivers::specs_for(config.driver.class()));
        tracing::info!(
            device = %config.id,
            driver = config.driver.driver_name(),
            resource = %resource,
            simulated = config.simulated,
            "Registered device"
        );
        devices.insert(
            config.id.clone(),
            Arc::new(DeviceSlot {
                config,
                lifecycle: tokio::sync::Mutex::new(()),
                inner: Mutex::new(SlotState {
                    state: ConnectionState::Closed,
                    parameters,
                    worker: None,
                    generation: 0,
                    failures: 0,
                }),
            }),
        );
        Ok(())
    }

    fn slot(&self, id: &DeviceId) -> LabResult<Arc<DeviceSlot>> {
        self.devices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LabError::NotFound(id.clone()))
    }

    fn transition(&self, slot: &DeviceSlot, state: ConnectionState) {
        slot.inner.lock().state = state.clone();
        tracing::debug!(device = %slot.config.id, state = %state, "Connection state changed");
        // No subscribers is fine.
        let _ = self.events.send(RegistryEvent {
            device: slot.config.id.clone(),
            state,
            timestamp: Utc::now(),
        });
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Ids of every registered device, ordered.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.read().keys().cloned().collect()
    }

    /// Ids of devices currently `Open`.
    pub fn open_devices(&self) -> Vec<DeviceId> {
        self.devices
            .read()
            .values()
            .filter(|d| d.inner.lock().state.is_open())
            .map(|d| d.config.id.clone())
            .collect()
    }

    /// List all registered devices.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .read()
            .values()
            .map(|d| DeviceInfo {
                id: d.config.id.clone(),
                name: d.config.name.clone(),
                driver_type: d.config.driver.driver_name().to_string(),
                class: d.config.driver.class(),
                resource: d.config.driver.resource(),
                simulated: d.config.simulated,
                state: d.inner.lock().state.clone(),
            })
            .collect()
    }

    /// Configuration a device was registered with.
    pub fn config(&self, id: &DeviceId) -> LabResult<DeviceConfig> {
        Ok(self.slot(id)?.config.clone())
    }

    /// Current connection state.
    pub fn state(&self, id: &DeviceId) -> LabResult<ConnectionState> {
        Ok(self.slot(id)?.inner.lock().state.clone())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the transport, run the handshake and start the device worker.
    ///
    /// Connecting an `Open` device is a no-op. Fails with
    /// [`LabError::Connection`], leaving the device in `Error`.
    #[tracing::instrument(skip_all, fields(device = %id), err)]
    pub async fn connect(&self, id: &DeviceId) -> LabResult<()> {
        let slot = self.slot(id)?;
        let _lifecycle = slot.lifecycle.lock().await;

        if slot.inner.lock().state.is_open() {
            return Ok(());
        }
        self.transition(&slot, ConnectionState::Opening);

        let transport = match self.connector.open(&slot.config).await {
            Ok(transport) => transport,
            Err(e) => return Err(self.connect_failed(&slot, e.to_string())),
        };
        let resource = transport.resource().to_string();

        let mut driver = Driver::build(
            id.clone(),
            slot.config.driver.class(),
            transport,
            self.settings.command_timeout,
        );
        if let Err(e) = driver.handshake().await {
            driver.close().await;
            return Err(self.connect_failed(&slot, format!("handshake failed: {}", e)));
        }

        let worker = WorkerHandle::spawn(id.clone(), driver);
        {
            let mut inner = slot.inner.lock();
            inner.worker = Some(worker);
            inner.generation += 1;
            inner.failures = 0;
        }
        self.transition(&slot, ConnectionState::Open);
        tracing::info!(device = %id, resource = %resource, "Device connected");
        Ok(())
    }

    fn connect_failed(&self, slot: &DeviceSlot, reason: String) -> LabError {
        self.transition(slot, ConnectionState::Error { reason: reason.clone() });
        LabError::Connection {
            device: slot.config.id.clone(),
            reason,
        }
    }

    /// Stop the device worker and release the transport.
    ///
    /// Safe on devices that are already closed or unknown. An in-flight
    /// command fails with [`LabError::NotOpen`].
    #[tracing::instrument(skip_all, fields(device = %id))]
    pub async fn disconnect(&self, id: &DeviceId) {
        let Ok(slot) = self.slot(id) else {
            tracing::debug!(device = %id, "Disconnect of unknown device ignored");
            return;
        };
        let _lifecycle = slot.lifecycle.lock().await;

        let worker = slot.inner.lock().worker.take();
        if let Some(worker) = worker {
            worker.stop().await;
            tracing::info!(device = %id, "Device disconnected");
        }
        let already_closed = slot.inner.lock().state == ConnectionState::Closed;
        if !already_closed {
            self.transition(&slot, ConnectionState::Closed);
        }
    }

    /// Connect every registered device, returning the failures.
    pub async fn connect_all(&self) -> Vec<LabError> {
        let mut failures = Vec::new();
        for id in self.device_ids() {
            if let Err(e) = self.connect(&id).await {
                failures.push(e);
            }
        }
        failures
    }

    /// Disconnect every registered device.
    pub async fn disconnect_all(&self) {
        for id in self.device_ids() {
            self.disconnect(&id).await;
        }
    }

    /// Tear a device down into `Error` unless it has been reconnected since.
    async fn fail(&self, slot: &DeviceSlot, generation: u64, reason: String) {
        let _lifecycle = slot.lifecycle.lock().await;
        let worker = {
            let mut inner = slot.inner.lock();
            if inner.generation != generation || inner.worker.is_none() {
                return;
            }
            inner.worker.take()
        };
        if let Some(worker) = worker {
            worker.stop().await;
        }
        tracing::warn!(device = %slot.config.id, reason = %reason, "Device moved to error state");
        self.transition(slot, ConnectionState::Error { reason });
    }

    async fn record_outcome(&self, slot: &DeviceSlot, generation: u64, result: &LabResult<Reply>) {
        let err = match result {
            Ok(_) => {
                let mut inner = slot.inner.lock();
                if inner.generation == generation {
                    inner.failures = 0;
                }
                return;
            }
            Err(err) => err,
        };

        if err.is_transport_fault() {
            self.fail(slot, generation, err.to_string()).await;
        } else if err.is_degrading() {
            let failures = {
                let mut inner = slot.inner.lock();
                if inner.generation != generation {
                    return;
                }
                inner.failures += 1;
                inner.failures
            };
            if failures >= self.settings.max_consecutive_failures {
                let reason = format!("{} consecutive failures, last: {}", failures, err);
                self.fail(slot, generation, reason).await;
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Route a command to an open device and wait for its reply.
    ///
    /// Fails with [`LabError::NotFound`] for unknown ids and
    /// [`LabError::NotOpen`] unless the device is `Open`.
    pub async fn dispatch(&self, id: &DeviceId, command: Command) -> LabResult<Reply> {
        self.dispatch_within(id, command, None).await
    }

    /// [`dispatch`](Self::dispatch) with a bound on the command's run time.
    ///
    /// The bound is enforced by the device worker, so a timed-out command
    /// frees the device and counts toward `max_consecutive_failures` like any
    /// other timeout.
    pub async fn dispatch_within(&self, id: &DeviceId, command: Command, limit: Option<Duration>) -> LabResult<Reply> {
        let slot = self.slot(id)?;
        let (submitter, generation) = {
            let inner = slot.inner.lock();
            match (&inner.state, &inner.worker) {
                (ConnectionState::Open, Some(worker)) => (worker.submitter(), inner.generation),
                (state, _) => {
                    return Err(LabError::NotOpen {
                        device: id.clone(),
                        state: state.to_string(),
                    })
                }
            }
        };

        let result = submitter.submit_within(command, limit).await;
        self.record_outcome(&slot, generation, &result).await;
        result
    }

    /// Resolve `key` and validate `value` against the device's declared
    /// parameters without touching memory or hardware.
    fn resolve(&self, slot: &DeviceSlot, key: &str, value: &ParameterValue) -> LabResult<Vec<(ParameterKey, ParameterValue)>> {
        let inner = slot.inner.lock();
        inner
            .parameters
            .resolve(key)?
            .into_iter()
            .map(|k| {
                let normalized = inner.parameters.validate(&k, value)?;
                Ok((k, normalized))
            })
            .collect()
    }

    /// Validate, transmit and record a parameter.
    ///
    /// An unindexed per-channel key follows the generator's `channel`
    /// selector (0 writes every channel). Nothing is sent when validation
    /// fails; the in-memory value is updated only after the device accepted
    /// the write.
    pub async fn write_parameter(&self, id: &DeviceId, key: &str, value: ParameterValue) -> LabResult<()> {
        let slot = self.slot(id)?;
        for (key, value) in self.resolve(&slot, key, &value)? {
            self.dispatch(
                id,
                Command::WriteParameter {
                    key: key.clone(),
                    value: value.clone(),
                },
            )
            .await?;
            slot.inner.lock().parameters.set(&key, &value)?;
        }
        Ok(())
    }

    /// Validate and record a parameter in memory only.
    pub fn stage_parameter(&self, id: &DeviceId, key: &str, value: ParameterValue) -> LabResult<()> {
        let slot = self.slot(id)?;
        let entries = self.resolve(&slot, key, &value)?;
        let mut inner = slot.inner.lock();
        for (key, value) in entries {
            inner.parameters.set(&key, &value)?;
        }
        Ok(())
    }

    /// Replace several in-memory values at once; all or nothing.
    pub fn replace_parameters(&self, id: &DeviceId, values: &BTreeMap<String, ParameterValue>) -> LabResult<()> {
        self.slot(id)?.inner.lock().parameters.replace_all(values)
    }

    /// Copy of the device's in-memory parameter set.
    pub fn parameters(&self, id: &DeviceId) -> LabResult<ParameterSet> {
        Ok(self.slot(id)?.inner.lock().parameters.clone())
    }

    /// Push the whole in-memory parameter set to the device.
    ///
    /// Entries go out in the order the class declares its parameters, with
    /// outputs such as laser emission last. The first failure stops the
    /// apply: entries before it are on the device, the rest were never sent,
    /// and memory is left as it was so a later apply retries them.
    pub async fn apply_parameters(&self, id: &DeviceId) -> LabResult<()> {
        let entries: Vec<(ParameterKey, ParameterValue)> = {
            let slot = self.slot(id)?;
            let inner = slot.inner.lock();
            let entries = inner.parameters.iter().map(|(k, v)| (k, v.clone())).collect();
            entries
        };
        tracing::info!(device = %id, count = entries.len(), "Applying parameters");
        self.dispatch(id, Command::Apply(entries)).await.map(|_| ())
    }

    /// Read live status.
    pub async fn read_status(&self, id: &DeviceId) -> LabResult<StatusSnapshot> {
        self.read_status_within(id, None).await
    }

    /// Read live status, giving the device at most `timeout` once the read
    /// starts.
    pub async fn read_status_within(&self, id: &DeviceId, timeout: Option<Duration>) -> LabResult<StatusSnapshot> {
        match self.dispatch_within(id, Command::ReadStatus, timeout).await? {
            Reply::Status(snapshot) => Ok(snapshot),
            other => Err(unexpected(id, "read_status", &other)),
        }
    }

    /// Set a generator's output frequency; channel 0 addresses all channels.
    pub async fn set_frequency(&self, id: &DeviceId, frequency_hz: f64, channel: u8) -> LabResult<()> {
        self.dispatch(id, Command::SetFrequency { frequency_hz, channel })
            .await
            .map(|_| ())
    }

    /// Measure the amplitude at `frequency_hz` on an analyzer.
    pub async fn measure_at(&self, id: &DeviceId, frequency_hz: f64) -> LabResult<f64> {
        match self.dispatch(id, Command::MeasureAt { frequency_hz }).await? {
            Reply::Amplitude(amplitude) => Ok(amplitude),
            other => Err(unexpected(id, "measure_at", &other)),
        }
    }

    /// Acquire an analyzer trace as `(frequency_hz, amplitude)` pairs, from
    /// one sweep or averaged over the configured `average_count`.
    pub async fn acquire_trace(&self, id: &DeviceId, averaged: bool) -> LabResult<Vec<(f64, f64)>> {
        match self.dispatch(id, Command::AcquireTrace { averaged }).await? {
            Reply::Trace(trace) => Ok(trace),
            other => Err(unexpected(id, "acquire_trace", &other)),
        }
    }

    /// Run a class-specific action.
    pub async fn action(&self, id: &DeviceId, action: Action) -> LabResult<()> {
        self.dispatch(id, Command::Action(action)).await.map(|_| ())
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected(id: &DeviceId, operation: &str, reply: &Reply) -> LabError {
    LabError::device(id, operation, format!("unexpected reply {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str, port: &str) -> DeviceConfig {
        DeviceConfig {
            id: DeviceId::new(id),
            name: "Stage".into(),
            driver: DriverType::EcoVario { port: port.into() },
            simulated: true,
        }
    }

    #[test]
    fn driver_config_from_toml() {
        let config: DeviceConfig = toml::from_str(
            r#"
            id = "fsv"
            name = "Analyzer"
            [driver]
            type = "fsv3000"
            host = "10.0.0.5"
            "#,
        )
        .unwrap();

        assert_eq!(config.driver.class(), InstrumentClass::SpectrumAnalyzer);
        assert_eq!(config.driver.resource(), "tcp:10.0.0.5:5025");
        assert!(!config.simulated);
    }

    #[test]
    fn duplicate_resource_is_refused() {
        let registry = DeviceRegistry::new();
        registry.register(stage("stage0", "/dev/ttyS0")).unwrap();

        let err = registry.register(stage("stage1", "/dev/ttyS0")).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
        assert!(matches!(
            registry.register(stage("stage0", "/dev/ttyS1")),
            Err(LabError::Config(_))
        ));
    }

    #[test]
    fn malformed_id_is_refused() {
        let registry = DeviceRegistry::new();
        assert!(registry.register(stage("Stage 0", "/dev/ttyS0")).is_err());
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let registry = DeviceRegistry::new();
        let err = registry.read_status(&DeviceId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, LabError::NotFound(_)));
        // Always succeeds.
        registry.disconnect(&DeviceId::new("ghost")).await;
    }

    #[test]
    fn staged_values_are_validated() {
        let registry = DeviceRegistry::new();
        registry.register(stage("stage0", "/dev/ttyS0")).unwrap();
        let id = DeviceId::new("stage0");

        registry
            .stage_parameter(&id, "target_position", ParameterValue::Float(12.5))
            .unwrap();
        assert!(registry
            .stage_parameter(&id, "target_position", ParameterValue::Float(-1.0))
            .is_err());
        assert_eq!(
            registry.parameters(&id).unwrap().get("target_position"),
            Some(&ParameterValue::Float(12.5))
        );
    }
}
