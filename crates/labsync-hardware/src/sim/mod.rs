//! Simulated Instruments
//!
//! In-process device models that speak the real wire protocols. Each one runs
//! as a tokio task on the far end of a `tokio::io::duplex` pipe, so drivers,
//! the device worker and the registry are exercised exactly as they are with
//! hardware attached.
//!
//! Simulations are used by:
//! - `--simulate` on the command line (every device, default behaviour)
//! - `simulated = true` on a single device in the configuration file
//! - tests, through [`SimulatedConnector`], which adds latency, silence and
//!   failure injection and exposes a [`SimHandle`] per device
//!
//! A [`SimHandle`] counts and logs every frame the instrument received and
//! mirrors the instrument's internal state into a register map, which is how
//! tests check that hardware state did (or did not) change.

mod analyzer;
mod generator;
mod laser;
mod stage;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labsync_core::error::TransportError;
use labsync_core::{DeviceId, InstrumentClass};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::registry::DeviceConfig;
use crate::transport::{Connector, DynTransport, StreamTransport};

pub use analyzer::low_pass_response;

/// Pipe capacity between driver and simulated instrument.
const PIPE_CAPACITY: usize = 64 * 1024;

// =============================================================================
// Behaviour and Handle
// =============================================================================

/// Knobs for a simulated instrument.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Delay before every reply
    pub latency: Duration,
    /// Swallow every frame without replying
    pub silent: bool,
    /// Analyzer only: the n-th trace query (0-based) returns a malformed trace
    pub fail_measurement_at: Option<usize>,
    /// Analyzer only: amplitude in dBm as a function of frequency in Hz
    pub amplitude_model: fn(f64) -> f64,
    /// Laser only: extra delay before acknowledging a controller reset
    pub reset_delay: Duration,
    /// Laser only: refuse this three-letter command with `x`
    pub rejected_command: Option<&'static str>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            silent: false,
            fail_measurement_at: None,
            amplitude_model: low_pass_response,
            reset_delay: Duration::ZERO,
            rejected_command: None,
        }
    }
}

impl SimBehavior {
    /// Reply after `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Never reply.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Corrupt the n-th trace query.
    pub fn failing_measurement_at(mut self, index: usize) -> Self {
        self.fail_measurement_at = Some(index);
        self
    }

    /// Take `delay` to come back from a laser controller reset.
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Make the laser refuse `command` as if the controller were faulted.
    pub fn rejecting(mut self, command: &'static str) -> Self {
        self.rejected_command = Some(command);
        self
    }

    /// Replace the analyzer's amplitude model.
    pub fn with_amplitude_model(mut self, model: fn(f64) -> f64) -> Self {
        self.amplitude_model = model;
        self
    }
}

/// Observation handle on a running simulated instrument.
#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    frames: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
    registers: Arc<Mutex<BTreeMap<String, String>>>,
}

impl SimHandle {
    /// Frames received since the instrument was spawned.
    pub fn frames_received(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Every frame received so far, terminator stripped, decoded lossily.
    pub fn frame_log(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    /// Current value of one internal register.
    pub fn register(&self, name: &str) -> Option<String> {
        self.registers.lock().get(name).cloned()
    }

    /// Copy of every internal register.
    pub fn registers(&self) -> BTreeMap<String, String> {
        self.registers.lock().clone()
    }
}

// =============================================================================
// Instrument Runner
// =============================================================================

/// How the instrument delimits incoming frames.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Framing {
    /// Frames end with this byte
    Line(u8),
    /// Frames have a fixed length
    Fixed(usize),
}

/// A protocol-level device model.
pub(crate) trait Instrument: Send + 'static {
    fn framing(&self) -> Framing;

    /// Process one frame and return the reply bytes (empty for none).
    fn respond(&mut self, frame: &[u8], registers: &mut BTreeMap<String, String>) -> Vec<u8>;

    /// Time the instrument needs before it answers `frame`, on top of the
    /// configured latency.
    fn busy_for(&self, _frame: &[u8]) -> Duration {
        Duration::ZERO
    }
}

/// Spawn the default model for `class` and return the driver side of the pipe.
pub fn spawn(class: InstrumentClass, behavior: SimBehavior) -> (DuplexStream, SimHandle) {
    let (driver_side, device_side) = tokio::io::duplex(PIPE_CAPACITY);
    let handle = SimHandle::default();

    match class {
        InstrumentClass::Stage => run(stage::SimStage::new(), device_side, behavior, handle.clone()),
        InstrumentClass::Laser => {
            let model = laser::SimLaser::new()
                .with_reset_delay(behavior.reset_delay)
                .rejecting(behavior.rejected_command);
            run(model, device_side, behavior, handle.clone())
        }
        InstrumentClass::FrequencyGenerator => {
            run(generator::SimGenerator::new(), device_side, behavior, handle.clone())
        }
        InstrumentClass::SpectrumAnalyzer => {
            let model = analyzer::SimAnalyzer::new(behavior.fail_measurement_at, behavior.amplitude_model);
            run(model, device_side, behavior, handle.clone())
        }
    }

    (driver_side, handle)
}

fn run<I: Instrument>(mut instrument: I, stream: DuplexStream, behavior: SimBehavior, handle: SimHandle) {
    {
        let mut registers = handle.registers.lock();
        instrument.respond(&[], &mut registers);
    }

    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        loop {
            let frame = match instrument.framing() {
                Framing::Line(terminator) => {
                    let mut buf = Vec::new();
                    match reader.read_until(terminator, &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if buf.last() == Some(&terminator) {
                                buf.pop();
                            }
                            buf
                        }
                    }
                }
                Framing::Fixed(len) => {
                    let mut buf = vec![0u8; len];
                    if reader.read_exact(&mut buf).await.is_err() {
                        break;
                    }
                    buf
                }
            };

            handle.frames.fetch_add(1, Ordering::SeqCst);
            handle.log.lock().push(frame.clone());
            let reply = {
                let mut registers = handle.registers.lock();
                instrument.respond(&frame, &mut registers)
            };

            if behavior.silent || reply.is_empty() {
                continue;
            }
            let delay = behavior.latency + instrument.busy_for(&frame);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if writer.write_all(&reply).await.is_err() {
                break;
            }
        }
        tracing::trace!("Simulated instrument stopped");
    });
}

// =============================================================================
// Simulated Connector
// =============================================================================

/// [`Connector`] that attaches every device to a simulated instrument.
///
/// Behaviour can be set per device before connecting, and the handle of the
/// most recent connection of each device can be retrieved afterwards.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    behaviors: Mutex<HashMap<DeviceId, SimBehavior>>,
    handles: Mutex<HashMap<DeviceId, SimHandle>>,
    refused: Mutex<HashSet<DeviceId>>,
}

impl SimulatedConnector {
    /// Connector with default behaviour for every device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behaviour used by the next connection of `id`.
    pub fn set_behavior(&self, id: impl Into<DeviceId>, behavior: SimBehavior) {
        self.behaviors.lock().insert(id.into(), behavior);
    }

    /// Make opening `id` fail as if the port were missing.
    pub fn refuse(&self, id: impl Into<DeviceId>) {
        self.refused.lock().insert(id.into());
    }

    /// Allow opening `id` again.
    pub fn allow(&self, id: &DeviceId) {
        self.refused.lock().remove(id);
    }

    /// Handle of the latest connection of `id`.
    pub fn handle(&self, id: &DeviceId) -> Option<SimHandle> {
        self.handles.lock().get(id).cloned()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self, config: &DeviceConfig) -> Result<DynTransport, TransportError> {
        let resource = format!("sim:{}", config.id);
        if self.refused.lock().contains(&config.id) {
            return Err(TransportError::Open {
                resource,
                reason: "no such device".into(),
            });
        }

        let behavior = self.behaviors.lock().get(&config.id).cloned().unwrap_or_default();
        let (stream, handle) = spawn(config.driver.class(), behavior);
        self.handles.lock().insert(config.id.clone(), handle);

        Ok(Box::new(StreamTransport::from_stream(stream, resource)))
    }
}
