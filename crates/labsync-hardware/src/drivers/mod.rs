//! Instrument Drivers
//!
//! One module per supported instrument. Each driver owns its transport and
//! implements the capability traits from [`labsync_core::capabilities`].
//!
//! | Driver | Instrument | Link | Capabilities |
//! |---|---|---|---|
//! | [`StageDriver`] | EcoVario servo stage | RS-232, 9600 | Readable, Writable |
//! | [`LaserDriver`] | Omicron LuxX+ | USB serial, 500000 | Readable, Writable |
//! | [`GeneratorDriver`] | TTi TGA1244 | RS-232, 9600 | Readable, Writable, FrequencySource |
//! | [`AnalyzerDriver`] | R&S FSV3000 | TCP 5025 | Readable, Writable, Sweepable |
//!
//! The device worker holds a [`Driver`], a tagged enum over the four drivers,
//! and feeds it [`Command`]s.

pub mod analyzer;
pub mod generator;
pub mod laser;
pub mod stage;

use std::time::Duration;

use labsync_core::capabilities::{FrequencySource, Readable, Sweepable, Writable};
use labsync_core::error::{LabError, LabResult};
use labsync_core::parameter::{ParameterKey, ParameterSpec, ParameterValue};
use labsync_core::status::StatusSnapshot;
use labsync_core::{DeviceId, InstrumentClass};

use crate::transport::DynTransport;

pub use analyzer::AnalyzerDriver;
pub use generator::GeneratorDriver;
pub use laser::LaserDriver;
pub use stage::StageDriver;

/// Declared parameters of an instrument class.
pub fn specs_for(class: InstrumentClass) -> &'static [ParameterSpec] {
    match class {
        InstrumentClass::Stage => stage::STAGE_PARAMETERS,
        InstrumentClass::Laser => laser::LASER_PARAMETERS,
        InstrumentClass::FrequencyGenerator => generator::GENERATOR_PARAMETERS,
        InstrumentClass::SpectrumAnalyzer => analyzer::ANALYZER_PARAMETERS,
    }
}

/// Sort `entries` into the order the class declares its parameters, so that
/// modes and levels are in place before outputs are switched on.
pub fn apply_order(class: InstrumentClass, entries: &mut [(ParameterKey, ParameterValue)]) {
    let specs = specs_for(class);
    let rank = |key: &ParameterKey| specs.iter().position(|s| s.name == key.name).unwrap_or(specs.len());
    entries.sort_by_key(|(key, _)| (rank(key), key.channel));
}

// =============================================================================
// Commands
// =============================================================================

/// Class-specific actions without a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stage: move to the target position
    Start,
    /// Stage: halt motion
    Stop,
    /// Stage: run the homing sequence
    Home,
    /// Stage: clear a latched fault
    ResetError,
    /// Laser: reboot the controller
    ResetController,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Home => "home",
            Action::ResetError => "reset_error",
            Action::ResetController => "reset_controller",
        };
        f.write_str(name)
    }
}

/// Work item executed by a device worker.
#[derive(Debug, Clone)]
pub enum Command {
    /// Validate and transmit one parameter
    WriteParameter {
        /// Concrete key
        key: ParameterKey,
        /// Value to write
        value: ParameterValue,
    },
    /// Write several parameters in declaration order, stopping at the first
    /// failure
    Apply(Vec<(ParameterKey, ParameterValue)>),
    /// Read live status
    ReadStatus,
    /// Generator: set output frequency on a channel (0 = all)
    SetFrequency {
        /// Frequency in Hz
        frequency_hz: f64,
        /// Channel 1-4, or 0 for every channel
        channel: u8,
    },
    /// Analyzer: measure amplitude at a frequency
    MeasureAt {
        /// Frequency in Hz
        frequency_hz: f64,
    },
    /// Analyzer: acquire trace 1 over the configured window
    AcquireTrace {
        /// Average over `average_count` sweeps instead of one
        averaged: bool,
    },
    /// Class-specific action
    Action(Action),
}

impl Command {
    /// Operation name used in errors and logs.
    pub fn operation(&self) -> String {
        match self {
            Command::WriteParameter { .. } => "write_parameter".into(),
            Command::Apply(_) => "apply_parameters".into(),
            Command::ReadStatus => "read_status".into(),
            Command::SetFrequency { .. } => "set_frequency".into(),
            Command::MeasureAt { .. } => "measure_at".into(),
            Command::AcquireTrace { .. } => "acquire_trace".into(),
            Command::Action(action) => action.to_string(),
        }
    }
}

/// Successful outcome of a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Command applied
    Done,
    /// Live status
    Status(StatusSnapshot),
    /// Measured amplitude
    Amplitude(f64),
    /// `(frequency_hz, amplitude)` pairs in sweep order
    Trace(Vec<(f64, f64)>),
}

// =============================================================================
// Driver
// =============================================================================

/// Any supported instrument driver.
pub enum Driver {
    /// Servo stage
    Stage(StageDriver),
    /// Diode laser
    Laser(LaserDriver),
    /// Function generator
    Generator(GeneratorDriver),
    /// Spectrum analyzer
    Analyzer(AnalyzerDriver),
}

impl Driver {
    /// Build the driver for `class` on an open transport.
    pub fn build(id: DeviceId, class: InstrumentClass, transport: DynTransport, timeout: Duration) -> Self {
        match class {
            InstrumentClass::Stage => Driver::Stage(StageDriver::new(id, transport, timeout)),
            InstrumentClass::Laser => Driver::Laser(LaserDriver::new(id, transport, timeout)),
            InstrumentClass::FrequencyGenerator => {
                Driver::Generator(GeneratorDriver::new(id, transport, timeout))
            }
            InstrumentClass::SpectrumAnalyzer => {
                Driver::Analyzer(AnalyzerDriver::new(id, transport, timeout))
            }
        }
    }

    /// Instrument class of this driver.
    pub fn class(&self) -> InstrumentClass {
        match self {
            Driver::Stage(_) => InstrumentClass::Stage,
            Driver::Laser(_) => InstrumentClass::Laser,
            Driver::Generator(_) => InstrumentClass::FrequencyGenerator,
            Driver::Analyzer(_) => InstrumentClass::SpectrumAnalyzer,
        }
    }

    /// Confirm the instrument answers and bring it to a known state.
    pub async fn handshake(&mut self) -> LabResult<()> {
        match self {
            Driver::Stage(d) => d.handshake().await,
            Driver::Laser(d) => d.handshake().await,
            Driver::Generator(d) => d.handshake().await,
            Driver::Analyzer(d) => d.handshake().await,
        }
    }

    /// Release the transport.
    pub async fn close(&mut self) {
        match self {
            Driver::Stage(d) => d.close().await,
            Driver::Laser(d) => d.close().await,
            Driver::Generator(d) => d.close().await,
            Driver::Analyzer(d) => d.close().await,
        }
    }

    /// Forget the reply of a command that was cut short.
    pub fn abandon(&mut self) {
        match self {
            Driver::Stage(d) => d.mark_stale(),
            Driver::Laser(d) => d.mark_stale(),
            Driver::Generator(d) => d.mark_stale(),
            Driver::Analyzer(d) => d.mark_stale(),
        }
    }

    fn writable(&mut self) -> &mut dyn Writable {
        match self {
            Driver::Stage(d) => d,
            Driver::Laser(d) => d,
            Driver::Generator(d) => d,
            Driver::Analyzer(d) => d,
        }
    }

    fn readable(&mut self) -> &mut dyn Readable {
        match self {
            Driver::Stage(d) => d,
            Driver::Laser(d) => d,
            Driver::Generator(d) => d,
            Driver::Analyzer(d) => d,
        }
    }

    /// Run one command to completion.
    pub async fn execute(&mut self, device: &DeviceId, command: Command) -> LabResult<Reply> {
        let unsupported = |command: &Command| LabError::Unsupported {
            device: device.clone(),
            operation: command.operation(),
        };

        match (self, command) {
            (driver, Command::WriteParameter { key, value }) => {
                driver.writable().write_parameter(&key, &value).await?;
                Ok(Reply::Done)
            }
            (driver, Command::Apply(mut entries)) => {
                apply_order(driver.class(), &mut entries);
                let writable = driver.writable();
                for (key, value) in &entries {
                    writable.write_parameter(key, value).await?;
                }
                Ok(Reply::Done)
            }
            (driver, Command::ReadStatus) => driver.readable().read_status().await.map(Reply::Status),
            (Driver::Generator(d), Command::SetFrequency { frequency_hz, channel }) => {
                d.set_frequency(frequency_hz, channel).await?;
                Ok(Reply::Done)
            }
            (Driver::Analyzer(d), Command::MeasureAt { frequency_hz }) => {
                d.measure_at(frequency_hz).await.map(Reply::Amplitude)
            }
            (Driver::Analyzer(d), Command::AcquireTrace { averaged }) => {
                d.acquire_trace(averaged).await.map(Reply::Trace)
            }
            (Driver::Stage(d), Command::Action(action)) => {
                match action {
                    Action::Start => d.start().await?,
                    Action::Stop => d.stop().await?,
                    Action::Home => d.home().await?,
                    Action::ResetError => d.reset_error().await?,
                    Action::ResetController => return Err(unsupported(&Command::Action(action))),
                }
                Ok(Reply::Done)
            }
            (Driver::Laser(d), Command::Action(Action::ResetController)) => {
                d.reset_controller().await?;
                Ok(Reply::Done)
            }
            (_, other) => Err(unsupported(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;

    fn idle_driver(class: InstrumentClass) -> Driver {
        let (_host, device) = tokio::io::duplex(64);
        Driver::build(
            DeviceId::new("dev"),
            class,
            Box::new(StreamTransport::from_stream(device, "test")),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn measure_on_generator_is_unsupported() {
        let mut driver = idle_driver(InstrumentClass::FrequencyGenerator);
        let err = driver
            .execute(&DeviceId::new("dev"), Command::MeasureAt { frequency_hz: 1e3 })
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn laser_has_no_homing() {
        let mut driver = idle_driver(InstrumentClass::Laser);
        let err = driver
            .execute(&DeviceId::new("dev"), Command::Action(Action::Home))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Unsupported { .. }));
    }

    #[test]
    fn laser_emission_is_applied_last() {
        let mut entries: Vec<(ParameterKey, ParameterValue)> = vec![
            (ParameterKey::plain("control_mode"), "apc".into()),
            (ParameterKey::plain("emission"), ParameterValue::Bool(true)),
            (ParameterKey::plain("modulation_mode"), "cw".into()),
            (ParameterKey::plain("power"), ParameterValue::Float(40.0)),
        ];
        apply_order(InstrumentClass::Laser, &mut entries);
        let names: Vec<_> = entries.iter().map(|(k, _)| k.name.as_str()).collect();
        assert_eq!(names, vec!["modulation_mode", "control_mode", "power", "emission"]);
    }

    #[test]
    fn generator_outputs_follow_their_settings() {
        let mut entries: Vec<(ParameterKey, ParameterValue)> = vec![
            (ParameterKey::indexed("output", 2), ParameterValue::Bool(true)),
            (ParameterKey::indexed("frequency", 2), ParameterValue::Float(1e3)),
            (ParameterKey::indexed("amplitude", 1), ParameterValue::Float(1.0)),
            (ParameterKey::indexed("frequency", 1), ParameterValue::Float(2e3)),
        ];
        apply_order(InstrumentClass::FrequencyGenerator, &mut entries);
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["frequency[1]", "frequency[2]", "amplitude[1]", "output[2]"]);
    }

    #[test]
    fn every_class_declares_parameters() {
        for class in [
            InstrumentClass::Stage,
            InstrumentClass::Laser,
            InstrumentClass::FrequencyGenerator,
            InstrumentClass::SpectrumAnalyzer,
        ] {
            assert!(!specs_for(class).is_empty());
            assert_eq!(idle_driver(class).class(), class);
        }
    }
}
