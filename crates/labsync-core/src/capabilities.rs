//! Instrument Capabilities
//!
//! Small async traits describing what an instrument driver can do. Every
//! driver is [`Readable`] and [`Writable`]; the spectrum analyzer is also
//! [`Sweepable`] and the function generator is a [`FrequencySource`].
//!
//! Drivers are owned by exactly one device worker task, so the methods take
//! `&mut self` and need no interior locking.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn bode_point<G, A>(generator: &mut G, analyzer: &mut A, f: f64) -> LabResult<f64>
//! where
//!     G: FrequencySource,
//!     A: Sweepable,
//! {
//!     generator.set_frequency(f, 1).await?;
//!     analyzer.measure_at(f).await
//! }
//! ```

use async_trait::async_trait;

use crate::error::LabResult;
use crate::parameter::{ParameterKey, ParameterSpec, ParameterValue};
use crate::status::StatusSnapshot;

/// Produces live status snapshots.
#[async_trait]
pub trait Readable: Send {
    /// Read the device's live status.
    ///
    /// Fails with a timeout when the device does not answer and with a device
    /// error on malformed or error-coded replies.
    async fn read_status(&mut self) -> LabResult<StatusSnapshot>;
}

/// Accepts validated parameter writes.
#[async_trait]
pub trait Writable: Send {
    /// Declared parameters of this instrument.
    fn parameter_specs(&self) -> &'static [ParameterSpec];

    /// Validate and transmit one parameter.
    ///
    /// Validation failures are returned before any frame reaches the
    /// transport.
    async fn write_parameter(&mut self, key: &ParameterKey, value: &ParameterValue) -> LabResult<()>;
}

/// Measures signal amplitude at a frequency.
#[async_trait]
pub trait Sweepable: Send {
    /// Trigger one measurement centred on `frequency_hz` and return the
    /// amplitude at that frequency in the analyzer's configured unit.
    async fn measure_at(&mut self, frequency_hz: f64) -> LabResult<f64>;
}

/// Produces a signal at a settable frequency.
#[async_trait]
pub trait FrequencySource: Send {
    /// Set the output frequency of `channel`.
    async fn set_frequency(&mut self, frequency_hz: f64, channel: u8) -> LabResult<()>;
}
