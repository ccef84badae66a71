//! Core types and traits shared by the labsync crates.
//!
//! - [`error`]: the [`LabError`](error::LabError) taxonomy
//! - [`device`]: device identity, instrument classes and connection state
//! - [`parameter`]: typed parameters, constraints and parameter sets
//! - [`status`]: live status snapshots and acquisition events
//! - [`capabilities`]: the uniform driver contract
//! - [`serial`]: async stream helpers
//! - [`limits`]: fixed transport parameters, default timeouts and ranges

pub mod capabilities;
pub mod device;
pub mod error;
pub mod limits;
pub mod parameter;
pub mod serial;
pub mod status;

pub use device::{ConnectionState, DeviceId, InstrumentClass, TransportKind};
pub use error::{ErrorKind, LabError, LabResult, TransportError};
pub use parameter::{ParameterKey, ParameterSet, ParameterSpec, ParameterValue};
pub use status::{StatusEvent, StatusSnapshot};
