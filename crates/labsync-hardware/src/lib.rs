//! Hardware layer of labsync.
//!
//! - [`transport`]: byte links to instruments (serial, TCP, simulated) and
//!   the [`Connector`](transport::Connector) that opens them
//! - [`drivers`]: one driver per instrument, unified by [`drivers::Driver`]
//! - [`sim`]: in-process instruments speaking the real protocols
//! - [`registry`]: device descriptors, connection state and command routing
//!
//! Each open device is served by its own worker task (see `worker`), so a
//! blocked read on one link never stalls another device.

pub mod drivers;
pub mod registry;
pub mod sim;
pub mod transport;
mod worker;

pub use drivers::{Action, Command, Reply};
pub use registry::{DeviceConfig, DeviceInfo, DeviceRegistry, DriverType, RegistryEvent, RegistrySettings};
pub use sim::{SimBehavior, SimHandle, SimulatedConnector};
pub use transport::{Connector, SystemConnector};
