//! # labsync
//!
//! Headless acquisition and sweep engine for an optics bench with a linear
//! stage, a diode laser, a four-channel function generator and a spectrum
//! analyzer.
//!
//! The workspace is split along the same lines as the runtime:
//!
//! - **`labsync-core`**: error taxonomy, device identity, the typed parameter
//!   model and status snapshots.
//! - **`labsync-hardware`**: transports, instrument drivers, simulated
//!   instruments and the [`DeviceRegistry`](labsync_hardware::DeviceRegistry).
//! - **`labsync-experiment`**: the logarithmic Bode sweep.
//!
//! This crate ties them together for the `labsync` binary:
//!
//! - [`config`]: Figment-based configuration (`config/labsync.toml` + `LABSYNC_*`)
//! - [`logging`]: `tracing-subscriber` setup
//! - [`acquisition`]: the periodic status poller
//! - [`preset`]: TOML parameter presets

pub mod acquisition;
pub mod config;
pub mod logging;
pub mod preset;

pub use acquisition::{AcquisitionHandle, AcquisitionLoop};
pub use config::{ConfigError, LabsyncConfig};
pub use preset::{PresetRecord, PresetStore};

pub use labsync_core as core;
pub use labsync_experiment as experiment;
pub use labsync_hardware as hardware;
