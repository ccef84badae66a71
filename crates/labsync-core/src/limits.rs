//! Shared constants for transports, timeouts and instrument ranges.
//!
//! Baud rates are fixed per instrument class and are not user-negotiable.

use std::time::Duration;

// =============================================================================
// Transport Parameters
// =============================================================================

/// Stage servo controller (RS232).
pub const STAGE_BAUD: u32 = 9600;
/// Function generator (RS232).
pub const GENERATOR_BAUD: u32 = 9600;
/// Laser (USB virtual serial port).
pub const LASER_BAUD: u32 = 500_000;
/// Default SCPI raw-socket port of the spectrum analyzer.
pub const ANALYZER_TCP_PORT: u16 = 5025;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Bound for opening a serial port or a TCP connection.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default per-call bound for a single command/response exchange.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound for analyzer operations that wait on `*OPC?`/`*WAI` (a full sweep).
pub const ANALYZER_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound for the laser controller to answer again after `RsC`.
pub const LASER_RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between reads while waiting for the laser controller to restart.
pub const LASER_RESET_RETRY: Duration = Duration::from_millis(100);

/// Default acquisition polling interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default bound on one status read inside the acquisition loop.
pub const STATUS_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default settling delay between setting the generator and measuring.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Timeouts and device errors in a row before a device is moved to Error.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

// =============================================================================
// Instrument Ranges
// =============================================================================

/// Upper bound of the function generator output frequency (40 MHz).
pub const GENERATOR_MAX_FREQUENCY_HZ: f64 = 40.0e6;

/// Number of generator output channels.
pub const GENERATOR_CHANNELS: u8 = 4;

/// Generator channel driven by the Bode sweep.
pub const SWEEP_GENERATOR_CHANNEL: u8 = 1;

/// Upper bound of the analyzer frequency axis (4 GHz).
pub const ANALYZER_MAX_FREQUENCY_HZ: f64 = 4.0e9;

/// Maximum stage travel in mm.
pub const STAGE_MAX_TRAVEL_MM: f64 = 1000.0;
