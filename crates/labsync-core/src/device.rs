//! Device identity and connection state.

use serde::{Deserialize, Serialize};

// =============================================================================
// Identity
// =============================================================================

/// Unique device identifier (e.g., "stage0", "laser1", "fsv").
///
/// Format: lowercase alphanumeric with underscores. The instrument class is
/// carried by the device's driver configuration, the id only names the
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the id format: non-empty, lowercase ASCII letters, digits, `_`.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Instrument class. Selects the driver, the parameter specs and the fixed
/// transport parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentClass {
    /// Motorized linear stage
    Stage,
    /// Diode laser with modulation input
    Laser,
    /// Multi-channel function generator
    FrequencyGenerator,
    /// Network-attached spectrum analyzer
    SpectrumAnalyzer,
}

impl InstrumentClass {
    /// Physical link used by this class.
    pub fn transport_kind(self) -> TransportKind {
        match self {
            InstrumentClass::Stage | InstrumentClass::FrequencyGenerator => TransportKind::Rs232,
            InstrumentClass::Laser => TransportKind::UsbSerial,
            InstrumentClass::SpectrumAnalyzer => TransportKind::Tcp,
        }
    }

    /// Fixed baud rate, `None` for TCP.
    pub fn baud_rate(self) -> Option<u32> {
        match self {
            InstrumentClass::Stage => Some(crate::limits::STAGE_BAUD),
            InstrumentClass::FrequencyGenerator => Some(crate::limits::GENERATOR_BAUD),
            InstrumentClass::Laser => Some(crate::limits::LASER_BAUD),
            InstrumentClass::SpectrumAnalyzer => None,
        }
    }
}

impl std::fmt::Display for InstrumentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InstrumentClass::Stage => "stage",
            InstrumentClass::Laser => "laser",
            InstrumentClass::FrequencyGenerator => "frequency_generator",
            InstrumentClass::SpectrumAnalyzer => "spectrum_analyzer",
        };
        f.write_str(label)
    }
}

/// Physical link family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// RS232 serial port
    Rs232,
    /// USB virtual serial port
    UsbSerial,
    /// Raw TCP socket
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Rs232 => write!(f, "rs232"),
            TransportKind::UsbSerial => write!(f, "usb_serial"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Per-device connection state.
///
/// ```text
/// Closed ──connect──▶ Opening ──handshake ok──▶ Open
///   ▲                    │                        │
///   │               handshake failed       disconnect / transport fault
///   │                    ▼                        ▼
///   └──disconnect──── Error ◀─────────────── Closed / Error
/// ```
///
/// `Error` is left only by an explicit reconnect (back to `Opening`) or by a
/// disconnect (to `Closed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport held
    Closed,
    /// Transport opening or handshake in progress
    Opening,
    /// Ready for commands
    Open,
    /// Failed; needs an explicit reconnect
    Error {
        /// Last failure
        reason: String,
    },
}

impl ConnectionState {
    /// True only in the Open state.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Opening => write!(f, "opening"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Error { reason } => write!(f, "error: {}", reason),
        }
    }
}
