//! Error types shared by every labsync crate.
//!
//! `LabError` is the single error type surfaced by drivers, the device
//! registry, the sweep coordinator and the preset store. It is built with
//! `thiserror` so that callers can match on the failure category while still
//! getting a readable message with the device identity and the operation that
//! failed.
//!
//! ## Error Taxonomy
//!
//! - **`Connection`**: opening a transport or the handshake failed. Recoverable
//!   by an explicit reconnect.
//! - **`Timeout`**: the device did not answer within the per-call bound. The
//!   device stays Open; the failure is reported as a degraded status.
//! - **`Validation`**: a value is outside the declared range or choice list.
//!   Raised before any frame is sent.
//! - **`Device`**: the device answered with an error code or a malformed reply.
//! - **`Transport`**: the link itself broke (EOF, I/O error). The registry moves
//!   the device to the Error state.
//! - **`NotFound`** / **`NotOpen`** / **`Busy`** / **`Unsupported`**: routing
//!   and state errors raised by the registry and the sweep coordinator.
//! - **`Io`** / **`Parse`** / **`Config`**: preset store and configuration
//!   failures.
//!
//! [`TransportError`] is the narrower error produced by transport adapters,
//! which know nothing about device identity. Drivers lift it into `LabError`
//! with [`LabError::from_transport`].

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceId;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure raised by a transport adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The OS resource could not be opened (port busy, host unreachable).
    #[error("failed to open {resource}: {reason}")]
    Open {
        /// Port path or `host:port`
        resource: String,
        /// Underlying cause
        reason: String,
    },

    /// No complete frame arrived within the bound.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Read or write failed at the OS level.
    #[error("I/O failure: {0}")]
    Io(String),

    /// The peer closed the link, or the adapter was already closed.
    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                TransportError::Closed
            }
            _ => TransportError::Io(err.to_string()),
        }
    }
}

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification of a [`LabError`], used for state transitions and
/// status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport open or handshake failure
    Connection,
    /// No reply within the bound
    Timeout,
    /// Value rejected before transmission
    Validation,
    /// Error-coded or malformed reply
    Device,
    /// Broken link
    Transport,
    /// Unknown device id
    NotFound,
    /// Device not in the Open state
    NotOpen,
    /// A sweep is already running
    Busy,
    /// Operation not offered by this instrument class
    Unsupported,
    /// Filesystem failure
    Io,
    /// Malformed document
    Parse,
    /// Invalid configuration
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Device => "device",
            ErrorKind::Transport => "transport",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotOpen => "not_open",
            ErrorKind::Busy => "busy",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Io => "io",
            ErrorKind::Parse => "parse",
            ErrorKind::Config => "config",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// LabError
// =============================================================================

/// Convenience alias for results using the labsync error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Primary error type for labsync.
#[derive(Error, Debug)]
pub enum LabError {
    /// Transport open or handshake failed.
    #[error("{device}: connection failed: {reason}")]
    Connection {
        /// Device that failed to connect
        device: DeviceId,
        /// Underlying cause
        reason: String,
    },

    /// No response within the per-call bound.
    #[error("{device}: {operation} timed out after {after:?}")]
    Timeout {
        /// Device that did not answer
        device: DeviceId,
        /// Operation in flight
        operation: String,
        /// Bound that expired
        after: Duration,
    },

    /// Value outside the declared range or choice list. Never transmitted.
    #[error("{device}: invalid value for '{parameter}': {reason}")]
    Validation {
        /// Target device
        device: DeviceId,
        /// Parameter key
        parameter: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Error-coded or malformed reply from the device.
    #[error("{device}: {operation} failed: {reason}")]
    Device {
        /// Device that answered
        device: DeviceId,
        /// Operation in flight
        operation: String,
        /// Error code or parse failure
        reason: String,
    },

    /// The link broke while talking to the device.
    #[error("{device}: {operation} lost the link: {source}")]
    Transport {
        /// Device whose link failed
        device: DeviceId,
        /// Operation in flight
        operation: String,
        /// Transport-level cause
        #[source]
        source: TransportError,
    },

    /// No device registered under this id.
    #[error("unknown device '{0}'")]
    NotFound(DeviceId),

    /// The device is not in the Open state.
    #[error("{device}: not open ({state})")]
    NotOpen {
        /// Target device
        device: DeviceId,
        /// State observed when the command was refused
        state: String,
    },

    /// A sweep is already planning or running.
    #[error("busy: {0}")]
    Busy(String),

    /// The instrument class does not offer this operation.
    #[error("{device}: {operation} is not supported by this instrument")]
    Unsupported {
        /// Target device
        device: DeviceId,
        /// Requested operation
        operation: String,
    },

    /// Filesystem failure in the preset store or export.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed preset or configuration document.
    #[error("parse error: {0}")]
    Parse(String),

    /// Semantically invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LabError {
    /// Lift a transport failure into a device-scoped error.
    ///
    /// Timeouts stay recoverable ([`LabError::Timeout`]); everything else is a
    /// broken link ([`LabError::Transport`]).
    pub fn from_transport(
        device: &DeviceId,
        operation: impl Into<String>,
        err: TransportError,
    ) -> Self {
        match err {
            TransportError::Timeout(after) => LabError::Timeout {
                device: device.clone(),
                operation: operation.into(),
                after,
            },
            TransportError::Open { reason, .. } => LabError::Connection {
                device: device.clone(),
                reason,
            },
            other => LabError::Transport {
                device: device.clone(),
                operation: operation.into(),
                source: other,
            },
        }
    }

    /// Shorthand for a [`LabError::Device`].
    pub fn device(device: &DeviceId, operation: impl Into<String>, reason: impl Into<String>) -> Self {
        LabError::Device {
            device: device.clone(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`LabError::Validation`].
    pub fn validation(
        device: &DeviceId,
        parameter: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LabError::Validation {
            device: device.clone(),
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Connection { .. } => ErrorKind::Connection,
            LabError::Timeout { .. } => ErrorKind::Timeout,
            LabError::Validation { .. } => ErrorKind::Validation,
            LabError::Device { .. } => ErrorKind::Device,
            LabError::Transport { .. } => ErrorKind::Transport,
            LabError::NotFound(_) => ErrorKind::NotFound,
            LabError::NotOpen { .. } => ErrorKind::NotOpen,
            LabError::Busy(_) => ErrorKind::Busy,
            LabError::Unsupported { .. } => ErrorKind::Unsupported,
            LabError::Io(_) => ErrorKind::Io,
            LabError::Parse(_) => ErrorKind::Parse,
            LabError::Config(_) => ErrorKind::Config,
        }
    }

    /// True when the link is gone and the device must leave the Open state.
    #[must_use]
    pub fn is_transport_fault(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }

    /// True for failures that count towards the consecutive-failure limit.
    #[must_use]
    pub fn is_degrading(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Device)
    }
}
