//! Live status snapshots published by the acquisition loop.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::ErrorKind;
use crate::parameter::ParameterValue;

/// Immutable, timestamped record of the last values read from one device.
///
/// A snapshot is built once by a driver's `read_status` and never mutated
/// afterwards; the acquisition loop replaces it wholesale on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Source device
    pub device: DeviceId,
    /// Time the read completed
    pub timestamp: DateTime<Utc>,
    /// Named readings (e.g. `position`, `error_code`, `emission`)
    pub readings: BTreeMap<String, ParameterValue>,
    /// Error reported by the device itself, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_error: Option<String>,
}

impl StatusSnapshot {
    /// Start building a snapshot for `device`.
    pub fn builder(device: &DeviceId) -> SnapshotBuilder {
        SnapshotBuilder {
            device: device.clone(),
            readings: BTreeMap::new(),
            device_error: None,
        }
    }

    /// Look up one reading.
    pub fn reading(&self, name: &str) -> Option<&ParameterValue> {
        self.readings.get(name)
    }
}

/// Accumulates readings before freezing them into a [`StatusSnapshot`].
#[derive(Debug)]
pub struct SnapshotBuilder {
    device: DeviceId,
    readings: BTreeMap<String, ParameterValue>,
    device_error: Option<String>,
}

impl SnapshotBuilder {
    /// Add a reading.
    pub fn reading(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.readings.insert(name.into(), value.into());
        self
    }

    /// Record an error code reported by the device.
    pub fn device_error(mut self, error: impl Into<String>) -> Self {
        self.device_error = Some(error.into());
        self
    }

    /// Timestamp and freeze.
    pub fn build(self) -> StatusSnapshot {
        StatusSnapshot {
            device: self.device,
            timestamp: Utc::now(),
            readings: self.readings,
            device_error: self.device_error,
        }
    }
}

/// Event published by the acquisition loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A read completed
    Snapshot(StatusSnapshot),
    /// A read failed; polling continues
    Fault {
        /// Device that failed
        device: DeviceId,
        /// Time the failure was observed
        timestamp: DateTime<Utc>,
        /// Failure category
        #[serde(skip)]
        kind: ErrorKind,
        /// Human-readable cause
        message: String,
    },
}

impl StatusEvent {
    /// Device the event refers to.
    pub fn device(&self) -> &DeviceId {
        match self {
            StatusEvent::Snapshot(s) => &s.device,
            StatusEvent::Fault { device, .. } => device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_readings() {
        let snap = StatusSnapshot::builder(&DeviceId::new("stage0"))
            .reading("position", 12.5)
            .reading("moving", false)
            .device_error("0x7310")
            .build();
        assert_eq!(snap.reading("position"), Some(&ParameterValue::Float(12.5)));
        assert_eq!(snap.device_error.as_deref(), Some("0x7310"));
    }
}
