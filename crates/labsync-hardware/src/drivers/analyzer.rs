//! Rohde & Schwarz FSV3000 Spectrum Analyzer Driver
//!
//! Protocol Overview:
//! - Format: SCPI over a raw TCP socket (port 5025), `\n` terminated
//! - Several commands may share one line separated by `;`
//! - Settings are sent with a `;*OPC?` suffix; the analyzer answers `1` once
//!   the setting has been applied
//! - Traces are returned as comma-separated ASCII values after `FORM ASC`
//!
//! A measurement at frequency `f` centres the analyzer on `f` with a
//! resolution bandwidth of `f · 5e-3` (at least 1 Hz), triggers one single
//! sweep and reads back trace 1 together with its x axis. The amplitude is the
//! trace value at the x point nearest `f`.
//!
//! A full trace can also be acquired as it is: either one single sweep, or an
//! averaged run of `average_count` sweeps with trace 1 in `AVER` mode.

use std::time::Duration;

use async_trait::async_trait;
use labsync_core::capabilities::{Readable, Sweepable, Writable};
use labsync_core::error::{LabError, LabResult};
use labsync_core::limits::{ANALYZER_MAX_FREQUENCY_HZ, ANALYZER_OPERATION_TIMEOUT};
use labsync_core::parameter::{self, ParameterKey, ParameterSpec, ParameterValue};
use labsync_core::status::StatusSnapshot;
use labsync_core::DeviceId;
use tracing::instrument;

use crate::transport::DynTransport;

const TERMINATOR: u8 = b'\n';

/// Resolution bandwidth as a fraction of the measured frequency.
const BANDWIDTH_FRACTION: f64 = 5.0e-3;

/// Sweep modes.
pub const SWEEP_TYPES: &[&str] = &["swe", "fft"];
/// Amplitude units.
pub const UNITS: &[&str] = &["dbm", "v", "w", "dbuv"];

/// Declared analyzer parameters.
pub static ANALYZER_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::float("center_frequency", "Hz", 0.0, ANALYZER_MAX_FREQUENCY_HZ, 1.0e3),
    ParameterSpec::float("span", "Hz", 0.0, ANALYZER_MAX_FREQUENCY_HZ, 1.0e3),
    ParameterSpec::float("bandwidth", "Hz", 1.0, 10.0e6, 100.0),
    ParameterSpec::choice("sweep_type", SWEEP_TYPES, "swe"),
    ParameterSpec::choice("unit", UNITS, "dbm"),
    ParameterSpec::int("sweep_points", "", 101, 100_001, 2001),
    ParameterSpec::int("average_count", "", 0, 32_767, 64),
];

/// SCPI header for a parameter.
fn scpi_header(name: &str) -> Option<&'static str> {
    match name {
        "center_frequency" => Some("FREQ:CENT"),
        "span" => Some("FREQ:SPAN"),
        "bandwidth" => Some("BAND"),
        "sweep_type" => Some("SWE:TYPE"),
        "unit" => Some("UNIT:POW"),
        "sweep_points" => Some("SWE:POIN"),
        "average_count" => Some("AVER:COUN"),
        _ => None,
    }
}

/// Resolution bandwidth used when measuring at `frequency_hz`.
pub fn measurement_bandwidth(frequency_hz: f64) -> f64 {
    (frequency_hz * BANDWIDTH_FRACTION).max(1.0)
}

// =============================================================================
// AnalyzerDriver
// =============================================================================

/// Driver for the R&S FSV3000 signal and spectrum analyzer.
pub struct AnalyzerDriver {
    id: DeviceId,
    transport: DynTransport,
    timeout: Duration,
    span_hz: f64,
    sweep_type: String,
    average_count: i64,
    identity: Option<String>,
}

impl AnalyzerDriver {
    /// Wrap an open transport.
    pub fn new(id: DeviceId, transport: DynTransport, timeout: Duration) -> Self {
        Self {
            id,
            transport,
            timeout,
            span_hz: 1.0e3,
            sweep_type: "swe".into(),
            average_count: 64,
            identity: None,
        }
    }

    /// Query the identity string.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn handshake(&mut self) -> LabResult<()> {
        let identity = self.query("*IDN?", "handshake", self.timeout).await?;
        if identity.is_empty() {
            return Err(LabError::device(&self.id, "handshake", "empty identity"));
        }
        tracing::info!(device = %self.id, identity = %identity, "Spectrum analyzer answered");
        self.identity = Some(identity);
        Ok(())
    }

    /// Release the socket.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Forget a reply that is still in transit.
    pub(crate) fn mark_stale(&mut self) {
        self.transport.mark_stale();
    }

    async fn query(&mut self, line: &str, operation: &str, timeout: Duration) -> LabResult<String> {
        let frame = format!("{}\n", line);
        self.transport
            .write(frame.as_bytes())
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;
        let raw = self
            .transport
            .read_until(TERMINATOR, timeout)
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Send `line;*OPC?` and wait for completion.
    async fn command(&mut self, line: &str, operation: &str, timeout: Duration) -> LabResult<()> {
        let reply = self.query(&format!("{};*OPC?", line), operation, timeout).await?;
        if reply == "1" {
            Ok(())
        } else {
            Err(LabError::device(
                &self.id,
                operation,
                format!("'{}' not completed (reply '{}')", line, reply),
            ))
        }
    }

    async fn read_trace(&mut self, query: &str, operation: &str) -> LabResult<Vec<f64>> {
        let reply = self.query(query, operation, ANALYZER_OPERATION_TIMEOUT).await?;
        reply
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| LabError::device(&self.id, operation, format!("malformed trace reply to {}", query)))
    }

    /// Run one sweep on the current frequency window and return trace 1 as
    /// `(frequency_hz, amplitude)` pairs.
    async fn sweep(&mut self, averaged: bool, operation: &str) -> LabResult<Vec<(f64, f64)>> {
        let mode = if averaged { "AVER" } else { "WRIT" };
        let mut setup = vec![
            "ABOR".to_string(),
            "FORM ASC".to_string(),
            "INIT:CONT OFF".to_string(),
            format!("DISP:TRAC1:MODE {}", mode),
            format!("SWE:TYPE {}", self.sweep_type.to_uppercase()),
        ];
        if averaged {
            setup.push(format!("SWE:COUN {}", self.average_count));
        }
        for line in &setup {
            self.command(line, operation, self.timeout).await?;
        }
        self.command("INIT:IMM;*WAI", operation, ANALYZER_OPERATION_TIMEOUT).await?;

        let amplitudes = self.read_trace("TRAC:DATA? TRACE1", operation).await?;
        let frequencies = self.read_trace("TRAC:DATA:X? TRACE1", operation).await?;
        if amplitudes.is_empty() || amplitudes.len() != frequencies.len() {
            return Err(LabError::device(
                &self.id,
                operation,
                format!("trace has {} values for {} x points", amplitudes.len(), frequencies.len()),
            ));
        }
        Ok(frequencies.into_iter().zip(amplitudes).collect())
    }

    /// Acquire trace 1 over the configured window, from a single sweep or
    /// averaged over `average_count` sweeps.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn acquire_trace(&mut self, averaged: bool) -> LabResult<Vec<(f64, f64)>> {
        let trace = self.sweep(averaged, "acquire_trace").await?;
        tracing::debug!(device = %self.id, points = trace.len(), averaged, "Acquired trace");
        Ok(trace)
    }
}

#[async_trait]
impl Writable for AnalyzerDriver {
    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        ANALYZER_PARAMETERS
    }

    #[instrument(skip(self), fields(device = %self.id, key = %key, value = %value), err)]
    async fn write_parameter(&mut self, key: &ParameterKey, value: &ParameterValue) -> LabResult<()> {
        let value = parameter::validate(ANALYZER_PARAMETERS, &self.id, key, value)?;
        let header = scpi_header(&key.name)
            .ok_or_else(|| LabError::validation(&self.id, key.to_string(), "unknown parameter"))?;

        let argument = match &value {
            ParameterValue::Text(choice) => choice.to_uppercase(),
            other => other.to_string(),
        };
        self.command(&format!("{} {}", header, argument), "write_parameter", self.timeout)
            .await?;

        match (key.name.as_str(), &value) {
            ("span", ParameterValue::Float(span)) => self.span_hz = *span,
            ("sweep_type", ParameterValue::Text(kind)) => self.sweep_type = kind.clone(),
            ("average_count", ParameterValue::Int(count)) => self.average_count = *count,
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Sweepable for AnalyzerDriver {
    #[instrument(skip(self), fields(device = %self.id), err)]
    async fn measure_at(&mut self, frequency_hz: f64) -> LabResult<f64> {
        const OP: &str = "measure_at";
        let center = parameter::validate(
            ANALYZER_PARAMETERS,
            &self.id,
            &ParameterKey::plain("center_frequency"),
            &ParameterValue::Float(frequency_hz),
        )?;

        let window = [
            format!("FREQ:CENT {}", center),
            format!("FREQ:SPAN {}", self.span_hz),
            format!("BAND {}", measurement_bandwidth(frequency_hz)),
        ];
        for line in &window {
            self.command(line, OP, self.timeout).await?;
        }

        let trace = self.sweep(false, OP).await?;
        let amplitude = trace
            .iter()
            .min_by(|(a, _), (b, _)| {
                (*a - frequency_hz)
                    .abs()
                    .total_cmp(&(*b - frequency_hz).abs())
            })
            .map(|(_, amplitude)| *amplitude)
            .ok_or_else(|| LabError::device(&self.id, OP, "empty trace"))?;
        tracing::debug!(device = %self.id, frequency_hz, amplitude, "Measured point");
        Ok(amplitude)
    }
}

#[async_trait]
impl Readable for AnalyzerDriver {
    #[instrument(skip(self), fields(device = %self.id), err)]
    async fn read_status(&mut self) -> LabResult<StatusSnapshot> {
        let center = self.query("FREQ:CENT?", "read_status", self.timeout).await?;
        let span = self.query("FREQ:SPAN?", "read_status", self.timeout).await?;
        let error = self.query("SYST:ERR?", "read_status", self.timeout).await?;

        let parse = |raw: &str, what: &str| {
            raw.parse::<f64>()
                .map_err(|_| LabError::device(&self.id, "read_status", format!("bad {} '{}'", what, raw)))
        };
        let center = parse(&center, "center frequency")?;
        let span = parse(&span, "span")?;

        let (code, message) = error
            .split_once(',')
            .ok_or_else(|| LabError::device(&self.id, "read_status", format!("bad error queue reply '{}'", error)))?;
        let code = code
            .trim()
            .parse::<i64>()
            .map_err(|_| LabError::device(&self.id, "read_status", format!("bad error code '{}'", code)))?;

        let mut snapshot = StatusSnapshot::builder(&self.id)
            .reading("center_frequency", center)
            .reading("span", span)
            .reading("sweep_type", self.sweep_type.as_str())
            .reading("error_code", code);
        if let Some(identity) = &self.identity {
            snapshot = snapshot.reading("identity", identity.as_str());
        }
        if code != 0 {
            snapshot = snapshot.device_error(message.trim().trim_matches('"').to_string());
        }
        Ok(snapshot.build())
    }
}
