//! TTi TGA1244 Function Generator Driver
//!
//! Protocol Overview:
//! - Format: ASCII over RS-232, `\n` terminated
//! - Baud: 9600, 8N1, no flow control
//! - Settings are write-only: `<COMMAND> <value>`; the instrument never
//!   acknowledges them
//! - Settings apply to the selected channel; `SETUPCH<n>` selects channel n and
//!   is only sent when the selection changes
//! - Queries (`*IDN?`, `EER?`) answer one line
//!
//! Because settings are not acknowledged, the driver mirrors every written
//! value and reports the mirror in its status next to the execution error
//! register.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use labsync_core::capabilities::{FrequencySource, Readable, Writable};
use labsync_core::error::{LabError, LabResult};
use labsync_core::limits::{GENERATOR_CHANNELS, GENERATOR_MAX_FREQUENCY_HZ};
use labsync_core::parameter::{self, ParameterKey, ParameterSpec, ParameterValue};
use labsync_core::status::StatusSnapshot;
use labsync_core::DeviceId;
use tracing::instrument;

use crate::transport::DynTransport;

const TERMINATOR: u8 = b'\n';

/// Output waveforms.
pub const WAVEFORMS: &[&str] = &["sine", "square", "triangle", "dc"];
/// Channel lock modes; `off` disables locking.
pub const LOCK_MODES: &[&str] = &["independent", "master", "slave", "off"];

/// Declared generator parameters.
pub static GENERATOR_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::int("channel", "", 0, GENERATOR_CHANNELS as i64, 1),
    ParameterSpec::choice("waveform", WAVEFORMS, "sine").per_channel(GENERATOR_CHANNELS),
    ParameterSpec::float("frequency", "Hz", 0.0, GENERATOR_MAX_FREQUENCY_HZ, 1000.0).per_channel(GENERATOR_CHANNELS),
    ParameterSpec::float("amplitude", "Vpp", 0.0, 20.0, 1.0).per_channel(GENERATOR_CHANNELS),
    ParameterSpec::float("offset", "V", -10.0, 10.0, 0.0).per_channel(GENERATOR_CHANNELS),
    ParameterSpec::float("phase", "deg", -360.0, 360.0, 0.0).per_channel(GENERATOR_CHANNELS),
    ParameterSpec::choice("lock_mode", LOCK_MODES, "off").per_channel(GENERATOR_CHANNELS),
    ParameterSpec::switch("output", false).per_channel(GENERATOR_CHANNELS),
];

/// Wire keyword for a waveform name.
fn waveform_keyword(name: &str) -> &'static str {
    match name {
        "square" => "square",
        "triangle" => "triag",
        "dc" => "dc",
        _ => "sine",
    }
}

fn lock_keyword(name: &str) -> Option<&'static str> {
    match name {
        "independent" => Some("INDEP"),
        "master" => Some("MASTER"),
        "slave" => Some("SLAVE"),
        _ => None,
    }
}

// =============================================================================
// GeneratorDriver
// =============================================================================

/// Driver for the TTi TGA1244 four-channel function generator.
pub struct GeneratorDriver {
    id: DeviceId,
    transport: DynTransport,
    timeout: Duration,
    /// Channel currently selected on the instrument, unknown until first set
    selected: Option<u8>,
    /// Last value written per key
    written: BTreeMap<String, ParameterValue>,
    identity: Option<String>,
}

impl GeneratorDriver {
    /// Wrap an open transport.
    pub fn new(id: DeviceId, transport: DynTransport, timeout: Duration) -> Self {
        Self {
            id,
            transport,
            timeout,
            selected: None,
            written: BTreeMap::new(),
            identity: None,
        }
    }

    /// Query the identity string.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn handshake(&mut self) -> LabResult<()> {
        let identity = self.query("*IDN?", "handshake").await?;
        if identity.is_empty() {
            return Err(LabError::device(&self.id, "handshake", "empty identity"));
        }
        tracing::info!(device = %self.id, identity = %identity, "Function generator answered");
        self.identity = Some(identity);
        Ok(())
    }

    /// Release the transport.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Forget a reply that is still in transit.
    pub(crate) fn mark_stale(&mut self) {
        self.transport.mark_stale();
    }

    async fn send(&mut self, line: &str, operation: &str) -> LabResult<()> {
        let frame = format!("{}\n", line);
        self.transport
            .write(frame.as_bytes())
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))
    }

    async fn query(&mut self, line: &str, operation: &str) -> LabResult<String> {
        self.send(line, operation).await?;
        let raw = self
            .transport
            .read_until(TERMINATOR, self.timeout)
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    async fn select(&mut self, channel: u8, operation: &str) -> LabResult<()> {
        if self.selected != Some(channel) {
            self.send(&format!("SETUPCH{}", channel), operation).await?;
            self.selected = Some(channel);
        }
        Ok(())
    }

    /// Transmit one validated per-channel setting.
    async fn write_channel(&mut self, name: &str, channel: u8, value: &ParameterValue) -> LabResult<()> {
        const OP: &str = "write_parameter";
        self.select(channel, OP).await?;

        match (name, value) {
            ("waveform", ParameterValue::Text(w)) => {
                self.send(&format!("WAVE {}", waveform_keyword(w)), OP).await?
            }
            ("frequency", v) => self.send(&format!("WAVFREQ {}", v), OP).await?,
            ("amplitude", v) => self.send(&format!("AMPL {}", v), OP).await?,
            ("offset", v) => self.send(&format!("DCOFFS {}", v), OP).await?,
            ("phase", v) => self.send(&format!("PHASE {}", v), OP).await?,
            ("lock_mode", ParameterValue::Text(mode)) => match lock_keyword(mode) {
                Some(keyword) => {
                    self.send(&format!("LOCKMODE {}", keyword), OP).await?;
                    self.send("LOCKSTAT ON", OP).await?;
                }
                None => self.send("LOCKSTAT OFF", OP).await?,
            },
            ("output", ParameterValue::Bool(true)) => {
                self.send("ZLOAD 50", OP).await?;
                self.send("OUTPUT ON", OP).await?;
            }
            ("output", ParameterValue::Bool(false)) => self.send("OUTPUT OFF", OP).await?,
            (other, _) => return Err(LabError::validation(&self.id, other, "unknown parameter")),
        }

        self.written
            .insert(ParameterKey::indexed(name, channel).to_string(), value.clone());
        Ok(())
    }
}

#[async_trait]
impl Writable for GeneratorDriver {
    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        GENERATOR_PARAMETERS
    }

    #[instrument(skip(self), fields(device = %self.id, key = %key, value = %value), err)]
    async fn write_parameter(&mut self, key: &ParameterKey, value: &ParameterValue) -> LabResult<()> {
        let value = parameter::validate(GENERATOR_PARAMETERS, &self.id, key, value)?;

        match key.channel {
            Some(channel) => self.write_channel(&key.name, channel, &value).await,
            None => {
                // Only the channel selector is unindexed.
                let channel = value.as_i64().unwrap_or_default();
                if let Ok(ch @ 1..=GENERATOR_CHANNELS) = u8::try_from(channel) {
                    self.select(ch, "write_parameter").await?;
                }
                self.written.insert(key.to_string(), value);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl FrequencySource for GeneratorDriver {
    /// Set the output frequency; channel 0 addresses every channel in turn.
    #[instrument(skip(self), fields(device = %self.id), err)]
    async fn set_frequency(&mut self, frequency_hz: f64, channel: u8) -> LabResult<()> {
        let channels: Vec<u8> = if channel == 0 {
            (1..=GENERATOR_CHANNELS).collect()
        } else {
            vec![channel]
        };

        let value = ParameterValue::Float(frequency_hz);
        let mut checked = Vec::with_capacity(channels.len());
        for ch in channels {
            let key = ParameterKey::indexed("frequency", ch);
            checked.push((ch, parameter::validate(GENERATOR_PARAMETERS, &self.id, &key, &value)?));
        }
        for (ch, value) in checked {
            self.write_channel("frequency", ch, &value).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Readable for GeneratorDriver {
    #[instrument(skip(self), fields(device = %self.id), err)]
    async fn read_status(&mut self) -> LabResult<StatusSnapshot> {
        let reply = self.query("EER?", "read_status").await?;
        let error_code = reply
            .parse::<i64>()
            .map_err(|_| LabError::device(&self.id, "read_status", format!("bad error register '{}'", reply)))?;

        let mut snapshot = StatusSnapshot::builder(&self.id).reading("error_code", error_code);
        if let Some(ch) = self.selected {
            snapshot = snapshot.reading("selected_channel", i64::from(ch));
        }
        if let Some(identity) = &self.identity {
            snapshot = snapshot.reading("identity", identity.as_str());
        }
        for (key, value) in &self.written {
            snapshot = snapshot.reading(key.clone(), value.clone());
        }
        if error_code != 0 {
            snapshot = snapshot.device_error(format!("execution error {}", error_code));
        }
        Ok(snapshot.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use tokio::io::AsyncReadExt;

    fn driver(device: tokio::io::DuplexStream) -> GeneratorDriver {
        GeneratorDriver::new(
            DeviceId::new("tga"),
            Box::new(StreamTransport::from_stream(device, "test")),
            Duration::from_millis(200),
        )
    }

    async fn drain(host: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_millis(50), host.read(&mut buf))
            .await
            .map(|r| r.unwrap())
            .unwrap_or(0);
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn channel_is_selected_once() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut tga = driver(device);

        tga.set_frequency(1000.0, 1).await.unwrap();
        tga.set_frequency(2000.0, 1).await.unwrap();

        assert_eq!(drain(&mut host).await, "SETUPCH1\nWAVFREQ 1000\nWAVFREQ 2000\n");
    }

    #[tokio::test]
    async fn channel_zero_sets_every_channel() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut tga = driver(device);

        tga.set_frequency(50.0, 0).await.unwrap();

        let sent = drain(&mut host).await;
        for ch in 1..=4 {
            assert!(sent.contains(&format!("SETUPCH{}\nWAVFREQ 50\n", ch)), "{}", sent);
        }
    }

    #[tokio::test]
    async fn frequency_above_limit_is_rejected_before_sending() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut tga = driver(device);

        let err = tga.set_frequency(41.0e6, 1).await.unwrap_err();
        assert!(matches!(err, LabError::Validation { .. }));
        assert_eq!(drain(&mut host).await, "");
    }

    #[tokio::test]
    async fn lock_mode_enables_lock_state() {
        let (mut host, device) = tokio::io::duplex(1024);
        let mut tga = driver(device);

        tga.write_parameter(&ParameterKey::indexed("lock_mode", 2), &"master".into())
            .await
            .unwrap();
        tga.write_parameter(&ParameterKey::indexed("output", 2), &ParameterValue::Bool(true))
            .await
            .unwrap();

        assert_eq!(
            drain(&mut host).await,
            "SETUPCH2\nLOCKMODE MASTER\nLOCKSTAT ON\nZLOAD 50\nOUTPUT ON\n"
        );
    }
}
