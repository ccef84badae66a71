//! Omicron LuxX+ Diode Laser Driver
//!
//! Protocol Overview:
//! - Format: ASCII over USB virtual serial port
//! - Baud: 500000, 8N1, no flow control
//! - Request: `?` + three-letter command + arguments + `\r`
//! - Reply: `!` + the same command + payload + `\r`; payload fields are
//!   separated by `|`
//! - Set commands answer `>` on success and `x` on failure
//!
//! Operating mode (`ROM`) indices:
//!
//! | Index | Mode |
//! |---|---|
//! | 0 | standby |
//! | 1 | CW, constant current (ACC) |
//! | 2 | CW, constant power (APC) |
//! | 3 | analog modulation |
//! | 4 | digital modulation |
//!
//! The driver keeps `modulation_mode` and `control_mode` as two parameters and
//! derives the index from the pair; modulation modes always run with ACC.

use std::time::Duration;

use async_trait::async_trait;
use labsync_core::capabilities::{Readable, Writable};
use labsync_core::error::{LabError, LabResult, TransportError};
use labsync_core::limits::{LASER_RESET_RETRY, LASER_RESET_TIMEOUT};
use labsync_core::parameter::{self, ParameterKey, ParameterSpec, ParameterValue};
use labsync_core::status::StatusSnapshot;
use labsync_core::DeviceId;
use tracing::instrument;

use crate::transport::DynTransport;

const TERMINATOR: u8 = b'\r';

/// Accepted reply of a set command.
const ACK: &str = ">";
/// Rejected reply of a set command.
const NAK: &str = "x";

/// Operating mode word disabling ad-hoc mode, written after power-on.
const STANDBY_NO_ADHOC: &str = "8000";

/// Status word bit: controller error.
const STATUS_ERROR: u32 = 0x0001;
/// Status word bit: laser emission on.
const STATUS_EMISSION: u32 = 0x0002;

/// Modulation modes, in parameter order.
pub const MODULATION_MODES: &[&str] = &["standby", "cw", "analog", "digital"];
/// Power control loops.
pub const CONTROL_MODES: &[&str] = &["acc", "apc"];

/// Declared laser parameters.
pub static LASER_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::choice("modulation_mode", MODULATION_MODES, "standby"),
    ParameterSpec::choice("control_mode", CONTROL_MODES, "acc"),
    ParameterSpec::float("power", "%", 0.0, 100.0, 0.0),
    ParameterSpec::switch("emission", false),
];

/// `ROM` index for a modulation/control pair.
pub fn operating_mode_index(modulation: &str, control: &str) -> Option<u8> {
    match (modulation, control) {
        ("standby", _) => Some(0),
        ("cw", "acc") => Some(1),
        ("cw", "apc") => Some(2),
        ("analog", _) => Some(3),
        ("digital", _) => Some(4),
        _ => None,
    }
}

fn operating_mode_name(index: u8) -> &'static str {
    match index {
        0 => "standby",
        1 => "cw_acc",
        2 => "cw_apc",
        3 => "analog",
        4 => "digital",
        5 => "analog_digital",
        _ => "unknown",
    }
}

// =============================================================================
// LaserDriver
// =============================================================================

/// Driver for Omicron LuxX+ lasers.
pub struct LaserDriver {
    id: DeviceId,
    transport: DynTransport,
    timeout: Duration,
    modulation: String,
    control: String,
    firmware: Option<String>,
    max_power_mw: Option<f64>,
}

impl LaserDriver {
    /// Wrap an open transport.
    pub fn new(id: DeviceId, transport: DynTransport, timeout: Duration) -> Self {
        Self {
            id,
            transport,
            timeout,
            modulation: "standby".into(),
            control: "acc".into(),
            firmware: None,
            max_power_mw: None,
        }
    }

    /// Read firmware and maximum power, power the controller on and leave it
    /// in standby without ad-hoc mode.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn handshake(&mut self) -> LabResult<()> {
        let firmware = self.query("GFw", "|", "handshake").await?.join("|");
        let max_power = self.query("GMP", "", "handshake").await?;
        let max_power_mw = max_power
            .first()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| LabError::device(&self.id, "handshake", format!("bad max power {:?}", max_power)))?;

        if let Err(e) = self.set("POn", "", "handshake").await {
            tracing::warn!(device = %self.id, error = %e, "Power-on refused; resetting controller");
            self.reset_controller().await?;
        }
        self.set("SOM", STANDBY_NO_ADHOC, "handshake").await?;

        tracing::info!(device = %self.id, firmware = %firmware, max_power_mw, "Laser controller ready");
        self.firmware = Some(firmware);
        self.max_power_mw = Some(max_power_mw);
        Ok(())
    }

    /// Reboot the controller and wait for it to answer again.
    ///
    /// The controller may print start-up lines before it acknowledges, so
    /// every line other than `!RsC>` is skipped until [`LASER_RESET_TIMEOUT`].
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn reset_controller(&mut self) -> LabResult<()> {
        const OP: &str = "reset_controller";
        self.transport
            .write(b"?RsC\r")
            .await
            .map_err(|e| LabError::from_transport(&self.id, OP, e))?;

        let deadline = tokio::time::Instant::now() + LASER_RESET_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let raw = self
                .transport
                .read_until(TERMINATOR, remaining)
                .await
                .map_err(|e| match e {
                    TransportError::Timeout(_) => {
                        LabError::from_transport(&self.id, OP, TransportError::Timeout(LASER_RESET_TIMEOUT))
                    }
                    other => LabError::from_transport(&self.id, OP, other),
                })?;

            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line == format!("!RsC{}", ACK) {
                tracing::info!(device = %self.id, "Laser controller restarted");
                return Ok(());
            }
            tracing::debug!(device = %self.id, line = %line, "Waiting for controller restart");
            tokio::time::sleep(LASER_RESET_RETRY).await;
        }
    }

    /// Release the transport.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Forget a reply that is still in transit.
    pub(crate) fn mark_stale(&mut self) {
        self.transport.mark_stale();
    }

    /// Maximum optical power reported during the handshake.
    pub fn max_power_mw(&self) -> Option<f64> {
        self.max_power_mw
    }

    /// Send `?CMDargs` and return the `|`-separated payload fields.
    async fn query(&mut self, command: &str, args: &str, operation: &str) -> LabResult<Vec<String>> {
        let frame = format!("?{}{}\r", command, args);
        self.transport
            .write(frame.as_bytes())
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;

        let raw = self
            .transport
            .read_until(TERMINATOR, self.timeout)
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;
        let reply = String::from_utf8_lossy(&raw).trim().to_string();

        let payload = reply
            .strip_prefix('!')
            .and_then(|rest| rest.strip_prefix(command))
            .ok_or_else(|| {
                LabError::device(&self.id, operation, format!("unexpected reply '{}' to {}", reply, command))
            })?;

        Ok(payload.split('|').map(str::to_string).collect())
    }

    /// Send a set command and require the `>` acknowledgement.
    async fn set(&mut self, command: &str, args: &str, operation: &str) -> LabResult<()> {
        let reply = self.query(command, args, operation).await?;
        match reply.first().map(String::as_str) {
            Some(ACK) => Ok(()),
            Some(NAK) => Err(LabError::device(&self.id, operation, format!("{} rejected by controller", command))),
            other => Err(LabError::device(
                &self.id,
                operation,
                format!("unexpected acknowledgement {:?} to {}", other, command),
            )),
        }
    }

    async fn apply_operating_mode(&mut self, modulation: &str, control: &str) -> LabResult<()> {
        let index = operating_mode_index(modulation, control).ok_or_else(|| {
            LabError::validation(&self.id, "modulation_mode", format!("no mode for {}/{}", modulation, control))
        })?;
        self.set("ROM", &index.to_string(), "write_parameter").await?;
        self.modulation = modulation.to_string();
        self.control = control.to_string();
        Ok(())
    }
}

#[async_trait]
impl Writable for LaserDriver {
    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        LASER_PARAMETERS
    }

    #[instrument(skip(self), fields(device = %self.id, key = %key, value = %value), err)]
    async fn write_parameter(&mut self, key: &ParameterKey, value: &ParameterValue) -> LabResult<()> {
        let value = parameter::validate(LASER_PARAMETERS, &self.id, key, value)?;

        match (key.name.as_str(), &value) {
            ("modulation_mode", ParameterValue::Text(mode)) => {
                let control = self.control.clone();
                self.apply_operating_mode(mode, &control).await
            }
            ("control_mode", ParameterValue::Text(control)) => {
                let modulation = self.modulation.clone();
                self.apply_operating_mode(&modulation, control).await
            }
            ("power", ParameterValue::Float(percent)) => {
                self.set("TPP", &percent.to_string(), "write_parameter").await
            }
            ("emission", ParameterValue::Bool(true)) => self.set("LOn", "", "write_parameter").await,
            ("emission", ParameterValue::Bool(false)) => self.set("LOf", "", "write_parameter").await,
            (name, _) => Err(LabError::validation(&self.id, name, "unknown parameter")),
        }
    }
}

#[async_trait]
impl Readable for LaserDriver {
    #[instrument(skip(self), fields(device = %self.id), err)]
    async fn read_status(&mut self) -> LabResult<StatusSnapshot> {
        let status = self.query("GAS", "", "read_status").await?;
        let status = parse_hex(&self.id, status.first(), "status word")?;

        let power = self.query("TTP", "", "read_status").await?;
        let power = power
            .first()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| LabError::device(&self.id, "read_status", format!("bad power reply {:?}", power)))?;

        let mode = self.query("ROM", "", "read_status").await?;
        let mode = mode
            .first()
            .and_then(|s| s.trim().parse::<u8>().ok())
            .ok_or_else(|| LabError::device(&self.id, "read_status", format!("bad mode reply {:?}", mode)))?;

        let failure = self.query("GLF", "", "read_status").await?;
        let failure = parse_hex(&self.id, failure.first(), "failure word")?;

        let mut snapshot = StatusSnapshot::builder(&self.id)
            .reading("emission", status & STATUS_EMISSION != 0)
            .reading("power", power)
            .reading("operating_mode", operating_mode_name(mode))
            .reading("failure_code", format!("{:#06x}", failure));
        if let Some(max) = self.max_power_mw {
            snapshot = snapshot.reading("power_mw", max * power / 100.0);
        }
        if let Some(firmware) = &self.firmware {
            snapshot = snapshot.reading("firmware", firmware.as_str());
        }
        if failure != 0 || status & STATUS_ERROR != 0 {
            snapshot = snapshot.device_error(format!("latched failure {:#06x}", failure));
        }
        Ok(snapshot.build())
    }
}

fn parse_hex(id: &DeviceId, field: Option<&String>, what: &str) -> LabResult<u32> {
    field
        .and_then(|s| u32::from_str_radix(s.trim(), 16).ok())
        .ok_or_else(|| LabError::device(id, "read_status", format!("bad {} {:?}", what, field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn driver(device: tokio::io::DuplexStream) -> LaserDriver {
        LaserDriver::new(
            DeviceId::new("laser1"),
            Box::new(StreamTransport::from_stream(device, "test")),
            Duration::from_millis(200),
        )
    }

    /// Answer each request with the given reply, returning the requests seen.
    fn fake_laser(host: tokio::io::DuplexStream, replies: Vec<&'static str>) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut seen = Vec::new();
            for reply in replies {
                let mut buf = Vec::new();
                host.read_until(b'\r', &mut buf).await.unwrap();
                seen.push(String::from_utf8_lossy(&buf).trim_end().to_string());
                host.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        })
    }

    #[test]
    fn mode_pairs_map_to_rom_indices() {
        assert_eq!(operating_mode_index("standby", "apc"), Some(0));
        assert_eq!(operating_mode_index("cw", "acc"), Some(1));
        assert_eq!(operating_mode_index("cw", "apc"), Some(2));
        assert_eq!(operating_mode_index("analog", "acc"), Some(3));
        assert_eq!(operating_mode_index("digital", "apc"), Some(4));
    }

    #[tokio::test]
    async fn power_uses_temporary_power_command() {
        let (host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);
        let fake = fake_laser(host, vec!["!TPP>\r"]);

        laser
            .write_parameter(&ParameterKey::plain("power"), &ParameterValue::Float(40.0))
            .await
            .unwrap();
        assert_eq!(fake.await.unwrap(), vec!["?TPP40"]);
    }

    #[tokio::test]
    async fn rejected_set_is_a_device_error() {
        let (host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);
        let _fake = fake_laser(host, vec!["!LOnx\r"]);

        let err = laser
            .write_parameter(&ParameterKey::plain("emission"), &ParameterValue::Bool(true))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Device { .. }));
    }

    #[tokio::test]
    async fn control_mode_change_keeps_modulation() {
        let (host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);
        let fake = fake_laser(host, vec!["!ROM>\r", "!ROM>\r"]);

        laser
            .write_parameter(&ParameterKey::plain("modulation_mode"), &"cw".into())
            .await
            .unwrap();
        laser
            .write_parameter(&ParameterKey::plain("control_mode"), &"apc".into())
            .await
            .unwrap();
        assert_eq!(fake.await.unwrap(), vec!["?ROM1", "?ROM2"]);
    }

    #[tokio::test]
    async fn status_reads_emission_and_power() {
        let (host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);
        let _fake = fake_laser(host, vec!["!GAS0002\r", "!TTP40\r", "!ROM4\r", "!GLF0000\r"]);

        let snapshot = laser.read_status().await.unwrap();
        assert_eq!(snapshot.reading("emission"), Some(&ParameterValue::Bool(true)));
        assert_eq!(snapshot.reading("power"), Some(&ParameterValue::Float(40.0)));
        assert_eq!(snapshot.reading("operating_mode"), Some(&ParameterValue::Text("digital".into())));
        assert!(snapshot.device_error.is_none());
    }

    #[tokio::test]
    async fn reset_waits_past_command_timeout_for_acknowledgement() {
        let (host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);
        let fake = tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut request = Vec::new();
            host.read_until(b'\r', &mut request).await.unwrap();
            host.get_mut().write_all(b"booting\r").await.unwrap();
            tokio::time::sleep(Duration::from_millis(2500)).await;
            host.get_mut().write_all(b"!RsC>\r").await.unwrap();
            request
        });

        let started = tokio::time::Instant::now();
        laser.reset_controller().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2500));
        assert_eq!(fake.await.unwrap(), b"?RsC\r");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_gives_up_after_reset_timeout() {
        let (_host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);

        let err = laser.reset_controller().await.unwrap_err();
        assert!(
            matches!(&err, LabError::Timeout { after, .. } if *after == LASER_RESET_TIMEOUT),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn power_above_hundred_percent_is_never_sent() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut laser = driver(device);

        let err = laser
            .write_parameter(&ParameterKey::plain("power"), &ParameterValue::Float(101.0))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation { .. }));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(20), host.read(&mut buf)).await;
        assert!(read.is_err(), "no frame may reach the laser");
    }
}
