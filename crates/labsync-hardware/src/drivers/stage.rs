//! EcoVario Servo Stage Driver
//!
//! Protocol Overview:
//! - Format: binary SDO frames over RS-232
//! - Baud: 9600, 8N1, no flow control
//! - Frame: `[node, cmd, index_lo, index_hi, subindex, d0, d1, d2, d3, checksum]`
//! - Checksum: two's complement of the byte sum of the first nine bytes
//! - The controller echoes every request before sending its own reply, so a
//!   transaction reads 20 bytes: 10 echo bytes, then the reply
//!
//! Positions and rates are written in encoder units; the conversion factors
//! below turn millimetres into counts.

use std::time::Duration;

use async_trait::async_trait;
use labsync_core::capabilities::{Readable, Writable};
use labsync_core::error::{LabError, LabResult};
use labsync_core::limits::STAGE_MAX_TRAVEL_MM;
use labsync_core::parameter::{self, ParameterKey, ParameterSpec, ParameterValue};
use labsync_core::status::StatusSnapshot;
use labsync_core::DeviceId;
use tracing::instrument;

use crate::transport::DynTransport;

// =============================================================================
// Protocol Constants
// =============================================================================

pub(crate) const FRAME_LEN: usize = 10;
const NODE_ID: u8 = 0x01;

pub(crate) const CMD_WRITE: u8 = 0x22;
pub(crate) const CMD_READ: u8 = 0x40;
pub(crate) const CMD_WRITE_REPLY: u8 = 0x60;
pub(crate) const CMD_READ_REPLY: u8 = 0x43;
pub(crate) const CMD_ABORT: u8 = 0x80;

pub(crate) const CONTROL_START: i32 = 0x003F;
pub(crate) const CONTROL_STOP: i32 = 0x0037;
pub(crate) const CONTROL_RESET_ERROR: i32 = 0x01AF;
pub(crate) const CONTROL_HOMING_ENABLE: i32 = 0x000F;
pub(crate) const CONTROL_HOMING_START: i32 = 0x001F;

const HOMING_METHOD: i32 = 0x11;
const MODE_HOMING: i32 = 0x06;

/// Status word bit set once the target position is reached.
const STATUS_TARGET_REACHED: i64 = 0x0400;
/// Status word fault bit.
const STATUS_FAULT: i64 = 0x0008;

/// mm per position count.
const MM_PER_COUNT: f64 = 0.001_253_258;
/// mm/s per speed count.
const MM_S_PER_COUNT: f64 = 0.000_019_585;
/// mm/s² per acceleration count.
const MM_S2_PER_COUNT: f64 = 0.020_059_88;

/// Object dictionary indices.
pub(crate) mod object {
    pub const CONTROL_WORD: u16 = 0x6040;
    pub const STATUS_WORD: u16 = 0x6041;
    pub const ERROR_CODE: u16 = 0x603F;
    pub const OPERATION_MODE: u16 = 0x6060;
    pub const ACTUAL_POSITION: u16 = 0x6063;
    pub const TARGET_POSITION: u16 = 0x607A;
    pub const SPEED: u16 = 0x6081;
    pub const ACCELERATION: u16 = 0x6083;
    pub const DECELERATION: u16 = 0x6084;
    pub const HOMING_METHOD: u16 = 0x6098;
}

/// Declared stage parameters.
pub static STAGE_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::float("target_position", "mm", 0.0, STAGE_MAX_TRAVEL_MM, 0.0),
    ParameterSpec::float("speed", "mm/s", 0.0, 1000.0, 25.0),
    ParameterSpec::float("acceleration", "mm/s^2", 0.0, 20000.0, 501.3),
    ParameterSpec::float("deceleration", "mm/s^2", 0.0, 20000.0, 501.3),
];

/// Two's complement of the byte sum.
pub(crate) fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg()
}

/// Build one SDO frame.
pub(crate) fn encode_frame(cmd: u8, index: u16, data: i32) -> [u8; FRAME_LEN] {
    let [lo, hi] = index.to_le_bytes();
    let d = data.to_le_bytes();
    let mut frame = [NODE_ID, cmd, lo, hi, 0x00, d[0], d[1], d[2], d[3], 0];
    frame[FRAME_LEN - 1] = checksum(&frame[..FRAME_LEN - 1]);
    frame
}

fn to_counts(value: f64, unit_per_count: f64) -> i32 {
    (value / unit_per_count).round() as i32
}

// =============================================================================
// StageDriver
// =============================================================================

/// Driver for the EcoVario servo stage controller.
pub struct StageDriver {
    id: DeviceId,
    transport: DynTransport,
    timeout: Duration,
}

impl StageDriver {
    /// Wrap an open transport.
    pub fn new(id: DeviceId, transport: DynTransport, timeout: Duration) -> Self {
        Self { id, transport, timeout }
    }

    /// Confirm the controller answers by reading its status word.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn handshake(&mut self) -> LabResult<()> {
        let status = self.read_object(object::STATUS_WORD, "handshake").await?;
        tracing::info!(device = %self.id, status_word = format_args!("{:#06x}", status), "Stage controller answered");
        Ok(())
    }

    /// Move to the configured target position.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn start(&mut self) -> LabResult<()> {
        self.write_object(object::CONTROL_WORD, CONTROL_START, "start").await
    }

    /// Stop the current motion.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn stop(&mut self) -> LabResult<()> {
        self.write_object(object::CONTROL_WORD, CONTROL_STOP, "stop").await
    }

    /// Run the homing sequence.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn home(&mut self) -> LabResult<()> {
        self.write_object(object::CONTROL_WORD, CONTROL_HOMING_ENABLE, "home").await?;
        self.write_object(object::HOMING_METHOD, HOMING_METHOD, "home").await?;
        self.write_object(object::OPERATION_MODE, MODE_HOMING, "home").await?;
        self.write_object(object::CONTROL_WORD, CONTROL_HOMING_START, "home").await
    }

    /// Clear a latched controller fault.
    #[instrument(skip(self), fields(device = %self.id), err)]
    pub async fn reset_error(&mut self) -> LabResult<()> {
        self.write_object(object::CONTROL_WORD, CONTROL_RESET_ERROR, "reset_error").await
    }

    /// Release the transport.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Forget a reply that is still in transit.
    pub(crate) fn mark_stale(&mut self) {
        self.transport.mark_stale();
    }

    async fn write_object(&mut self, index: u16, value: i32, operation: &str) -> LabResult<()> {
        self.transaction(CMD_WRITE, index, value, operation).await.map(|_| ())
    }

    async fn read_object(&mut self, index: u16, operation: &str) -> LabResult<i32> {
        self.transaction(CMD_READ, index, 0, operation).await
    }

    /// Send one frame, check the echo and decode the reply payload.
    async fn transaction(&mut self, cmd: u8, index: u16, data: i32, operation: &str) -> LabResult<i32> {
        let request = encode_frame(cmd, index, data);
        self.transport
            .write(&request)
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;

        let bytes = self
            .transport
            .read_exact(2 * FRAME_LEN, self.timeout)
            .await
            .map_err(|e| LabError::from_transport(&self.id, operation, e))?;
        let (echo, reply) = bytes.split_at(FRAME_LEN);

        if echo != request {
            return Err(LabError::device(&self.id, operation, "echo does not match request"));
        }
        if checksum(&reply[..FRAME_LEN - 1]) != reply[FRAME_LEN - 1] {
            return Err(LabError::device(&self.id, operation, "reply checksum mismatch"));
        }

        let payload = i32::from_le_bytes([reply[5], reply[6], reply[7], reply[8]]);
        match reply[1] {
            CMD_ABORT => Err(LabError::device(
                &self.id,
                operation,
                format!("object {:#06x} aborted with code {:#010x}", index, payload),
            )),
            CMD_WRITE_REPLY if cmd == CMD_WRITE => Ok(payload),
            r if cmd == CMD_READ && r & 0xF0 == 0x40 => Ok(payload),
            other => Err(LabError::device(
                &self.id,
                operation,
                format!("unexpected reply command {:#04x}", other),
            )),
        }
    }
}

#[async_trait]
impl Writable for StageDriver {
    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        STAGE_PARAMETERS
    }

    #[instrument(skip(self), fields(device = %self.id, key = %key, value = %value), err)]
    async fn write_parameter(&mut self, key: &ParameterKey, value: &ParameterValue) -> LabResult<()> {
        let value = parameter::validate(STAGE_PARAMETERS, &self.id, key, value)?;
        let x = value.as_f64().unwrap_or_default();

        let (index, counts) = match key.name.as_str() {
            "target_position" => (object::TARGET_POSITION, to_counts(x, MM_PER_COUNT)),
            "speed" => (object::SPEED, to_counts(x, MM_S_PER_COUNT)),
            "acceleration" => (object::ACCELERATION, to_counts(x, MM_S2_PER_COUNT)),
            "deceleration" => (object::DECELERATION, to_counts(x, MM_S2_PER_COUNT)),
            other => {
                return Err(LabError::validation(&self.id, other, "unknown parameter"));
            }
        };
        self.write_object(index, counts, "write_parameter").await
    }
}

#[async_trait]
impl Readable for StageDriver {
    #[instrument(skip(self), fields(device = %self.id), err)]
    async fn read_status(&mut self) -> LabResult<StatusSnapshot> {
        let position = self.read_object(object::ACTUAL_POSITION, "read_status").await?;
        let status = i64::from(self.read_object(object::STATUS_WORD, "read_status").await? & 0xFFFF);
        let error_code = self.read_object(object::ERROR_CODE, "read_status").await? & 0xFFFF;

        let mut snapshot = StatusSnapshot::builder(&self.id)
            .reading("position", f64::from(position) * MM_PER_COUNT)
            .reading("status_word", status)
            .reading("target_reached", status & STATUS_TARGET_REACHED != 0)
            .reading("error_code", format!("{:#06x}", error_code));

        if error_code != 0 || status & STATUS_FAULT != 0 {
            snapshot = snapshot.device_error(format!("controller fault {:#06x}", error_code));
        }
        Ok(snapshot.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn driver(device: tokio::io::DuplexStream) -> StageDriver {
        StageDriver::new(
            DeviceId::new("stage0"),
            Box::new(StreamTransport::from_stream(device, "test")),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn start_frame_matches_controller_format() {
        let frame = encode_frame(CMD_WRITE, object::CONTROL_WORD, CONTROL_START);
        assert_eq!(frame, [0x01, 0x22, 0x40, 0x60, 0x00, 0x3F, 0x00, 0x00, 0x00, 0xFE]);
    }

    #[test]
    fn checksum_makes_byte_sum_zero() {
        let frame = encode_frame(CMD_READ, object::ACTUAL_POSITION, 0);
        let sum = frame.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[tokio::test]
    async fn target_position_is_written_in_counts() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut stage = driver(device);

        let fake = tokio::spawn(async move {
            let mut request = [0u8; FRAME_LEN];
            host.read_exact(&mut request).await.unwrap();
            let mut reply = request.to_vec();
            reply.extend_from_slice(&encode_frame(CMD_WRITE_REPLY, object::TARGET_POSITION, 0));
            host.write_all(&reply).await.unwrap();
            request
        });

        stage
            .write_parameter(&ParameterKey::plain("target_position"), &ParameterValue::Float(12.5))
            .await
            .unwrap();

        let request = fake.await.unwrap();
        assert_eq!(request[1], CMD_WRITE);
        assert_eq!(u16::from_le_bytes([request[2], request[3]]), object::TARGET_POSITION);
        let counts = i32::from_le_bytes([request[5], request[6], request[7], request[8]]);
        assert_eq!(counts, (12.5 / MM_PER_COUNT).round() as i32);
    }

    #[tokio::test]
    async fn out_of_range_write_sends_nothing() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut stage = driver(device);

        let err = stage
            .write_parameter(&ParameterKey::plain("target_position"), &ParameterValue::Float(-1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation { .. }));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(20), host.read(&mut buf)).await;
        assert!(read.is_err(), "no frame may reach the device");
    }

    #[tokio::test]
    async fn abort_reply_is_a_device_error() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut stage = driver(device);

        tokio::spawn(async move {
            let mut request = [0u8; FRAME_LEN];
            host.read_exact(&mut request).await.unwrap();
            let mut reply = request.to_vec();
            reply.extend_from_slice(&encode_frame(CMD_ABORT, object::CONTROL_WORD, 0x0504_0001));
            host.write_all(&reply).await.unwrap();
        });

        let err = stage.start().await.unwrap_err();
        assert!(matches!(err, LabError::Device { .. }));
    }
}
