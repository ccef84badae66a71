//! Serial Port Helpers
//!
//! [`open_serial_async`] requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! labsync-core = { path = "../labsync-core", features = ["serial"] }
//! ```
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for byte streams
//! - [`DynSerial`]: Type-erased boxed stream
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`drain_serial_buffer`]: Drain stale data from a stream

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

#[cfg(feature = "serial")]
use crate::error::TransportError;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async byte-stream I/O.
///
/// Covers `tokio_serial::SerialStream` (real hardware),
/// `tokio::net::TcpStream` and `tokio::io::DuplexStream` (tests and
/// simulated instruments).
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed stream.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control. On Unix the port is
/// opened in exclusive mode so no second process can share the handle.
///
/// # Parameters
///
/// - `port_path`: Path to the serial port (e.g., "/dev/ttyUSB0")
/// - `baud_rate`: Baud rate fixed by the instrument class
/// - `device_name`: Human-readable device name for error messages
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> Result<tokio_serial::SerialStream, TransportError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                resource: port_path_owned.clone(),
                reason: format!("{} serial port: {}", device_name_owned, e),
            })
    })
    .await
    .map_err(|e| TransportError::Open {
        resource: port_path.to_string(),
        reason: format!("spawn_blocking for serial port opening failed: {}", e),
    })?
}

/// Drain stale data from a stream.
///
/// Reads and discards until nothing arrives for `timeout_ms`. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // nothing more pending
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);

        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);
    }

    #[tokio::test]
    async fn test_dyn_serial_accepts_duplex() {
        let (_host, device) = tokio::io::duplex(64);
        let _port: DynSerial = Box::new(device);
    }
}
