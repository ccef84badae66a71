//! Transport Adapters
//!
//! One adapter per physical link family: RS232 serial, USB-serial and raw TCP.
//! All three are byte streams, so a single [`StreamTransport`] implements the
//! [`Transport`] contract over any [`SerialPortIO`] stream; what differs is how
//! the stream is opened, which lives in [`connector`].
//!
//! Adapters know nothing about device identity. They report
//! [`TransportError`]s, which drivers lift into `LabError`s carrying the
//! device id and the operation.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut transport = StreamTransport::new(Box::new(stream), "serial:/dev/ttyUSB0@9600");
//! transport.write(b"*IDN?\n").await?;
//! let reply = transport.read_until(b'\n', Duration::from_secs(1)).await?;
//! transport.close().await;
//! ```

pub mod connector;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use labsync_core::error::TransportError;
use labsync_core::serial::{drain_serial_buffer, DynSerial, SerialPortIO};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

pub use connector::{Connector, SystemConnector};

/// Time spent draining stale input after a timed-out read.
const DRAIN_WINDOW_MS: u64 = 20;

// =============================================================================
// Transport Trait
// =============================================================================

/// Frame-level access to one exclusively held link.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable resource (e.g. `serial:/dev/ttyUSB0@9600`, `tcp:10.0.0.5:5025`).
    fn resource(&self) -> &str;

    /// Send one frame.
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read up to and including `terminator`; the terminator is stripped.
    async fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Read exactly `len` bytes.
    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the OS handle. Idempotent; safe after any error.
    async fn close(&mut self);

    /// True once [`Transport::close`] ran or the peer hung up.
    fn is_closed(&self) -> bool;

    /// Treat any reply still in transit as stale. Called when a read is
    /// abandoned from outside, so the next write starts from a clean buffer.
    fn mark_stale(&mut self);
}

/// Type-erased transport owned by a driver.
pub type DynTransport = Box<dyn Transport>;

// =============================================================================
// Stream Transport
// =============================================================================

/// [`Transport`] over any async byte stream.
///
/// Reads go through a `BufReader` so that line-framed protocols can use
/// `read_until`. After a timed-out read, the next write first drains whatever
/// the device sent late so that replies do not shift by one.
pub struct StreamTransport {
    resource: String,
    port: Option<BufReader<DynSerial>>,
    stale: bool,
}

impl StreamTransport {
    /// Wrap an already opened stream.
    pub fn new(stream: DynSerial, resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            port: Some(BufReader::new(stream)),
            stale: false,
        }
    }

    /// Wrap a concrete stream.
    pub fn from_stream<S: SerialPortIO + 'static>(stream: S, resource: impl Into<String>) -> Self {
        Self::new(Box::new(stream), resource)
    }

    fn port_mut(&mut self) -> Result<&mut BufReader<DynSerial>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }

    async fn discard_stale(&mut self) -> Result<(), TransportError> {
        if !self.stale {
            return Ok(());
        }
        self.stale = false;
        let resource = self.resource.clone();
        let port = self.port_mut()?;

        let buffered = port.buffer().len();
        Pin::new(&mut *port).consume(buffered);
        let drained = drain_serial_buffer(port.get_mut(), DRAIN_WINDOW_MS).await;

        if buffered + drained > 0 {
            tracing::debug!(resource = %resource, bytes = buffered + drained, "Discarded late reply bytes");
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: TransportError) -> Result<T, TransportError> {
        match err {
            TransportError::Timeout(_) => self.stale = true,
            TransportError::Closed => self.port = None,
            _ => {}
        }
        Err(err)
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.discard_stale().await?;
        let port = self.port_mut()?;
        let writer = port.get_mut();

        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::trace!(resource = %self.resource, bytes = frame.len(), "Frame sent");
                Ok(())
            }
            Err(e) => self.fail(e.into()),
        }
    }

    async fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port_mut()?;
        let mut buf = Vec::new();

        match tokio::time::timeout(timeout, port.read_until(terminator, &mut buf)).await {
            Err(_) => self.fail(TransportError::Timeout(timeout)),
            Ok(Err(e)) => self.fail(e.into()),
            Ok(Ok(0)) => self.fail(TransportError::Closed),
            Ok(Ok(_)) => {
                if buf.last() != Some(&terminator) {
                    // EOF in the middle of a frame
                    return self.fail(TransportError::Closed);
                }
                buf.pop();
                Ok(buf)
            }
        }
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port_mut()?;
        let mut buf = vec![0u8; len];

        match tokio::time::timeout(timeout, port.read_exact(&mut buf)).await {
            Err(_) => self.fail(TransportError::Timeout(timeout)),
            Ok(Err(e)) => self.fail(e.into()),
            Ok(Ok(_)) => Ok(buf),
        }
    }

    async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.get_mut().shutdown().await {
                tracing::debug!(resource = %self.resource, error = %e, "Shutdown on close failed");
            }
            tracing::debug!(resource = %self.resource, "Transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    fn mark_stale(&mut self) {
        self.stale = true;
    }
}
