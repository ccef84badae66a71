//! Opening transports for device descriptors.
//!
//! The registry never opens OS resources itself; it asks a [`Connector`].
//! [`SystemConnector`] opens real serial ports and TCP sockets (or a simulated
//! instrument when the descriptor says so). Tests plug in
//! [`SimulatedConnector`](crate::sim::SimulatedConnector) to control every
//! instrument's behaviour.

use std::time::Duration;

use async_trait::async_trait;
use labsync_core::error::TransportError;
use labsync_core::limits::OPEN_TIMEOUT;

use super::{DynTransport, StreamTransport};
use crate::registry::{DeviceConfig, DriverType};
use crate::sim::{self, SimBehavior};

/// Opens the link described by a device configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an exclusive transport for `config`.
    async fn open(&self, config: &DeviceConfig) -> Result<DynTransport, TransportError>;
}

/// Opens real OS resources.
#[derive(Debug, Clone)]
pub struct SystemConnector {
    open_timeout: Duration,
}

impl SystemConnector {
    /// Connector with a custom open bound.
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }

    #[cfg(feature = "serial")]
    async fn open_serial(&self, config: &DeviceConfig, port: &str) -> Result<DynTransport, TransportError> {
        let class = config.driver.class();
        let baud = class.baud_rate().ok_or_else(|| TransportError::Open {
            resource: port.to_string(),
            reason: format!("{} has no serial link", class),
        })?;

        let stream = tokio::time::timeout(
            self.open_timeout,
            labsync_core::serial::open_serial_async(port, baud, config.driver.driver_name()),
        )
        .await
        .map_err(|_| TransportError::Open {
            resource: port.to_string(),
            reason: format!("open timed out after {:?}", self.open_timeout),
        })??;

        Ok(Box::new(StreamTransport::from_stream(
            stream,
            format!("serial:{}@{}", port, baud),
        )))
    }

    #[cfg(not(feature = "serial"))]
    async fn open_serial(&self, _config: &DeviceConfig, port: &str) -> Result<DynTransport, TransportError> {
        Err(TransportError::Open {
            resource: port.to_string(),
            reason: "serial support not compiled in (enable the `serial` feature)".into(),
        })
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<DynTransport, TransportError> {
        let resource = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.open_timeout, tokio::net::TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Open {
                resource: resource.clone(),
                reason: format!("connect timed out after {:?}", self.open_timeout),
            })?
            .map_err(|e| TransportError::Open {
                resource: resource.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(resource = %resource, error = %e, "TCP_NODELAY not applied");
        }

        Ok(Box::new(StreamTransport::from_stream(stream, format!("tcp:{}", resource))))
    }
}

impl Default for SystemConnector {
    fn default() -> Self {
        Self::new(OPEN_TIMEOUT)
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn open(&self, config: &DeviceConfig) -> Result<DynTransport, TransportError> {
        if config.simulated {
            let (stream, _handle) = sim::spawn(config.driver.class(), SimBehavior::default());
            return Ok(Box::new(StreamTransport::from_stream(
                stream,
                format!("sim:{}", config.id),
            )));
        }

        match &config.driver {
            DriverType::EcoVario { port } | DriverType::LuxxPlus { port } | DriverType::Tga1244 { port } => {
                self.open_serial(config, port).await
            }
            DriverType::Fsv3000 { host, port } => self.open_tcp(host, *port).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_core::DeviceId;

    #[tokio::test]
    async fn tcp_open_failure_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = DeviceConfig {
            id: DeviceId::new("fsv"),
            name: "Analyzer".into(),
            driver: DriverType::Fsv3000 {
                host: "127.0.0.1".into(),
                port,
            },
            simulated: false,
        };

        let result = SystemConnector::new(Duration::from_millis(500)).open(&config).await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[tokio::test]
    async fn tcp_open_succeeds_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = DeviceConfig {
            id: DeviceId::new("fsv"),
            name: "Analyzer".into(),
            driver: DriverType::Fsv3000 {
                host: "127.0.0.1".into(),
                port,
            },
            simulated: false,
        };

        let transport = SystemConnector::default().open(&config).await.unwrap();
        assert_eq!(transport.resource(), format!("tcp:127.0.0.1:{}", port));
    }
}
