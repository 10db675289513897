/*!
 * Byte transports.
 *
 * A [`Transport`] owns one connection and moves raw bytes. A [`Link`] wraps
 * the transport a session owns and runs complete command cycles: discard
 * stale input, send, then receive until a terminator byte or a fixed count.
 * [`Connector`]s open transports from a [`TransportAddress`].
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use skylink_core::utils::printable;

use crate::device::TransportAddress;
use crate::error::{ConnectError, TransportError};

pub mod http;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

pub use http::HttpTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Where a receive stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// Up to and including this byte
    Byte(u8),
    /// Exactly this many bytes
    Count(usize),
}

/// A byte-stream connection to one device
#[async_trait]
pub trait Transport: Send + Debug {
    /// Write a complete frame
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read until the delimiter is satisfied or the timeout expires.
    ///
    /// On timeout the bytes received so far are returned inside the error.
    async fn receive_until(
        &mut self,
        delimiter: Delimiter,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Discard anything buffered but not yet read
    async fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Close the connection. Further calls fail with [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Open a transport to the given address
    async fn open(
        &self,
        address: &TransportAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// The exclusive connection a session owns, with its command timeout
#[derive(Debug)]
pub struct Link {
    transport: Box<dyn Transport>,
    timeout: Duration,
}

impl Link {
    /// Wrap an open transport
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Per-command timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the per-command timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Start a command cycle: flush stale input, then send the frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.transport.clear_input().await?;
        debug!(transport = %self.transport.describe(), "-> {}", printable(frame));
        self.transport.send(frame).await
    }

    /// Receive the rest of a reply within the command timeout
    pub async fn receive(&mut self, delimiter: Delimiter) -> Result<Vec<u8>, TransportError> {
        let reply = self.transport.receive_until(delimiter, self.timeout).await?;
        debug!(transport = %self.transport.describe(), "<- {}", printable(&reply));
        Ok(reply)
    }

    /// Full command cycle returning the raw reply
    pub async fn transact(
        &mut self,
        frame: &[u8],
        delimiter: Delimiter,
    ) -> Result<Vec<u8>, TransportError> {
        self.send(frame).await?;
        self.receive(delimiter).await
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> Result<(), TransportError> {
        trace!(transport = %self.transport.describe(), "closing");
        self.transport.close().await
    }

    /// Description of the underlying transport
    pub fn describe(&self) -> String {
        self.transport.describe()
    }
}

/// Connector for real hardware: serial ports, TCP sockets and HTTP endpoints
#[derive(Debug, Clone, Default)]
pub struct SystemConnector;

impl SystemConnector {
    /// Create a new connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn open(
        &self,
        address: &TransportAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        match address {
            #[cfg(feature = "serial")]
            TransportAddress::Serial { path, baud } => {
                Ok(Box::new(SerialTransport::open(path, *baud).await?))
            }
            #[cfg(not(feature = "serial"))]
            TransportAddress::Serial { path, .. } => Err(ConnectError::NotFound(format!(
                "{}: serial support not compiled in",
                path
            ))),
            TransportAddress::Tcp { host, port } => {
                Ok(Box::new(TcpTransport::connect(host, *port, timeout).await?))
            }
            TransportAddress::Http { host, port, .. } => {
                Ok(Box::new(HttpTransport::new(host, *port, timeout)?))
            }
            TransportAddress::Simulated { model } => Err(ConnectError::NotFound(format!(
                "simulated device {} needs a simulator connector",
                model
            ))),
        }
    }
}

/// Split one frame off the front of a receive buffer, if it is complete
pub(crate) fn take_frame(buffer: &mut BytesMut, delimiter: Delimiter) -> Option<Vec<u8>> {
    let end = match delimiter {
        Delimiter::Byte(b) => buffer.iter().position(|x| *x == b)? + 1,
        Delimiter::Count(n) if buffer.len() >= n => n,
        Delimiter::Count(_) => return None,
    };
    let frame = buffer[..end].to_vec();
    buffer.advance(end);
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_by_terminator() {
        let mut buffer = BytesMut::from(&b"M0\nQ180.0\n"[..]);
        assert_eq!(take_frame(&mut buffer, Delimiter::Byte(b'\n')), Some(b"M0\n".to_vec()));
        assert_eq!(
            take_frame(&mut buffer, Delimiter::Byte(b'\n')),
            Some(b"Q180.0\n".to_vec())
        );
        assert_eq!(take_frame(&mut buffer, Delimiter::Byte(b'\n')), None);
    }

    #[test]
    fn test_take_frame_by_count() {
        let mut buffer = BytesMut::from(&[0x82u8, 0x01, 0x05][..]);
        assert_eq!(take_frame(&mut buffer, Delimiter::Count(4)), None);
        assert_eq!(take_frame(&mut buffer, Delimiter::Count(2)), Some(vec![0x82, 0x01]));
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_system_connector_refuses_simulated() {
        let err = SystemConnector::new()
            .open(
                &TransportAddress::Simulated {
                    model: "dome".to_string(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NotFound(_)));
    }
}
