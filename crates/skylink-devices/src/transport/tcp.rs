/*!
 * TCP transport for serial-over-network adapters.
 */
use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::{take_frame, Delimiter, Transport};
use crate::error::{ConnectError, TimeoutError, TransportError};

/// A raw TCP byte stream
#[derive(Debug)]
pub struct TcpTransport {
    peer: String,
    stream: Option<TcpStream>,
    buffer: BytesMut,
}

impl TcpTransport {
    /// Connect within the given timeout
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let peer = format!("{}:{}", host, port);
        debug!("Connecting to {}", peer);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| ConnectError::NotFound(format!("{}: connect timed out", peer)))?
            .map_err(|e| match e.kind() {
                IoErrorKind::AddrInUse | IoErrorKind::PermissionDenied => {
                    ConnectError::Busy(format!("{}: {}", peer, e))
                }
                _ => ConnectError::NotFound(format!("{}: {}", peer, e)),
            })?;
        let _ = stream.set_nodelay(true);

        Ok(Self {
            peer,
            stream: Some(stream),
            buffer: BytesMut::with_capacity(256),
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive_until(
        &mut self,
        delimiter: Delimiter,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = take_frame(&mut self.buffer, delimiter) {
                return Ok(frame);
            }

            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            match timeout_at(deadline, stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Ok(Ok(n)) => trace!("read {} bytes from {}", n, self.peer),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => {
                    return Err(TransportError::Timeout(TimeoutError {
                        waited: timeout,
                        partial: self.buffer.split().to_vec(),
                    }))
                }
            }
        }
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        let stream = self.stream()?;
        let mut scratch = [0u8; 256];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => trace!("discarded {} stale bytes", n),
                Err(e) if e.kind() == IoErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
