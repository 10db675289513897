/*!
 * Serial port transport.
 *
 * `serialport` is blocking, so every read and write runs on the blocking
 * thread pool with the port moved in and handed back afterwards.
 */
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace};

use super::{take_frame, Delimiter, Transport};
use crate::error::{ConnectError, TimeoutError, TransportError};

/// Read slice used while waiting for a delimiter
const READ_SLICE: Duration = Duration::from_millis(50);

/// A local serial or USB-serial port
pub struct SerialTransport {
    path: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    buffer: BytesMut,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud", &self.baud)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Open the port at 8N1 with the given baud rate
    pub async fn open(path: &str, baud: u32) -> Result<Self, ConnectError> {
        debug!("Opening serial port {} at {} baud", path, baud);
        let owned = path.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(owned, baud).timeout(READ_SLICE).open()
        })
        .await
        .map_err(|e| ConnectError::Busy(format!("{}: {}", path, e)))?
        .map_err(|e| open_error(path, e))?;

        Ok(Self {
            path: path.to_string(),
            baud,
            port: Some(port),
            buffer: BytesMut::with_capacity(256),
        })
    }

    /// Run a blocking closure against the port
    async fn with_port<T, F>(&mut self, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut Box<dyn SerialPort>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut port = self.port.take().ok_or(TransportError::Closed)?;
        let (port, out) = tokio::task::spawn_blocking(move || {
            let out = f(&mut port);
            (port, out)
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::new(IoErrorKind::Other, e)))?;
        self.port = Some(port);
        Ok(out)
    }
}

fn open_error(path: &str, err: serialport::Error) -> ConnectError {
    match err.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::InvalidInput
        | serialport::ErrorKind::Io(IoErrorKind::NotFound) => {
            ConnectError::NotFound(format!("{}: {}", path, err))
        }
        _ => ConnectError::Busy(format!("{}: {}", path, err)),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let frame = bytes.to_vec();
        self.with_port(move |port| {
            port.write_all(&frame)?;
            port.flush()
        })
        .await?
        .map_err(TransportError::Io)
    }

    async fn receive_until(
        &mut self,
        delimiter: Delimiter,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if let Some(frame) = take_frame(&mut self.buffer, delimiter) {
            return Ok(frame);
        }

        let mut pending = self.buffer.split();
        let (pending, result) = self
            .with_port(move |port| {
                let started = Instant::now();
                let mut chunk = [0u8; 64];
                loop {
                    if let Some(frame) = take_frame(&mut pending, delimiter) {
                        return (pending, Ok(Some(frame)));
                    }
                    if started.elapsed() >= timeout {
                        return (pending, Ok(None));
                    }
                    match port.read(&mut chunk) {
                        Ok(0) => {}
                        Ok(n) => pending.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == IoErrorKind::TimedOut => {}
                        Err(e) => return (pending, Err(e)),
                    }
                }
            })
            .await?;
        self.buffer = pending;

        match result {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::Timeout(TimeoutError {
                waited: timeout,
                partial: self.buffer.split().to_vec(),
            })),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        self.with_port(|port| port.clear(ClearBuffer::Input))
            .await?
            .map_err(|e| TransportError::Io(e.into()))?;
        trace!("flushed input on {}", self.path);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the handle closes the file descriptor
        self.port = None;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_port_is_not_found() {
        let err = SerialTransport::open("/dev/skylink-does-not-exist", 9600)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NotFound(_)));
    }
}
