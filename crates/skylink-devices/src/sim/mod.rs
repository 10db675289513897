/*!
 * In-process device simulators.
 *
 * A [`SimDevice`] answers complete request frames with complete reply
 * frames. [`SimConnector`] opens [`SimTransport`]s onto a shared simulator
 * and lets tests inject line faults such as a dropped byte, a garbled or
 * trailing reply, a silent device or an unplugged cable.
 */
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::trace;

use crate::device::TransportAddress;
use crate::drivers;
use crate::error::{ConnectError, TimeoutError, TransportError};
use crate::transport::{take_frame, Connector, Delimiter, Transport};

mod dew_heater;
mod dome;
mod focuser;
mod telescope;

pub use dew_heater::DewHeaterSim;
pub use dome::DomeSim;
pub use focuser::{FrameFocuserSim, StepFocuserSim};
pub use telescope::TelescopeSim;

/// A simulated device
pub trait SimDevice: Send + Debug {
    /// Answer one request frame; an empty reply means silence
    fn respond(&mut self, request: &[u8]) -> Vec<u8>;
}

/// A simulator shared between a connector, its transports and a test
pub type SharedSim = Arc<Mutex<dyn SimDevice>>;

/// Line faults applied to replies
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Remove the byte at this index from the next reply only
    pub drop_byte: Option<usize>,
    /// Corrupt the first byte of every reply
    pub garble_reply: bool,
    /// Append these bytes after the next reply only, like a late answer
    pub trailing: Option<Vec<u8>>,
    /// Swallow requests without replying
    pub silent: bool,
    /// Fail every send as if the cable were pulled
    pub unplugged: bool,
    /// Fail the next open with this error
    pub refuse_open: Option<ConnectError>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens transports onto one simulator
#[derive(Debug, Clone)]
pub struct SimConnector {
    sim: SharedSim,
    faults: Arc<Mutex<Faults>>,
}

impl SimConnector {
    /// Create a connector for a simulator the caller keeps a handle to
    pub fn new<D: SimDevice + 'static>(sim: Arc<Mutex<D>>) -> Self {
        Self {
            sim,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Change the active faults
    pub fn inject<F: FnOnce(&mut Faults)>(&self, f: F) {
        f(&mut lock(&self.faults));
    }

    /// Clear every fault
    pub fn heal(&self) {
        *lock(&self.faults) = Faults::default();
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(
        &self,
        address: &TransportAddress,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        if let Some(err) = lock(&self.faults).refuse_open.take() {
            return Err(err);
        }
        Ok(Box::new(SimTransport {
            name: address.to_string(),
            sim: Arc::clone(&self.sim),
            faults: Arc::clone(&self.faults),
            buffer: BytesMut::new(),
            closed: false,
        }))
    }
}

/// Simulator for a driver name with factory defaults
pub fn connector_for(model: &str) -> Result<SimConnector, ConnectError> {
    let connector = match model {
        drivers::frame_focuser::NAME => SimConnector::new(Arc::new(Mutex::new(FrameFocuserSim::new(0)))),
        drivers::step_focuser::NAME => SimConnector::new(Arc::new(Mutex::new(StepFocuserSim::new(0)))),
        drivers::dome::NAME => SimConnector::new(Arc::new(Mutex::new(DomeSim::new(0.0)))),
        drivers::dew_heater::NAME => SimConnector::new(Arc::new(Mutex::new(DewHeaterSim::new()))),
        drivers::alpaca_telescope::NAME => {
            SimConnector::new(Arc::new(Mutex::new(TelescopeSim::new(0.0, 90.0))))
        }
        other => return Err(ConnectError::NotFound(format!("no simulator for {}", other))),
    };
    Ok(connector)
}

/// Transport onto a simulator
#[derive(Debug)]
pub struct SimTransport {
    name: String,
    sim: SharedSim,
    faults: Arc<Mutex<Faults>>,
    buffer: BytesMut,
    closed: bool,
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut faults = lock(&self.faults);
        if faults.unplugged {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cable unplugged").into());
        }
        if faults.silent {
            return Ok(());
        }

        let mut reply = lock(&self.sim).respond(bytes);
        if let Some(index) = faults.drop_byte.take() {
            if index < reply.len() {
                reply.remove(index);
            }
        }
        if faults.garble_reply {
            if let Some(first) = reply.first_mut() {
                *first ^= 0x20;
            }
        }
        if let Some(extra) = faults.trailing.take() {
            reply.extend_from_slice(&extra);
        }
        trace!("{} replied {} bytes", self.name, reply.len());
        self.buffer.extend_from_slice(&reply);
        Ok(())
    }

    async fn receive_until(
        &mut self,
        delimiter: Delimiter,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Some(frame) = take_frame(&mut self.buffer, delimiter) {
            return Ok(frame);
        }
        // Replies arrive whole on send, so whatever is missing never comes
        tokio::time::sleep(timeout).await;
        let partial = self.buffer.split().to_vec();
        Err(TimeoutError {
            waited: timeout,
            partial,
        }
        .into())
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.buffer.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Split `word arg1 arg2\n` into its parts
pub(crate) fn split_request(request: &[u8]) -> (String, Vec<String>) {
    let text = String::from_utf8_lossy(request);
    let mut parts = text.split_whitespace().map(str::to_string);
    let word = parts.next().unwrap_or_default();
    (word, parts.collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Link;

    fn address() -> TransportAddress {
        TransportAddress::Simulated {
            model: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_refuse_open_is_one_shot() {
        let connector = SimConnector::new(Arc::new(Mutex::new(StepFocuserSim::new(0))));
        connector.inject(|faults| faults.refuse_open = Some(ConnectError::Busy("in use".to_string())));

        let err = connector.open(&address(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ConnectError::Busy("in use".to_string()));
        assert!(connector.open(&address(), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let connector = SimConnector::new(Arc::new(Mutex::new(StepFocuserSim::new(0))));
        let transport = connector.open(&address(), Duration::from_secs(1)).await.unwrap();
        let mut link = Link::new(transport, Duration::from_millis(500));

        connector.inject(|faults| faults.silent = true);
        let err = link.transact(b"getpos\n", Delimiter::Byte(b'\n')).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(TimeoutError { ref partial, .. }) if partial.is_empty()));

        connector.heal();
        let reply = link.transact(b"getpos\n", Delimiter::Byte(b'\n')).await.unwrap();
        assert_eq!(reply, b"getpos:0\n");
    }

    #[tokio::test]
    async fn test_unplugged_and_closed() {
        let connector = SimConnector::new(Arc::new(Mutex::new(StepFocuserSim::new(0))));
        let mut transport = connector.open(&address(), Duration::from_secs(1)).await.unwrap();

        connector.inject(|faults| faults.unplugged = true);
        assert!(matches!(transport.send(b"getpos\n").await, Err(TransportError::Io(_))));

        transport.close().await.unwrap();
        assert!(matches!(transport.send(b"getpos\n").await, Err(TransportError::Closed)));
    }

    #[test]
    fn test_connector_for_known_models() {
        for name in drivers::DRIVER_NAMES {
            assert!(connector_for(name).is_ok(), "{}", name);
        }
        assert!(matches!(connector_for("camera"), Err(ConnectError::NotFound(_))));
    }
}
