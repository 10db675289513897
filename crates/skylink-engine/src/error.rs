/*!
 * Error types for the skylink engine crate.
 */
use thiserror::Error;

use skylink_devices::error::{ConnectError, DriverError};

pub use skylink_devices::error::ErrorKind;

use crate::session::SessionState;

/// Why an intent or abort was not dispatched
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Another operation is in progress or still halting
    #[error("Session busy: {0}")]
    Busy(String),

    /// The device refused the action in its current state
    #[error("Rejected by device: {0}")]
    Rejected(String),

    /// The command round-trip failed on the wire
    #[error("Transport failure: {0}")]
    TransportFailure(#[source] DriverError),

    /// The session has no open connection
    #[error("Session is not connected")]
    NotConnected,

    /// The session is faulted and needs a reset or reconnect
    #[error("Session faulted: {0}")]
    Faulted(String),

    /// The driver has no such capability
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<DriverError> for DispatchError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Rejected(reason) => DispatchError::Rejected(reason),
            DriverError::Unsupported(what) => DispatchError::Unsupported(what),
            other => DispatchError::TransportFailure(other),
        }
    }
}

/// Error type for session lifecycle operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The device could not be opened or did not identify itself
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// connect() outside the Disconnected state
    #[error("Session already connected (state {0})")]
    AlreadyConnected(SessionState),

    /// reset() outside the Faulted state
    #[error("Session is not faulted (state {0})")]
    NotFaulted(SessionState),

    /// reset() found the device still reporting a fault
    #[error("Device still faulted: {0}")]
    StillFaulted(String),

    /// The configured driver could not be built
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] skylink_core::error::Error),

    /// No session with this name
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Two sessions with the same name
    #[error("Duplicate device: {0}")]
    DuplicateDevice(String),
}

/// Result type for session lifecycle operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_devices::error::{CodecError, TransportError};

    #[test]
    fn test_driver_error_mapping() {
        assert!(matches!(
            DispatchError::from(DriverError::rejected("parked")),
            DispatchError::Rejected(_)
        ));
        assert!(matches!(
            DispatchError::from(DriverError::unsupported("park")),
            DispatchError::Unsupported(_)
        ));
        assert!(matches!(
            DispatchError::from(DriverError::from(CodecError::Malformed("x".into()))),
            DispatchError::TransportFailure(DriverError::Codec(_))
        ));
        assert!(matches!(
            DispatchError::from(DriverError::from(TransportError::Closed)),
            DispatchError::TransportFailure(_)
        ));
    }
}
