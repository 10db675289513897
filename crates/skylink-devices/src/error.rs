/*!
 * Error types for transports, codecs and drivers.
 *
 * Errors are layered: a [`TransportError`] or [`CodecError`] is a local
 * failure of one command cycle, a [`DriverError`] is what a driver reports
 * back to the session, and [`ErrorKind`] classifies the physical failure of a
 * long-running operation.
 */
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to open a device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No such serial device or socket
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device exists but is already claimed
    #[error("Device busy: {0}")]
    Busy(String),

    /// The device did not answer the identification probe
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// A receive that hit its deadline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Timed out after {waited:?} with {} bytes received", partial.len())]
pub struct TimeoutError {
    /// How long the receive waited
    pub waited: Duration,
    /// Bytes that arrived before the deadline
    pub partial: Vec<u8>,
}

/// Error type for transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A receive hit its deadline
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,

    /// The HTTP endpoint answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The transport cannot carry this kind of frame
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Error type for encoding and decoding frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The frame does not match the expected grammar
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Binary frame checksum does not match its contents
    #[error("Checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        computed: u8,
        /// Checksum byte carried by the frame
        received: u8,
    },

    /// The reply does not belong to the command just sent
    #[error("Unexpected echo: expected {expected:?}, got {actual:?}")]
    UnexpectedEcho {
        /// What the reply should have started with
        expected: String,
        /// What it actually started with
        actual: String,
    },

    /// A numeric field is outside its physical range
    #[error("Value out of range for {field}: {value}")]
    OutOfRange {
        /// Field name
        field: String,
        /// Offending value as received
        value: String,
    },
}

/// Error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport failure during a command cycle
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    /// Codec failure during a command cycle
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The device cannot perform the action in its current state
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The driver does not implement this intent
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Create a new rejection
    pub fn rejected<S: AsRef<str>>(msg: S) -> Self {
        DriverError::Rejected(msg.as_ref().to_string())
    }

    /// Create a new unsupported error
    pub fn unsupported<S: AsRef<str>>(msg: S) -> Self {
        DriverError::Unsupported(msg.as_ref().to_string())
    }
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        match err {
            // The server understood the request and refused it
            TransportError::Http { status, body } if (400..500).contains(&status) => {
                DriverError::Rejected(format!("HTTP {}: {}", status, body))
            }
            other => DriverError::Transport(other),
        }
    }
}

impl From<TimeoutError> for DriverError {
    fn from(err: TimeoutError) -> Self {
        DriverError::Transport(TransportError::Timeout(err))
    }
}

/// Classification of an operation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No progress before the deadline
    Timeout,
    /// The device lost something it needs (power, connection)
    ResourceUnavailable,
    /// The device behaved inconsistently (did not halt, reported a fault)
    DeviceFault,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceUnavailable => "resource unavailable",
            ErrorKind::DeviceFault => "device fault",
        };
        f.write_str(s)
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
