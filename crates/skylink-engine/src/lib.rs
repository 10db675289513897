/*!
 * Skylink Engine
 *
 * This crate provides the device session layer of skylink: the session
 * state machine, the command dispatcher that starts operations, and the
 * poller that mirrors device status and drives operations to completion.
 */

#![warn(missing_docs)]

// Re-export core types
pub use skylink_core::prelude;

// Re-export types from skylink_core for convenience
pub use skylink_core::types::{Id, Value};

pub mod capability;
mod dispatcher;
pub mod error;
pub mod event;
pub mod operation;
mod poller;
pub mod registry;
pub mod session;

// Re-export main types for convenience
pub use capability::{
    HasHeaters, HasShutter, HasTemperatureSensor, Homes, MovesAbsolute, MovesRelative, Parks, Rotates, Slews,
};
pub use error::{DispatchError, ErrorKind, Result, SessionError};
pub use event::{SessionEvent, SessionEventKind};
pub use operation::{Operation, OperationError, OperationHandle, OperationStatus};
pub use registry::SessionRegistry;
pub use session::{Session, SessionState, Subscription};
pub use skylink_devices::device::Intent;

/// Skylink engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("Skylink Engine {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
