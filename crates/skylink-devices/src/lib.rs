/*!
 * Skylink Devices
 *
 * This crate provides the device side of a skylink session: byte
 * transports, wire codecs, the property store and the drivers that speak
 * each device's protocol, plus in-process simulators for every driver.
 */

#![warn(missing_docs)]

// Re-export core types
pub use skylink_core::prelude;

pub mod codec;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod property;
pub mod sim;
pub mod transport;

pub use device::{Capability, DeviceIdentity, DeviceInfo, DeviceKind, Intent, TransportAddress};
pub use driver::{Ack, Driver, Evaluation, Health};
pub use error::{CodecError, ConnectError, DriverError, ErrorKind, TimeoutError, TransportError};
pub use property::{Property, PropertyChange, PropertySpec, PropertyStore, Reading, Validity, ValueKind};
pub use transport::{Connector, Link, SystemConnector, Transport};

/// Skylink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), skylink_core::error::Error> {
    tracing::info!(
        "Skylink Devices {} initialized with drivers {:?}",
        VERSION,
        drivers::DRIVER_NAMES
    );
    Ok(())
}

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["tcp", "alpaca", "simulated"];

    #[cfg(feature = "serial")]
    transports.insert(0, "serial");

    transports
}
