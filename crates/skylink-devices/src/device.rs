/*!
 * Device identity, capabilities and intents.
 *
 * A [`DeviceIdentity`] says where a device lives and what it is. It is built
 * once when a session is created and never changes. [`Intent`]s are the typed
 * requests callers submit; each one requires a [`Capability`] the driver must
 * declare.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

use skylink_core::config::{DeviceConfig, TransportConfig};
use skylink_core::types::Value;

/// Device type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Focuser
    Focuser,
    /// Dome
    Dome,
    /// Telescope mount
    Telescope,
    /// Auxiliary device (dew heaters, weather sensors)
    Auxiliary,
}

impl DeviceKind {
    /// Device type as used in Alpaca URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Focuser => "focuser",
            DeviceKind::Dome => "dome",
            DeviceKind::Telescope => "telescope",
            DeviceKind::Auxiliary => "switch",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a device can be reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportAddress {
    /// Serial or USB-serial port
    Serial {
        /// Device path
        path: String,
        /// Baud rate
        baud: u32,
    },
    /// Raw TCP socket
    Tcp {
        /// Host
        host: String,
        /// Port
        port: u16,
    },
    /// HTTP endpoint speaking the Alpaca API
    Http {
        /// Host
        host: String,
        /// Port
        port: u16,
        /// API version
        api_version: u32,
    },
    /// In-process simulator
    Simulated {
        /// Simulator model
        model: String,
    },
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Serial { path, baud } => write!(f, "{}@{}", path, baud),
            TransportAddress::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            TransportAddress::Http {
                host,
                port,
                api_version,
            } => write!(f, "http://{}:{}/api/v{}", host, port, api_version),
            TransportAddress::Simulated { model } => write!(f, "sim://{}", model),
        }
    }
}

impl From<&TransportConfig> for TransportAddress {
    fn from(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Serial { path, baud } => TransportAddress::Serial {
                path: path.clone(),
                baud: *baud,
            },
            TransportConfig::Tcp { host, port } => TransportAddress::Tcp {
                host: host.clone(),
                port: *port,
            },
            TransportConfig::Alpaca {
                host,
                port,
                api_version,
            } => TransportAddress::Http {
                host: host.clone(),
                port: *port,
                api_version: *api_version,
            },
            TransportConfig::Simulated { model } => TransportAddress::Simulated {
                model: model.clone(),
            },
        }
    }
}

/// Immutable description of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Configured name
    pub name: String,
    /// Transport address
    pub address: TransportAddress,
    /// Device type
    pub kind: DeviceKind,
    /// Vendor and model the driver speaks to
    pub model: String,
    /// Numeric device index
    pub device_number: u32,
}

impl DeviceIdentity {
    /// Build an identity for a configured device
    pub fn from_config(config: &DeviceConfig, kind: DeviceKind, model: &str) -> Self {
        Self {
            name: config.name.clone(),
            address: TransportAddress::from(&config.transport),
            kind,
            model: model.to_string(),
            device_number: config.device_number,
        }
    }
}

/// What the device said about itself during the handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware version or device name string
    pub firmware: String,
    /// Free-form description
    pub description: Option<String>,
}

/// A capability a driver may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Move to an absolute position
    MovesAbsolute,
    /// Move by a signed offset
    MovesRelative,
    /// Report a temperature
    HasTemperatureSensor,
    /// Open and close a shutter
    HasShutter,
    /// Slew to equatorial coordinates
    Slews,
    /// Park and unpark
    Parks,
    /// Find a home position
    Homes,
    /// Rotate to an azimuth
    Rotates,
    /// Drive heater outputs
    HasHeaters,
}

/// A typed request submitted to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    /// Move a focuser to an absolute step position
    MoveAbsolute(i64),
    /// Move a focuser by a signed number of steps
    MoveRelative(i64),
    /// Slew a mount to right ascension (hours) and declination (degrees)
    SlewTo {
        /// Right ascension in hours
        ra: f64,
        /// Declination in degrees
        dec: f64,
    },
    /// Park the mount or dome
    Park,
    /// Release the park state
    Unpark,
    /// Search for the home position
    FindHome,
    /// Rotate a dome to an azimuth in degrees
    RotateTo(f64),
    /// Open the shutter
    OpenShutter,
    /// Close the shutter
    CloseShutter,
    /// Set a heater output to a power level in percent
    SetHeater {
        /// Output channel, starting at 1
        channel: u8,
        /// Power level 0..=100
        power: u8,
    },
}

impl Intent {
    /// Short name used for logging and operation records
    pub fn name(&self) -> &'static str {
        match self {
            Intent::MoveAbsolute(_) => "move_absolute",
            Intent::MoveRelative(_) => "move_relative",
            Intent::SlewTo { .. } => "slew",
            Intent::Park => "park",
            Intent::Unpark => "unpark",
            Intent::FindHome => "find_home",
            Intent::RotateTo(_) => "rotate",
            Intent::OpenShutter => "open_shutter",
            Intent::CloseShutter => "close_shutter",
            Intent::SetHeater { .. } => "set_heater",
        }
    }

    /// The capability a driver must declare to accept this intent
    pub fn required_capability(&self) -> Capability {
        match self {
            Intent::MoveAbsolute(_) => Capability::MovesAbsolute,
            Intent::MoveRelative(_) => Capability::MovesRelative,
            Intent::SlewTo { .. } => Capability::Slews,
            Intent::Park | Intent::Unpark => Capability::Parks,
            Intent::FindHome => Capability::Homes,
            Intent::RotateTo(_) => Capability::Rotates,
            Intent::OpenShutter | Intent::CloseShutter => Capability::HasShutter,
            Intent::SetHeater { .. } => Capability::HasHeaters,
        }
    }

    /// The value the intent asks for, when it names one directly
    pub fn requested_value(&self) -> Option<Value> {
        match self {
            Intent::MoveAbsolute(p) => Some(Value::Int(*p)),
            Intent::RotateTo(az) => Some(Value::Float(*az)),
            Intent::SetHeater { power, .. } => Some(Value::Int(i64::from(*power))),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::MoveAbsolute(p) => write!(f, "move to {}", p),
            Intent::MoveRelative(d) => write!(f, "move by {:+}", d),
            Intent::SlewTo { ra, dec } => write!(f, "slew to RA {:.4}h Dec {:+.4}°", ra, dec),
            Intent::RotateTo(az) => write!(f, "rotate to {:.1}°", az),
            Intent::SetHeater { channel, power } => {
                write!(f, "heater {} to {}%", channel, power)
            }
            other => f.write_str(other.name()),
        }
    }
}
