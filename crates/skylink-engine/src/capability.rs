/*!
 * Typed capability facades over a session.
 *
 * Each trait maps a method onto an [`Intent`] and submits it, so callers
 * can write `session.slew_to(5.5, 20.0)` instead of building intents by
 * hand. Drivers that do not declare the capability reject the intent with
 * [`DispatchError::Unsupported`].
 */
use async_trait::async_trait;

use skylink_devices::device::{Capability, Intent};
use skylink_devices::property::Validity;

use crate::error::DispatchError;
use crate::operation::OperationHandle;
use crate::session::Session;

type Started = Result<OperationHandle, DispatchError>;

/// Absolute positioning (focusers)
#[async_trait]
pub trait MovesAbsolute {
    /// Move to a step position
    async fn move_to(&self, position: i64) -> Started;
}

/// Relative positioning (focusers)
#[async_trait]
pub trait MovesRelative {
    /// Move by a signed number of steps
    async fn move_by(&self, steps: i64) -> Started;
}

/// Equatorial slewing (mounts)
#[async_trait]
pub trait Slews {
    /// Slew to right ascension in hours and declination in degrees
    async fn slew_to(&self, ra: f64, dec: f64) -> Started;
}

/// Park position (mounts, domes)
#[async_trait]
pub trait Parks {
    /// Go to the park position
    async fn park(&self) -> Started;
    /// Leave the park state
    async fn unpark(&self) -> Started;
}

/// Homing (mounts, domes)
#[async_trait]
pub trait Homes {
    /// Search for the home position
    async fn find_home(&self) -> Started;
}

/// Azimuth rotation (domes)
#[async_trait]
pub trait Rotates {
    /// Rotate to an azimuth in degrees
    async fn rotate_to(&self, azimuth: f64) -> Started;
}

/// Shutter control (domes)
#[async_trait]
pub trait HasShutter {
    /// Open the shutter
    async fn open_shutter(&self) -> Started;
    /// Close the shutter
    async fn close_shutter(&self) -> Started;
}

/// Heater outputs (dew controllers)
#[async_trait]
pub trait HasHeaters {
    /// Set an output channel to a power level in percent
    async fn set_heater(&self, channel: u8, power: u8) -> Started;
}

/// Temperature readout
#[async_trait]
pub trait HasTemperatureSensor {
    /// Last confirmed temperature in °C; `None` while unknown or stale
    async fn temperature(&self) -> Result<Option<f64>, DispatchError>;
}

#[async_trait]
impl MovesAbsolute for Session {
    async fn move_to(&self, position: i64) -> Started {
        self.submit(Intent::MoveAbsolute(position)).await
    }
}

#[async_trait]
impl MovesRelative for Session {
    async fn move_by(&self, steps: i64) -> Started {
        self.submit(Intent::MoveRelative(steps)).await
    }
}

#[async_trait]
impl Slews for Session {
    async fn slew_to(&self, ra: f64, dec: f64) -> Started {
        self.submit(Intent::SlewTo { ra, dec }).await
    }
}

#[async_trait]
impl Parks for Session {
    async fn park(&self) -> Started {
        self.submit(Intent::Park).await
    }

    async fn unpark(&self) -> Started {
        self.submit(Intent::Unpark).await
    }
}

#[async_trait]
impl Homes for Session {
    async fn find_home(&self) -> Started {
        self.submit(Intent::FindHome).await
    }
}

#[async_trait]
impl Rotates for Session {
    async fn rotate_to(&self, azimuth: f64) -> Started {
        self.submit(Intent::RotateTo(azimuth)).await
    }
}

#[async_trait]
impl HasShutter for Session {
    async fn open_shutter(&self) -> Started {
        self.submit(Intent::OpenShutter).await
    }

    async fn close_shutter(&self) -> Started {
        self.submit(Intent::CloseShutter).await
    }
}

#[async_trait]
impl HasHeaters for Session {
    async fn set_heater(&self, channel: u8, power: u8) -> Started {
        self.submit(Intent::SetHeater { channel, power }).await
    }
}

#[async_trait]
impl HasTemperatureSensor for Session {
    async fn temperature(&self) -> Result<Option<f64>, DispatchError> {
        if !self.has_capability(Capability::HasTemperatureSensor) {
            return Err(DispatchError::Unsupported(format!(
                "{} has no temperature sensor",
                self.name()
            )));
        }
        for key in ["temperature", "temperature_ambient"] {
            if let Some(property) = self.get_property(key).await {
                return Ok(property
                    .value
                    .filter(|_| property.validity == Validity::Valid)
                    .and_then(|v| v.as_float()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use skylink_core::config::{DeviceConfig, SessionDefaults, TransportConfig};
    use skylink_devices::device::DeviceIdentity;
    use skylink_devices::drivers;
    use skylink_devices::sim::{DewHeaterSim, DomeSim, SimConnector, SimDevice, TelescopeSim};

    use crate::operation::OperationStatus;

    fn session<D: SimDevice + 'static>(driver: &str, sim: D) -> Session {
        let connector = SimConnector::new(Arc::new(Mutex::new(sim)));
        let config = DeviceConfig::new(
            driver,
            driver,
            TransportConfig::Simulated {
                model: driver.to_string(),
            },
        );
        let driver = drivers::build(&config).unwrap();
        let identity = DeviceIdentity::from_config(&config, driver.kind(), driver.model());
        let timing = SessionDefaults {
            autopoll: false,
            ..SessionDefaults::default()
        };
        Session::new(identity, driver, Arc::new(connector), timing)
    }

    #[tokio::test]
    async fn test_slew_and_park() {
        let mount = session("alpaca-telescope", TelescopeSim::new(1.0, 10.0));
        mount.connect().await.unwrap();

        let slew = mount.slew_to(3.0, 25.0).await.unwrap();
        for _ in 0..3 {
            mount.poll_now().await.unwrap();
        }
        assert_eq!(slew.wait().await.status, OperationStatus::Completed);

        let park = mount.park().await.unwrap();
        mount.poll_now().await.unwrap();
        assert_eq!(park.wait().await.status, OperationStatus::Completed);
        assert!(matches!(mount.slew_to(4.0, 0.0).await, Err(DispatchError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_heater_and_ambient_temperature() {
        let heater = session("dew-heater", DewHeaterSim::new());
        heater.connect().await.unwrap();

        let op = heater.set_heater(2, 40).await.unwrap();
        heater.poll_now().await.unwrap();
        assert_eq!(op.wait().await.status, OperationStatus::Completed);
        assert!(heater.temperature().await.unwrap().is_some());
        assert!(matches!(heater.set_heater(4, 10).await, Err(DispatchError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_missing_capability_is_unsupported() {
        let dome = session("dome", DomeSim::new(0.0));
        dome.connect().await.unwrap();

        assert!(matches!(dome.temperature().await, Err(DispatchError::Unsupported(_))));
        assert!(matches!(dome.move_to(100).await, Err(DispatchError::Unsupported(_))));
        assert!(matches!(dome.slew_to(1.0, 1.0).await, Err(DispatchError::Unsupported(_))));

        let shutter = dome.open_shutter().await.unwrap();
        for _ in 0..4 {
            dome.poll_now().await.unwrap();
        }
        assert_eq!(shutter.wait().await.status, OperationStatus::Completed);
    }
}
