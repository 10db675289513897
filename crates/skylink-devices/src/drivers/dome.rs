/*!
 * Dome rotator with shutter, speaking single-letter ASCII commands.
 *
 * Requests are one lower-case letter with optional arguments; replies start
 * with the same letter upper-cased: `q` -> `Q180.0`, `k` -> `K 1250 1180`.
 * The rotation motor runs from a battery; at or below 7 V the motor has no
 * power, new motion is refused and a move in progress cannot finish.
 *
 * The controller has no park command. Parking is a rotation to the park
 * azimuth, and the dome counts as parked once a poll sees it stopped there.
 * While parked the dome refuses rotation, homing and shutter motion.
 */
use async_trait::async_trait;
use tracing::debug;

use skylink_core::config::DeviceConfig;
use skylink_core::types::Value;

use crate::codec::{exchange, AsciiCodec, AsciiCommand, AsciiDialect, AsciiReply};
use crate::device::{Capability, DeviceInfo, DeviceKind, Intent};
use crate::driver::{require_capability, Ack, Driver, Evaluation, Health};
use crate::error::{CodecError, DriverError, ErrorKind, Result};
use crate::property::{PropertySpec, PropertyStore, Reading, ValueKind};
use crate::transport::Link;

/// Driver name
pub const NAME: &str = "dome";

/// Motor battery level at or below which the motor is unpowered
pub const MIN_MOTOR_VOLTS: f64 = 7.0;

/// Default park azimuth in degrees
pub const DEFAULT_PARK_AZIMUTH: f64 = 180.0;

/// Azimuth tolerance for completion, degrees
const AZIMUTH_TOLERANCE: f64 = 0.5;

/// Shutter position reported when fully open
const SHUTTER_OPEN_POSITION: f64 = 90.0;

/// Shutter state names indexed by the `u` reply code
pub const SHUTTER_STATES: [&str; 6] = [
    "not_connected",
    "open",
    "opening",
    "closed",
    "closing",
    "undetermined",
];

const CAPABILITIES: &[Capability] = &[
    Capability::Rotates,
    Capability::HasShutter,
    Capability::Homes,
    Capability::Parks,
];

/// Dome driver
#[derive(Debug, Clone)]
pub struct Dome {
    codec: AsciiCodec,
    park_azimuth: f64,
    parking: bool,
    parked: bool,
}

impl Dome {
    /// Create a driver with the given park azimuth
    pub fn new(park_azimuth: f64) -> Self {
        Self {
            codec: AsciiCodec::new(AsciiDialect::letter_echo()),
            park_azimuth,
            parking: false,
            parked: false,
        }
    }

    /// Create from a device entry
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.park_azimuth.unwrap_or(DEFAULT_PARK_AZIMUTH))
    }

    async fn query(&self, link: &mut Link, command: AsciiCommand) -> Result<AsciiReply> {
        exchange(&self.codec, link, &command).await
    }

    fn motor_powered(store: &PropertyStore) -> bool {
        store
            .float("battery_main")
            .map_or(true, |v| v > MIN_MOTOR_VOLTS)
    }
}

/// Smallest angle between two azimuths
fn azimuth_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

#[async_trait]
impl Driver for Dome {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Dome
    }

    fn model(&self) -> &str {
        "NexDome"
    }

    fn schema(&self) -> Vec<PropertySpec> {
        vec![
            PropertySpec::read_write("azimuth", ValueKind::Float),
            PropertySpec::read_only("moving", ValueKind::Bool),
            PropertySpec::read_only("at_home", ValueKind::Bool),
            PropertySpec::read_only("parked", ValueKind::Bool),
            PropertySpec::read_only("battery_main", ValueKind::Float),
            PropertySpec::read_only("battery_shutter", ValueKind::Float),
            PropertySpec::enumeration("shutter", &SHUTTER_STATES),
            PropertySpec::read_only("shutter_position", ValueKind::Float),
        ]
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn handshake(&mut self, link: &mut Link) -> Result<DeviceInfo> {
        let reply = self.query(link, AsciiCommand::new("v")).await?;
        if reply.fields.is_empty() {
            return Err(CodecError::Malformed("empty firmware version".to_string()).into());
        }
        Ok(DeviceInfo {
            firmware: reply.fields.join(" "),
            description: None,
        })
    }

    async fn poll(&mut self, link: &mut Link, _store: &PropertyStore) -> Result<Vec<Reading>> {
        let motion = self
            .query(link, AsciiCommand::new("m"))
            .await?
            .int(0, "motion", 0..=3)?;
        let moving = motion != 0;
        let azimuth = self
            .query(link, AsciiCommand::new("q"))
            .await?
            .float(0, "azimuth", 0.0..=360.0)?;

        let battery = self.query(link, AsciiCommand::new("k")).await?;
        let main = battery.float(0, "battery_main", 0.0..=1600.0)? / 100.0;
        let shutter_volts = battery.float(1, "battery_shutter", 0.0..=1600.0)? / 100.0;

        let shutter_code = self
            .query(link, AsciiCommand::new("u"))
            .await?
            .int(0, "shutter", 0..=5)?;
        let shutter_position = self
            .query(link, AsciiCommand::new("b"))
            .await?
            .float(0, "shutter_position", -22.5..=90.0)?;

        let mut readings = vec![
            Reading::new("moving", moving),
            Reading::new("azimuth", azimuth),
            Reading::new("battery_main", main),
            Reading::new("battery_shutter", shutter_volts),
            Reading::new("shutter", SHUTTER_STATES[shutter_code as usize]),
            Reading::new("shutter_position", shutter_position),
        ];

        if self.parking && !moving && azimuth_distance(azimuth, self.park_azimuth) <= AZIMUTH_TOLERANCE {
            debug!("Dome stopped at park azimuth {:.1}", azimuth);
            self.parking = false;
            self.parked = true;
        }
        readings.push(Reading::new("parked", self.parked));

        // The home sensor is only meaningful while the dome is stopped
        if !moving {
            let home = self
                .query(link, AsciiCommand::new("z"))
                .await?
                .int(0, "home", -1..=1)?;
            readings.push(Reading::new("at_home", home == 1));
        }

        Ok(readings)
    }

    fn check_intent(&self, intent: &Intent, store: &PropertyStore) -> Result<()> {
        require_capability(self, intent)?;

        if !Self::motor_powered(store) {
            return Err(DriverError::rejected(format!(
                "motor battery at {:.2} V, needs more than {} V",
                store.float("battery_main").unwrap_or_default(),
                MIN_MOTOR_VOLTS
            )));
        }

        let parked = store.bool("parked") == Some(true);
        match intent {
            Intent::RotateTo(_) | Intent::FindHome | Intent::OpenShutter | Intent::CloseShutter if parked => {
                Err(DriverError::rejected("dome is parked"))
            }
            Intent::RotateTo(az) if !(0.0..360.0).contains(az) => Err(DriverError::rejected(
                format!("azimuth {} outside 0..360", az),
            )),
            Intent::OpenShutter | Intent::CloseShutter
                if store.text("shutter") == Some(SHUTTER_STATES[0]) =>
            {
                Err(DriverError::rejected("shutter is not connected"))
            }
            _ => Ok(()),
        }
    }

    async fn start(&mut self, link: &mut Link, intent: &Intent, _store: &PropertyStore) -> Result<Ack> {
        let (command, target) = match intent {
            Intent::RotateTo(az) => (
                Some(AsciiCommand::new("g").arg(format!("{:.1}", az))),
                Value::Float(*az),
            ),
            Intent::Park => (
                Some(AsciiCommand::new("g").arg(format!("{:.1}", self.park_azimuth))),
                Value::Float(self.park_azimuth),
            ),
            // Releasing the park state needs no motion
            Intent::Unpark => (None, Value::Bool(false)),
            Intent::FindHome => (Some(AsciiCommand::new("h")), Value::Bool(true)),
            Intent::OpenShutter => (Some(AsciiCommand::new("d")), Value::from(SHUTTER_STATES[1])),
            Intent::CloseShutter => (Some(AsciiCommand::new("e")), Value::from(SHUTTER_STATES[3])),
            other => return Err(DriverError::unsupported(other.name())),
        };

        if let Some(command) = command {
            self.query(link, command).await?;
        }
        self.parking = matches!(intent, Intent::Park);
        if matches!(intent, Intent::Unpark) {
            self.parked = false;
        }
        Ok(Ack::new(target))
    }

    async fn abort(&mut self, link: &mut Link) -> Result<()> {
        self.parking = false;
        self.query(link, AsciiCommand::new("a")).await.map(|_| ())
    }

    fn evaluate(&self, intent: &Intent, target: &Value, store: &PropertyStore) -> Evaluation {
        if !Self::motor_powered(store) {
            return Evaluation::Interrupted {
                kind: ErrorKind::ResourceUnavailable,
                reason: format!(
                    "motor battery dropped to {:.2} V",
                    store.float("battery_main").unwrap_or_default()
                ),
            };
        }

        let moving = store.bool("moving").unwrap_or(true);
        let azimuth = store.float("azimuth");
        let parked = store.bool("parked");

        match intent {
            Intent::RotateTo(_) => match (azimuth, target.as_float()) {
                (Some(az), Some(t)) => {
                    let distance = azimuth_distance(az, t);
                    if !moving && distance <= AZIMUTH_TOLERANCE {
                        Evaluation::Completed
                    } else {
                        Evaluation::Progress(distance)
                    }
                }
                _ => Evaluation::remaining(None),
            },
            Intent::Park if parked == Some(true) => Evaluation::Completed,
            Intent::Park => Evaluation::remaining(azimuth.map(|az| azimuth_distance(az, self.park_azimuth))),
            Intent::Unpark if parked == Some(false) => Evaluation::Completed,
            Intent::Unpark => Evaluation::remaining(None),
            Intent::FindHome => {
                if !moving && store.bool("at_home") == Some(true) {
                    Evaluation::Completed
                } else {
                    Evaluation::remaining(None)
                }
            }
            Intent::OpenShutter | Intent::CloseShutter => {
                let state = store.text("shutter");
                if state == Some(SHUTTER_STATES[0]) {
                    return Evaluation::Interrupted {
                        kind: ErrorKind::ResourceUnavailable,
                        reason: "shutter lost its connection".to_string(),
                    };
                }
                if state.is_some() && state == target.as_str() {
                    Evaluation::Completed
                } else {
                    let open_at = match intent {
                        Intent::OpenShutter => SHUTTER_OPEN_POSITION,
                        _ => 0.0,
                    };
                    Evaluation::remaining(store.float("shutter_position").map(|p| open_at - p))
                }
            }
            _ => Evaluation::Interrupted {
                kind: ErrorKind::DeviceFault,
                reason: format!("dome cannot track {}", intent.name()),
            },
        }
    }

    fn is_halted(&self, store: &PropertyStore) -> bool {
        let shutter_moving = matches!(store.text("shutter"), Some("opening") | Some("closing"));
        store.bool("moving") == Some(false) && !shutter_moving
    }

    fn health(&self, store: &PropertyStore) -> Health {
        if Self::motor_powered(store) {
            Health::Ok
        } else {
            Health::Fault("motor is not powered".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::device::TransportAddress;
    use crate::sim::{DomeSim, SimConnector};
    use crate::transport::Connector;

    fn dome_store(driver: &Dome, volts: f64, azimuth: f64, moving: bool) -> PropertyStore {
        let mut store = PropertyStore::from_schema(&driver.schema());
        store.set_from_device("battery_main", Value::Float(volts)).unwrap();
        store.set_from_device("azimuth", Value::Float(azimuth)).unwrap();
        store.set_from_device("moving", Value::Bool(moving)).unwrap();
        store
    }

    #[test]
    fn test_azimuth_distance_wraps() {
        assert!((azimuth_distance(359.8, 0.1) - 0.3).abs() < 1e-9);
        assert!((azimuth_distance(90.0, 270.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_low_battery_rejects_motion() {
        let driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let store = dome_store(&driver, 6.9, 10.0, false);
        assert!(matches!(
            driver.check_intent(&Intent::RotateTo(90.0), &store),
            Err(DriverError::Rejected(_))
        ));
        assert!(matches!(
            driver.check_intent(&Intent::Unpark, &store),
            Err(DriverError::Rejected(_))
        ));
        assert!(matches!(driver.health(&store), Health::Fault(_)));
    }

    #[test]
    fn test_power_loss_interrupts() {
        let driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let store = dome_store(&driver, 7.0, 45.0, true);
        assert!(matches!(
            driver.evaluate(&Intent::RotateTo(90.0), &Value::Float(90.0), &store),
            Evaluation::Interrupted {
                kind: ErrorKind::ResourceUnavailable,
                ..
            }
        ));
    }

    #[test]
    fn test_rotation_completion() {
        let driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let target = Value::Float(90.0);
        let moving = dome_store(&driver, 12.5, 89.8, true);
        assert!(matches!(
            driver.evaluate(&Intent::RotateTo(90.0), &target, &moving),
            Evaluation::Progress(d) if (d - 0.2).abs() < 1e-9
        ));
        let stopped = dome_store(&driver, 12.5, 89.8, false);
        assert_eq!(
            driver.evaluate(&Intent::RotateTo(90.0), &target, &stopped),
            Evaluation::Completed
        );
    }

    #[test]
    fn test_parked_dome_refuses_motion() {
        let driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let mut store = dome_store(&driver, 12.5, 180.0, false);
        store.set_from_device("parked", Value::Bool(true)).unwrap();
        for intent in [
            Intent::RotateTo(90.0),
            Intent::FindHome,
            Intent::OpenShutter,
            Intent::CloseShutter,
        ] {
            assert!(
                matches!(driver.check_intent(&intent, &store), Err(DriverError::Rejected(_))),
                "{:?} accepted while parked",
                intent
            );
        }
        assert!(driver.check_intent(&Intent::Park, &store).is_ok());
        assert!(driver.check_intent(&Intent::Unpark, &store).is_ok());
    }

    async fn link_to(sim: DomeSim) -> Link {
        let connector = SimConnector::new(Arc::new(Mutex::new(sim)));
        let transport = connector
            .open(
                &TransportAddress::Simulated {
                    model: NAME.to_string(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        Link::new(transport, Duration::from_millis(200))
    }

    async fn poll_into(driver: &mut Dome, link: &mut Link, store: &mut PropertyStore) {
        for reading in driver.poll(link, store).await.unwrap() {
            store.set_from_device(reading.key, reading.value).unwrap();
        }
    }

    #[tokio::test]
    async fn test_park_is_reported_once_stopped() {
        let mut link = link_to(DomeSim::new(150.0)).await;
        let mut driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let mut store = PropertyStore::from_schema(&driver.schema());
        let park_target = Value::Float(DEFAULT_PARK_AZIMUTH);

        let ack = driver.start(&mut link, &Intent::Park, &store).await.unwrap();
        assert!(ack.confirmed.is_empty());
        for _ in 0..2 {
            poll_into(&mut driver, &mut link, &mut store).await;
            assert_eq!(store.bool("parked"), Some(false));
            assert!(matches!(
                driver.evaluate(&Intent::Park, &park_target, &store),
                Evaluation::Progress(_)
            ));
        }

        poll_into(&mut driver, &mut link, &mut store).await;
        assert_eq!(store.bool("parked"), Some(true));
        assert_eq!(driver.evaluate(&Intent::Park, &park_target, &store), Evaluation::Completed);
        assert!(driver.check_intent(&Intent::RotateTo(90.0), &store).is_err());

        // Unparking is confirmed by the next poll, not by the command
        driver.start(&mut link, &Intent::Unpark, &store).await.unwrap();
        assert_eq!(store.bool("parked"), Some(true));
        poll_into(&mut driver, &mut link, &mut store).await;
        assert_eq!(store.bool("parked"), Some(false));
        assert_eq!(
            driver.evaluate(&Intent::Unpark, &Value::Bool(false), &store),
            Evaluation::Completed
        );
        assert!(driver.check_intent(&Intent::RotateTo(90.0), &store).is_ok());
    }

    #[tokio::test]
    async fn test_rotation_to_park_azimuth_is_not_a_park() {
        let mut link = link_to(DomeSim::new(175.0)).await;
        let mut driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let mut store = PropertyStore::from_schema(&driver.schema());

        driver.start(&mut link, &Intent::RotateTo(180.0), &store).await.unwrap();
        poll_into(&mut driver, &mut link, &mut store).await;
        assert_eq!(store.float("azimuth"), Some(180.0));
        assert_eq!(store.bool("moving"), Some(false));
        assert_eq!(store.bool("parked"), Some(false));
    }

    #[tokio::test]
    async fn test_poll_against_simulator() {
        let connector = SimConnector::new(Arc::new(Mutex::new(DomeSim::new(30.0))));
        let transport = connector
            .open(
                &TransportAddress::Simulated {
                    model: NAME.to_string(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let mut link = Link::new(transport, Duration::from_millis(200));
        let mut driver = Dome::new(DEFAULT_PARK_AZIMUTH);
        let store = PropertyStore::from_schema(&driver.schema());

        let info = driver.handshake(&mut link).await.unwrap();
        assert!(!info.firmware.is_empty());

        let readings = driver.poll(&mut link, &store).await.unwrap();
        assert!(readings.contains(&Reading::new("azimuth", 30.0)));
        assert!(readings.contains(&Reading::new("shutter", "closed")));
        assert!(readings.contains(&Reading::new("at_home", false)));
        assert!(readings.contains(&Reading::new("parked", false)));

        let ack = driver.start(&mut link, &Intent::Park, &store).await.unwrap();
        assert_eq!(ack.target, Value::Float(180.0));
    }
}
