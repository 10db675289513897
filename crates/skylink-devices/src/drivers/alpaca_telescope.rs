/*!
 * Telescope mount behind an ASCOM Alpaca REST server.
 */
use async_trait::async_trait;
use tracing::debug;

use skylink_core::config::DeviceConfig;
use skylink_core::types::Value;

use crate::codec::{exchange, RestCodec, RestReply, RestRequest};
use crate::device::{Capability, DeviceInfo, DeviceKind, Intent};
use crate::driver::{require_capability, Ack, Driver, Evaluation, Health};
use crate::error::{DriverError, ErrorKind, Result};
use crate::property::{PropertySpec, PropertyStore, Reading, ValueKind};
use crate::transport::Link;

/// Driver name
pub const NAME: &str = "alpaca-telescope";

/// Client id used when the configuration gives none
pub const DEFAULT_CLIENT_ID: u32 = 1;

/// Right ascension tolerance, hours (about 4 seconds of time)
const RA_TOLERANCE: f64 = 0.0011;
/// Declination tolerance, degrees (one arc-minute)
const DEC_TOLERANCE: f64 = 1.0 / 60.0;

const CAPABILITIES: &[Capability] = &[Capability::Slews, Capability::Parks, Capability::Homes];

/// Alpaca telescope driver
#[derive(Debug, Clone)]
pub struct AlpacaTelescope {
    codec: RestCodec,
}

impl AlpacaTelescope {
    /// Create a driver for `/api/v{api_version}/telescope/{device_number}`
    pub fn new(api_version: u32, device_number: u32, client_id: u32) -> Self {
        Self {
            codec: RestCodec::new(api_version, "telescope", device_number, client_id),
        }
    }

    /// Create from a device entry
    pub fn from_config(config: &DeviceConfig) -> Self {
        let api_version = match &config.transport {
            skylink_core::config::TransportConfig::Alpaca { api_version, .. } => *api_version,
            _ => 1,
        };
        Self::new(
            api_version,
            config.device_number,
            config.client_id.unwrap_or(DEFAULT_CLIENT_ID),
        )
    }

    async fn call(&self, link: &mut Link, request: RestRequest) -> Result<RestReply> {
        let reply = exchange(&self.codec, link, &request).await?;
        reply.ensure_ok()?;
        Ok(reply)
    }

    async fn action(&mut self, link: &mut Link, command: &str) -> Result<()> {
        let request = self.codec.put(command);
        self.call(link, request).await.map(|_| ())
    }

    async fn read(&mut self, link: &mut Link, command: &str) -> Result<RestReply> {
        let request = self.codec.get(command);
        self.call(link, request).await
    }
}

/// Hour-angle distance on the 24 h circle
fn ra_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(24.0);
    d.min(24.0 - d)
}

#[async_trait]
impl Driver for AlpacaTelescope {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Telescope
    }

    fn model(&self) -> &str {
        "Alpaca telescope"
    }

    fn schema(&self) -> Vec<PropertySpec> {
        vec![
            PropertySpec::read_write("right_ascension", ValueKind::Float),
            PropertySpec::read_write("declination", ValueKind::Float),
            PropertySpec::read_only("slewing", ValueKind::Bool),
            PropertySpec::read_only("parked", ValueKind::Bool),
            PropertySpec::read_only("at_home", ValueKind::Bool),
        ]
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn handshake(&mut self, link: &mut Link) -> Result<DeviceInfo> {
        let name = self.read(link, "name").await?.text("name")?.to_string();
        let request = self.codec.put("connected").param("Connected", true);
        self.call(link, request).await?;
        debug!("Connected to Alpaca telescope {}", name);
        Ok(DeviceInfo {
            firmware: String::new(),
            description: Some(name),
        })
    }

    async fn poll(&mut self, link: &mut Link, _store: &PropertyStore) -> Result<Vec<Reading>> {
        let ra = self
            .read(link, "rightascension")
            .await?
            .float("right_ascension", 0.0..=24.0)?;
        let dec = self
            .read(link, "declination")
            .await?
            .float("declination", -90.0..=90.0)?;
        let slewing = self.read(link, "slewing").await?.bool("slewing")?;
        let parked = self.read(link, "atpark").await?.bool("parked")?;
        let at_home = self.read(link, "athome").await?.bool("at_home")?;

        Ok(vec![
            Reading::new("right_ascension", ra),
            Reading::new("declination", dec),
            Reading::new("slewing", slewing),
            Reading::new("parked", parked),
            Reading::new("at_home", at_home),
        ])
    }

    fn check_intent(&self, intent: &Intent, store: &PropertyStore) -> Result<()> {
        require_capability(self, intent)?;
        let parked = store.bool("parked") == Some(true);
        match intent {
            Intent::SlewTo { ra, dec } => {
                if !(0.0..24.0).contains(ra) || !(-90.0..=90.0).contains(dec) {
                    return Err(DriverError::rejected(format!(
                        "coordinates out of range: ra {} dec {}",
                        ra, dec
                    )));
                }
                if parked {
                    return Err(DriverError::rejected("mount is parked"));
                }
                Ok(())
            }
            Intent::FindHome if parked => Err(DriverError::rejected("mount is parked")),
            _ => Ok(()),
        }
    }

    async fn start(&mut self, link: &mut Link, intent: &Intent, _store: &PropertyStore) -> Result<Ack> {
        match intent {
            Intent::SlewTo { ra, dec } => {
                let request = self
                    .codec
                    .put("slewtocoordinatesasync")
                    .param("RightAscension", ra)
                    .param("Declination", dec);
                self.call(link, request).await?;
                Ok(Ack::new(format!("{:.4} {:+.3}", ra, dec)))
            }
            Intent::Park => {
                self.action(link, "park").await?;
                Ok(Ack::new(true))
            }
            Intent::Unpark => {
                self.action(link, "unpark").await?;
                Ok(Ack::new(false))
            }
            Intent::FindHome => {
                self.action(link, "findhome").await?;
                Ok(Ack::new(true))
            }
            other => Err(DriverError::unsupported(other.name())),
        }
    }

    async fn abort(&mut self, link: &mut Link) -> Result<()> {
        self.action(link, "abortslew").await
    }

    fn evaluate(&self, intent: &Intent, _target: &Value, store: &PropertyStore) -> Evaluation {
        let slewing = store.bool("slewing").unwrap_or(true);

        // Distance left in degrees of sky, where the mount reports one
        let (done, remaining) = match intent {
            Intent::SlewTo { ra, dec } => {
                if store.bool("parked") == Some(true) {
                    return Evaluation::Interrupted {
                        kind: ErrorKind::DeviceFault,
                        reason: "mount parked during slew".to_string(),
                    };
                }
                match (store.float("right_ascension"), store.float("declination")) {
                    (Some(cur_ra), Some(cur_dec)) => {
                        let ra_off = ra_distance(cur_ra, *ra);
                        let dec_off = (cur_dec - dec).abs();
                        let done = !slewing && ra_off <= RA_TOLERANCE && dec_off <= DEC_TOLERANCE;
                        (done, Some(ra_off * 15.0 + dec_off))
                    }
                    _ => (false, None),
                }
            }
            Intent::Park => (store.bool("parked") == Some(true), None),
            Intent::Unpark => (store.bool("parked") == Some(false), None),
            Intent::FindHome => (!slewing && store.bool("at_home") == Some(true), None),
            other => {
                return Evaluation::Interrupted {
                    kind: ErrorKind::DeviceFault,
                    reason: format!("telescope cannot track {}", other.name()),
                }
            }
        };

        if done {
            Evaluation::Completed
        } else {
            Evaluation::remaining(remaining)
        }
    }

    fn is_halted(&self, store: &PropertyStore) -> bool {
        store.bool("slewing") == Some(false)
    }

    fn health(&self, _store: &PropertyStore) -> Health {
        Health::Ok
    }
}
