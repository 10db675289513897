/*!
 * Three-channel dew heater controller.
 *
 * Commands are six characters with no terminator. Status comes back as
 * sixteen `/` separated fields between `##` and `**`:
 *
 * ```text
 * ##22.37/22.62/23.35/50.77/12.55/0/0/0/0/0/0/2/2/0/0/4**
 *   t1    t2    amb   hum   dew   o1 o2 o3 c1 c2 ca th1 th2 auto link aggr
 * ```
 */
use async_trait::async_trait;

use skylink_core::config::DeviceConfig;
use skylink_core::types::Value;

use crate::codec::{exchange, AsciiCodec, AsciiCommand, AsciiDialect, AsciiReply};
use crate::device::{Capability, DeviceInfo, DeviceKind, Intent};
use crate::driver::{require_capability, Ack, Driver, Evaluation, Health};
use crate::error::{CodecError, DriverError, ErrorKind, Result};
use crate::property::{PropertySpec, PropertyStore, Reading, ValueKind};
use crate::transport::Link;

/// Driver name
pub const NAME: &str = "dew-heater";

/// Number of heater outputs
pub const CHANNELS: u8 = 3;

const OUTPUT_KEYS: [&str; CHANNELS as usize] = ["output_1", "output_2", "output_3"];

const STATUS_FIELDS: usize = 16;

const CAPABILITIES: &[Capability] = &[Capability::HasHeaters, Capability::HasTemperatureSensor];

/// Dew heater driver
#[derive(Debug, Clone)]
pub struct DewHeater {
    plain: AsciiCodec,
    status: AsciiCodec,
}

impl Default for DewHeater {
    fn default() -> Self {
        let dialect = AsciiDialect::fixed_width();
        Self {
            status: AsciiCodec::new(dialect.clone().with_reply_frame("##", "**")),
            plain: AsciiCodec::new(dialect),
        }
    }
}

impl DewHeater {
    /// Create a driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a device entry
    pub fn from_config(_config: &DeviceConfig) -> Self {
        Self::default()
    }

    async fn query(&self, link: &mut Link, word: &str) -> Result<AsciiReply> {
        exchange(&self.plain, link, &AsciiCommand::new(word)).await
    }

    fn output_key(channel: u8) -> Option<&'static str> {
        channel
            .checked_sub(1)
            .and_then(|i| OUTPUT_KEYS.get(usize::from(i)))
            .copied()
    }
}

/// Parse the firmware number out of `UDP2(<n>)`
fn parse_identity(line: &str) -> Option<String> {
    line.strip_prefix("UDP2(")?
        .strip_suffix(')')
        .filter(|fw| !fw.is_empty() && fw.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
}

#[async_trait]
impl Driver for DewHeater {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Auxiliary
    }

    fn model(&self) -> &str {
        "USB_Dewpoint v2"
    }

    fn schema(&self) -> Vec<PropertySpec> {
        let mut schema = vec![
            PropertySpec::read_only("temperature_1", ValueKind::Float),
            PropertySpec::read_only("temperature_2", ValueKind::Float),
            PropertySpec::read_only("temperature_ambient", ValueKind::Float),
            PropertySpec::read_only("humidity", ValueKind::Float),
            PropertySpec::read_only("dew_point", ValueKind::Float),
            PropertySpec::read_only("auto_mode", ValueKind::Bool),
            PropertySpec::read_only("link_outputs", ValueKind::Bool),
            PropertySpec::read_only("aggressivity", ValueKind::Int),
        ];
        schema.extend(
            OUTPUT_KEYS
                .iter()
                .map(|key| PropertySpec::read_write(*key, ValueKind::Int)),
        );
        schema
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn handshake(&mut self, link: &mut Link) -> Result<DeviceInfo> {
        let reply = self.query(link, "SWHOIS").await?;
        let firmware = parse_identity(&reply.line).ok_or_else(|| {
            CodecError::Malformed(format!("unexpected identity {:?}", reply.line))
        })?;
        Ok(DeviceInfo {
            firmware,
            description: Some(self.model().to_string()),
        })
    }

    async fn poll(&mut self, link: &mut Link, _store: &PropertyStore) -> Result<Vec<Reading>> {
        let reply = exchange(&self.status, link, &AsciiCommand::new("SGETAL")).await?;
        if reply.fields.len() != STATUS_FIELDS {
            return Err(CodecError::Malformed(format!(
                "status has {} fields, expected {}",
                reply.fields.len(),
                STATUS_FIELDS
            ))
            .into());
        }

        let temperature = |i: usize, name: &str| reply.float(i, name, -60.0..=80.0);
        let mut readings = vec![
            Reading::new("temperature_1", temperature(0, "temperature_1")?),
            Reading::new("temperature_2", temperature(1, "temperature_2")?),
            Reading::new("temperature_ambient", temperature(2, "temperature_ambient")?),
            Reading::new("humidity", reply.float(3, "humidity", 0.0..=100.0)?),
            Reading::new("dew_point", temperature(4, "dew_point")?),
        ];
        for (i, key) in OUTPUT_KEYS.into_iter().enumerate() {
            readings.push(Reading::new(key, reply.int(5 + i, key, 0..=100)?));
        }
        readings.push(Reading::new("auto_mode", reply.flag(13, "auto_mode")?));
        readings.push(Reading::new("link_outputs", reply.flag(14, "link_outputs")?));
        readings.push(Reading::new("aggressivity", reply.int(15, "aggressivity", 1..=4)?));
        Ok(readings)
    }

    fn check_intent(&self, intent: &Intent, store: &PropertyStore) -> Result<()> {
        require_capability(self, intent)?;
        if let Intent::SetHeater { channel, power } = intent {
            if Self::output_key(*channel).is_none() {
                return Err(DriverError::rejected(format!(
                    "channel {} outside 1..={}",
                    channel, CHANNELS
                )));
            }
            if *power > 100 {
                return Err(DriverError::rejected(format!("power {} above 100", power)));
            }
            if store.bool("auto_mode") == Some(true) {
                return Err(DriverError::rejected("outputs are under automatic control"));
            }
        }
        Ok(())
    }

    async fn start(&mut self, link: &mut Link, intent: &Intent, _store: &PropertyStore) -> Result<Ack> {
        let (channel, power) = match intent {
            Intent::SetHeater { channel, power } => (*channel, *power),
            other => return Err(DriverError::unsupported(other.name())),
        };
        let key = Self::output_key(channel)
            .ok_or_else(|| DriverError::rejected(format!("no output channel {}", channel)))?;

        let reply = self.query(link, &format!("S{}O{:03}", channel, power)).await?;
        if reply.line != "DONE" {
            return Err(CodecError::UnexpectedEcho {
                expected: "DONE".to_string(),
                actual: reply.line,
            }
            .into());
        }
        Ok(Ack::new(i64::from(power)).confirming(key, i64::from(power)))
    }

    async fn abort(&mut self, _link: &mut Link) -> Result<()> {
        // Output changes are immediate; there is nothing in flight to halt
        Ok(())
    }

    fn evaluate(&self, intent: &Intent, target: &Value, store: &PropertyStore) -> Evaluation {
        let key = match intent {
            Intent::SetHeater { channel, .. } => Self::output_key(*channel),
            _ => None,
        };
        let Some(key) = key else {
            return Evaluation::Interrupted {
                kind: ErrorKind::DeviceFault,
                reason: format!("dew heater cannot track {}", intent.name()),
            };
        };
        match store.int(key) {
            Some(level) if Some(level) == target.as_int() => Evaluation::Completed,
            Some(level) => Evaluation::remaining(target.as_int().map(|t| level.abs_diff(t) as f64)),
            None => Evaluation::remaining(None),
        }
    }

    fn is_halted(&self, _store: &PropertyStore) -> bool {
        true
    }

    fn health(&self, _store: &PropertyStore) -> Health {
        Health::Ok
    }
}
