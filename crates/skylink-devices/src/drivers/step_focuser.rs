/*!
 * Focuser speaking an ASCII echo protocol.
 *
 * Each request is a command word with optional arguments and each reply
 * repeats the word before its fields: `getpos` -> `getpos:1500`. Motion
 * commands answer with a result code where `0` means accepted.
 */
use async_trait::async_trait;

use skylink_core::config::DeviceConfig;
use skylink_core::types::Value;

use super::{evaluate_focus, focus_target, DEFAULT_MAX_POSITION};
use crate::codec::{exchange, AsciiCodec, AsciiCommand, AsciiDialect, AsciiReply};
use crate::device::{Capability, DeviceInfo, DeviceKind, Intent};
use crate::driver::{require_capability, Ack, Driver, Evaluation, Health};
use crate::error::{DriverError, Result};
use crate::property::{PropertySpec, PropertyStore, Reading, ValueKind};
use crate::transport::Link;

/// Driver name
pub const NAME: &str = "step-focuser";

/// Temperature the firmware reports when no probe is attached
const NO_PROBE: f64 = -127.0;

const CAPABILITIES: &[Capability] = &[
    Capability::MovesAbsolute,
    Capability::MovesRelative,
    Capability::HasTemperatureSensor,
];

/// ASCII step focuser driver
#[derive(Debug, Clone)]
pub struct StepFocuser {
    codec: AsciiCodec,
    max_position: i64,
}

impl StepFocuser {
    /// Create a driver for a focuser with the given travel
    pub fn new(max_position: i64) -> Self {
        Self {
            codec: AsciiCodec::new(AsciiDialect::word_echo()),
            max_position,
        }
    }

    /// Create from a device entry
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.max_position.unwrap_or(DEFAULT_MAX_POSITION))
    }

    async fn query(&self, link: &mut Link, command: AsciiCommand) -> Result<AsciiReply> {
        exchange(&self.codec, link, &command).await
    }

    /// Run a command answered by a result code
    async fn act(&self, link: &mut Link, command: AsciiCommand) -> Result<()> {
        let word = command.word.clone();
        let reply = self.query(link, command).await?;
        match reply.int(0, "result", i64::MIN..=i64::MAX)? {
            0 => Ok(()),
            code => Err(DriverError::rejected(format!("{} refused with code {}", word, code))),
        }
    }
}

#[async_trait]
impl Driver for StepFocuser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Focuser
    }

    fn model(&self) -> &str {
        "ASCII step focuser"
    }

    fn schema(&self) -> Vec<PropertySpec> {
        vec![
            PropertySpec::read_write("position", ValueKind::Int),
            PropertySpec::read_only("moving", ValueKind::Bool),
            PropertySpec::read_only("temperature", ValueKind::Float),
            PropertySpec::read_only("probe_attached", ValueKind::Bool),
        ]
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn handshake(&mut self, link: &mut Link) -> Result<DeviceInfo> {
        let reply = self.query(link, AsciiCommand::new("hello")).await?;
        Ok(DeviceInfo {
            firmware: reply.text(0, "firmware")?.to_string(),
            description: reply.fields.get(1).cloned(),
        })
    }

    async fn poll(&mut self, link: &mut Link, _store: &PropertyStore) -> Result<Vec<Reading>> {
        let position = self
            .query(link, AsciiCommand::new("getpos"))
            .await?
            .int(0, "position", 0..=self.max_position)?;
        let moving = self
            .query(link, AsciiCommand::new("ismoving"))
            .await?
            .flag(0, "moving")?;
        let temperature = self
            .query(link, AsciiCommand::new("gettemp"))
            .await?
            .float(0, "temperature", -128.0..=80.0)?;

        let mut readings = vec![
            Reading::new("position", position),
            Reading::new("moving", moving),
        ];
        if temperature <= NO_PROBE {
            readings.push(Reading::new("probe_attached", false));
        } else {
            readings.push(Reading::new("probe_attached", true));
            readings.push(Reading::new("temperature", temperature));
        }
        Ok(readings)
    }

    fn check_intent(&self, intent: &Intent, store: &PropertyStore) -> Result<()> {
        require_capability(self, intent)?;
        focus_target(intent, store, self.max_position).map(|_| ())
    }

    async fn start(&mut self, link: &mut Link, intent: &Intent, store: &PropertyStore) -> Result<Ack> {
        let target = focus_target(intent, store, self.max_position)?;
        self.act(link, AsciiCommand::new("goto").arg(target)).await?;
        Ok(Ack::new(target))
    }

    async fn abort(&mut self, link: &mut Link) -> Result<()> {
        self.act(link, AsciiCommand::new("stop")).await
    }

    fn evaluate(&self, _intent: &Intent, target: &Value, store: &PropertyStore) -> Evaluation {
        evaluate_focus(target, store)
    }

    fn is_halted(&self, store: &PropertyStore) -> bool {
        store.bool("moving") == Some(false)
    }

    fn health(&self, _store: &PropertyStore) -> Health {
        Health::Ok
    }
}
