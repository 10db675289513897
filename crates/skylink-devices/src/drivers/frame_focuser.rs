/*!
 * Focuser speaking checksummed binary frames.
 *
 * | opcode | request payload | ack payload |
 * |---|---|---|
 * | `0x01` identify | - | firmware string |
 * | `0x02` status | - | position `i32`, moving `u8`, temperature centi-°C `i16` |
 * | `0x10` move | target `i32` | target `i32` |
 * | `0x11` halt | - | - |
 *
 * Acks set bit 7 of the opcode; a refusal is opcode `0x7F` with payload
 * `[opcode, reason]`.
 */
use async_trait::async_trait;
use tracing::debug;

use skylink_core::config::DeviceConfig;
use skylink_core::types::Value;

use super::{evaluate_focus, focus_target, DEFAULT_MAX_POSITION};
use crate::codec::{exchange, BinaryCodec, Frame};
use crate::device::{Capability, DeviceInfo, DeviceKind, Intent};
use crate::driver::{require_capability, Ack, Driver, Evaluation, Health};
use crate::error::{CodecError, DriverError, Result};
use crate::property::{PropertySpec, PropertyStore, Reading, ValueKind};
use crate::transport::Link;

/// Driver name
pub const NAME: &str = "frame-focuser";

/// Identify opcode
pub const OP_IDENTIFY: u8 = 0x01;
/// Status opcode
pub const OP_STATUS: u8 = 0x02;
/// Move opcode
pub const OP_MOVE: u8 = 0x10;
/// Halt opcode
pub const OP_HALT: u8 = 0x11;

/// NAK reason: target outside travel
pub const NAK_RANGE: u8 = 0x01;
/// NAK reason: motor busy
pub const NAK_BUSY: u8 = 0x02;

const CAPABILITIES: &[Capability] = &[
    Capability::MovesAbsolute,
    Capability::MovesRelative,
    Capability::HasTemperatureSensor,
];

/// Binary-frame focuser driver
#[derive(Debug, Clone)]
pub struct FrameFocuser {
    codec: BinaryCodec,
    max_position: i64,
}

impl FrameFocuser {
    /// Create a driver for a focuser with the given travel
    pub fn new(max_position: i64) -> Self {
        Self {
            codec: BinaryCodec::default(),
            max_position,
        }
    }

    /// Create from a device entry
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.max_position.unwrap_or(DEFAULT_MAX_POSITION))
    }

    async fn command(&self, link: &mut Link, frame: Frame) -> Result<Frame> {
        let reply = exchange(&self.codec, link, &frame).await?;
        match self.codec.nak_reason(&reply) {
            Some(NAK_RANGE) => Err(DriverError::rejected("target outside travel")),
            Some(NAK_BUSY) => Err(DriverError::rejected("motor busy")),
            Some(reason) => Err(DriverError::rejected(format!(
                "opcode {:#04x} refused with reason {:#04x}",
                frame.opcode, reason
            ))),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl Driver for FrameFocuser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Focuser
    }

    fn model(&self) -> &str {
        "binary frame focuser"
    }

    fn schema(&self) -> Vec<PropertySpec> {
        vec![
            PropertySpec::read_write("position", ValueKind::Int),
            PropertySpec::read_only("target", ValueKind::Int),
            PropertySpec::read_only("moving", ValueKind::Bool),
            PropertySpec::read_only("temperature", ValueKind::Float),
        ]
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn handshake(&mut self, link: &mut Link) -> Result<DeviceInfo> {
        let reply = self.command(link, Frame::bare(OP_IDENTIFY)).await?;
        let firmware = String::from_utf8(reply.payload)
            .map_err(|_| CodecError::Malformed("identify reply is not text".to_string()))?;
        debug!("Focuser firmware {}", firmware);
        Ok(DeviceInfo {
            firmware,
            description: None,
        })
    }

    async fn poll(&mut self, link: &mut Link, _store: &PropertyStore) -> Result<Vec<Reading>> {
        let reply = self.command(link, Frame::bare(OP_STATUS)).await?;

        let position = i64::from(reply.i32_at(0, "position")?);
        if !(0..=self.max_position).contains(&position) {
            return Err(CodecError::OutOfRange {
                field: "position".to_string(),
                value: position.to_string(),
            }
            .into());
        }
        let moving = match reply.u8_at(4, "moving")? {
            0 => false,
            1 => true,
            other => {
                return Err(CodecError::OutOfRange {
                    field: "moving".to_string(),
                    value: other.to_string(),
                }
                .into())
            }
        };
        let temperature = f64::from(reply.i16_at(5, "temperature")?) / 100.0;
        if !(-60.0..=80.0).contains(&temperature) {
            return Err(CodecError::OutOfRange {
                field: "temperature".to_string(),
                value: temperature.to_string(),
            }
            .into());
        }

        Ok(vec![
            Reading::new("position", position),
            Reading::new("moving", moving),
            Reading::new("temperature", temperature),
        ])
    }

    fn check_intent(&self, intent: &Intent, store: &PropertyStore) -> Result<()> {
        require_capability(self, intent)?;
        focus_target(intent, store, self.max_position).map(|_| ())
    }

    async fn start(&mut self, link: &mut Link, intent: &Intent, store: &PropertyStore) -> Result<Ack> {
        let target = focus_target(intent, store, self.max_position)?;
        let target_i32 = i32::try_from(target)
            .map_err(|_| DriverError::rejected(format!("target {} does not fit the frame", target)))?;

        let reply = self
            .command(link, Frame::new(OP_MOVE, target_i32.to_be_bytes().to_vec()))
            .await?;
        let echoed = i64::from(reply.i32_at(0, "target")?);
        if echoed != target {
            return Err(CodecError::UnexpectedEcho {
                expected: target.to_string(),
                actual: echoed.to_string(),
            }
            .into());
        }

        Ok(Ack::new(target).confirming("target", target))
    }

    async fn abort(&mut self, link: &mut Link) -> Result<()> {
        self.command(link, Frame::bare(OP_HALT)).await.map(|_| ())
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
