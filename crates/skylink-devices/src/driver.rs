/*!
 * The driver trait.
 *
 * A driver knows one device's protocol. It never owns the connection or the
 * property store: the session lends it the [`Link`] for each command cycle
 * and a read-only view of the store. Everything the driver learns comes back
 * as values ([`Reading`]s, [`Ack`]s, [`Evaluation`]s) that the session
 * applies.
 */
use std::fmt::Debug;

use async_trait::async_trait;

use skylink_core::types::Value;

use crate::device::{Capability, DeviceInfo, DeviceKind, Intent};
use crate::error::{ErrorKind, Result};
use crate::property::{PropertySpec, PropertyStore, Reading};
use crate::transport::Link;

/// The device's acknowledgement of a started operation
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// Value the operation is heading for, used to judge completion
    pub target: Value,
    /// Writes the device confirmed in its acknowledgement
    pub confirmed: Vec<Reading>,
}

impl Ack {
    /// Acknowledgement with nothing confirmed
    pub fn new<V: Into<Value>>(target: V) -> Self {
        Self {
            target: target.into(),
            confirmed: Vec::new(),
        }
    }

    /// Add a confirmed write
    pub fn confirming<V: Into<Value>>(mut self, key: &'static str, value: V) -> Self {
        self.confirmed.push(Reading::new(key, value));
        self
    }
}

/// Where an in-progress operation stands after a poll
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The device reports the target reached
    Completed,
    /// Still under way, carrying the distance left to the target in device
    /// units. Infinite while the device position is unknown.
    Progress(f64),
    /// The device can no longer finish the operation
    Interrupted {
        /// Failure class
        kind: ErrorKind,
        /// What the device reported
        reason: String,
    },
}

impl Evaluation {
    /// Progress measured from an optional distance
    pub fn remaining(distance: Option<f64>) -> Self {
        Evaluation::Progress(distance.map_or(f64::INFINITY, f64::abs))
    }
}

/// Device self-reported condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Ready for commands
    Ok,
    /// Not able to accept commands
    Fault(String),
}

/// Protocol knowledge for one kind of device
#[async_trait]
pub trait Driver: Send + Sync + Debug {
    /// Driver name as used in configuration
    fn name(&self) -> &'static str;

    /// Device type
    fn kind(&self) -> DeviceKind;

    /// Vendor and model string
    fn model(&self) -> &str;

    /// Properties this driver mirrors
    fn schema(&self) -> Vec<PropertySpec>;

    /// Capabilities this driver provides
    fn capabilities(&self) -> &[Capability];

    /// Identify the device; an error here fails the connection
    async fn handshake(&mut self, link: &mut Link) -> Result<DeviceInfo>;

    /// Query status and return what the device reported
    async fn poll(&mut self, link: &mut Link, store: &PropertyStore) -> Result<Vec<Reading>>;

    /// Refuse an intent the device cannot perform in its current state
    fn check_intent(&self, intent: &Intent, store: &PropertyStore) -> Result<()>;

    /// Send the command that starts an operation
    async fn start(&mut self, link: &mut Link, intent: &Intent, store: &PropertyStore) -> Result<Ack>;

    /// Send the device's halt command
    async fn abort(&mut self, link: &mut Link) -> Result<()>;

    /// Judge an in-progress operation against freshly polled state
    fn evaluate(&self, intent: &Intent, target: &Value, store: &PropertyStore) -> Evaluation;

    /// Whether the device reports it has stopped moving
    fn is_halted(&self, store: &PropertyStore) -> bool;

    /// Whether the device reports itself able to accept commands
    fn health(&self, store: &PropertyStore) -> Health;
}

/// Reject an intent whose capability the driver lacks
pub fn require_capability(driver: &dyn Driver, intent: &Intent) -> Result<()> {
    let needed = intent.required_capability();
    if driver.capabilities().contains(&needed) {
        Ok(())
    } else {
        Err(crate::error::DriverError::unsupported(format!(
            "{} does not support {:?}",
            driver.name(),
            needed
        )))
    }
}
