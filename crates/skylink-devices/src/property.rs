/*!
 * Property store: the local mirror of device-reported state.
 *
 * The store only ever holds values the device has confirmed, either by
 * reporting them in a status poll ([`PropertyStore::set_from_device`]) or by
 * acknowledging a write ([`PropertyStore::set_from_confirmed_write`]).
 * Drivers receive a shared reference and can only read it.
 */
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use skylink_core::types::Value;

/// Declared type of a property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Boolean
    Bool,
    /// Integer
    Int,
    /// Floating point
    Float,
    /// Free text
    Text,
    /// One of a fixed set of text variants
    Enum(Vec<String>),
}

/// Whether callers may request writes to a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Reported by the device only
    ReadOnly,
    /// Can be changed through an intent
    ReadWrite,
}

/// Freshness of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    /// Confirmed by the most recent successful poll or write
    Valid,
    /// Last confirmed value, but the latest poll failed
    Stale,
    /// Never confirmed on this connection
    Unknown,
}

/// Schema entry a driver declares for each property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Property key
    pub key: String,
    /// Declared type
    pub kind: ValueKind,
    /// Writability
    pub access: Access,
}

impl PropertySpec {
    /// Create a read-only property
    pub fn read_only<S: Into<String>>(key: S, kind: ValueKind) -> Self {
        Self {
            key: key.into(),
            kind,
            access: Access::ReadOnly,
        }
    }

    /// Create a read-write property
    pub fn read_write<S: Into<String>>(key: S, kind: ValueKind) -> Self {
        Self {
            key: key.into(),
            kind,
            access: Access::ReadWrite,
        }
    }

    /// Create an enumerated read-only property
    pub fn enumeration<S: Into<String>>(key: S, variants: &[&str]) -> Self {
        Self::read_only(
            key,
            ValueKind::Enum(variants.iter().map(|v| v.to_string()).collect()),
        )
    }
}

/// One mirrored device property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property key
    pub key: String,
    /// Declared type
    pub kind: ValueKind,
    /// Last confirmed value, `None` while unknown
    pub value: Option<Value>,
    /// Writability
    pub access: Access,
    /// Freshness
    pub validity: Validity,
    /// When the value was last confirmed
    pub updated_at: Option<DateTime<Utc>>,
}

/// A change produced by a store update
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Property key
    pub key: String,
    /// Value before the update
    pub old: Option<Value>,
    /// Value after the update
    pub new: Option<Value>,
    /// Validity after the update
    pub validity: Validity,
}

/// A value reported by the device during a poll
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Property key
    pub key: &'static str,
    /// Reported value
    pub value: Value,
}

impl Reading {
    /// Create a reading
    pub fn new<V: Into<Value>>(key: &'static str, value: V) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Error type for store updates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    /// The key is not part of the schema
    #[error("Unknown property: {0}")]
    UnknownKey(String),

    /// The value does not match the declared type
    #[error("Type mismatch for {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Property key
        key: String,
        /// Declared type
        expected: String,
        /// Received value type
        actual: &'static str,
    },
}

/// Typed key to value registry mirroring one device
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    properties: BTreeMap<String, Property>,
}

impl PropertyStore {
    /// Create a store from a driver schema with every property unknown
    pub fn from_schema(schema: &[PropertySpec]) -> Self {
        let properties = schema
            .iter()
            .map(|spec| {
                (
                    spec.key.clone(),
                    Property {
                        key: spec.key.clone(),
                        kind: spec.kind.clone(),
                        value: None,
                        access: spec.access,
                        validity: Validity::Unknown,
                        updated_at: None,
                    },
                )
            })
            .collect();
        Self { properties }
    }

    /// Get a property, `None` if the key is not in the schema
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    /// Last confirmed value of a property, valid or stale
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.properties.get(key).and_then(|p| p.value.as_ref())
    }

    /// Last confirmed value as an integer
    pub fn int(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(Value::as_int)
    }

    /// Last confirmed value as a float
    pub fn float(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(Value::as_float)
    }

    /// Last confirmed value as a boolean
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    /// Last confirmed value as text
    pub fn text(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    /// Whether every property is valid
    pub fn is_fresh(&self) -> bool {
        self.properties
            .values()
            .all(|p| p.validity == Validity::Valid)
    }

    /// Property keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Record a value the device reported in a status poll.
    ///
    /// Only the poller calls this.
    pub fn set_from_device(
        &mut self,
        key: &str,
        value: Value,
    ) -> Result<Option<PropertyChange>, PropertyError> {
        self.confirm(key, value)
    }

    /// Record a value the device acknowledged writing.
    ///
    /// Only the dispatcher calls this, after the acknowledgement frame decoded.
    pub fn set_from_confirmed_write(
        &mut self,
        key: &str,
        value: Value,
    ) -> Result<Option<PropertyChange>, PropertyError> {
        self.confirm(key, value)
    }

    fn confirm(&mut self, key: &str, value: Value) -> Result<Option<PropertyChange>, PropertyError> {
        let property = self
            .properties
            .get_mut(key)
            .ok_or_else(|| PropertyError::UnknownKey(key.to_string()))?;
        let value = coerce(key, &property.kind, value)?;

        let changed = property.value.as_ref() != Some(&value) || property.validity != Validity::Valid;
        let old = property.value.replace(value.clone());
        property.validity = Validity::Valid;
        property.updated_at = Some(Utc::now());

        Ok(changed.then(|| PropertyChange {
            key: key.to_string(),
            old,
            new: Some(value),
            validity: Validity::Valid,
        }))
    }

    /// Mark every confirmed property stale after a failed poll
    pub fn mark_stale(&mut self) -> Vec<PropertyChange> {
        self.properties
            .values_mut()
            .filter(|p| p.validity == Validity::Valid)
            .map(|p| {
                p.validity = Validity::Stale;
                PropertyChange {
                    key: p.key.clone(),
                    old: p.value.clone(),
                    new: p.value.clone(),
                    validity: Validity::Stale,
                }
            })
            .collect()
    }

    /// Copy of every property, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, Property> {
        self.properties.clone()
    }
}

fn coerce(key: &str, kind: &ValueKind, value: Value) -> Result<Value, PropertyError> {
    let mismatch = |value: &Value| PropertyError::TypeMismatch {
        key: key.to_string(),
        expected: format!("{:?}", kind),
        actual: value.type_name(),
    };

    match (kind, value) {
        (ValueKind::Bool, v @ Value::Bool(_)) => Ok(v),
        (ValueKind::Int, v @ Value::Int(_)) => Ok(v),
        (ValueKind::Float, v @ Value::Float(_)) => Ok(v),
        (ValueKind::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (ValueKind::Text, v @ Value::Text(_)) => Ok(v),
        (ValueKind::Enum(variants), Value::Text(s)) if variants.iter().any(|v| *v == s) => {
            Ok(Value::Text(s))
        }
        (_, v) => Err(mismatch(&v)),
    }
}
