/*!
 * Alpaca-style REST requests with JSON replies.
 *
 * Requests are rendered as the text frame the HTTP transport executes:
 * `METHOD /api/v{N}/{device_type}/{device_number}/{command}[?query]\n[body]`.
 * Every request carries `ClientID` and a fresh `ClientTransactionID`; a reply
 * echoing a different transaction id is out of step and rejected.
 */
use std::fmt::Write as _;
use std::ops::RangeInclusive;

use serde::Deserialize;

use super::{Codec, Framing};
use crate::error::{CodecError, DriverError};
use crate::transport::http::BODY_END;

/// Alpaca error number for "invalid while parked"
pub const ERROR_INVALID_WHILE_PARKED: i32 = 0x408;

/// Alpaca error number for "not implemented"
pub const ERROR_NOT_IMPLEMENTED: i32 = 0x400;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    /// Read a value
    Get,
    /// Change state or run an action
    Put,
}

/// One REST request with its transaction id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRequest {
    /// Method
    pub method: RestMethod,
    /// Lower-case command name (`rightascension`, `slewtocoordinatesasync`)
    pub command: String,
    /// Parameters besides client and transaction ids
    pub params: Vec<(String, String)>,
    /// Transaction id the reply must echo
    pub transaction_id: u32,
}

impl RestRequest {
    /// Add a parameter
    pub fn param<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }
}

/// Decoded JSON reply
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestReply {
    /// Returned value, `null` for actions
    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
    /// Device error number, 0 on success
    #[serde(rename = "ErrorNumber", default)]
    pub error_number: i32,
    /// Device error message
    #[serde(rename = "ErrorMessage", default)]
    pub error_message: String,
    /// Echoed client transaction id
    #[serde(rename = "ClientTransactionID", default)]
    pub client_transaction_id: Option<u32>,
    /// Server transaction id
    #[serde(rename = "ServerTransactionID", default)]
    pub server_transaction_id: Option<u32>,
}

impl RestReply {
    /// Turn a device-reported error into a rejection
    pub fn ensure_ok(&self) -> Result<(), DriverError> {
        match self.error_number {
            0 => Ok(()),
            ERROR_NOT_IMPLEMENTED => Err(DriverError::unsupported(&self.error_message)),
            n => Err(DriverError::rejected(format!(
                "device error {:#x}: {}",
                n, self.error_message
            ))),
        }
    }

    /// Boolean value
    pub fn bool(&self, name: &str) -> Result<bool, CodecError> {
        self.value
            .as_bool()
            .ok_or_else(|| CodecError::Malformed(format!("{} is not a boolean: {}", name, self.value)))
    }

    /// Numeric value checked against its range
    pub fn float(&self, name: &str, range: RangeInclusive<f64>) -> Result<f64, CodecError> {
        let value = self
            .value
            .as_f64()
            .ok_or_else(|| CodecError::Malformed(format!("{} is not a number: {}", name, self.value)))?;
        if !range.contains(&value) {
            return Err(CodecError::OutOfRange {
                field: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(value)
    }

    /// String value
    pub fn text(&self, name: &str) -> Result<&str, CodecError> {
        self.value
            .as_str()
            .ok_or_else(|| CodecError::Malformed(format!("{} is not a string: {}", name, self.value)))
    }
}

/// Codec for one Alpaca device
#[derive(Debug, Clone)]
pub struct RestCodec {
    api_version: u32,
    device_type: String,
    device_number: u32,
    client_id: u32,
    next_transaction: u32,
}

impl RestCodec {
    /// Create a codec for `/api/v{api_version}/{device_type}/{device_number}`
    pub fn new<S: Into<String>>(api_version: u32, device_type: S, device_number: u32, client_id: u32) -> Self {
        Self {
            api_version,
            device_type: device_type.into(),
            device_number,
            client_id,
            next_transaction: 1,
        }
    }

    /// Create a request stamped with the next transaction id
    pub fn request<S: Into<String>>(&mut self, method: RestMethod, command: S) -> RestRequest {
        let transaction_id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1).max(1);
        RestRequest {
            method,
            command: command.into(),
            params: Vec::new(),
            transaction_id,
        }
    }

    /// Shortcut for a GET request
    pub fn get<S: Into<String>>(&mut self, command: S) -> RestRequest {
        self.request(RestMethod::Get, command)
    }

    /// Shortcut for a PUT request
    pub fn put<S: Into<String>>(&mut self, command: S) -> RestRequest {
        self.request(RestMethod::Put, command)
    }

    fn path(&self, command: &str) -> String {
        format!(
            "/api/v{}/{}/{}/{}",
            self.api_version, self.device_type, self.device_number, command
        )
    }
}

/// Percent-encode form and query values
fn form_encode(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        encode_component(&mut out, k);
        out.push('=');
        encode_component(&mut out, v);
    }
    out
}

fn encode_component(out: &mut String, s: &str) {
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => {
                let _ = write!(out, "%{:02X}", b);
            }
        }
    }
}

impl Codec for RestCodec {
    type Command = RestRequest;
    type Reply = RestReply;

    fn encode(&self, request: &RestRequest) -> Result<Vec<u8>, CodecError> {
        if request.command.is_empty() || !request.command.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(CodecError::Malformed(format!(
                "invalid command name {:?}",
                request.command
            )));
        }

        let mut pairs = vec![
            ("ClientID".to_string(), self.client_id.to_string()),
            (
                "ClientTransactionID".to_string(),
                request.transaction_id.to_string(),
            ),
        ];
        pairs.extend(request.params.iter().cloned());
        let encoded = form_encode(&pairs);
        let path = self.path(&request.command);

        let frame = match request.method {
            RestMethod::Get => format!("GET {}?{}\n", path, encoded),
            RestMethod::Put => format!("PUT {}\n{}", path, encoded),
        };
        Ok(frame.into_bytes())
    }

    fn decode(&self, request: &RestRequest, raw: &[u8]) -> Result<RestReply, CodecError> {
        let reply: RestReply = serde_json::from_slice(raw)
            .map_err(|e| CodecError::Malformed(format!("invalid JSON reply: {}", e)))?;

        match reply.client_transaction_id {
            Some(id) if id != 0 && id != request.transaction_id => Err(CodecError::UnexpectedEcho {
                expected: request.transaction_id.to_string(),
                actual: id.to_string(),
            }),
            _ => Ok(reply),
        }
    }

    fn framing(&self) -> Framing {
        Framing::Terminated(BODY_END)
    }
}
