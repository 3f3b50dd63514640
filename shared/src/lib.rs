//! # Arena Protocol Library
//!
//! Shared protocol model for the arena installation: the logical address
//! space devices identify themselves with, and the dynamic message envelope
//! that travels between them and the server.
//!
//! ## Addresses
//!
//! Every device is reachable at an [`InboxAddress`], a `(type, id)` pair.
//! The type says what kind of device it is (admin tablet, simulator,
//! wearable, wall arduino, ...); the id is an opaque string the device picks
//! when it identifies itself. An address with an empty id is a *wildcard*
//! over its type and matches every device of that kind, which is how the
//! server broadcasts to "all admins" or "all sub walls".
//!
//! On the wire the type is its numeric code (`{"type": 2, "id": "s1"}`),
//! matching what the tablet and simulator clients expect.
//!
//! ## Messages
//!
//! An [`InboxMessage`] is a dynamic JSON object keyed by `cmd` plus whatever
//! payload the command carries. Connections stamp routing annotations on
//! messages as they read them (who sent it, identity claims and releases,
//! whether the connection is going away); only the body ever crosses the
//! wire.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Kind of device behind an address.
///
/// The numeric codes are the wire representation and are fixed by the
/// deployed clients; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboxAddressType {
    Unknown,
    /// Administrator tablet.
    Admin,
    /// Player simulator.
    Simulator,
    /// Arduino debugging loopback device.
    ArduinoTest,
    /// Exit-hall tablet.
    Postgame,
    /// Wearable sensor.
    Wearable,
    /// Main wall arduino.
    MainArduino,
    /// Small wall arduino.
    SubArduino,
}

impl InboxAddressType {
    /// Numeric wire code of this type.
    pub fn code(self) -> u8 {
        match self {
            InboxAddressType::Unknown => 0,
            InboxAddressType::Admin => 1,
            InboxAddressType::Simulator => 2,
            InboxAddressType::ArduinoTest => 3,
            InboxAddressType::Postgame => 4,
            InboxAddressType::Wearable => 5,
            InboxAddressType::MainArduino => 6,
            InboxAddressType::SubArduino => 7,
        }
    }

    /// Inverse of [`code`](Self::code); out-of-range codes map to `Unknown`.
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => InboxAddressType::Admin,
            2 => InboxAddressType::Simulator,
            3 => InboxAddressType::ArduinoTest,
            4 => InboxAddressType::Postgame,
            5 => InboxAddressType::Wearable,
            6 => InboxAddressType::MainArduino,
            7 => InboxAddressType::SubArduino,
            _ => InboxAddressType::Unknown,
        }
    }

    /// Player controllers are created and destroyed as devices come and go.
    pub fn is_player_controller(self) -> bool {
        matches!(
            self,
            InboxAddressType::Simulator | InboxAddressType::Wearable
        )
    }

    /// Arduino controllers are preconfigured; connects only flip them online.
    pub fn is_arduino_controller(self) -> bool {
        matches!(
            self,
            InboxAddressType::MainArduino | InboxAddressType::SubArduino
        )
    }
}

impl Serialize for InboxAddressType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

struct AddressTypeVisitor;

impl<'de> Visitor<'de> for AddressTypeVisitor {
    type Value = InboxAddressType;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an address type code")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(InboxAddressType::from_code(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(InboxAddressType::from_code(v.max(0) as u64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        let code = v
            .parse::<u64>()
            .map_err(|_| E::custom(format!("invalid address type {v:?}")))?;
        Ok(InboxAddressType::from_code(code))
    }
}

impl<'de> Deserialize<'de> for InboxAddressType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AddressTypeVisitor)
    }
}

/// Logical device address: a type plus a device-chosen id.
///
/// An empty id is a wildcard over the whole type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InboxAddress {
    #[serde(rename = "type")]
    pub kind: InboxAddressType,
    pub id: String,
}

impl InboxAddress {
    pub fn new(kind: InboxAddressType, id: impl Into<String>) -> Self {
        InboxAddress {
            kind,
            id: id.into(),
        }
    }

    /// Address matching every device of `kind`.
    pub fn wildcard(kind: InboxAddressType) -> Self {
        InboxAddress {
            kind,
            id: String::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.id.is_empty()
    }
}

impl fmt::Display for InboxAddress {
    /// `code:id`, the form used as controller registry key.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind.code(), self.id)
    }
}

/// One logical message plus the routing annotations a connection stamped on
/// it while reading.
///
/// The body is a free-form JSON object; `cmd` names the verb and the rest is
/// the payload. The annotations never leave the process:
///
/// - `address`: who sent the message.
/// - `add_address`: a new identity this connection is claiming.
/// - `remove_address`: an identity this connection is relinquishing.
/// - `should_close_connection`: the reader hit end-of-stream or an error and
///   the connection should be torn down after this message.
#[derive(Debug, Clone, Default)]
pub struct InboxMessage {
    pub data: Map<String, Value>,
    pub address: Option<InboxAddress>,
    pub add_address: Option<InboxAddress>,
    pub remove_address: Option<InboxAddress>,
    pub should_close_connection: bool,
}

impl InboxMessage {
    pub fn new() -> Self {
        InboxMessage::default()
    }

    /// Command verb of this message, or `""` when absent.
    pub fn cmd(&self) -> &str {
        self.get_str("cmd")
    }

    pub fn set_cmd(&mut self, cmd: &str) {
        self.set("cmd", cmd);
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// String value for `key`, or `""` when absent or not a string.
    pub fn get_str(&self, key: &str) -> &str {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Numeric value for `key`, accepting JSON numbers (including floats,
    /// which some clients send for ids) and numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Serialize the body for the wire. Annotations are not included.
    pub fn marshal(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.data)
    }
}
