use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared type of an attribute in the active vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    String,
    Int64,
    Double,
    Bool,
    Timestamp,
    Duration,
    StringMap,
    IpAddress,
    Bytes,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "STRING",
            ValueType::Int64 => "INT64",
            ValueType::Double => "DOUBLE",
            ValueType::Bool => "BOOL",
            ValueType::Timestamp => "TIMESTAMP",
            ValueType::Duration => "DURATION",
            ValueType::StringMap => "STRING_MAP",
            ValueType::IpAddress => "IP_ADDRESS",
            ValueType::Bytes => "BYTES",
        };
        f.write_str(name)
    }
}

/// Runtime value of one attribute. IP addresses are carried as network-order
/// octets; on the wire they share the bytes maps, so a decoded bag surfaces
/// them as `Bytes`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
    StringMap(BTreeMap<String, String>),
    IpAddress(Vec<u8>),
    Bytes(Vec<u8>),
}

impl AttributeValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            AttributeValue::String(_) => ValueType::String,
            AttributeValue::Int64(_) => ValueType::Int64,
            AttributeValue::Double(_) => ValueType::Double,
            AttributeValue::Bool(_) => ValueType::Bool,
            AttributeValue::Timestamp(_) => ValueType::Timestamp,
            AttributeValue::Duration(_) => ValueType::Duration,
            AttributeValue::StringMap(_) => ValueType::StringMap,
            AttributeValue::IpAddress(_) => ValueType::IpAddress,
            AttributeValue::Bytes(_) => ValueType::Bytes,
        }
    }

    /// Wire-level equality: IP addresses and opaque bytes are the same kind
    /// on the wire, so payload-equal values of either tag compare equal.
    pub fn wire_eq(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::IpAddress(a), AttributeValue::Bytes(b))
            | (AttributeValue::Bytes(a), AttributeValue::IpAddress(b)) => a == b,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int64(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            AttributeValue::Duration(v) => write!(f, "{v:?}"),
            AttributeValue::StringMap(m) => write!(f, "{m:?}"),
            AttributeValue::IpAddress(b) | AttributeValue::Bytes(b) => {
                for octet in b {
                    write!(f, "{octet:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int64(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}
