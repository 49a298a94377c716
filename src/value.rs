//! # Data Model
//!
//! Core entities shared by every layer: `Device`, `Tag`, `Value`,
//! `DataType`, and `Quality` (spec §3). Devices are referenced everywhere
//! else by `DeviceId`, never by pointer, per spec §9's back-reference note —
//! the pool, breaker, and diagnostics registries all key off this id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// Unique device identifier within a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

/// Unique tag identifier, scoped to its owning device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId(pub String);

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TagId {
    fn from(s: &str) -> Self {
        TagId(s.to_string())
    }
}

/// The fieldbus protocols the engine speaks. Concrete handlers are
/// registered against one of these (spec §9, "dynamic dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Modbus,
    Cip,
    OpcUa,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Modbus => write!(f, "Modbus"),
            Protocol::Cip => write!(f, "EtherNet/IP-CIP"),
            Protocol::OpcUa => write!(f, "OPC-UA"),
        }
    }
}

impl Protocol {
    /// Stable lowercase id used to key protocol-defaults maps and handler
    /// registries.
    pub fn id(&self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::Cip => "cip",
            Protocol::OpcUa => "opcua",
        }
    }
}

/// A reachable endpoint (spec §3 Device entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    /// Protocol-specific config (default unit id overrides, security
    /// policy overrides, etc.), opaque to everything but the handler.
    pub config: HashMap<String, String>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            protocol,
            address: address.into(),
            port,
            config: HashMap::new(),
        }
    }
}

/// Declared scalar type of a tag's value. Governs both codec behaviour
/// (register counts, truncation rules) and write-value conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Number of 16-bit Modbus registers this type occupies (spec §4.1).
    /// Coils/bools occupy a single bit, not a register; callers that need
    /// the register-table width should special-case `Bool`.
    pub fn modbus_register_count(&self) -> u16 {
        match self {
            DataType::Bool => 1,
            DataType::Int16 | DataType::UInt16 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 4,
        }
    }
}

/// Named data point on a device (spec §3 Tag entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub device_id: DeviceId,
    pub address: String,
    pub data_type: DataType,
    pub writable: bool,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

impl Tag {
    pub fn new(id: impl Into<TagId>, device_id: DeviceId, address: impl Into<String>, data_type: DataType, writable: bool) -> Self {
        Self {
            id: id.into(),
            device_id,
            address: address.into(),
            data_type,
            writable,
            scale: None,
            offset: None,
        }
    }
}

/// A typed scalar. Exactly one protocol-independent value union for every
/// decoded/encoded sample (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl Scalar {
    pub fn data_type(&self) -> DataType {
        match self {
            Scalar::Bool(_) => DataType::Bool,
            Scalar::Int16(_) => DataType::Int16,
            Scalar::UInt16(_) => DataType::UInt16,
            Scalar::Int32(_) => DataType::Int32,
            Scalar::UInt32(_) => DataType::UInt32,
            Scalar::Int64(_) => DataType::Int64,
            Scalar::UInt64(_) => DataType::UInt64,
            Scalar::Float32(_) => DataType::Float32,
            Scalar::Float64(_) => DataType::Float64,
        }
    }
}

/// Per-sample truthiness tag surfaced with every value (spec §3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
    Stale,
}

/// A decoded sample: scalar, quality, and a monotonic-per-(device,tag)
/// timestamp (spec §3 Value entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub scalar: Scalar,
    pub quality: Quality,
    #[serde(with = "systemtime_millis")]
    pub timestamp: SystemTime,
}

impl Value {
    pub fn good(scalar: Scalar) -> Self {
        Self {
            scalar,
            quality: Quality::Good,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_quality(scalar: Scalar, quality: Quality) -> Self {
        Self {
            scalar,
            quality,
            timestamp: SystemTime::now(),
        }
    }
}

mod systemtime_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        millis.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_register_counts_match_spec_table() {
        assert_eq!(DataType::Int16.modbus_register_count(), 1);
        assert_eq!(DataType::UInt32.modbus_register_count(), 2);
        assert_eq!(DataType::Float32.modbus_register_count(), 2);
        assert_eq!(DataType::Float64.modbus_register_count(), 4);
        assert_eq!(DataType::Int64.modbus_register_count(), 4);
    }

    #[test]
    fn scalar_data_type_round_trips() {
        assert_eq!(Scalar::Int32(-7).data_type(), DataType::Int32);
        assert_eq!(Scalar::Float64(1.5).data_type(), DataType::Float64);
    }
}
