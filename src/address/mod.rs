//! # Address & Codec Layer
//!
//! Per-protocol address parsing and value codecs (spec §4.1). Each submodule
//! owns one protocol's address grammar and wire-scalar conversion; nothing
//! above this layer knows about register tables, EPATH segments, or node-id
//! syntax.

pub mod cip;
pub mod modbus;
pub mod opcua;

use crate::error::{GatewayError, Result};
use crate::value::{DataType, Protocol, Scalar};

/// A parsed, protocol-specific address. Each variant's payload is the
/// structured form `format()` round-trips back to the canonical string.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAddress {
    Modbus(modbus::ModbusAddress),
    Cip(cip::CipAddress),
    OpcUa(opcua::OpcUaNodeId),
}

impl ParsedAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            ParsedAddress::Modbus(_) => Protocol::Modbus,
            ParsedAddress::Cip(_) => Protocol::Cip,
            ParsedAddress::OpcUa(_) => Protocol::OpcUa,
        }
    }
}

/// Parse `address` under `protocol`'s grammar.
pub fn parse(protocol: Protocol, address: &str) -> Result<ParsedAddress> {
    match protocol {
        Protocol::Modbus => modbus::parse(address).map(ParsedAddress::Modbus),
        Protocol::Cip => cip::parse(address).map(ParsedAddress::Cip),
        Protocol::OpcUa => opcua::parse(address).map(ParsedAddress::OpcUa),
    }
}

/// `validate_address` per spec §4.6: ok iff `parse` succeeds.
pub fn validate(protocol: Protocol, address: &str) -> bool {
    parse(protocol, address).is_ok()
}

/// Canonical string form of a parsed address; `format(parse(s)) == s` for
/// every string `s` accepted by `parse` (spec §8).
pub fn format(parsed: &ParsedAddress) -> String {
    match parsed {
        ParsedAddress::Modbus(a) => modbus::format(a),
        ParsedAddress::Cip(a) => cip::format(a),
        ParsedAddress::OpcUa(a) => opcua::format(a),
    }
}

/// Convert a decoded wire value into the declared `data_type`, performing
/// only the truncation/conversion rules fixed per type (no silent widening
/// across sign, per spec §4.6).
pub fn coerce(scalar: Scalar, data_type: DataType) -> Result<Scalar> {
    if scalar.data_type() == data_type {
        return Ok(scalar);
    }
    Err(GatewayError::TypeMismatch {
        data_type: format!("{:?}", data_type),
        reason: format!("cannot convert {:?} to {:?} without explicit cast", scalar.data_type(), data_type),
    })
}
