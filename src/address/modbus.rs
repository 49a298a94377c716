//! Modbus address grammar and register codec (spec §4.1, §6).
//!
//! Address strings are the traditional 5-digit table-prefixed form:
//! `0xxxx` coils, `1xxxx` discrete inputs, `3xxxx` input registers,
//! `4xxxx` holding registers. The function-code/exception vocabulary below
//! mirrors `tokio-modbus`'s frame model.

use crate::config::WordOrder;
use crate::error::{GatewayError, Result};
use crate::value::{DataType, Scalar};

/// Which of the four Modbus data tables an address falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusTable {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl ModbusTable {
    fn prefix_digit(&self) -> char {
        match self {
            ModbusTable::Coil => '0',
            ModbusTable::DiscreteInput => '1',
            ModbusTable::InputRegister => '3',
            ModbusTable::HoldingRegister => '4',
        }
    }

    /// Whether writes are permitted to this table (spec §4.1: "writable
    /// tags must land in the coil or holding-register table").
    pub fn is_writable(&self) -> bool {
        matches!(self, ModbusTable::Coil | ModbusTable::HoldingRegister)
    }
}

/// A parsed Modbus address: table plus the 0-based on-wire offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusAddress {
    pub table: ModbusTable,
    /// 0-based offset, already decremented from the address string's
    /// 1-based digits.
    pub wire_offset: u16,
}

pub fn parse(address: &str) -> Result<ModbusAddress> {
    let invalid = |reason: &str| GatewayError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.len() != 5 || !address.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("expected a 5-digit table-prefixed address"));
    }
    let mut chars = address.chars();
    let prefix = chars.next().unwrap();
    let table = match prefix {
        '0' => ModbusTable::Coil,
        '1' => ModbusTable::DiscreteInput,
        '3' => ModbusTable::InputRegister,
        '4' => ModbusTable::HoldingRegister,
        _ => return Err(invalid("leading digit must be 0, 1, 3, or 4")),
    };
    let one_based: u32 = chars.as_str().parse().map_err(|_| invalid("offset digits are not numeric"))?;
    if one_based == 0 {
        return Err(invalid("offset is 1-based and must be >= 1"));
    }
    let wire_offset = (one_based - 1) as u16;
    Ok(ModbusAddress { table, wire_offset })
}

pub fn format(addr: &ModbusAddress) -> String {
    format!("{}{:04}", addr.table.prefix_digit(), addr.wire_offset + 1)
}

/// Modbus function codes this gateway supports (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
    WriteMultipleCoils = 15,
    WriteMultipleRegisters = 16,
}

impl FunctionCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// The read function code for this address's table.
    pub fn read_for(table: ModbusTable) -> FunctionCode {
        match table {
            ModbusTable::Coil => FunctionCode::ReadCoils,
            ModbusTable::DiscreteInput => FunctionCode::ReadDiscreteInputs,
            ModbusTable::InputRegister => FunctionCode::ReadInputRegisters,
            ModbusTable::HoldingRegister => FunctionCode::ReadHoldingRegisters,
        }
    }

    /// The single-element write function code for this address's table, if
    /// the table is writable.
    pub fn write_single_for(table: ModbusTable) -> Option<FunctionCode> {
        match table {
            ModbusTable::Coil => Some(FunctionCode::WriteSingleCoil),
            ModbusTable::HoldingRegister => Some(FunctionCode::WriteSingleRegister),
            _ => None,
        }
    }
}

/// Modbus exception codes (spec §6, §7), matching the wire values used by
/// `tokio-modbus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl ModbusException {
    pub fn from_code(code: u8) -> Option<ModbusException> {
        use ModbusException::*;
        Some(match code {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x08 => MemoryParityError,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetDevice,
            _ => return None,
        })
    }

    /// Per spec §7: busy/acknowledge are recoverable (retried); everything
    /// else surfaces immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ModbusException::ServerDeviceBusy | ModbusException::Acknowledge)
    }
}

/// Maximum registers/coils per a single read, per spec §8's boundary tests.
pub const MAX_HOLDING_REGISTERS_PER_READ: u16 = 125;
pub const MAX_COILS_PER_READ: u16 = 2000;

/// Decode `count` big/little-endian 16-bit registers (per `word_order`)
/// into the scalar `data_type` declares.
pub fn decode_registers(registers: &[u16], data_type: DataType, word_order: WordOrder) -> Result<Scalar> {
    let ordered: Vec<u16> = match word_order {
        WordOrder::BigEndian => registers.to_vec(),
        WordOrder::LittleEndian => registers.iter().rev().copied().collect(),
    };
    let bytes: Vec<u8> = ordered.iter().flat_map(|r| r.to_be_bytes()).collect();

    let scalar = match data_type {
        DataType::Bool => return Err(GatewayError::TypeMismatch {
            data_type: "Bool".into(),
            reason: "coil reads decode as bits, not registers".into(),
        }),
        DataType::Int16 => Scalar::Int16(i16::from_be_bytes(bytes[0..2].try_into().unwrap())),
        DataType::UInt16 => Scalar::UInt16(u16::from_be_bytes(bytes[0..2].try_into().unwrap())),
        DataType::Int32 => Scalar::Int32(i32::from_be_bytes(bytes[0..4].try_into().unwrap())),
        DataType::UInt32 => Scalar::UInt32(u32::from_be_bytes(bytes[0..4].try_into().unwrap())),
        DataType::Float32 => Scalar::Float32(f32::from_be_bytes(bytes[0..4].try_into().unwrap())),
        DataType::Int64 => Scalar::Int64(i64::from_be_bytes(bytes[0..8].try_into().unwrap())),
        DataType::UInt64 => Scalar::UInt64(u64::from_be_bytes(bytes[0..8].try_into().unwrap())),
        DataType::Float64 => Scalar::Float64(f64::from_be_bytes(bytes[0..8].try_into().unwrap())),
    };
    Ok(scalar)
}

/// Encode a scalar to the registers it occupies, honouring `word_order`.
pub fn encode_registers(scalar: Scalar, word_order: WordOrder) -> Vec<u16> {
    let bytes: Vec<u8> = match scalar {
        Scalar::Bool(_) => Vec::new(),
        Scalar::Int16(v) => v.to_be_bytes().to_vec(),
        Scalar::UInt16(v) => v.to_be_bytes().to_vec(),
        Scalar::Int32(v) => v.to_be_bytes().to_vec(),
        Scalar::UInt32(v) => v.to_be_bytes().to_vec(),
        Scalar::Float32(v) => v.to_be_bytes().to_vec(),
        Scalar::Int64(v) => v.to_be_bytes().to_vec(),
        Scalar::UInt64(v) => v.to_be_bytes().to_vec(),
        Scalar::Float64(v) => v.to_be_bytes().to_vec(),
    };
    let registers: Vec<u16> = bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
    match word_order {
        WordOrder::BigEndian => registers,
        WordOrder::LittleEndian => registers.into_iter().rev().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_table_prefix() {
        assert_eq!(parse("00001").unwrap().table, ModbusTable::Coil);
        assert_eq!(parse("10001").unwrap().table, ModbusTable::DiscreteInput);
        assert_eq!(parse("30001").unwrap().table, ModbusTable::InputRegister);
        assert_eq!(parse("40001").unwrap().table, ModbusTable::HoldingRegister);
    }

    #[test]
    fn offset_is_zero_based_on_wire() {
        let a = parse("40001").unwrap();
        assert_eq!(a.wire_offset, 0);
        let b = parse("40100").unwrap();
        assert_eq!(b.wire_offset, 99);
    }

    #[test]
    fn format_is_left_inverse_of_parse() {
        for s in ["00001", "10050", "30999", "49999"] {
            let parsed = parse(s).unwrap();
            assert_eq!(format(&parsed), s);
        }
    }

    #[test]
    fn rejects_bad_prefix_and_bad_length() {
        assert!(parse("20001").is_err());
        assert!(parse("4001").is_err());
        assert!(parse("400001").is_err());
        assert!(parse("4000a").is_err());
    }

    #[test]
    fn only_coil_and_holding_register_are_writable() {
        assert!(ModbusTable::Coil.is_writable());
        assert!(ModbusTable::HoldingRegister.is_writable());
        assert!(!ModbusTable::DiscreteInput.is_writable());
        assert!(!ModbusTable::InputRegister.is_writable());
    }

    #[test]
    fn decode_uint16_from_register() {
        let v = decode_registers(&[0x0BAA], DataType::UInt16, WordOrder::BigEndian).unwrap();
        assert_eq!(v, Scalar::UInt16(2986));
    }

    #[test]
    fn round_trip_int32_big_endian() {
        let regs = encode_registers(Scalar::Int32(12345), WordOrder::BigEndian);
        let decoded = decode_registers(&regs, DataType::Int32, WordOrder::BigEndian).unwrap();
        assert_eq!(decoded, Scalar::Int32(12345));
    }

    #[test]
    fn round_trip_float64_little_endian_word_order() {
        let regs = encode_registers(Scalar::Float64(3.25), WordOrder::LittleEndian);
        let decoded = decode_registers(&regs, DataType::Float64, WordOrder::LittleEndian).unwrap();
        assert_eq!(decoded, Scalar::Float64(3.25));
    }

    #[test]
    fn recoverable_exceptions_are_busy_and_ack_only() {
        assert!(ModbusException::ServerDeviceBusy.is_recoverable());
        assert!(ModbusException::Acknowledge.is_recoverable());
        assert!(!ModbusException::IllegalDataAddress.is_recoverable());
    }
}
