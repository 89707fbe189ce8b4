/// Modbus protocol definitions and data structures
///
/// This module contains the Modbus TCP protocol definitions shared by the
/// gateway server and the probing client: function codes, exception codes,
/// the MBAP header, and request/response structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{GatewayError, GatewayResult};
use crate::utils::validation;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus TCP unit identifier
pub type UnitId = u8;

/// MBAP header size (transaction id + protocol id + length)
pub const MBAP_HEADER_SIZE: usize = 6;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> GatewayResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(GatewayError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Map a request-processing error onto the exception a client should see
    pub fn from_error(error: &GatewayError) -> Self {
        match error {
            GatewayError::InvalidFunction { .. } => ModbusException::IllegalFunction,
            GatewayError::InvalidAddress { .. } => ModbusException::IllegalDataAddress,
            GatewayError::InvalidData { .. } | GatewayError::Frame { .. } => ModbusException::IllegalDataValue,
            _ => ModbusException::ServerDeviceFailure,
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}", self.to_u8())
    }
}

/// Modbus Application Protocol header plus the unit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count following the length field (unit id + PDU)
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Parse the first seven bytes of a frame
    pub fn parse(bytes: &[u8]) -> GatewayResult<Self> {
        if bytes.len() < MBAP_HEADER_SIZE + 1 {
            return Err(GatewayError::frame("MBAP header too short"));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(GatewayError::frame("Invalid protocol ID"));
        }
        // unit id + function code at minimum
        if header.length < 2 || header.length as usize > crate::MAX_TCP_FRAME_SIZE - MBAP_HEADER_SIZE {
            return Err(GatewayError::frame(format!("Invalid MBAP length: {}", header.length)));
        }
        Ok(header)
    }

    /// Build a full frame around `pdu` (function code + data)
    pub fn frame(transaction_id: u16, unit_id: UnitId, pdu: &[u8]) -> Vec<u8> {
        let length = (pdu.len() + 1) as u16;
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu);
        frame
    }
}

/// Modbus request structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Encode function code and data into a PDU
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.data.len());
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.address.to_be_bytes());

        match self.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                pdu.extend_from_slice(&self.data);
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push(self.data.len() as u8);
                pdu.extend_from_slice(&self.data);
            }
            _ => pdu.extend_from_slice(&self.quantity.to_be_bytes()),
        }
        pdu
    }

    /// Validate the request
    pub fn validate(&self) -> GatewayResult<()> {
        validation::validate_unit_id(self.unit_id)?;

        match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs | ModbusFunction::WriteMultipleCoils => {
                validation::validate_coil_count(self.quantity)?;
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters | ModbusFunction::WriteMultipleRegisters => {
                validation::validate_register_count(self.quantity)?;
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {}
        }

        validation::validate_address_range(self.address, self.quantity.max(1))
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(unit_id: UnitId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
            exception: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(unit_id: UnitId, function: ModbusFunction, exception_code: u8) -> Self {
        Self {
            unit_id,
            function,
            data: vec![exception_code],
            exception: Some(
                ModbusException::from_u8(exception_code).unwrap_or(ModbusException::ServerDeviceFailure)
            ),
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<GatewayError> {
        self.exception.map(|exc| GatewayError::exception(self.function.to_u8(), exc.to_u8()))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> GatewayResult<Vec<u16>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let (&byte_count, rest) = self.data.split_first()
            .ok_or_else(|| GatewayError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;
        if rest.len() < byte_count {
            return Err(GatewayError::frame("Incomplete register data"));
        }
        data_utils::bytes_to_registers(&rest[..byte_count])
    }

    /// Parse response data as bits (bool values)
    pub fn parse_bits(&self, quantity: u16) -> GatewayResult<Vec<bool>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let (&byte_count, rest) = self.data.split_first()
            .ok_or_else(|| GatewayError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;
        if rest.len() < byte_count || byte_count * 8 < quantity as usize {
            return Err(GatewayError::frame("Incomplete bit data"));
        }
        Ok(data_utils::unpack_bits(&rest[..byte_count], quantity as usize))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> GatewayResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(GatewayError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes.chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).map_or(false, |byte| byte & (1 << (i % 8)) != 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);

        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_exception_mapping() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(
            ModbusException::from_error(&GatewayError::invalid_function(0x2B)),
            ModbusException::IllegalFunction
        );
        assert_eq!(
            ModbusException::from_error(&GatewayError::invalid_address(65535, 2)),
            ModbusException::IllegalDataAddress
        );
    }

    #[test]
    fn test_mbap_header() {
        let frame = MbapHeader::frame(0x0102, 7, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(frame, vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x00, 0x00, 0x02]);

        let header = MbapHeader::parse(&frame).unwrap();
        assert_eq!(header.transaction_id, 0x0102);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 7);

        let mut bad = frame.clone();
        bad[2] = 0x01;
        assert!(MbapHeader::parse(&bad).is_err());
    }

    #[test]
    fn test_request_validation() {
        let valid = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 10);
        assert!(valid.validate().is_ok());

        let too_many = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 200);
        assert!(too_many.validate().is_err());

        let past_end = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 65535, 2);
        assert!(past_end.validate().is_err());
    }

    #[test]
    fn test_response_parsing() {
        let register_data = vec![4, 0x12, 0x34, 0x56, 0x78];
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, register_data);
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let bit_data = vec![1, 0b0000_1010];
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, bit_data);
        assert_eq!(response.parse_bits(4).unwrap(), vec![false, true, false, true]);

        let response = ModbusResponse::new_exception(1, ModbusFunction::ReadCoils, 0x02);
        assert!(response.is_exception());
        assert!(response.parse_bits(1).is_err());
    }

    #[test]
    fn test_bit_packing() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);
    }
}
