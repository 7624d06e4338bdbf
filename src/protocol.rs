/// Modbus wire formats as they appear in a capture
///
/// This module decodes raw captured TCP payloads into typed requests and
/// responses for the two wire variants the emulator replays: Modbus-TCP
/// (MBAP-framed) and Modbus-RTU-over-TCP (slave/function/body/check field).
/// Decoding is a pure transformation of the input bytes; a frame that is too
/// short for its function code yields a `Frame` error and no partial value.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Size of the MBAP header (transaction id, protocol id, length, unit id)
pub const MBAP_HEADER_LEN: usize = 7;

/// Minimum Modbus-TCP frame: MBAP header plus function code
pub const MIN_TCP_FRAME_LEN: usize = 8;

/// Minimum Modbus-TCP read / single-write request
pub const MIN_TCP_SIMPLE_REQUEST_LEN: usize = 11;

/// Minimum Modbus-TCP multiple-write request
pub const MIN_TCP_MULTIPLE_REQUEST_LEN: usize = 14;

/// Length of the trailing RTU check field
pub const RTU_CHECK_FIELD_LEN: usize = 2;

/// Value a single coil write carries to switch the coil on
pub const COIL_ON: u16 = 0xFF00;

/// Wire variant of a captured or emulated socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    /// Modbus-TCP with MBAP header
    Tcp,
    /// Modbus-RTU frames carried over a TCP stream
    RtuOverTcp,
}

impl fmt::Display for WireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMode::Tcp => write!(f, "tcp"),
            WireMode::RtuOverTcp => write!(f, "rtu_over_tcp"),
        }
    }
}

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
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Whether `code` is one of {1,2,3,4,5,6,15,16}
    pub fn is_supported(code: u8) -> bool {
        Self::from_u8(code).is_ok()
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Check if this function addresses single-bit objects
    pub fn is_bit_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteMultipleCoils
        )
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

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Server Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Server Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
            ModbusException::GatewayPathUnavailable => "Gateway Path Unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => {
                "Gateway Target Device Failed to Respond"
            }
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// MBAP header of a Modbus-TCP frame, including the function code byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function_code: u8,
}

impl MbapHeader {
    /// Decode the first 8 bytes of a Modbus-TCP frame
    ///
    /// Fails when the frame is shorter than 8 bytes or the protocol
    /// identifier is not the reserved Modbus value (0x0000).
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        require_len(frame, MIN_TCP_FRAME_LEN, "MBAP header")?;

        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "unknown protocol identifier 0x{:04X}", protocol_id
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            protocol_id,
            length: u16::from_be_bytes([frame[4], frame[5]]),
            unit_id: frame[6],
            function_code: frame[7],
        })
    }
}

/// Header of a Modbus-RTU-over-TCP frame
///
/// The check field is stored as captured and never verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RtuHeader {
    pub slave_address: u8,
    pub function_code: u8,
    pub check_field: [u8; RTU_CHECK_FIELD_LEN],
}

impl RtuHeader {
    /// Decode slave address, function code and trailing check field
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        require_len(frame, 2 + RTU_CHECK_FIELD_LEN, "RTU header")?;
        let tail = frame.len() - RTU_CHECK_FIELD_LEN;
        Ok(Self {
            slave_address: frame[0],
            function_code: frame[1],
            check_field: [frame[tail], frame[tail + 1]],
        })
    }
}

/// Header of either wire variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FrameHeader {
    Tcp(MbapHeader),
    RtuOverTcp(RtuHeader),
}

impl FrameHeader {
    pub fn wire_mode(&self) -> WireMode {
        match self {
            FrameHeader::Tcp(_) => WireMode::Tcp,
            FrameHeader::RtuOverTcp(_) => WireMode::RtuOverTcp,
        }
    }

    /// Unit id (TCP) or slave address (RTU)
    pub fn slave_id(&self) -> SlaveId {
        match self {
            FrameHeader::Tcp(header) => header.unit_id,
            FrameHeader::RtuOverTcp(header) => header.slave_address,
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            FrameHeader::Tcp(header) => header.function_code,
            FrameHeader::RtuOverTcp(header) => header.function_code,
        }
    }

    /// MBAP transaction id; RTU frames carry none
    pub fn transaction_id(&self) -> Option<u16> {
        match self {
            FrameHeader::Tcp(header) => Some(header.transaction_id),
            FrameHeader::RtuOverTcp(_) => None,
        }
    }
}

/// Function-specific body of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    /// Functions 1-4: number of items requested
    Read { address: ModbusAddress, quantity: u16 },
    /// Functions 5-6: address and value to write
    WriteSingle { address: ModbusAddress, value: u16 },
    /// Functions 15-16: item count, byte count and raw item data
    WriteMultiple {
        address: ModbusAddress,
        quantity: u16,
        byte_count: u8,
        data: Vec<u8>,
    },
}

/// Decoded request frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub header: FrameHeader,
    pub body: RequestBody,
}

impl Request {
    /// Decode a captured request in the given wire mode
    pub fn decode(mode: WireMode, frame: &[u8]) -> ModbusResult<Self> {
        match mode {
            WireMode::Tcp => Self::decode_tcp(frame),
            WireMode::RtuOverTcp => Self::decode_rtu(frame),
        }
    }

    fn decode_tcp(frame: &[u8]) -> ModbusResult<Self> {
        let header = MbapHeader::decode(frame)?;
        let function = ModbusFunction::from_u8(header.function_code)?;

        let body = match function {
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                require_len(frame, MIN_TCP_MULTIPLE_REQUEST_LEN, "multiple write request")?;
                let byte_count = frame[12];
                let data = take_bytes(frame, 13, byte_count as usize, "multiple write data")?;
                RequestBody::WriteMultiple {
                    address: be_u16(frame, 8),
                    quantity: be_u16(frame, 10),
                    byte_count,
                    data,
                }
            }
            _ => {
                require_len(frame, MIN_TCP_SIMPLE_REQUEST_LEN, "request body")?;
                let address = be_u16(frame, 8);
                // Item field is whatever the frame carries after the address, up to two bytes.
                let field = be_field(&frame[10..frame.len().min(12)]);
                if function.is_read_function() {
                    RequestBody::Read { address, quantity: field }
                } else {
                    RequestBody::WriteSingle { address, value: field }
                }
            }
        };

        Ok(Self { header: FrameHeader::Tcp(header), body })
    }

    fn decode_rtu(frame: &[u8]) -> ModbusResult<Self> {
        let header = RtuHeader::decode(frame)?;
        let function = ModbusFunction::from_u8(header.function_code)?;

        let body = match function {
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                require_len(frame, 7 + RTU_CHECK_FIELD_LEN, "RTU multiple write request")?;
                let byte_count = frame[6];
                let body = &frame[..frame.len() - RTU_CHECK_FIELD_LEN];
                let data = take_bytes(body, 7, byte_count as usize, "RTU multiple write data")?;
                RequestBody::WriteMultiple {
                    address: be_u16(frame, 2),
                    quantity: be_u16(frame, 4),
                    byte_count,
                    data,
                }
            }
            _ => {
                require_len(frame, 6 + RTU_CHECK_FIELD_LEN, "RTU request body")?;
                let address = be_u16(frame, 2);
                let field = be_u16(frame, 4);
                if function.is_read_function() {
                    RequestBody::Read { address, quantity: field }
                } else {
                    RequestBody::WriteSingle { address, value: field }
                }
            }
        };

        Ok(Self { header: FrameHeader::RtuOverTcp(header), body })
    }

    pub fn function_code(&self) -> u8 {
        self.header.function_code()
    }

    pub fn slave_id(&self) -> SlaveId {
        self.header.slave_id()
    }

    pub fn address(&self) -> ModbusAddress {
        match self.body {
            RequestBody::Read { address, .. }
            | RequestBody::WriteSingle { address, .. }
            | RequestBody::WriteMultiple { address, .. } => address,
        }
    }

    /// Number of items the request touches; single writes touch one
    pub fn quantity(&self) -> u16 {
        match self.body {
            RequestBody::Read { quantity, .. } | RequestBody::WriteMultiple { quantity, .. } => {
                quantity
            }
            RequestBody::WriteSingle { .. } => 1,
        }
    }
}

/// Function-specific body of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Functions 1-2: packed status bytes, LSB first
    ReadBits { byte_count: u8, status: Vec<u8> },
    /// Functions 3-4: register values
    ReadRegisters { byte_count: u8, values: Vec<u16> },
    /// Functions 5-6: address and value echo
    WriteSingle { address: ModbusAddress, value: u16 },
    /// Functions 15-16: address and item count, no payload echo
    WriteMultiple { address: ModbusAddress, quantity: u16 },
    /// Exception or unsupported function code
    Error { exception_code: u8 },
}

/// Decoded response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub header: FrameHeader,
    pub body: ResponseBody,
}

impl Response {
    /// Decode a captured response in the given wire mode
    ///
    /// A function code outside the supported set selects the `Error`
    /// variant rather than failing, so the transaction can still be
    /// correlated and later skipped by the replay engine.
    pub fn decode(mode: WireMode, frame: &[u8]) -> ModbusResult<Self> {
        match mode {
            WireMode::Tcp => Self::decode_tcp(frame),
            WireMode::RtuOverTcp => Self::decode_rtu(frame),
        }
    }

    fn decode_tcp(frame: &[u8]) -> ModbusResult<Self> {
        let header = MbapHeader::decode(frame)?;
        let body = Self::decode_body(header.function_code, frame, MIN_TCP_FRAME_LEN)?;
        Ok(Self { header: FrameHeader::Tcp(header), body })
    }

    fn decode_rtu(frame: &[u8]) -> ModbusResult<Self> {
        let header = RtuHeader::decode(frame)?;
        let pdu = &frame[..frame.len() - RTU_CHECK_FIELD_LEN];
        let body = Self::decode_body(header.function_code, pdu, 2)?;
        Ok(Self { header: FrameHeader::RtuOverTcp(header), body })
    }

    /// Decode the body starting at `offset` (first byte after the function code)
    fn decode_body(function_code: u8, frame: &[u8], offset: usize) -> ModbusResult<ResponseBody> {
        let function = match ModbusFunction::from_u8(function_code) {
            Ok(function) => function,
            Err(_) => {
                return Ok(ResponseBody::Error {
                    exception_code: frame.get(offset).copied().unwrap_or(0),
                });
            }
        };

        let body = match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                require_len(frame, offset + 1, "read bits response")?;
                let byte_count = frame[offset];
                let status =
                    take_bytes(frame, offset + 1, byte_count as usize, "read bits status")?;
                ResponseBody::ReadBits { byte_count, status }
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                require_len(frame, offset + 1, "read registers response")?;
                let byte_count = frame[offset];
                let raw =
                    take_bytes(frame, offset + 1, byte_count as usize, "read registers values")?;
                let values = data_utils::bytes_to_registers(&raw)?;
                ResponseBody::ReadRegisters { byte_count, values }
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                require_len(frame, offset + 4, "single write response")?;
                ResponseBody::WriteSingle {
                    address: be_u16(frame, offset),
                    value: be_u16(frame, offset + 2),
                }
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                require_len(frame, offset + 4, "multiple write response")?;
                ResponseBody::WriteMultiple {
                    address: be_u16(frame, offset),
                    quantity: be_u16(frame, offset + 2),
                }
            }
        };
        Ok(body)
    }

    pub fn function_code(&self) -> u8 {
        self.header.function_code()
    }

    pub fn slave_id(&self) -> SlaveId {
        self.header.slave_id()
    }

    /// Check if this is an exception or unsupported-function response
    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error { .. })
    }

    /// Exception carried by an error response, if it is a standard one
    pub fn exception(&self) -> Option<ModbusException> {
        match self.body {
            ResponseBody::Error { exception_code } => ModbusException::from_u8(exception_code),
            _ => None,
        }
    }
}

fn require_len(frame: &[u8], min: usize, what: &str) -> ModbusResult<()> {
    if frame.len() < min {
        return Err(ModbusError::frame(format!(
            "{}: need at least {} bytes, got {}", what, min, frame.len()
        )));
    }
    Ok(())
}

fn take_bytes(frame: &[u8], start: usize, count: usize, what: &str) -> ModbusResult<Vec<u8>> {
    frame
        .get(start..start + count)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ModbusError::frame(format!(
            "{}: declared {} bytes, frame holds {}", what, count, frame.len().saturating_sub(start)
        )))
}

/// Caller guarantees `offset + 2 <= frame.len()`
fn be_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

fn be_field(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, &b| (acc << 8) | b as u16)
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
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::frame("Register byte count must be even"));
        }

        Ok(bytes
            .chunks(2)
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

    /// Unpack bytes into boolean values, LSB first
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}
