//! Protocol data units understood by the SUN2000 family.
//!
//! Only the subset the device actually uses is modelled: read holding
//! registers, write multiple registers, and Huawei's vendor extension
//! function (0x41) which carries the login handshake.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::error::{Error, Result};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const VENDOR_EXTENSION: u8 = 0x41;

const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum registers per read request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Maximum registers per write request.
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Largest PDU that fits both an MBAP and an RTU frame.
pub const MAX_PDU_LEN: usize = 253;
/// Largest vendor payload: the PDU minus function, sub-function and length.
pub const MAX_VENDOR_PAYLOAD: usize = MAX_PDU_LEN - 3;

/// Modbus exception codes, including the vendor-specific permission code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    GatewayPathUnavailable,
    GatewayTargetNoResponse,
    /// 0x80: the register requires an elevated session.
    PermissionDenied,
    Other(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetNoResponse,
            0x80 => ExceptionCode::PermissionDenied,
            other => ExceptionCode::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetNoResponse => 0x0B,
            ExceptionCode::PermissionDenied => 0x80,
            ExceptionCode::Other(code) => code,
        }
    }

    /// Busy and gateway-no-response are worth another attempt; everything
    /// else, including codes we do not know, is surfaced as is.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ExceptionCode::ServerDeviceBusy | ExceptionCode::GatewayTargetNoResponse
        )
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::ServerDeviceBusy => "server device busy",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetNoResponse => "gateway target failed to respond",
            ExceptionCode::PermissionDenied => "permission denied",
            ExceptionCode::Other(_) => "unknown exception",
        };
        write!(f, "{} (0x{:02X})", label, self.as_u8())
    }
}

/// A PDU that can be framed on the wire.
pub trait Pdu: Sized {
    fn function_code(&self) -> u8;

    /// Append function code and data to `dst`.
    ///
    /// Fails, leaving `dst` in an unspecified state, when a count or length
    /// does not fit its field.
    fn encode(&self, dst: &mut BytesMut) -> Result<()>;

    /// Parse a complete PDU (function code first).
    fn decode(pdu: &[u8]) -> Result<Self>;

    /// Total PDU length given its first bytes, or `None` if more bytes are
    /// needed to tell. Used by RTU framing, which has no length header.
    fn frame_len(prefix: &[u8]) -> Option<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteMultipleRegisters { address: u16, words: Vec<u16> },
    Vendor { sub_function: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadHoldingRegisters(Vec<u16>),
    WriteMultipleRegisters { address: u16, count: u16 },
    Vendor { sub_function: u8, payload: Vec<u8> },
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    /// Turn an exception response into the matching error.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Exception {
                code: ExceptionCode::PermissionDenied,
                ..
            } => Err(Error::AccessDenied),
            Response::Exception { code, .. } => Err(Error::DeviceException(code)),
            other => Ok(other),
        }
    }

    /// Whether this response answers `request` (exceptions included).
    pub fn answers(&self, request: &Request) -> bool {
        match (self, request) {
            (Response::Exception { function, .. }, req) => *function == req.function_code(),
            (
                Response::Vendor { sub_function, .. },
                Request::Vendor {
                    sub_function: asked,
                    ..
                },
            ) => sub_function == asked,
            (resp, req) => resp.function_code() == req.function_code(),
        }
    }
}

fn words_to_bytes(words: &[u16], dst: &mut BytesMut) {
    for word in words {
        dst.put_u16(*word);
    }
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(BigEndian::read_u16).collect()
}

/// Word counts the wire format allows for a read or write of `words`.
fn register_count(words: usize, max: u16, what: &str) -> Result<u16> {
    match u16::try_from(words) {
        Ok(n) if (1..=max).contains(&n) => Ok(n),
        _ => Err(Error::invalid(format!(
            "{what} of {words} registers, allowed 1 to {max}"
        ))),
    }
}

fn payload_len(payload: &[u8]) -> Result<u8> {
    if payload.len() > MAX_VENDOR_PAYLOAD {
        return Err(Error::invalid(format!(
            "vendor payload of {} bytes, at most {MAX_VENDOR_PAYLOAD} fit",
            payload.len()
        )));
    }
    Ok(payload.len() as u8)
}

fn truncated(what: &str) -> Error {
    Error::Protocol(format!("truncated {what} PDU"))
}

impl Pdu for Request {
    fn function_code(&self) -> u8 {
        match self {
            Request::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Request::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Request::Vendor { .. } => VENDOR_EXTENSION,
        }
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.function_code());
        match self {
            Request::ReadHoldingRegisters { address, count } => {
                register_count(*count as usize, MAX_READ_REGISTERS, "read")?;
                dst.put_u16(*address);
                dst.put_u16(*count);
            }
            Request::WriteMultipleRegisters { address, words } => {
                let count = register_count(words.len(), MAX_WRITE_REGISTERS, "write")?;
                dst.put_u16(*address);
                dst.put_u16(count);
                dst.put_u8((count * 2) as u8);
                words_to_bytes(words, dst);
            }
            Request::Vendor {
                sub_function,
                payload,
            } => {
                let len = payload_len(payload)?;
                dst.put_u8(*sub_function);
                dst.put_u8(len);
                dst.put_slice(payload);
            }
        }
        Ok(())
    }

    fn decode(pdu: &[u8]) -> Result<Self> {
        let (&function, data) = pdu.split_first().ok_or_else(|| truncated("request"))?;
        match function {
            READ_HOLDING_REGISTERS => {
                if data.len() < 4 {
                    return Err(truncated("read request"));
                }
                Ok(Request::ReadHoldingRegisters {
                    address: BigEndian::read_u16(&data[0..2]),
                    count: BigEndian::read_u16(&data[2..4]),
                })
            }
            WRITE_MULTIPLE_REGISTERS => {
                if data.len() < 5 {
                    return Err(truncated("write request"));
                }
                let address = BigEndian::read_u16(&data[0..2]);
                let count = BigEndian::read_u16(&data[2..4]) as usize;
                let byte_count = data[4] as usize;
                if byte_count != count * 2 || data.len() < 5 + byte_count {
                    return Err(Error::Protocol("write request byte count mismatch".into()));
                }
                Ok(Request::WriteMultipleRegisters {
                    address,
                    words: bytes_to_words(&data[5..5 + byte_count]),
                })
            }
            VENDOR_EXTENSION => {
                if data.len() < 2 || data.len() < 2 + data[1] as usize {
                    return Err(truncated("vendor request"));
                }
                Ok(Request::Vendor {
                    sub_function: data[0],
                    payload: data[2..2 + data[1] as usize].to_vec(),
                })
            }
            other => Err(Error::Protocol(format!(
                "unsupported function code 0x{other:02X}"
            ))),
        }
    }

    fn frame_len(prefix: &[u8]) -> Option<usize> {
        match *prefix.first()? {
            READ_HOLDING_REGISTERS => Some(5),
            WRITE_MULTIPLE_REGISTERS => prefix.get(5).map(|count| 6 + *count as usize),
            VENDOR_EXTENSION => prefix.get(2).map(|len| 3 + *len as usize),
            // unknown functions: take the function byte and let decode reject it
            _ => Some(1),
        }
    }
}

impl Pdu for Response {
    fn function_code(&self) -> u8 {
        match self {
            Response::ReadHoldingRegisters(_) => READ_HOLDING_REGISTERS,
            Response::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Response::Vendor { .. } => VENDOR_EXTENSION,
            Response::Exception { function, .. } => function | EXCEPTION_FLAG,
        }
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.function_code());
        match self {
            Response::ReadHoldingRegisters(words) => {
                let count = register_count(words.len(), MAX_READ_REGISTERS, "read reply")?;
                dst.put_u8((count * 2) as u8);
                words_to_bytes(words, dst);
            }
            Response::WriteMultipleRegisters { address, count } => {
                dst.put_u16(*address);
                dst.put_u16(*count);
            }
            Response::Vendor {
                sub_function,
                payload,
            } => {
                let len = payload_len(payload)?;
                dst.put_u8(*sub_function);
                dst.put_u8(len);
                dst.put_slice(payload);
            }
            Response::Exception { code, .. } => dst.put_u8(code.as_u8()),
        }
        Ok(())
    }

    fn decode(pdu: &[u8]) -> Result<Self> {
        let (&function, data) = pdu.split_first().ok_or_else(|| truncated("response"))?;
        if function & EXCEPTION_FLAG != 0 {
            let code = *data.first().ok_or_else(|| truncated("exception"))?;
            return Ok(Response::Exception {
                function: function & !EXCEPTION_FLAG,
                code: ExceptionCode::from_u8(code),
            });
        }
        match function {
            READ_HOLDING_REGISTERS => {
                let byte_count = *data.first().ok_or_else(|| truncated("read response"))? as usize;
                if byte_count % 2 != 0 || data.len() < 1 + byte_count {
                    return Err(Error::Protocol("read response byte count mismatch".into()));
                }
                Ok(Response::ReadHoldingRegisters(bytes_to_words(
                    &data[1..1 + byte_count],
                )))
            }
            WRITE_MULTIPLE_REGISTERS => {
                if data.len() < 4 {
                    return Err(truncated("write response"));
                }
                Ok(Response::WriteMultipleRegisters {
                    address: BigEndian::read_u16(&data[0..2]),
                    count: BigEndian::read_u16(&data[2..4]),
                })
            }
            VENDOR_EXTENSION => {
                if data.len() < 2 || data.len() < 2 + data[1] as usize {
                    return Err(truncated("vendor response"));
                }
                Ok(Response::Vendor {
                    sub_function: data[0],
                    payload: data[2..2 + data[1] as usize].to_vec(),
                })
            }
            other => Err(Error::Protocol(format!(
                "unsupported function code 0x{other:02X}"
            ))),
        }
    }

    fn frame_len(prefix: &[u8]) -> Option<usize> {
        let function = *prefix.first()?;
        if function & EXCEPTION_FLAG != 0 {
            return Some(2);
        }
        match function {
            READ_HOLDING_REGISTERS => prefix.get(1).map(|count| 2 + *count as usize),
            WRITE_MULTIPLE_REGISTERS => Some(5),
            VENDOR_EXTENSION => prefix.get(2).map(|len| 3 + *len as usize),
            _ => Some(1),
        }
    }
}
