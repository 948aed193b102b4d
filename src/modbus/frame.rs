//! Framing codecs: Modbus TCP (MBAP header) and Modbus RTU (slave id + CRC).
//!
//! Both codecs are generic over the PDU direction so the same code frames
//! client requests and, in tests, simulated device responses.

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

use super::pdu::{Pdu, Request, Response, MAX_PDU_LEN};
use crate::error::{Error, Result};

const MBAP_HEADER_LEN: usize = 7;
const MAX_MBAP_LENGTH: usize = 254;
const MODBUS_PROTOCOL_ID: u16 = 0;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

fn check_pdu_len(pdu: &[u8]) -> Result<()> {
    if pdu.len() > MAX_PDU_LEN {
        return Err(Error::invalid(format!(
            "PDU of {} bytes exceeds {MAX_PDU_LEN}",
            pdu.len()
        )));
    }
    Ok(())
}

/// One framed PDU. `transaction` is only meaningful for TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<P> {
    pub slave: u8,
    pub transaction: u16,
    pub pdu: P,
}

/// MBAP framing. Decodes `In`, encodes `Out`.
#[derive(Debug)]
pub struct TcpCodec<In, Out> {
    _pdu: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Default for TcpCodec<In, Out> {
    fn default() -> Self {
        Self { _pdu: PhantomData }
    }
}

impl<In: Pdu, Out> Decoder for TcpCodec<In, Out> {
    type Item = Frame<In>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([src[4], src[5]]) as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(Error::Protocol(format!("invalid MBAP length {length}")));
        }
        let total = 6 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let transaction = frame.get_u16();
        let protocol = frame.get_u16();
        let _length = frame.get_u16();
        let slave = frame.get_u8();
        if protocol != MODBUS_PROTOCOL_ID {
            return Err(Error::Protocol(format!("unexpected protocol id {protocol}")));
        }

        Ok(Some(Frame {
            slave,
            transaction,
            pdu: In::decode(&frame)?,
        }))
    }
}

impl<In, Out: Pdu> Encoder<Frame<Out>> for TcpCodec<In, Out> {
    type Error = Error;

    fn encode(&mut self, item: Frame<Out>, dst: &mut BytesMut) -> Result<()> {
        let mut pdu = BytesMut::new();
        item.pdu.encode(&mut pdu)?;
        check_pdu_len(&pdu)?;

        dst.reserve(MBAP_HEADER_LEN + pdu.len());
        dst.put_u16(item.transaction);
        dst.put_u16(MODBUS_PROTOCOL_ID);
        dst.put_u16((pdu.len() + 1) as u16);
        dst.put_u8(item.slave);
        dst.extend_from_slice(&pdu);
        Ok(())
    }
}

/// RTU framing. Frame length is derived from the function code.
#[derive(Debug)]
pub struct RtuCodec<In, Out> {
    _pdu: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Default for RtuCodec<In, Out> {
    fn default() -> Self {
        Self { _pdu: PhantomData }
    }
}

impl<In: Pdu, Out> Decoder for RtuCodec<In, Out> {
    type Item = Frame<In>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let Some(pdu_len) = In::frame_len(&src[1..]) else {
            return Ok(None);
        };
        let total = 1 + pdu_len + 2;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let (body, crc_bytes) = frame.split_at(total - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = CRC16.checksum(body);
        if received != computed {
            return Err(Error::Protocol(format!(
                "CRC mismatch: expected 0x{computed:04X}, got 0x{received:04X}"
            )));
        }

        Ok(Some(Frame {
            slave: body[0],
            transaction: 0,
            pdu: In::decode(&body[1..])?,
        }))
    }
}

impl<In, Out: Pdu> Encoder<Frame<Out>> for RtuCodec<In, Out> {
    type Error = Error;

    fn encode(&mut self, item: Frame<Out>, dst: &mut BytesMut) -> Result<()> {
        let mut adu = BytesMut::new();
        adu.put_u8(item.slave);
        item.pdu.encode(&mut adu)?;
        check_pdu_len(&adu[1..])?;
        let crc = CRC16.checksum(&adu);
        dst.extend_from_slice(&adu);
        dst.put_u16_le(crc);
        Ok(())
    }
}

pub type ClientTcpCodec = TcpCodec<Response, Request>;
pub type ClientRtuCodec = RtuCodec<Response, Request>;
pub type DeviceTcpCodec = TcpCodec<Request, Response>;
pub type DeviceRtuCodec = RtuCodec<Request, Response>;
