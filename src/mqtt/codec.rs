//! Byte-accurate encoder/decoder for the fixed packet subset the broker
//! speaks. The decoder consumes the complete bytes of one packet as produced
//! by the [`crate::mqtt::Framer`]; encoders build ready-to-write frames.

use super::packet::{
    ConnackPacket, ConnectPacket, Packet, PublishPacket, QoS, SubackPacket, SubscribePacket,
    SubscriptionRequest, Will,
};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub(crate) const CONNECT: u8 = 1;
pub(crate) const CONNACK: u8 = 2;
pub(crate) const PUBLISH: u8 = 3;
pub(crate) const PUBACK: u8 = 4;
pub(crate) const SUBSCRIBE: u8 = 8;
pub(crate) const SUBACK: u8 = 9;
pub(crate) const PINGREQ: u8 = 12;
pub(crate) const PINGRESP: u8 = 13;
pub(crate) const DISCONNECT: u8 = 14;

/// Largest remaining-length a four-byte varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed packet")]
    MalformedPacket,
    #[error("invalid length")]
    InvalidLength,
    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),
}

/// Decode a remaining-length varint from the head of `buf`.
///
/// Returns `(value, bytes_consumed)`, or `None` when the buffer ends before
/// the varint terminates. A continuation bit still set after four bytes is
/// `InvalidLength`.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(CodecError::InvalidLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        Err(CodecError::InvalidLength)
    } else {
        Ok(None)
    }
}

/// Encode a remaining-length varint (one to four bytes).
pub fn encode_length(len: usize) -> Result<Vec<u8>, CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::InvalidLength);
    }
    let mut encoded = Vec::with_capacity(4);
    let mut n = len;
    loop {
        let mut digit = (n % 128) as u8;
        n /= 128;
        if n > 0 {
            digit |= 0x80;
        }
        encoded.push(digit);
        if n == 0 {
            break;
        }
    }
    Ok(encoded)
}

struct Reader<'a> {
    frame: &'a Bytes,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.frame.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        if self.remaining() < 1 {
            return Err(CodecError::MalformedPacket);
        }
        let v = self.frame[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        if self.remaining() < 2 {
            return Err(CodecError::MalformedPacket);
        }
        let v = u16::from_be_bytes([self.frame[self.pos], self.frame[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    /// Read a u16-length-prefixed byte string; zero length is a valid empty
    /// value.
    fn read_prefixed(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_u16()? as usize;
        if self.remaining() < len {
            return Err(CodecError::MalformedPacket);
        }
        let out = self.frame.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn take_rest(&mut self) -> Bytes {
        let out = self.frame.slice(self.pos..);
        self.pos = self.frame.len();
        out
    }
}

/// Decode one complete MQTT packet.
pub fn decode_packet(frame: &Bytes) -> Result<Packet, CodecError> {
    if frame.len() < 2 {
        return Err(CodecError::MalformedPacket);
    }
    let packet_type = frame[0] >> 4;
    let flags = frame[0] & 0x0F;
    let (remaining, varint_len) =
        decode_varint(&frame[1..])?.ok_or(CodecError::MalformedPacket)?;
    let body_start = 1 + varint_len;
    if frame.len() - body_start != remaining {
        return Err(CodecError::MalformedPacket);
    }
    let mut r = Reader {
        frame,
        pos: body_start,
    };
    match packet_type {
        CONNECT => {
            expect_flags(flags, 0)?;
            decode_connect(&mut r)
        }
        CONNACK => {
            expect_flags(flags, 0)?;
            decode_connack(&mut r)
        }
        PUBLISH => decode_publish(flags, &mut r),
        PUBACK => {
            expect_flags(flags, 0)?;
            let id = r.read_u16()?;
            expect_consumed(&r)?;
            Ok(Packet::Puback(id))
        }
        SUBSCRIBE => {
            // Reserved fixed-header flags for SUBSCRIBE are 0b0010.
            expect_flags(flags, 0x02)?;
            decode_subscribe(&mut r)
        }
        SUBACK => {
            expect_flags(flags, 0)?;
            decode_suback(&mut r)
        }
        PINGREQ => {
            expect_flags(flags, 0)?;
            expect_consumed(&r)?;
            Ok(Packet::Pingreq)
        }
        PINGRESP => {
            expect_flags(flags, 0)?;
            expect_consumed(&r)?;
            Ok(Packet::Pingresp)
        }
        DISCONNECT => {
            expect_flags(flags, 0)?;
            expect_consumed(&r)?;
            Ok(Packet::Disconnect)
        }
        other => Err(CodecError::UnsupportedPacketType(other)),
    }
}

fn expect_flags(flags: u8, want: u8) -> Result<(), CodecError> {
    if flags == want {
        Ok(())
    } else {
        Err(CodecError::MalformedPacket)
    }
}

fn expect_consumed(r: &Reader<'_>) -> Result<(), CodecError> {
    if r.remaining() == 0 {
        Ok(())
    } else {
        Err(CodecError::MalformedPacket)
    }
}

fn decode_connect(r: &mut Reader<'_>) -> Result<Packet, CodecError> {
    let protocol_name = r.read_prefixed()?;
    let protocol_level = r.read_u8()?;
    let connect_flags = r.read_u8()?;
    if connect_flags & 0x01 != 0 {
        // Reserved bit must be zero (MQTT-3.1.2-3).
        return Err(CodecError::MalformedPacket);
    }
    let clean_session = connect_flags & 0x02 != 0;
    let will_flag = connect_flags & 0x04 != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = connect_flags & 0x20 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    let username_flag = connect_flags & 0x80 != 0;
    if !will_flag && (will_qos_bits != 0 || will_retain) {
        return Err(CodecError::MalformedPacket);
    }
    let keep_alive = r.read_u16()?;
    let client_id = r.read_prefixed()?;
    let will = if will_flag {
        let qos = QoS::from_bits(will_qos_bits).ok_or(CodecError::MalformedPacket)?;
        let topic = r.read_prefixed()?;
        let payload = r.read_prefixed()?;
        Some(Will {
            topic,
            payload,
            qos,
            retain: will_retain,
        })
    } else {
        None
    };
    let username = if username_flag {
        Some(r.read_prefixed()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(r.read_prefixed()?)
    } else {
        None
    };
    expect_consumed(r)?;
    Ok(Packet::Connect(ConnectPacket {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(r: &mut Reader<'_>) -> Result<Packet, CodecError> {
    let ack_flags = r.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(CodecError::MalformedPacket);
    }
    let return_code = r.read_u8()?;
    expect_consumed(r)?;
    Ok(Packet::Connack(ConnackPacket {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, r: &mut Reader<'_>) -> Result<Packet, CodecError> {
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    let qos = QoS::from_bits((flags >> 1) & 0x03).ok_or(CodecError::MalformedPacket)?;
    if dup && qos == QoS::AtMostOnce {
        return Err(CodecError::MalformedPacket);
    }
    let topic = r.read_prefixed()?;
    if topic.is_empty() || topic.contains(&b'+') || topic.contains(&b'#') {
        // A published topic name carries no wildcards.
        return Err(CodecError::MalformedPacket);
    }
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(r.read_u16()?)
    };
    let payload = r.take_rest();
    Ok(Packet::Publish(PublishPacket {
        topic,
        payload,
        qos,
        retain,
        dup,
        packet_id,
    }))
}

fn decode_subscribe(r: &mut Reader<'_>) -> Result<Packet, CodecError> {
    let packet_id = r.read_u16()?;
    let mut filters = Vec::new();
    while r.remaining() > 0 {
        let filter = r.read_prefixed()?;
        let opts = r.read_u8()?;
        if opts & 0xFC != 0 {
            // Upper six bits of the requested-qos byte are reserved-zero.
            return Err(CodecError::MalformedPacket);
        }
        let qos = QoS::from_bits(opts & 0x03).ok_or(CodecError::MalformedPacket)?;
        filters.push(SubscriptionRequest { filter, qos });
    }
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    Ok(Packet::Subscribe(SubscribePacket { packet_id, filters }))
}

fn decode_suback(r: &mut Reader<'_>) -> Result<Packet, CodecError> {
    let packet_id = r.read_u16()?;
    let return_codes = r.take_rest().to_vec();
    if return_codes.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    Ok(Packet::Suback(SubackPacket {
        packet_id,
        return_codes,
    }))
}

fn frame(first_byte: u8, body: &[u8]) -> Result<Bytes, CodecError> {
    let length = encode_length(body.len())?;
    let mut out = BytesMut::with_capacity(1 + length.len() + body.len());
    out.put_u8(first_byte);
    out.extend_from_slice(&length);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

pub fn encode_connack(session_present: bool, return_code: u8) -> Bytes {
    let flags = u8::from(session_present);
    Bytes::copy_from_slice(&[CONNACK << 4, 2, flags, return_code])
}

pub fn encode_puback(packet_id: u16) -> Bytes {
    let id = packet_id.to_be_bytes();
    Bytes::copy_from_slice(&[PUBACK << 4, 2, id[0], id[1]])
}

pub fn encode_pingresp() -> Bytes {
    Bytes::from_static(&[PINGRESP << 4, 0])
}

pub fn encode_suback(packet_id: u16, return_codes: &[u8]) -> Result<Bytes, CodecError> {
    let mut body = Vec::with_capacity(2 + return_codes.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    body.extend_from_slice(return_codes);
    frame(SUBACK << 4, &body)
}

pub fn encode_publish(
    topic: &[u8],
    payload: &[u8],
    qos: QoS,
    retain: bool,
    dup: bool,
    packet_id: Option<u16>,
) -> Result<Bytes, CodecError> {
    if topic.len() > usize::from(u16::MAX) {
        return Err(CodecError::MalformedPacket);
    }
    let mut first = (PUBLISH << 4) | (qos.bits() << 1);
    if dup {
        first |= 0x08;
    }
    if retain {
        first |= 0x01;
    }
    let mut body = Vec::with_capacity(2 + topic.len() + 2 + payload.len());
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic);
    if qos != QoS::AtMostOnce {
        let id = packet_id.ok_or(CodecError::MalformedPacket)?;
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(payload);
    frame(first, &body)
}
