//! # MQTT 3.1.1 Wire Format
//!
//! Packet encoding and decoding for the packet set this node exchanges
//! with its broker: `CONNECT`/`CONNACK`, `SUBSCRIBE`/`SUBACK`,
//! `PUBLISH`/`PUBACK` and `PINGREQ`/`PINGRESP`.
//!
//! Encoding writes into a caller-provided buffer: space for the longest
//! possible remaining-length field is reserved after the fixed header,
//! the variable header and payload are written behind it, and the content
//! is compacted once the actual length is known. Decoding is incremental:
//! [`decode`] reports `None` until a full frame is buffered, and on success
//! returns the number of bytes consumed so the caller can retain a partial
//! next frame.

use crate::error::WireError;
use heapless::Vec;

/// Delivery guarantee negotiated per publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(WireError::Malformed),
        }
    }
}

/// A packet that can be encoded into a byte buffer.
pub trait Encode {
    /// Writes the packet into `buf` and returns the encoded length.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError>;
}

/// Packets this node can receive from the broker.
#[derive(Debug)]
pub enum Packet<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    SubAck(SubAck),
    PingResp,
}

/// Fixed header byte plus the four bytes reserved for the longest
/// remaining-length encoding.
const CONTENT_START: usize = 5;

/// MQTT 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;

/// Decodes the next complete packet from `buf`.
///
/// Returns `Ok(None)` while the buffer holds only a partial frame, and
/// `Ok(Some((packet, consumed)))` once a frame is complete. `consumed` is
/// the total frame length; bytes past it belong to the next frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet<'_>, usize)>, WireError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let Some((remaining, header_len)) = read_remaining_len(buf)? else {
        return Ok(None);
    };
    let total = header_len + remaining;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[header_len..total];
    let packet = match buf[0] >> 4 {
        2 => Packet::ConnAck(ConnAck::decode(body)?),
        3 => Packet::Publish(Publish::decode(buf[0] & 0x0F, body)?),
        4 => Packet::PubAck(PubAck::decode(body)?),
        9 => Packet::SubAck(SubAck::decode(body)?),
        13 => Packet::PingResp,
        other => return Err(WireError::UnsupportedPacket(other)),
    };

    Ok(Some((packet, total)))
}

// --- CONNECT ---

/// Connection request carrying the client identity and credentials.
#[derive(Debug)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    /// Negotiated keep-alive interval in seconds.
    pub keep_alive: u16,
    pub clean_session: bool,
}

impl Encode for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < CONTENT_START {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = 0x10;
        let mut cursor = CONTENT_START;
        cursor += write_utf8_str(&mut buf[cursor..], "MQTT")?;
        write_u8(&mut cursor, buf, PROTOCOL_LEVEL)?;

        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        write_u8(&mut cursor, buf, flags)?;
        write_u16(&mut cursor, buf, self.keep_alive)?;

        cursor += write_utf8_str(&mut buf[cursor..], self.client_id)?;
        if let Some(username) = self.username {
            cursor += write_utf8_str(&mut buf[cursor..], username)?;
        }
        if let Some(password) = self.password {
            cursor += write_utf8_str(&mut buf[cursor..], password)?;
        }

        finish_packet(buf, cursor)
    }
}

// --- CONNACK ---

#[derive(Debug, Clone, Copy)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: u8,
}

impl ConnAck {
    fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 2 {
            return Err(WireError::Malformed);
        }
        Ok(Self {
            session_present: (body[0] & 0x01) != 0,
            code: body[1],
        })
    }
}

// --- PUBLISH ---

/// An application message, outbound or inbound.
///
/// The topic and payload borrow the caller's (or the session's receive)
/// buffer; they are only valid for the duration of the handler call.
#[derive(Debug)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    /// Present only for QoS levels above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> Publish<'a> {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, WireError> {
        let qos = QoS::from_bits((flags >> 1) & 0x03)?;
        let mut cursor = 0;
        let topic = read_utf8_str(&mut cursor, body)?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_u16(&mut cursor, body)?)
        } else {
            None
        };
        Ok(Self {
            topic,
            qos,
            packet_id,
            payload: &body[cursor..],
        })
    }
}

impl Encode for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < CONTENT_START {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = 0x30 | ((self.qos as u8) << 1);
        let mut cursor = CONTENT_START;
        cursor += write_utf8_str(&mut buf[cursor..], self.topic)?;
        if self.qos != QoS::AtMostOnce
            && let Some(id) = self.packet_id
        {
            write_u16(&mut cursor, buf, id)?;
        }
        write_bytes(&mut cursor, buf, self.payload)?;
        finish_packet(buf, cursor)
    }
}

// --- PUBACK ---

#[derive(Debug, Clone, Copy)]
pub struct PubAck {
    pub packet_id: u16,
}

impl PubAck {
    fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut cursor = 0;
        let packet_id = read_u16(&mut cursor, body)?;
        Ok(Self { packet_id })
    }
}

impl Encode for PubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < 4 {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = 0x40;
        buf[1] = 0x02;
        buf[2..4].copy_from_slice(&self.packet_id.to_be_bytes());
        Ok(4)
    }
}

// --- SUBSCRIBE ---

/// Subscription request for a single topic filter.
#[derive(Debug)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topic: &'a str,
    pub qos: QoS,
}

impl Encode for Subscribe<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < CONTENT_START {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = 0x82;
        let mut cursor = CONTENT_START;
        write_u16(&mut cursor, buf, self.packet_id)?;
        cursor += write_utf8_str(&mut buf[cursor..], self.topic)?;
        write_u8(&mut cursor, buf, self.qos as u8)?;
        finish_packet(buf, cursor)
    }
}

// --- SUBACK ---

#[derive(Debug)]
pub struct SubAck {
    pub packet_id: u16,
    /// One return code per requested topic filter; `0x80` marks a refusal.
    pub codes: Vec<u8, 4>,
}

impl SubAck {
    fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut cursor = 0;
        let packet_id = read_u16(&mut cursor, body)?;
        let mut codes = Vec::new();
        for &code in &body[cursor..] {
            codes.push(code).map_err(|_| WireError::PayloadTooLarge)?;
        }
        Ok(Self { packet_id, codes })
    }
}

// --- PINGREQ ---

#[derive(Debug)]
pub struct PingReq;

impl Encode for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < 2 {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = 0xC0;
        buf[1] = 0x00;
        Ok(2)
    }
}

// --- encoding helpers ---

/// Writes the remaining length at `buf[1..]` and compacts the content that
/// was staged at [`CONTENT_START`] down against the fixed header.
fn finish_packet(buf: &mut [u8], cursor: usize) -> Result<usize, WireError> {
    let remaining = cursor - CONTENT_START;
    let len_bytes = write_remaining_len(&mut buf[1..], remaining)?;
    let header_len = 1 + len_bytes;
    buf.copy_within(CONTENT_START..cursor, header_len);
    Ok(header_len + remaining)
}

fn write_remaining_len(buf: &mut [u8], mut val: usize) -> Result<usize, WireError> {
    let mut i = 0;
    loop {
        let mut byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            byte |= 0x80;
        }
        *buf.get_mut(i).ok_or(WireError::BufferTooSmall)? = byte;
        i += 1;
        if val == 0 {
            return Ok(i);
        }
        if i >= 4 {
            return Err(WireError::PayloadTooLarge);
        }
    }
}

/// Reads the remaining-length field starting at `buf[1]`.
///
/// Returns `(remaining, header_len)`, or `None` when the field itself is
/// still incomplete.
fn read_remaining_len(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let Some(&byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, 2 + i)));
        }
        multiplier *= 128;
    }
    Err(WireError::Malformed)
}

fn write_u8(cursor: &mut usize, buf: &mut [u8], val: u8) -> Result<(), WireError> {
    *buf.get_mut(*cursor).ok_or(WireError::BufferTooSmall)? = val;
    *cursor += 1;
    Ok(())
}

fn write_u16(cursor: &mut usize, buf: &mut [u8], val: u16) -> Result<(), WireError> {
    buf.get_mut(*cursor..*cursor + 2)
        .ok_or(WireError::BufferTooSmall)?
        .copy_from_slice(&val.to_be_bytes());
    *cursor += 2;
    Ok(())
}

fn write_bytes(cursor: &mut usize, buf: &mut [u8], bytes: &[u8]) -> Result<(), WireError> {
    buf.get_mut(*cursor..*cursor + bytes.len())
        .ok_or(WireError::BufferTooSmall)?
        .copy_from_slice(bytes);
    *cursor += bytes.len();
    Ok(())
}

/// Writes a UTF-8 string prefixed with its 2-byte length; returns the
/// bytes used.
fn write_utf8_str(buf: &mut [u8], s: &str) -> Result<usize, WireError> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(WireError::PayloadTooLarge);
    }
    let required = 2 + len;
    let slice = buf.get_mut(..required).ok_or(WireError::BufferTooSmall)?;
    slice[..2].copy_from_slice(&(len as u16).to_be_bytes());
    slice[2..].copy_from_slice(s.as_bytes());
    Ok(required)
}

fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, WireError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(WireError::Malformed)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a UTF-8 string prefixed with its 2-byte length.
fn read_utf8_str<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a str, WireError> {
    let len = read_u16(cursor, buf)? as usize;
    let bytes = buf
        .get(*cursor..*cursor + len)
        .ok_or(WireError::Malformed)?;
    *cursor += len;
    core::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
}
