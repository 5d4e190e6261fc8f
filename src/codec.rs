//! MQTT 3.1.1 packet codec.
//!
//! Encodes and decodes the fourteen v3.1.1 control packets to and from byte
//! buffers, including the variable-length remaining-length field. Decoding is
//! incremental: [`decode`] reports [`Decoded::NeedMore`] when a frame
//! straddles a read boundary so the caller can buffer and retry.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol name in the CONNECT variable header.
const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;
/// Largest value the 4-byte remaining-length encoding can carry.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Codec-level failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("string field of {0} bytes exceeds the 65535 byte limit")]
    TopicTooLong(usize),
    #[error("packet of {size} bytes exceeds the configured maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
}

/// MQTT control packet types (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            other => Err(CodecError::MalformedPacket(format!(
                "invalid packet type {other}"
            ))),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::MalformedPacket(format!("invalid QoS {other}"))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ConnackCode {
    /// Whether a rejection with this code will repeat identically on every
    /// retry, meaning auto-reconnect should stop instead of backing off.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ConnackCode::IdentifierRejected
                | ConnackCode::BadCredentials
                | ConnackCode::NotAuthorized
        )
    }
}

impl TryFrom<u8> for ConnackCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadCredentials),
            5 => Ok(ConnackCode::NotAuthorized),
            other => Err(CodecError::MalformedPacket(format!(
                "invalid CONNACK return code {other}"
            ))),
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
}

/// Last-will configuration carried in CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present for QoS 1 and 2 only.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data. Return codes >= 0x80 mark per-topic failures.
#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// MQTT control packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// Outcome of a decode attempt over a partially filled buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete packet and the number of bytes it occupied.
    Packet { packet: Packet, consumed: usize },
    /// The buffer does not yet hold a complete frame.
    NeedMore,
}

/// Parsed fixed header of a frame whose body may not be buffered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// First byte of the fixed header (type nibble + flags).
    pub first_byte: u8,
    /// Declared length of the variable header plus payload.
    pub remaining_len: usize,
    /// Bytes occupied by the fixed header itself.
    pub header_len: usize,
}

impl FrameHeader {
    pub fn packet_type(&self) -> Result<PacketType, CodecError> {
        PacketType::try_from(self.first_byte >> 4)
    }

    /// Total frame size once fully buffered.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_len
    }
}

/// Parse the fixed header without requiring the body. Returns `Ok(None)`
/// when more bytes are needed to finish the remaining-length field.
pub fn peek_header(buf: &[u8]) -> Result<Option<FrameHeader>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut remaining_len = 0usize;
    let mut shift = 0u32;
    for (i, &byte) in buf[1..].iter().take(4).enumerate() {
        remaining_len |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(Some(FrameHeader {
                first_byte: buf[0],
                remaining_len,
                header_len: 1 + i + 1,
            }));
        }
        if i == 3 {
            return Err(CodecError::MalformedPacket(
                "remaining length exceeds 4 bytes".into(),
            ));
        }
    }
    Ok(None)
}

/// Decode one packet from the front of `buf`.
///
/// Frames whose declared size exceeds `max_packet_size` fail with
/// [`CodecError::PacketTooLarge`]; oversized PUBLISH frames are expected to
/// be intercepted via [`peek_header`] and streamed by the caller instead.
pub fn decode(buf: &[u8], max_packet_size: usize) -> Result<Decoded, CodecError> {
    let header = match peek_header(buf)? {
        Some(header) => header,
        None => return Ok(Decoded::NeedMore),
    };
    if header.frame_len() > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size: header.frame_len(),
            max: max_packet_size,
        });
    }
    if buf.len() < header.frame_len() {
        return Ok(Decoded::NeedMore);
    }

    let flags = header.first_byte & 0x0F;
    let body = &buf[header.header_len..header.frame_len()];
    let packet = match header.packet_type()? {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(flags, body)?,
        PacketType::Publish => Packet::Publish(decode_publish(flags, body)?),
        PacketType::Puback => Packet::Puback {
            packet_id: decode_packet_id_only(flags, 0, body, "PUBACK")?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_packet_id_only(flags, 0, body, "PUBREC")?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_packet_id_only(flags, 0x02, body, "PUBREL")?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_packet_id_only(flags, 0, body, "PUBCOMP")?,
        },
        PacketType::Subscribe => decode_subscribe(flags, body)?,
        PacketType::Suback => decode_suback(flags, body)?,
        PacketType::Unsubscribe => decode_unsubscribe(flags, body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_packet_id_only(flags, 0, body, "UNSUBACK")?,
        },
        PacketType::Pingreq => decode_empty(flags, body, Packet::Pingreq, "PINGREQ")?,
        PacketType::Pingresp => decode_empty(flags, body, Packet::Pingresp, "PINGRESP")?,
        PacketType::Disconnect => decode_empty(flags, body, Packet::Disconnect, "DISCONNECT")?,
    };
    Ok(Decoded::Packet {
        packet,
        consumed: header.frame_len(),
    })
}

/// Encode `packet` onto the end of `dst`.
pub fn encode(packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
    let mut body = BytesMut::new();
    let first_byte = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0x10
        }
        Packet::Connack(connack) => {
            body.put_u8(connack.session_present as u8);
            body.put_u8(connack.code as u8);
            0x20
        }
        Packet::Publish(publish) => {
            encode_publish(publish, &mut body)?;
            let qos = publish.qos as u8;
            0x30 | ((publish.dup as u8) << 3) | (qos << 1) | publish.retain as u8
        }
        Packet::Puback { packet_id } => {
            body.put_u16(*packet_id);
            0x40
        }
        Packet::Pubrec { packet_id } => {
            body.put_u16(*packet_id);
            0x50
        }
        Packet::Pubrel { packet_id } => {
            body.put_u16(*packet_id);
            0x62
        }
        Packet::Pubcomp { packet_id } => {
            body.put_u16(*packet_id);
            0x70
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for (topic, qos) in &subscribe.topics {
                put_string(topic, &mut body)?;
                body.put_u8(*qos as u8);
            }
            0x82
        }
        Packet::Suback(suback) => {
            body.put_u16(suback.packet_id);
            body.extend_from_slice(&suback.return_codes);
            0x90
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for topic in &unsubscribe.topics {
                put_string(topic, &mut body)?;
            }
            0xA2
        }
        Packet::Unsuback { packet_id } => {
            body.put_u16(*packet_id);
            0xB0
        }
        Packet::Pingreq => 0xC0,
        Packet::Pingresp => 0xD0,
        Packet::Disconnect => 0xE0,
    };

    dst.put_u8(first_byte);
    put_remaining_length(body.len(), dst)?;
    dst.extend_from_slice(&body);
    Ok(())
}

/// Set the DUP bit on an already-encoded PUBLISH frame for retransmission.
/// No-op for other packet types.
pub fn set_dup_flag(frame: &mut [u8]) {
    if let Some(first) = frame.first_mut() {
        if *first >> 4 == PacketType::Publish as u8 {
            *first |= 0x08;
        }
    }
}

fn put_remaining_length(mut len: usize, dst: &mut BytesMut) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn put_string(s: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
    if s.len() > u16::MAX as usize {
        return Err(CodecError::TopicTooLong(s.len()));
    }
    dst.put_u16(s.len() as u16);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), CodecError> {
    put_string(PROTOCOL_NAME, body)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_string(&connect.client_id, body)?;
    if let Some(will) = &connect.will {
        put_string(&will.topic, body)?;
        if will.message.len() > u16::MAX as usize {
            return Err(CodecError::TopicTooLong(will.message.len()));
        }
        body.put_u16(will.message.len() as u16);
        body.extend_from_slice(&will.message);
    }
    if let Some(username) = &connect.username {
        put_string(username, body)?;
    }
    if let Some(password) = &connect.password {
        put_string(password, body)?;
    }
    Ok(())
}

fn encode_publish(publish: &Publish, body: &mut BytesMut) -> Result<(), CodecError> {
    put_string(&publish.topic, body)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => {}
        (_, Some(id)) => body.put_u16(id),
        (_, None) => {
            return Err(CodecError::MalformedPacket(
                "QoS > 0 PUBLISH requires a packet id".into(),
            ))
        }
    }
    body.extend_from_slice(&publish.payload);
    Ok(())
}

/// Cursor over a fully buffered packet body. Running out of bytes here means
/// the declared remaining length lied about the body, which is malformed.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        if self.remaining() < 1 {
            return Err(CodecError::MalformedPacket("truncated field".into()));
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        if self.remaining() < 2 {
            return Err(CodecError::MalformedPacket("truncated field".into()));
        }
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::MalformedPacket("truncated field".into()));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::MalformedPacket("string field is not UTF-8".into()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

fn require_flags(flags: u8, expected: u8, name: &str) -> Result<(), CodecError> {
    if flags != expected {
        return Err(CodecError::MalformedPacket(format!(
            "reserved flag bits {flags:#06b} on {name}"
        )));
    }
    Ok(())
}

fn decode_connect(body: &[u8]) -> Result<Packet, CodecError> {
    let mut r = Reader::new(body);
    let protocol = r.read_string()?;
    let level = r.read_u8()?;
    if protocol != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(CodecError::MalformedPacket(format!(
            "unsupported protocol {protocol}/{level}"
        )));
    }
    let flags = r.read_u8()?;
    let keep_alive = r.read_u16()?;
    let client_id = r.read_string()?;

    let will = if flags & 0x04 != 0 {
        let topic = r.read_string()?;
        let len = r.read_u16()? as usize;
        let message = Bytes::copy_from_slice(r.read_bytes(len)?);
        Some(Will {
            topic,
            message,
            qos: QoS::try_from((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(r.read_string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(r.read_string()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
        will,
    }))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, CodecError> {
    require_flags(flags, 0, "CONNACK")?;
    let mut r = Reader::new(body);
    let ack_flags = r.read_u8()?;
    let code = ConnackCode::try_from(r.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Publish, CodecError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let mut r = Reader::new(body);
    let topic = r.read_string()?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(r.read_u16()?)
    };
    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(r.rest()),
    })
}

fn decode_packet_id_only(
    flags: u8,
    expected_flags: u8,
    body: &[u8],
    name: &str,
) -> Result<u16, CodecError> {
    require_flags(flags, expected_flags, name)?;
    let mut r = Reader::new(body);
    let packet_id = r.read_u16()?;
    if r.remaining() != 0 {
        return Err(CodecError::MalformedPacket(format!(
            "{name} carries unexpected payload"
        )));
    }
    Ok(packet_id)
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, CodecError> {
    require_flags(flags, 0x02, "SUBSCRIBE")?;
    let mut r = Reader::new(body);
    let packet_id = r.read_u16()?;
    let mut topics = Vec::new();
    while r.remaining() > 0 {
        let topic = r.read_string()?;
        let qos = QoS::try_from(r.read_u8()? & 0x03)?;
        topics.push((topic, qos));
    }
    if topics.is_empty() {
        return Err(CodecError::MalformedPacket(
            "SUBSCRIBE without topic filters".into(),
        ));
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, CodecError> {
    require_flags(flags, 0, "SUBACK")?;
    let mut r = Reader::new(body);
    let packet_id = r.read_u16()?;
    let return_codes = r.rest().to_vec();
    if return_codes.is_empty() {
        return Err(CodecError::MalformedPacket(
            "SUBACK without return codes".into(),
        ));
    }
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, CodecError> {
    require_flags(flags, 0x02, "UNSUBSCRIBE")?;
    let mut r = Reader::new(body);
    let packet_id = r.read_u16()?;
    let mut topics = Vec::new();
    while r.remaining() > 0 {
        topics.push(r.read_string()?);
    }
    if topics.is_empty() {
        return Err(CodecError::MalformedPacket(
            "UNSUBSCRIBE without topic filters".into(),
        ));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

fn decode_empty(flags: u8, body: &[u8], packet: Packet, name: &str) -> Result<Packet, CodecError> {
    require_flags(flags, 0, name)?;
    if !body.is_empty() {
        return Err(CodecError::MalformedPacket(format!(
            "{name} carries unexpected payload"
        )));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = MAX_REMAINING_LENGTH + 5;

    fn roundtrip(packet: Packet) {
        let mut buf = BytesMut::new();
        encode(&packet, &mut buf).unwrap();
        match decode(&buf, MAX).unwrap() {
            Decoded::Packet {
                packet: decoded,
                consumed,
            } => {
                assert_eq!(decoded, packet);
                assert_eq!(consumed, buf.len());
            }
            Decoded::NeedMore => panic!("complete frame reported as incomplete"),
        }
    }

    #[test]
    fn test_roundtrip_connect_minimal() {
        roundtrip(Packet::Connect(Connect {
            client_id: "dev-1".into(),
            clean_session: true,
            keep_alive: 120,
            username: None,
            password: None,
            will: None,
        }));
    }

    #[test]
    fn test_roundtrip_connect_full() {
        roundtrip(Packet::Connect(Connect {
            client_id: "dev-2".into(),
            clean_session: false,
            keep_alive: 30,
            username: Some("user".into()),
            password: Some("pass".into()),
            will: Some(Will {
                topic: "status/dev-2".into(),
                message: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        }));
    }

    #[test]
    fn test_roundtrip_connack() {
        roundtrip(Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        }));
        roundtrip(Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::BadCredentials,
        }));
    }

    #[test]
    fn test_roundtrip_publish_all_qos() {
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: None,
            payload: Bytes::from_static(b"hello"),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: Some(7),
            payload: Bytes::from_static(b"hello"),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "a/b/c".into(),
            packet_id: Some(0xFFFF),
            payload: Bytes::new(),
        }));
    }

    #[test]
    fn test_roundtrip_acks_and_control() {
        roundtrip(Packet::Puback { packet_id: 1 });
        roundtrip(Packet::Pubrec { packet_id: 2 });
        roundtrip(Packet::Pubrel { packet_id: 3 });
        roundtrip(Packet::Pubcomp { packet_id: 4 });
        roundtrip(Packet::Unsuback { packet_id: 5 });
        roundtrip(Packet::Pingreq);
        roundtrip(Packet::Pingresp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_roundtrip_subscribe_suback_unsubscribe() {
        roundtrip(Packet::Subscribe(Subscribe {
            packet_id: 10,
            topics: vec![("a/+".into(), QoS::AtLeastOnce), ("b/#".into(), QoS::ExactlyOnce)],
        }));
        roundtrip(Packet::Suback(Suback {
            packet_id: 10,
            return_codes: vec![0x01, 0x80],
        }));
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 11,
            topics: vec!["a/+".into()],
        }));
    }

    #[test]
    fn test_remaining_length_boundaries() {
        // Payload sizes chosen so the remaining length lands on each encoding
        // boundary: 0, 127, 128, 16383, 16384.
        for body_len in [0usize, 127, 128, 16383, 16384] {
            let topic = "t";
            let overhead = 2 + topic.len(); // topic length prefix + topic
            if body_len < overhead {
                continue;
            }
            let payload = vec![0xAB; body_len - overhead];
            roundtrip(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: topic.into(),
                packet_id: None,
                payload: Bytes::from(payload),
            }));
        }
        // Zero remaining length round-trips via PINGREQ.
        let mut buf = BytesMut::new();
        encode(&Packet::Pingreq, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0xC0, 0x00]);
    }

    #[test]
    fn test_remaining_length_wire_encoding() {
        let mut buf = BytesMut::new();
        put_remaining_length(0, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
        buf.clear();
        put_remaining_length(127, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x7F]);
        buf.clear();
        put_remaining_length(128, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x80, 0x01]);
        buf.clear();
        put_remaining_length(16383, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0xFF, 0x7F]);
        buf.clear();
        put_remaining_length(16384, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x80, 0x80, 0x01]);
        buf.clear();
        put_remaining_length(MAX_REMAINING_LENGTH, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(put_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
    }

    #[test]
    fn test_unterminated_remaining_length_is_malformed() {
        let err = peek_header(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPacket(_)));
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let mut buf = BytesMut::new();
        encode(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "a/b".into(),
                packet_id: Some(3),
                payload: Bytes::from_static(b"hello world"),
            }),
            &mut buf,
        )
        .unwrap();
        for cut in 0..buf.len() {
            assert_eq!(decode(&buf[..cut], MAX).unwrap(), Decoded::NeedMore);
        }
    }

    #[test]
    fn test_qos3_publish_rejected() {
        // Flags 0b0110 would be QoS 3.
        let frame = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert!(matches!(
            decode(&frame, MAX),
            Err(CodecError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        // PUBREL must carry flags 0b0010.
        let frame = [0x60, 0x02, 0x00, 0x01];
        assert!(matches!(
            decode(&frame, MAX),
            Err(CodecError::MalformedPacket(_))
        ));
        // PINGRESP with nonzero flags.
        let frame = [0xD1, 0x00];
        assert!(matches!(
            decode(&frame, MAX),
            Err(CodecError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_packet_larger_than_buffer_rejected() {
        let mut buf = BytesMut::new();
        encode(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "t".into(),
                packet_id: None,
                payload: Bytes::from(vec![0u8; 2048]),
            }),
            &mut buf,
        )
        .unwrap();
        assert!(matches!(
            decode(&buf, 1024),
            Err(CodecError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_topic_too_long() {
        let topic = "x".repeat(u16::MAX as usize + 1);
        let mut buf = BytesMut::new();
        let err = encode(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic,
                packet_id: None,
                payload: Bytes::new(),
            }),
            &mut buf,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::TopicTooLong(_)));
    }

    #[test]
    fn test_set_dup_flag() {
        let mut frame = vec![0x32, 0x00];
        set_dup_flag(&mut frame);
        assert_eq!(frame[0], 0x3A);
        // Non-PUBLISH frames are untouched.
        let mut frame = vec![0x82, 0x00];
        set_dup_flag(&mut frame);
        assert_eq!(frame[0], 0x82);
    }

    #[test]
    fn test_connack_code_permanence() {
        assert!(ConnackCode::IdentifierRejected.is_permanent());
        assert!(ConnackCode::BadCredentials.is_permanent());
        assert!(ConnackCode::NotAuthorized.is_permanent());
        assert!(!ConnackCode::ServerUnavailable.is_permanent());
        assert!(!ConnackCode::UnacceptableProtocolVersion.is_permanent());
    }
}
