use crate::net::TransportError;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
/// Largest value the 4-byte remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(anyhow!("unsupported QoS {other}")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1 section 3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadCredentials = 0x04,
    NotAuthorized = 0x05,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Accepted),
            0x01 => Ok(Self::UnacceptableProtocolVersion),
            0x02 => Ok(Self::IdentifierRejected),
            0x03 => Ok(Self::ServerUnavailable),
            0x04 => Ok(Self::BadCredentials),
            0x05 => Ok(Self::NotAuthorized),
            other => Err(anyhow!("unknown CONNACK return code {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub dup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, Qos)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckReturn {
    Granted(Qos),
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub returns: Vec<SubAckReturn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Control packet name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// Read one control packet from the stream.
///
/// A clean end of stream before the first header byte is reported as
/// [`TransportError::Closed`]; an end of stream inside a frame is an i/o failure.
pub async fn read_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_packet_size: usize,
) -> std::result::Result<Packet, TransportError> {
    let mut first = [0u8; 1];
    if stream.read(&mut first).await? == 0 {
        return Err(TransportError::Closed);
    }
    let remaining_len = decode_remaining_length_stream(stream).await?;
    if remaining_len > max_packet_size {
        return Err(TransportError::Malformed(format!(
            "packet of {remaining_len} bytes exceeds limit {max_packet_size}"
        )));
    }
    let mut body = vec![0u8; remaining_len];
    stream.read_exact(&mut body).await?;
    decode(first[0], &body).map_err(TransportError::malformed)
}

/// Encode and write one control packet.
pub async fn write_packet<S: AsyncWrite + Unpin>(
    stream: &mut S,
    packet: &Packet,
) -> std::result::Result<(), TransportError> {
    let frame = encode(packet).map_err(TransportError::malformed)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Encode a packet into a complete frame (fixed header included).
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let (header, body) = match packet {
        Packet::Connect(connect) => (0x10, encode_connect(connect)?),
        Packet::ConnAck(ack) => (0x20, vec![u8::from(ack.session_present), ack.code as u8]),
        Packet::Publish(publish) => encode_publish(publish)?,
        Packet::PubAck(id) => (0x40, id.to_be_bytes().to_vec()),
        Packet::PubRec(id) => (0x50, id.to_be_bytes().to_vec()),
        Packet::PubRel(id) => (0x62, id.to_be_bytes().to_vec()),
        Packet::PubComp(id) => (0x70, id.to_be_bytes().to_vec()),
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                bail!("SUBSCRIBE requires at least one filter");
            }
            let mut body = subscribe.packet_id.to_be_bytes().to_vec();
            for (filter, qos) in &subscribe.filters {
                write_string(&mut body, filter)?;
                body.push(u8::from(*qos));
            }
            (0x82, body)
        }
        Packet::SubAck(ack) => {
            let mut body = ack.packet_id.to_be_bytes().to_vec();
            for ret in &ack.returns {
                body.push(match ret {
                    SubAckReturn::Granted(qos) => u8::from(*qos),
                    SubAckReturn::Failure => 0x80,
                });
            }
            (0x90, body)
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                bail!("UNSUBSCRIBE requires at least one filter");
            }
            let mut body = unsubscribe.packet_id.to_be_bytes().to_vec();
            for filter in &unsubscribe.filters {
                write_string(&mut body, filter)?;
            }
            (0xA2, body)
        }
        Packet::UnsubAck(id) => (0xB0, id.to_be_bytes().to_vec()),
        Packet::PingReq => (0xC0, Vec::new()),
        Packet::PingResp => (0xD0, Vec::new()),
        Packet::Disconnect => (0xE0, Vec::new()),
    };
    if body.len() > MAX_REMAINING_LENGTH {
        bail!("{} body of {} bytes is too large", packet.name(), body.len());
    }
    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(header);
    frame.extend(encode_remaining_length(body.len()));
    frame.extend(body);
    Ok(frame)
}

/// Decode a packet from its first header byte and body.
pub fn decode(first: u8, buf: &[u8]) -> Result<Packet> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;
    let expected_flags = match packet_type {
        3 => flags,
        6 | 8 | 10 => 0b0010,
        _ => 0,
    };
    if flags != expected_flags {
        bail!("invalid flags {flags:#06b} for packet type {packet_type}");
    }
    let packet = match packet_type {
        1 => Packet::Connect(parse_connect(buf)?),
        2 => Packet::ConnAck(parse_connack(buf)?),
        3 => Packet::Publish(parse_publish(flags, buf)?),
        4 => Packet::PubAck(parse_packet_id(buf)?),
        5 => Packet::PubRec(parse_packet_id(buf)?),
        6 => Packet::PubRel(parse_packet_id(buf)?),
        7 => Packet::PubComp(parse_packet_id(buf)?),
        8 => Packet::Subscribe(parse_subscribe(buf)?),
        9 => Packet::SubAck(parse_suback(buf)?),
        10 => Packet::Unsubscribe(parse_unsubscribe(buf)?),
        11 => Packet::UnsubAck(parse_packet_id(buf)?),
        12 => expect_empty(buf, Packet::PingReq)?,
        13 => expect_empty(buf, Packet::PingResp)?,
        14 => expect_empty(buf, Packet::Disconnect)?,
        other => bail!("unsupported packet type {other}"),
    };
    Ok(packet)
}

fn encode_connect(connect: &ConnectPacket) -> Result<Vec<u8>> {
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | (u8::from(will.qos) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        if connect.username.is_none() {
            bail!("password requires a username");
        }
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }

    let mut body = Vec::new();
    write_string(&mut body, PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL);
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&mut body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        write_string(&mut body, &will.topic)?;
        write_binary(&mut body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        write_string(&mut body, username)?;
    }
    if let Some(password) = &connect.password {
        write_binary(&mut body, password)?;
    }
    Ok(body)
}

fn encode_publish(publish: &PublishPacket) -> Result<(u8, Vec<u8>)> {
    let mut header = 0b0011_0000 | (u8::from(publish.qos) << 1);
    if publish.retain {
        header |= 0x01;
    }
    if publish.dup {
        if publish.qos == Qos::AtMostOnce {
            bail!("dup flag set for qos0 publish");
        }
        header |= 0x08;
    }
    let mut body = Vec::with_capacity(publish.topic.len() + publish.payload.len() + 4);
    write_string(&mut body, &publish.topic)?;
    if publish.qos != Qos::AtMostOnce {
        let id = publish
            .packet_id
            .filter(|id| *id != 0)
            .ok_or_else(|| anyhow!("packet id required for qos {}", u8::from(publish.qos)))?;
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(&publish.payload);
    Ok((header, body))
}

fn parse_connect(buf: &[u8]) -> Result<ConnectPacket> {
    let mut cursor = 0usize;
    let proto_name = read_string(buf, &mut cursor)?;
    let proto_level = read_u8(buf, &mut cursor)?;
    if proto_name != PROTOCOL_NAME || proto_level != PROTOCOL_LEVEL {
        bail!("unsupported protocol {proto_name} level {proto_level}");
    }
    let flags = read_u8(buf, &mut cursor)?;
    if flags & 0x01 != 0 {
        bail!("reserved CONNECT flag set");
    }
    let keep_alive = read_u16(buf, &mut cursor)?;
    let client_id = read_string(buf, &mut cursor)?;
    let will = if flags & 0x04 != 0 {
        let qos = Qos::try_from((flags >> 3) & 0x03)?;
        let topic = read_string(buf, &mut cursor)?;
        let payload = read_binary(buf, &mut cursor)?;
        Some(Will {
            topic,
            payload,
            qos,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(buf, &mut cursor)?)
    } else {
        None
    };
    expect_consumed(buf, cursor, "CONNECT")?;
    Ok(ConnectPacket {
        client_id,
        keep_alive,
        clean_session: flags & 0x02 != 0,
        will,
        username,
        password,
    })
}

fn parse_connack(buf: &[u8]) -> Result<ConnAckPacket> {
    if buf.len() != 2 {
        bail!("CONNACK length {} != 2", buf.len());
    }
    if buf[0] & 0xFE != 0 {
        bail!("reserved CONNACK flags set");
    }
    Ok(ConnAckPacket {
        session_present: buf[0] & 0x01 != 0,
        code: ConnectReturnCode::try_from(buf[1])?,
    })
}

fn parse_publish(flags: u8, buf: &[u8]) -> Result<PublishPacket> {
    let dup = flags & 0b0000_1000 != 0;
    let retain = flags & 0b0000_0001 != 0;
    let qos = Qos::try_from((flags & 0b0000_0110) >> 1)?;
    if qos == Qos::AtMostOnce && dup {
        bail!("dup flag set for qos0 publish");
    }
    let mut cursor = 0usize;
    let topic = read_string(buf, &mut cursor)?;
    let packet_id = match qos {
        Qos::AtMostOnce => None,
        _ => {
            let id = read_u16(buf, &mut cursor)?;
            if id == 0 {
                bail!("publish packet id must be non-zero");
            }
            Some(id)
        }
    };
    Ok(PublishPacket {
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(&buf[cursor..]),
        qos,
        retain,
        dup,
    })
}

fn parse_subscribe(buf: &[u8]) -> Result<SubscribePacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        let filter = read_string(buf, &mut cursor)?;
        let options = read_u8(buf, &mut cursor)?;
        if options & 0xFC != 0 {
            bail!("reserved subscription option bits set");
        }
        filters.push((filter, Qos::try_from(options)?));
    }
    if filters.is_empty() {
        bail!("SUBSCRIBE without filters");
    }
    Ok(SubscribePacket { packet_id, filters })
}

fn parse_suback(buf: &[u8]) -> Result<SubAckPacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let returns = buf[cursor..]
        .iter()
        .map(|code| match code {
            0x80 => Ok(SubAckReturn::Failure),
            other => Qos::try_from(*other).map(SubAckReturn::Granted),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(SubAckPacket { packet_id, returns })
}

fn parse_unsubscribe(buf: &[u8]) -> Result<UnsubscribePacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        filters.push(read_string(buf, &mut cursor)?);
    }
    if filters.is_empty() {
        bail!("UNSUBSCRIBE without filters");
    }
    Ok(UnsubscribePacket { packet_id, filters })
}

fn parse_packet_id(buf: &[u8]) -> Result<u16> {
    if buf.len() != 2 {
        bail!("expected 2-byte packet id, got {} bytes", buf.len());
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

fn expect_empty(buf: &[u8], packet: Packet) -> Result<Packet> {
    if !buf.is_empty() {
        bail!("{} must not carry a body", packet.name());
    }
    Ok(packet)
}

fn expect_consumed(buf: &[u8], cursor: usize, what: &str) -> Result<()> {
    if cursor != buf.len() {
        bail!("{} trailing bytes after {what}", buf.len() - cursor);
    }
    Ok(())
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8> {
    let byte = *buf
        .get(*cursor)
        .ok_or_else(|| anyhow!("unexpected end of packet"))?;
    *cursor += 1;
    Ok(byte)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = cursor.checked_add(2).context("cursor overflow")?;
    let bytes = buf
        .get(*cursor..end)
        .ok_or_else(|| anyhow!("unexpected end of packet"))?;
    *cursor = end;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Bytes> {
    let len = read_u16(buf, cursor)? as usize;
    let end = cursor.checked_add(len).context("cursor overflow")?;
    let bytes = buf
        .get(*cursor..end)
        .ok_or_else(|| anyhow!("length-prefixed field runs past end of packet"))?;
    *cursor = end;
    Ok(Bytes::copy_from_slice(bytes))
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let bytes = read_binary(buf, cursor)?;
    String::from_utf8(bytes.to_vec()).context("invalid utf-8 string")
}

fn write_binary(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| anyhow!("field of {} bytes exceeds 65535", bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    write_binary(out, value.as_bytes())
}

fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

async fn decode_remaining_length_stream<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::result::Result<usize, TransportError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let byte = stream.read_u8().await?;
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(TransportError::Malformed(
        "remaining length exceeds 4 bytes".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_uses_continuation_bits() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16_383), vec![0xFF, 0x7F]);
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH),
            vec![0xFF, 0xFF, 0xFF, 0x7F]
        );
    }

    #[test]
    fn connect_flags_cover_will_and_clean_session() {
        let frame = encode(&Packet::Connect(ConnectPacket {
            client_id: "c".into(),
            keep_alive: 60,
            clean_session: true,
            will: Some(Will {
                topic: "w".into(),
                payload: Bytes::from_static(b"gone"),
                qos: Qos::AtLeastOnce,
                retain: true,
            }),
            username: None,
            password: None,
        }))
        .unwrap();
        // fixed header, len, "MQTT", level, flags
        assert_eq!(frame[0], 0x10);
        assert_eq!(&frame[2..8], &[0, 4, b'M', b'Q', b'T', b'T']);
        assert_eq!(frame[8], PROTOCOL_LEVEL);
        assert_eq!(frame[9], 0x02 | 0x04 | 0x08 | 0x20);
        assert_eq!(&frame[10..12], &60u16.to_be_bytes());
    }

    #[test]
    fn password_without_username_is_refused() {
        let err = encode(&Packet::Connect(ConnectPacket {
            client_id: "c".into(),
            keep_alive: 0,
            clean_session: true,
            will: None,
            username: None,
            password: Some(Bytes::from_static(b"pw")),
        }))
        .unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn qos1_publish_requires_packet_id() {
        let err = encode(&Packet::Publish(PublishPacket {
            topic: "a".into(),
            packet_id: None,
            payload: Bytes::new(),
            qos: Qos::AtLeastOnce,
            retain: false,
            dup: false,
        }))
        .unwrap_err();
        assert!(err.to_string().contains("packet id"));
    }

    #[test]
    fn decode_rejects_bad_fixed_header_flags() {
        // SUBSCRIBE must carry 0b0010
        assert!(decode(0x80, &[0, 1, 0, 1, b'a', 0]).is_err());
        assert!(decode(0xC1, &[]).is_err());
    }

    #[test]
    fn suback_failure_code_is_preserved() {
        let packet = decode(0x90, &[0x00, 0x07, 0x01, 0x80]).unwrap();
        assert_eq!(
            packet,
            Packet::SubAck(SubAckPacket {
                packet_id: 7,
                returns: vec![SubAckReturn::Granted(Qos::AtLeastOnce), SubAckReturn::Failure],
            })
        );
    }

    #[test]
    fn connack_maps_return_codes() {
        let packet = decode(0x20, &[0x01, 0x05]).unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck(ConnAckPacket {
                session_present: true,
                code: ConnectReturnCode::NotAuthorized,
            })
        );
        assert!(decode(0x20, &[0x00, 0x09]).is_err());
    }

    #[test]
    fn qos_serde_uses_numeric_levels() {
        let qos: Qos = serde_json::from_str("1").unwrap();
        assert_eq!(qos, Qos::AtLeastOnce);
        assert_eq!(serde_json::to_string(&Qos::ExactlyOnce).unwrap(), "2");
        assert!(serde_json::from_str::<Qos>("3").is_err());
    }
}
