// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MQTT-SN v1.2 wire format parser/builder.
//
// Frame layout: [length u8][type u8][fields...], length covers the whole frame.
// All parsing is safe: malformed input returns Err, never panics.

use crate::error::CodecError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Message types
pub const ADVERTISE: u8 = 0x00;
pub const SEARCHGW: u8 = 0x01;
pub const GWINFO: u8 = 0x02;
pub const CONNECT: u8 = 0x04;
pub const CONNACK: u8 = 0x05;
pub const WILLTOPICREQ: u8 = 0x06;
pub const WILLTOPIC: u8 = 0x07;
pub const WILLMSGREQ: u8 = 0x08;
pub const WILLMSG: u8 = 0x09;
pub const REGISTER: u8 = 0x0A;
pub const REGACK: u8 = 0x0B;
pub const PUBLISH: u8 = 0x0C;
pub const PUBACK: u8 = 0x0D;
pub const PUBCOMP: u8 = 0x0E;
pub const PUBREC: u8 = 0x0F;
pub const PUBREL: u8 = 0x10;
pub const SUBSCRIBE: u8 = 0x12;
pub const SUBACK: u8 = 0x13;
pub const UNSUBSCRIBE: u8 = 0x14;
pub const UNSUBACK: u8 = 0x15;
pub const PINGREQ: u8 = 0x16;
pub const PINGRESP: u8 = 0x17;
pub const DISCONNECT: u8 = 0x18;
pub const WILLTOPICUPD: u8 = 0x1A;
pub const WILLTOPICRESP: u8 = 0x1B;
pub const WILLMSGUPD: u8 = 0x1C;
pub const WILLMSGRESP: u8 = 0x1D;

/// Forwarder encapsulation marker (second byte of an encapsulated datagram).
pub const ENCAPSULATED: u8 = 0xFE;

/// Protocol id carried in CONNECT.
pub const PROTOCOL_ID: u8 = 0x01;

/// Largest frame representable with the one-byte length field.
pub const MAX_FRAME_LEN: usize = 255;

// Flag bits
const FLAG_DUP: u8 = 0x80;
const FLAG_QOS_SHIFT: u8 = 5;
const FLAG_RETAIN: u8 = 0x10;
const FLAG_WILL: u8 = 0x08;
const FLAG_CLEAN_SESSION: u8 = 0x04;
const FLAG_TOPIC_ID_TYPE: u8 = 0x03;

// ---------------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    /// QoS -1: publish without connecting, predefined or short topics only.
    MinusOne,
}

impl QoS {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => Self::MinusOne,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
            Self::MinusOne => 3,
        }
    }

    /// Map a broker QoS level (0..=2).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    /// Broker QoS level, `None` for QoS -1.
    pub fn level(self) -> Option<u8> {
        match self {
            Self::MinusOne => None,
            other => Some(other.bits()),
        }
    }
}

// ---------------------------------------------------------------------------
// Topic id type
// ---------------------------------------------------------------------------

/// Two-bit topic discriminator carried in the flags byte.
///
/// In SUBSCRIBE/UNSUBSCRIBE the value 0 means the frame carries a full
/// topic name; everywhere else it means a normal (registered) topic id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TopicIdType {
    #[default]
    Normal = 0,
    Predefined = 1,
    Short = 2,
}

impl TopicIdType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Predefined),
            2 => Ok(Self::Short),
            other => Err(CodecError::ReservedTopicIdType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl Flags {
    pub fn parse(b: u8) -> Result<Self, CodecError> {
        Ok(Self {
            dup: b & FLAG_DUP != 0,
            qos: QoS::from_bits(b >> FLAG_QOS_SHIFT),
            retain: b & FLAG_RETAIN != 0,
            will: b & FLAG_WILL != 0,
            clean_session: b & FLAG_CLEAN_SESSION != 0,
            topic_id_type: TopicIdType::from_u8(b & FLAG_TOPIC_ID_TYPE)?,
        })
    }

    /// Parse flags whose topic id bits are unused (CONNECT, WILLTOPIC).
    /// A reserved topic id type reads as `Normal`.
    pub fn parse_lenient(b: u8) -> Self {
        let topic_id_type =
            TopicIdType::from_u8(b & FLAG_TOPIC_ID_TYPE).unwrap_or(TopicIdType::Normal);
        Self {
            dup: b & FLAG_DUP != 0,
            qos: QoS::from_bits(b >> FLAG_QOS_SHIFT),
            retain: b & FLAG_RETAIN != 0,
            will: b & FLAG_WILL != 0,
            clean_session: b & FLAG_CLEAN_SESSION != 0,
            topic_id_type,
        }
    }

    pub fn as_u8(&self) -> u8 {
        let mut b = self.qos.bits() << FLAG_QOS_SHIFT;
        if self.dup {
            b |= FLAG_DUP;
        }
        if self.retain {
            b |= FLAG_RETAIN;
        }
        if self.will {
            b |= FLAG_WILL;
        }
        if self.clean_session {
            b |= FLAG_CLEAN_SESSION;
        }
        b | self.topic_id_type.as_u8()
    }

    /// Flags for a data frame (PUBLISH, SUBACK).
    pub fn data(dup: bool, qos: QoS, retain: bool, topic_id_type: TopicIdType) -> Self {
        Self {
            dup,
            qos,
            retain,
            topic_id_type,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Return code
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0x00,
    Congestion = 0x01,
    InvalidTopicId = 0x02,
    NotSupported = 0x03,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0x00 => Ok(Self::Accepted),
            0x01 => Ok(Self::Congestion),
            0x02 => Ok(Self::InvalidTopicId),
            0x03 => Ok(Self::NotSupported),
            other => Err(CodecError::UnknownReturnCode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Topic reference (SUBSCRIBE / UNSUBSCRIBE)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRef {
    Name(String),
    Predefined(u16),
    Short([u8; 2]),
}

impl TopicRef {
    pub fn id_type(&self) -> TopicIdType {
        match self {
            Self::Name(_) => TopicIdType::Normal,
            Self::Predefined(_) => TopicIdType::Predefined,
            Self::Short(_) => TopicIdType::Short,
        }
    }
}

/// Pack a two-character topic name into a topic id field.
pub fn short_topic_id(name: &str) -> Option<u16> {
    match name.as_bytes() {
        [a, b] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

/// Unpack a short topic name from a topic id field.
pub fn short_topic_name(id: u16) -> String {
    short_topic_str(&id.to_be_bytes())
}

/// Decode the two bytes of a short topic name, replacing invalid UTF-8.
pub fn short_topic_str(bytes: &[u8; 2]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(name) => name.to_string(),
        Err(_) => {
            log::debug!(
                "[SN] short topic {:02x}{:02x} is not UTF-8, using lossy name",
                bytes[0],
                bytes[1]
            );
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnMessage {
    Advertise { gw_id: u8, duration: u16 },
    SearchGw { radius: u8 },
    GwInfo { gw_id: u8, gw_addr: Vec<u8> },
    Connect { flags: Flags, protocol_id: u8, duration: u16, client_id: String },
    Connack { return_code: ReturnCode },
    WillTopicReq,
    /// `flags: None` is the two-byte "delete will" form.
    WillTopic { flags: Option<Flags>, topic: String },
    WillMsgReq,
    WillMsg { message: Vec<u8> },
    Register { topic_id: u16, msg_id: u16, topic_name: String },
    Regack { topic_id: u16, msg_id: u16, return_code: ReturnCode },
    Publish { flags: Flags, topic_id: u16, msg_id: u16, data: Vec<u8> },
    Puback { topic_id: u16, msg_id: u16, return_code: ReturnCode },
    Pubcomp { msg_id: u16 },
    Pubrec { msg_id: u16 },
    Pubrel { msg_id: u16 },
    Subscribe { flags: Flags, msg_id: u16, topic: TopicRef },
    Suback { flags: Flags, topic_id: u16, msg_id: u16, return_code: ReturnCode },
    Unsubscribe { flags: Flags, msg_id: u16, topic: TopicRef },
    Unsuback { msg_id: u16 },
    Pingreq { client_id: Option<String> },
    Pingresp,
    Disconnect { duration: Option<u16> },
    WillTopicUpd { flags: Option<Flags>, topic: String },
    WillTopicResp { return_code: ReturnCode },
    WillMsgUpd { message: Vec<u8> },
    WillMsgResp { return_code: ReturnCode },
}

impl SnMessage {
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Advertise { .. } => ADVERTISE,
            Self::SearchGw { .. } => SEARCHGW,
            Self::GwInfo { .. } => GWINFO,
            Self::Connect { .. } => CONNECT,
            Self::Connack { .. } => CONNACK,
            Self::WillTopicReq => WILLTOPICREQ,
            Self::WillTopic { .. } => WILLTOPIC,
            Self::WillMsgReq => WILLMSGREQ,
            Self::WillMsg { .. } => WILLMSG,
            Self::Register { .. } => REGISTER,
            Self::Regack { .. } => REGACK,
            Self::Publish { .. } => PUBLISH,
            Self::Puback { .. } => PUBACK,
            Self::Pubcomp { .. } => PUBCOMP,
            Self::Pubrec { .. } => PUBREC,
            Self::Pubrel { .. } => PUBREL,
            Self::Subscribe { .. } => SUBSCRIBE,
            Self::Suback { .. } => SUBACK,
            Self::Unsubscribe { .. } => UNSUBSCRIBE,
            Self::Unsuback { .. } => UNSUBACK,
            Self::Pingreq { .. } => PINGREQ,
            Self::Pingresp => PINGRESP,
            Self::Disconnect { .. } => DISCONNECT,
            Self::WillTopicUpd { .. } => WILLTOPICUPD,
            Self::WillTopicResp { .. } => WILLTOPICRESP,
            Self::WillMsgUpd { .. } => WILLMSGUPD,
            Self::WillMsgResp { .. } => WILLMSGRESP,
        }
    }

    /// Human readable type name for logging.
    pub fn name(&self) -> &'static str {
        type_name(self.msg_type())
    }
}

fn type_name(msg_type: u8) -> &'static str {
    match msg_type {
        ADVERTISE => "ADVERTISE",
        SEARCHGW => "SEARCHGW",
        GWINFO => "GWINFO",
        CONNECT => "CONNECT",
        CONNACK => "CONNACK",
        WILLTOPICREQ => "WILLTOPICREQ",
        WILLTOPIC => "WILLTOPIC",
        WILLMSGREQ => "WILLMSGREQ",
        WILLMSG => "WILLMSG",
        REGISTER => "REGISTER",
        REGACK => "REGACK",
        PUBLISH => "PUBLISH",
        PUBACK => "PUBACK",
        PUBCOMP => "PUBCOMP",
        PUBREC => "PUBREC",
        PUBREL => "PUBREL",
        SUBSCRIBE => "SUBSCRIBE",
        SUBACK => "SUBACK",
        UNSUBSCRIBE => "UNSUBSCRIBE",
        UNSUBACK => "UNSUBACK",
        PINGREQ => "PINGREQ",
        PINGRESP => "PINGRESP",
        DISCONNECT => "DISCONNECT",
        WILLTOPICUPD => "WILLTOPICUPD",
        WILLTOPICRESP => "WILLTOPICRESP",
        WILLMSGUPD => "WILLMSGUPD",
        WILLMSGRESP => "WILLMSGRESP",
        _ => "UNKNOWN",
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers (big-endian)
// ---------------------------------------------------------------------------

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn utf8(bytes: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn min_len(kind: &'static str, frame: &[u8], min: usize) -> Result<(), CodecError> {
    if frame.len() < min {
        return Err(CodecError::TooShort {
            kind,
            len: frame.len(),
        });
    }
    Ok(())
}

fn exact_len(kind: &'static str, frame: &[u8], len: usize) -> Result<(), CodecError> {
    if frame.len() != len {
        return Err(CodecError::BadLength {
            kind,
            len: frame.len(),
        });
    }
    Ok(())
}

fn parse_topic_ref(flags: &Flags, bytes: &[u8]) -> Result<TopicRef, CodecError> {
    match flags.topic_id_type {
        TopicIdType::Normal => Ok(TopicRef::Name(utf8(bytes)?)),
        TopicIdType::Predefined => {
            exact_len("topic id", bytes, 2)?;
            Ok(TopicRef::Predefined(read_u16(bytes, 0)))
        }
        TopicIdType::Short => {
            exact_len("short topic", bytes, 2)?;
            Ok(TopicRef::Short([bytes[0], bytes[1]]))
        }
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one complete MQTT-SN frame.
pub fn decode(frame: &[u8]) -> Result<SnMessage, CodecError> {
    min_len("frame", frame, 2)?;
    let declared = frame[0] as usize;
    if declared != frame.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }
    let msg_type = frame[1];
    let kind = type_name(msg_type);

    let msg = match msg_type {
        ADVERTISE => {
            exact_len(kind, frame, 5)?;
            SnMessage::Advertise {
                gw_id: frame[2],
                duration: read_u16(frame, 3),
            }
        }
        SEARCHGW => {
            exact_len(kind, frame, 3)?;
            SnMessage::SearchGw { radius: frame[2] }
        }
        GWINFO => {
            min_len(kind, frame, 3)?;
            SnMessage::GwInfo {
                gw_id: frame[2],
                gw_addr: frame[3..].to_vec(),
            }
        }
        CONNECT => {
            min_len(kind, frame, 7)?;
            SnMessage::Connect {
                flags: Flags::parse_lenient(frame[2]),
                protocol_id: frame[3],
                duration: read_u16(frame, 4),
                client_id: utf8(&frame[6..])?,
            }
        }
        CONNACK => {
            exact_len(kind, frame, 3)?;
            SnMessage::Connack {
                return_code: ReturnCode::from_u8(frame[2])?,
            }
        }
        WILLTOPICREQ => {
            exact_len(kind, frame, 2)?;
            SnMessage::WillTopicReq
        }
        WILLTOPIC | WILLTOPICUPD => {
            let (flags, topic) = if frame.len() == 2 {
                (None, String::new())
            } else {
                (Some(Flags::parse_lenient(frame[2])), utf8(&frame[3..])?)
            };
            if msg_type == WILLTOPIC {
                SnMessage::WillTopic { flags, topic }
            } else {
                SnMessage::WillTopicUpd { flags, topic }
            }
        }
        WILLMSGREQ => {
            exact_len(kind, frame, 2)?;
            SnMessage::WillMsgReq
        }
        WILLMSG => SnMessage::WillMsg {
            message: frame[2..].to_vec(),
        },
        WILLMSGUPD => SnMessage::WillMsgUpd {
            message: frame[2..].to_vec(),
        },
        REGISTER => {
            min_len(kind, frame, 7)?;
            SnMessage::Register {
                topic_id: read_u16(frame, 2),
                msg_id: read_u16(frame, 4),
                topic_name: utf8(&frame[6..])?,
            }
        }
        REGACK | PUBACK => {
            exact_len(kind, frame, 7)?;
            let topic_id = read_u16(frame, 2);
            let msg_id = read_u16(frame, 4);
            let return_code = ReturnCode::from_u8(frame[6])?;
            if msg_type == REGACK {
                SnMessage::Regack {
                    topic_id,
                    msg_id,
                    return_code,
                }
            } else {
                SnMessage::Puback {
                    topic_id,
                    msg_id,
                    return_code,
                }
            }
        }
        PUBLISH => {
            min_len(kind, frame, 7)?;
            SnMessage::Publish {
                flags: Flags::parse(frame[2])?,
                topic_id: read_u16(frame, 3),
                msg_id: read_u16(frame, 5),
                data: frame[7..].to_vec(),
            }
        }
        PUBCOMP | PUBREC | PUBREL | UNSUBACK => {
            exact_len(kind, frame, 4)?;
            let msg_id = read_u16(frame, 2);
            match msg_type {
                PUBCOMP => SnMessage::Pubcomp { msg_id },
                PUBREC => SnMessage::Pubrec { msg_id },
                PUBREL => SnMessage::Pubrel { msg_id },
                _ => SnMessage::Unsuback { msg_id },
            }
        }
        SUBSCRIBE | UNSUBSCRIBE => {
            min_len(kind, frame, 6)?;
            let flags = Flags::parse(frame[2])?;
            let msg_id = read_u16(frame, 3);
            let topic = parse_topic_ref(&flags, &frame[5..])?;
            if msg_type == SUBSCRIBE {
                SnMessage::Subscribe {
                    flags,
                    msg_id,
                    topic,
                }
            } else {
                SnMessage::Unsubscribe {
                    flags,
                    msg_id,
                    topic,
                }
            }
        }
        SUBACK => {
            exact_len(kind, frame, 8)?;
            SnMessage::Suback {
                flags: Flags::parse(frame[2])?,
                topic_id: read_u16(frame, 3),
                msg_id: read_u16(frame, 5),
                return_code: ReturnCode::from_u8(frame[7])?,
            }
        }
        PINGREQ => SnMessage::Pingreq {
            client_id: if frame.len() > 2 {
                Some(utf8(&frame[2..])?)
            } else {
                None
            },
        },
        PINGRESP => {
            exact_len(kind, frame, 2)?;
            SnMessage::Pingresp
        }
        DISCONNECT => match frame.len() {
            2 => SnMessage::Disconnect { duration: None },
            4 => SnMessage::Disconnect {
                duration: Some(read_u16(frame, 2)),
            },
            len => return Err(CodecError::BadLength { kind, len }),
        },
        WILLTOPICRESP | WILLMSGRESP => {
            exact_len(kind, frame, 3)?;
            let return_code = ReturnCode::from_u8(frame[2])?;
            if msg_type == WILLTOPICRESP {
                SnMessage::WillTopicResp { return_code }
            } else {
                SnMessage::WillMsgResp { return_code }
            }
        }
        other => return Err(CodecError::UnknownType(other)),
    };
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a message into one MQTT-SN frame (length byte included).
pub fn encode(msg: &SnMessage) -> Result<Vec<u8>, CodecError> {
    let mut body: Vec<u8> = Vec::with_capacity(16);
    match msg {
        SnMessage::Advertise { gw_id, duration } => {
            body.push(*gw_id);
            body.extend_from_slice(&duration.to_be_bytes());
        }
        SnMessage::SearchGw { radius } => body.push(*radius),
        SnMessage::GwInfo { gw_id, gw_addr } => {
            body.push(*gw_id);
            body.extend_from_slice(gw_addr);
        }
        SnMessage::Connect {
            flags,
            protocol_id,
            duration,
            client_id,
        } => {
            body.push(flags.as_u8());
            body.push(*protocol_id);
            body.extend_from_slice(&duration.to_be_bytes());
            body.extend_from_slice(client_id.as_bytes());
        }
        SnMessage::Connack { return_code }
        | SnMessage::WillTopicResp { return_code }
        | SnMessage::WillMsgResp { return_code } => body.push(return_code.as_u8()),
        SnMessage::WillTopicReq | SnMessage::WillMsgReq | SnMessage::Pingresp => {}
        SnMessage::WillTopic { flags, topic } | SnMessage::WillTopicUpd { flags, topic } => {
            if let Some(flags) = flags {
                body.push(flags.as_u8());
                body.extend_from_slice(topic.as_bytes());
            }
        }
        SnMessage::WillMsg { message } | SnMessage::WillMsgUpd { message } => {
            body.extend_from_slice(message);
        }
        SnMessage::Register {
            topic_id,
            msg_id,
            topic_name,
        } => {
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.extend_from_slice(topic_name.as_bytes());
        }
        SnMessage::Regack {
            topic_id,
            msg_id,
            return_code,
        }
        | SnMessage::Puback {
            topic_id,
            msg_id,
            return_code,
        } => {
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.push(return_code.as_u8());
        }
        SnMessage::Publish {
            flags,
            topic_id,
            msg_id,
            data,
        } => {
            body.push(flags.as_u8());
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.extend_from_slice(data);
        }
        SnMessage::Pubcomp { msg_id }
        | SnMessage::Pubrec { msg_id }
        | SnMessage::Pubrel { msg_id }
        | SnMessage::Unsuback { msg_id } => body.extend_from_slice(&msg_id.to_be_bytes()),
        SnMessage::Subscribe {
            flags,
            msg_id,
            topic,
        }
        | SnMessage::Unsubscribe {
            flags,
            msg_id,
            topic,
        } => {
            let flags = Flags {
                topic_id_type: topic.id_type(),
                ..*flags
            };
            body.push(flags.as_u8());
            body.extend_from_slice(&msg_id.to_be_bytes());
            match topic {
                TopicRef::Name(name) => body.extend_from_slice(name.as_bytes()),
                TopicRef::Predefined(id) => body.extend_from_slice(&id.to_be_bytes()),
                TopicRef::Short(bytes) => body.extend_from_slice(bytes),
            }
        }
        SnMessage::Suback {
            flags,
            topic_id,
            msg_id,
            return_code,
        } => {
            body.push(flags.as_u8());
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.push(return_code.as_u8());
        }
        SnMessage::Pingreq { client_id } => {
            if let Some(id) = client_id {
                body.extend_from_slice(id.as_bytes());
            }
        }
        SnMessage::Disconnect { duration } => {
            if let Some(d) = duration {
                body.extend_from_slice(&d.to_be_bytes());
            }
        }
    }

    let total = body.len() + 2;
    if total > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLong(total));
    }
    let mut out = Vec::with_capacity(total);
    out.push(total as u8);
    out.push(msg.msg_type());
    out.extend_from_slice(&body);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
