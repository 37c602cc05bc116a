// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MQTT 3.1 wire format parser/builder (broker side of the gateway).
//
// Fixed header: [type << 4 | dup << 3 | qos << 1 | retain][remaining length 1..=4 bytes]
// Strings are u16 big-endian length prefixed UTF-8.

use std::io::{self, Read};

use crate::error::CodecError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const PROTOCOL_NAME: &str = "MQIsdp";
pub const PROTOCOL_VERSION: u8 = 3;

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PUBREC: u8 = 5;
pub const PUBREL: u8 = 6;
pub const PUBCOMP: u8 = 7;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const UNSUBSCRIBE: u8 = 10;
pub const UNSUBACK: u8 = 11;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

/// CONNACK return code for an accepted connection.
pub const CONNACK_ACCEPTED: u8 = 0;

/// Largest value the remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT_USERNAME: u8 = 0x80;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_WILL_QOS_SHIFT: u8 = 3;
const CONNECT_WILL: u8 = 0x04;
const CONNECT_CLEAN_SESSION: u8 = 0x02;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Connect {
    /// CONNECT with the default 3.1 protocol name and version.
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.into(),
            clean_session: true,
            keep_alive,
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    /// Present only when qos > 0.
    pub msg_id: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttMessage {
    Connect(Connect),
    Connack { return_code: u8 },
    Publish(Publish),
    Puback { msg_id: u16 },
    Pubrec { msg_id: u16 },
    Pubrel { msg_id: u16 },
    Pubcomp { msg_id: u16 },
    Subscribe { dup: bool, msg_id: u16, topics: Vec<(String, u8)> },
    Suback { msg_id: u16, granted_qos: Vec<u8> },
    Unsubscribe { dup: bool, msg_id: u16, topics: Vec<String> },
    Unsuback { msg_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl MqttMessage {
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Connect(_) => CONNECT,
            Self::Connack { .. } => CONNACK,
            Self::Publish(_) => PUBLISH,
            Self::Puback { .. } => PUBACK,
            Self::Pubrec { .. } => PUBREC,
            Self::Pubrel { .. } => PUBREL,
            Self::Pubcomp { .. } => PUBCOMP,
            Self::Subscribe { .. } => SUBSCRIBE,
            Self::Suback { .. } => SUBACK,
            Self::Unsubscribe { .. } => UNSUBSCRIBE,
            Self::Unsuback { .. } => UNSUBACK,
            Self::Pingreq => PINGREQ,
            Self::Pingresp => PINGRESP,
            Self::Disconnect => DISCONNECT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::Connack { .. } => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::Puback { .. } => "PUBACK",
            Self::Pubrec { .. } => "PUBREC",
            Self::Pubrel { .. } => "PUBREL",
            Self::Pubcomp { .. } => "PUBCOMP",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Suback { .. } => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::Unsuback { .. } => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

// ---------------------------------------------------------------------------
// Remaining length
// ---------------------------------------------------------------------------

/// Append the base-128 encoding of `len`.
pub fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::FrameTooLong(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining-length field. Returns (value, bytes consumed).
pub fn decode_remaining_length(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in buf.iter().enumerate().take(4) {
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
    }
    if buf.len() < 4 {
        Err(CodecError::TooShort {
            kind: "remaining length",
            len: buf.len(),
        })
    } else {
        Err(CodecError::BadRemainingLength)
    }
}

/// Read one complete frame (header, length, body) from a byte stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    frame.push(byte[0]);

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    let mut done = false;
    for _ in 0..4 {
        reader.read_exact(&mut byte)?;
        frame.push(byte[0]);
        remaining += (byte[0] as usize & 0x7F) * multiplier;
        multiplier *= 128;
        if byte[0] & 0x80 == 0 {
            done = true;
            break;
        }
    }
    if !done {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            CodecError::BadRemainingLength,
        ));
    }

    let header_len = frame.len();
    frame.resize(header_len + remaining, 0);
    reader.read_exact(&mut frame[header_len..])?;
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    put_bytes(out, s.as_bytes())
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(b.len()).map_err(|_| CodecError::FrameTooLong(b.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(b);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], kind: &'static str) -> Self {
        Self { buf, pos: 0, kind }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::TooShort {
                kind: self.kind,
                len: self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

fn check_qos(qos: u8) -> Result<u8, CodecError> {
    if qos > 2 {
        return Err(CodecError::InvalidQos(qos));
    }
    Ok(qos)
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a message into one MQTT frame.
pub fn encode(msg: &MqttMessage) -> Result<Vec<u8>, CodecError> {
    let mut flags = 0u8;
    let mut body = Vec::with_capacity(32);

    match msg {
        MqttMessage::Connect(c) => {
            put_str(&mut body, &c.protocol_name)?;
            body.push(c.protocol_version);
            let mut cf = 0u8;
            if c.clean_session {
                cf |= CONNECT_CLEAN_SESSION;
            }
            if let Some(will) = &c.will {
                cf |= CONNECT_WILL | (check_qos(will.qos)? << CONNECT_WILL_QOS_SHIFT);
                if will.retain {
                    cf |= CONNECT_WILL_RETAIN;
                }
            }
            if c.username.is_some() {
                cf |= CONNECT_USERNAME;
            }
            if c.password.is_some() {
                cf |= CONNECT_PASSWORD;
            }
            body.push(cf);
            body.extend_from_slice(&c.keep_alive.to_be_bytes());
            put_str(&mut body, &c.client_id)?;
            if let Some(will) = &c.will {
                put_str(&mut body, &will.topic)?;
                put_bytes(&mut body, &will.message)?;
            }
            if let Some(user) = &c.username {
                put_str(&mut body, user)?;
            }
            if let Some(pass) = &c.password {
                put_str(&mut body, pass)?;
            }
        }
        MqttMessage::Connack { return_code } => {
            body.push(0);
            body.push(*return_code);
        }
        MqttMessage::Publish(p) => {
            flags = (u8::from(p.dup) << 3) | (check_qos(p.qos)? << 1) | u8::from(p.retain);
            put_str(&mut body, &p.topic)?;
            if p.qos > 0 {
                body.extend_from_slice(&p.msg_id.to_be_bytes());
            }
            body.extend_from_slice(&p.payload);
        }
        MqttMessage::Puback { msg_id }
        | MqttMessage::Pubrec { msg_id }
        | MqttMessage::Pubcomp { msg_id }
        | MqttMessage::Unsuback { msg_id } => body.extend_from_slice(&msg_id.to_be_bytes()),
        MqttMessage::Pubrel { msg_id } => {
            flags = 0x02;
            body.extend_from_slice(&msg_id.to_be_bytes());
        }
        MqttMessage::Subscribe {
            dup,
            msg_id,
            topics,
        } => {
            flags = (u8::from(*dup) << 3) | 0x02;
            body.extend_from_slice(&msg_id.to_be_bytes());
            for (topic, qos) in topics {
                put_str(&mut body, topic)?;
                body.push(check_qos(*qos)?);
            }
        }
        MqttMessage::Suback { msg_id, granted_qos } => {
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.extend_from_slice(granted_qos);
        }
        MqttMessage::Unsubscribe {
            dup,
            msg_id,
            topics,
        } => {
            flags = (u8::from(*dup) << 3) | 0x02;
            body.extend_from_slice(&msg_id.to_be_bytes());
            for topic in topics {
                put_str(&mut body, topic)?;
            }
        }
        MqttMessage::Pingreq | MqttMessage::Pingresp | MqttMessage::Disconnect => {}
    }

    let mut out = Vec::with_capacity(body.len() + 5);
    out.push((msg.msg_type() << 4) | flags);
    encode_remaining_length(body.len(), &mut out)?;
    out.extend_from_slice(&body);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one complete MQTT frame.
pub fn decode(frame: &[u8]) -> Result<MqttMessage, CodecError> {
    if frame.len() < 2 {
        return Err(CodecError::TooShort {
            kind: "frame",
            len: frame.len(),
        });
    }
    let header = frame[0];
    let (remaining, used) = decode_remaining_length(&frame[1..])?;
    let body = &frame[1 + used..];
    if body.len() != remaining {
        return Err(CodecError::LengthMismatch {
            declared: remaining,
            actual: body.len(),
        });
    }

    let msg_type = header >> 4;
    let dup = header & 0x08 != 0;
    let qos = (header >> 1) & 0x03;
    let retain = header & 0x01 != 0;

    let msg = match msg_type {
        CONNECT => {
            let mut c = Cursor::new(body, "CONNECT");
            let protocol_name = c.string()?;
            let protocol_version = c.u8()?;
            let cf = c.u8()?;
            let keep_alive = c.u16()?;
            let client_id = c.string()?;
            let will = if cf & CONNECT_WILL != 0 {
                Some(Will {
                    topic: c.string()?,
                    message: c.bytes()?,
                    qos: check_qos((cf >> CONNECT_WILL_QOS_SHIFT) & 0x03)?,
                    retain: cf & CONNECT_WILL_RETAIN != 0,
                })
            } else {
                None
            };
            let username = if cf & CONNECT_USERNAME != 0 {
                Some(c.string()?)
            } else {
                None
            };
            let password = if cf & CONNECT_PASSWORD != 0 {
                Some(c.string()?)
            } else {
                None
            };
            MqttMessage::Connect(Connect {
                protocol_name,
                protocol_version,
                client_id,
                clean_session: cf & CONNECT_CLEAN_SESSION != 0,
                keep_alive,
                will,
                username,
                password,
            })
        }
        CONNACK => {
            if body.len() != 2 {
                return Err(CodecError::BadLength {
                    kind: "CONNACK",
                    len: body.len(),
                });
            }
            MqttMessage::Connack {
                return_code: body[1],
            }
        }
        PUBLISH => {
            let qos = check_qos(qos)?;
            let mut c = Cursor::new(body, "PUBLISH");
            let topic = c.string()?;
            let msg_id = if qos > 0 { c.u16()? } else { 0 };
            MqttMessage::Publish(Publish {
                dup,
                qos,
                retain,
                topic,
                msg_id,
                payload: c.rest().to_vec(),
            })
        }
        PUBACK | PUBREC | PUBREL | PUBCOMP | UNSUBACK => {
            if body.len() != 2 {
                return Err(CodecError::BadLength {
                    kind: "ack",
                    len: body.len(),
                });
            }
            let msg_id = u16::from_be_bytes([body[0], body[1]]);
            match msg_type {
                PUBACK => MqttMessage::Puback { msg_id },
                PUBREC => MqttMessage::Pubrec { msg_id },
                PUBREL => MqttMessage::Pubrel { msg_id },
                PUBCOMP => MqttMessage::Pubcomp { msg_id },
                _ => MqttMessage::Unsuback { msg_id },
            }
        }
        SUBSCRIBE => {
            let mut c = Cursor::new(body, "SUBSCRIBE");
            let msg_id = c.u16()?;
            let mut topics = Vec::new();
            while c.remaining() > 0 {
                let topic = c.string()?;
                topics.push((topic, check_qos(c.u8()?)?));
            }
            MqttMessage::Subscribe {
                dup,
                msg_id,
                topics,
            }
        }
        SUBACK => {
            let mut c = Cursor::new(body, "SUBACK");
            let msg_id = c.u16()?;
            MqttMessage::Suback {
                msg_id,
                granted_qos: c.rest().to_vec(),
            }
        }
        UNSUBSCRIBE => {
            let mut c = Cursor::new(body, "UNSUBSCRIBE");
            let msg_id = c.u16()?;
            let mut topics = Vec::new();
            while c.remaining() > 0 {
                topics.push(c.string()?);
            }
            MqttMessage::Unsubscribe {
                dup,
                msg_id,
                topics,
            }
        }
        PINGREQ | PINGRESP | DISCONNECT => {
            if !body.is_empty() {
                return Err(CodecError::BadLength {
                    kind: "empty",
                    len: body.len(),
                });
            }
            match msg_type {
                PINGREQ => MqttMessage::Pingreq,
                PINGRESP => MqttMessage::Pingresp,
                _ => MqttMessage::Disconnect,
            }
        }
        other => return Err(CodecError::UnknownType(other)),
    };
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
