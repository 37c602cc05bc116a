// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared across the gateway.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced while decoding or encoding a wire frame (either protocol).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Frame is shorter than the minimum for its message type.
    #[error("{kind} frame too short ({len} bytes)")]
    TooShort { kind: &'static str, len: usize },

    /// Declared length does not match the number of bytes received.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Frame has an exact size for its type and this one differs.
    #[error("{kind} frame has invalid length {len}")]
    BadLength { kind: &'static str, len: usize },

    /// Unknown message type byte.
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    /// Topic id type 0b11 is reserved.
    #[error("reserved topic id type: {0}")]
    ReservedTopicIdType(u8),

    /// Return code outside the defined range.
    #[error("unknown return code: 0x{0:02x}")]
    UnknownReturnCode(u8),

    /// QoS value 3 in a broker frame.
    #[error("invalid QoS level: {0}")]
    InvalidQos(u8),

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Encoded frame would not fit the length field.
    #[error("frame too long: {0} bytes")]
    FrameTooLong(usize),

    /// Remaining-length field uses more than four bytes.
    #[error("malformed remaining length")]
    BadRemainingLength,
}

/// Errors from device and broker transports.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("link not open")]
    NotOpen,

    #[error("no transport endpoint known for {0}")]
    NoEndpoint(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("broker refused the gateway connection (return code {0})")]
    ConnectionRefused(u8),

    #[error("no device link could be opened")]
    NoDeviceLinks,

    #[error("gateway broker connection lost")]
    BrokerConnectionLost,
}
