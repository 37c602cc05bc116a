// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Endpoint identities used as session keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Link-layer envelope a device frame arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    /// `[len, 0xFE, ctrl, node id...]` forwarder envelope.
    Forwarder { ctrl: u8 },
    /// `[0x00, id len, id...]` envelope.
    Legacy,
}

#[derive(Debug, Clone)]
pub struct DeviceAddress {
    /// Logical identifier (wireless node id, or IP octets + port).
    pub id: Vec<u8>,
    /// Last transport endpoint the device was seen at.
    pub endpoint: Option<SocketAddr>,
    pub encapsulation: Option<Encapsulation>,
}

#[derive(Debug, Clone)]
pub struct GatewayAddress {
    pub id: Vec<u8>,
}

/// Identity of a session: a remote device or the gateway itself.
///
/// Equality and hashing only look at the variant and the logical id, so a
/// device that roams to a new endpoint still maps to the same session.
#[derive(Debug, Clone)]
pub enum Address {
    Device(DeviceAddress),
    Gateway(GatewayAddress),
}

impl Address {
    /// Plain (non-encapsulated) device identified by its socket address.
    pub fn device(endpoint: SocketAddr) -> Self {
        let mut id = match endpoint.ip() {
            std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
            std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        id.extend_from_slice(&endpoint.port().to_be_bytes());
        Self::Device(DeviceAddress {
            id,
            endpoint: Some(endpoint),
            encapsulation: None,
        })
    }

    /// Device reached through a forwarder.
    pub fn encapsulated(id: Vec<u8>, endpoint: SocketAddr, encapsulation: Encapsulation) -> Self {
        Self::Device(DeviceAddress {
            id,
            endpoint: Some(endpoint),
            encapsulation: Some(encapsulation),
        })
    }

    pub fn gateway(gw_id: u8) -> Self {
        Self::Gateway(GatewayAddress { id: vec![gw_id] })
    }

    pub fn id(&self) -> &[u8] {
        match self {
            Self::Device(d) => &d.id,
            Self::Gateway(g) => &g.id,
        }
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        match self {
            Self::Device(d) => d.endpoint,
            Self::Gateway(_) => None,
        }
    }

    pub fn encapsulation(&self) -> Option<Encapsulation> {
        match self {
            Self::Device(d) => d.encapsulation,
            Self::Gateway(_) => None,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::Gateway(_))
    }

    /// Copy the transport endpoint and envelope of `other` (same identity).
    pub fn refresh_from(&mut self, other: &Address) {
        if let (Self::Device(mine), Self::Device(theirs)) = (self, other) {
            if theirs.endpoint.is_some() {
                mine.endpoint = theirs.endpoint;
                mine.encapsulation = theirs.encapsulation;
            }
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.is_gateway() == other.is_gateway() && self.id() == other.id()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.is_gateway().hash(state);
        self.id().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_gateway() { "gw" } else { "dev" };
        write!(f, "{}[", prefix)?;
        for b in self.id() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}
