// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// UDP device link.
//
// Datagrams either carry a bare MQTT-SN frame or wrap it in a forwarder
// envelope:
//   forwarder: [hdr len][0xFE][ctrl][node id...][frame]
//   legacy:    [0x00][id len][id...][frame]
// Replies are wrapped the same way the device's last datagram was.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::address::{Address, Encapsulation};
use crate::error::{CodecError, LinkError};
use crate::link::DeviceLink;
use crate::sensor::{self, SnMessage, ENCAPSULATED};

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const RECV_BUFFER_SIZE: usize = 1024;

/// Sender endpoint remembered for broadcasts.
#[derive(Debug, Clone)]
struct Peer {
    endpoint: SocketAddr,
    encapsulated: bool,
    last_seen: Instant,
}

/// UDP transport using `socket2` for setup.
pub struct UdpDeviceLink {
    name: String,
    socket: UdpSocket,
    peers: Mutex<Vec<Peer>>,
    forwarder_timeout: Duration,
    open: AtomicBool,
}

impl UdpDeviceLink {
    /// Bind a UDP socket to `0.0.0.0:<port>` (0 picks a free port).
    pub fn bind(port: u16, forwarder_timeout: Duration) -> Result<Self, LinkError> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        // Bounded blocking so the reader notices close()
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let socket: UdpSocket = socket.into();
        let local = socket.local_addr()?;
        log::info!("[UDP] listening on {}", local);

        Ok(Self {
            name: format!("udp:{}", local.port()),
            socket,
            peers: Mutex::new(Vec::new()),
            forwarder_timeout,
            open: AtomicBool::new(true),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn remember(&self, endpoint: SocketAddr, encapsulated: bool) {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        match peers.iter_mut().find(|p| p.endpoint == endpoint) {
            Some(peer) => {
                peer.last_seen = now;
                peer.encapsulated = encapsulated;
            }
            None => peers.push(Peer {
                endpoint,
                encapsulated,
                last_seen: now,
            }),
        }
    }

    /// Live peers; expired ones are forgotten.
    fn live_peers(&self) -> Vec<Peer> {
        let timeout = self.forwarder_timeout;
        let mut peers = self.peers.lock();
        peers.retain(|p| p.last_seen.elapsed() < timeout);
        peers.clone()
    }

    fn send_raw(&self, endpoint: SocketAddr, datagram: &[u8]) -> Result<(), LinkError> {
        self.socket
            .send_to(datagram, endpoint)
            .map(|_| ())
            .map_err(LinkError::Send)
    }
}

impl DeviceLink for UdpDeviceLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self) -> Result<Option<(Address, Vec<u8>)>, LinkError> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (n, from) = match self.socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(LinkError::Io(e)),
        };
        let (address, frame) = unwrap_datagram(&buf[..n], from)?;
        self.remember(from, address.encapsulation().is_some());
        Ok(Some((address, frame)))
    }

    fn send(&self, to: &Address, msg: &SnMessage) -> Result<(), LinkError> {
        let endpoint = to
            .endpoint()
            .ok_or_else(|| LinkError::NoEndpoint(to.to_string()))?;
        let frame = sensor::encode(msg)?;
        log::trace!("[UDP] {} -> {}", msg.name(), to);
        self.send_raw(endpoint, &wrap_frame(to, &frame))
    }

    fn broadcast(&self, msg: &SnMessage) -> Result<(), LinkError> {
        self.broadcast_radius(0, msg)
    }

    fn broadcast_radius(&self, radius: u8, msg: &SnMessage) -> Result<(), LinkError> {
        let frame = sensor::encode(msg)?;
        let mut enveloped = Vec::with_capacity(frame.len() + 3);
        enveloped.extend_from_slice(&[3, ENCAPSULATED, radius]);
        enveloped.extend_from_slice(&frame);

        let mut last_err = None;
        for peer in self.live_peers() {
            let datagram = if peer.encapsulated { &enveloped } else { &frame };
            if let Err(e) = self.send_raw(peer.endpoint, datagram) {
                log::warn!("[UDP] broadcast to {} failed: {}", peer.endpoint, e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            log::info!("[UDP] {} closed", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Split a datagram into the device address and the MQTT-SN frame.
pub fn unwrap_datagram(data: &[u8], from: SocketAddr) -> Result<(Address, Vec<u8>), CodecError> {
    if data.len() < 2 {
        return Err(CodecError::TooShort {
            kind: "datagram",
            len: data.len(),
        });
    }

    if data[1] == ENCAPSULATED {
        let header_len = data[0] as usize;
        if header_len < 3 || data.len() <= header_len {
            return Err(CodecError::BadLength {
                kind: "forwarder envelope",
                len: data.len(),
            });
        }
        let ctrl = data[2];
        let id = data[3..header_len].to_vec();
        let address = Address::encapsulated(id, from, Encapsulation::Forwarder { ctrl });
        return Ok((address, data[header_len..].to_vec()));
    }

    if data[0] == 0x00 {
        let start = 2 + data[1] as usize;
        if data.len() <= start {
            return Err(CodecError::BadLength {
                kind: "legacy envelope",
                len: data.len(),
            });
        }
        let address = Address::encapsulated(data[2..start].to_vec(), from, Encapsulation::Legacy);
        return Ok((address, data[start..].to_vec()));
    }

    Ok((Address::device(from), data.to_vec()))
}

/// Wrap an encoded frame for `to`, mirroring how it reached us.
pub fn wrap_frame(to: &Address, frame: &[u8]) -> Vec<u8> {
    let id = to.id();
    match to.encapsulation() {
        Some(Encapsulation::Forwarder { ctrl }) => {
            let mut out = Vec::with_capacity(3 + id.len() + frame.len());
            out.push((3 + id.len()) as u8);
            out.push(ENCAPSULATED);
            out.push(ctrl);
            out.extend_from_slice(id);
            out.extend_from_slice(frame);
            out
        }
        Some(Encapsulation::Legacy) => {
            let mut out = Vec::with_capacity(2 + id.len() + frame.len());
            out.push(0x00);
            out.push(id.len() as u8);
            out.extend_from_slice(id);
            out.extend_from_slice(frame);
            out
        }
        None => frame.to_vec(),
    }
}
