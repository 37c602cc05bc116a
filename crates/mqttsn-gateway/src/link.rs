// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction toward devices and toward the broker.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::address::Address;
use crate::broker::MqttMessage;
use crate::config::{DeviceLinkConfig, GatewayConfig};
use crate::error::LinkError;
use crate::queue::{Envelope, MessageQueue};
use crate::sensor::{self, SnMessage};
use crate::tcp::TcpBrokerLink;
use crate::udp::UdpDeviceLink;

// ---------------------------------------------------------------------------
// Link traits
// ---------------------------------------------------------------------------

/// Datagram link shared by every device session reached through it.
pub trait DeviceLink: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next datagram. `Ok(None)` when the read timed out.
    fn receive(&self) -> Result<Option<(Address, Vec<u8>)>, LinkError>;

    /// Send a message to one device.
    fn send(&self, to: &Address, msg: &SnMessage) -> Result<(), LinkError>;

    /// Send a message to every known device.
    fn broadcast(&self, msg: &SnMessage) -> Result<(), LinkError>;

    /// Broadcast limited to `radius` hops.
    fn broadcast_radius(&self, radius: u8, msg: &SnMessage) -> Result<(), LinkError>;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Connection to the broker owned by exactly one session.
///
/// Inbound frames are not returned by the link: an internal reader puts
/// them on the dispatcher queue addressed to the owning session.
pub trait BrokerLink: Send {
    fn open(&mut self) -> Result<(), LinkError>;

    fn send(&mut self, msg: &MqttMessage) -> Result<(), LinkError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Creates links from configuration.
pub trait LinkFactory: Send + Sync {
    /// Unopened broker link owned by `owner`.
    fn broker_link(&self, owner: &Address) -> Box<dyn BrokerLink>;

    /// Open a device link and start its reader.
    fn device_link(&self, config: &DeviceLinkConfig) -> Result<Arc<dyn DeviceLink>, LinkError>;
}

// ---------------------------------------------------------------------------
// Device reader
// ---------------------------------------------------------------------------

/// Spawn the blocking reader of a device link.
///
/// Frames outside `min_len..=max_len` and frames that do not decode are
/// dropped. The thread exits once the link is closed.
pub fn spawn_device_reader(
    link: Arc<dyn DeviceLink>,
    queue: Arc<MessageQueue>,
    min_len: usize,
    max_len: usize,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("mqttsn-reader-{}", link.name()))
        .spawn(move || {
            while link.is_open() {
                match link.receive() {
                    Ok(Some((address, frame))) => {
                        if frame.len() < min_len || frame.len() > max_len {
                            log::debug!(
                                "[UDP] dropping {} byte frame from {} (allowed {}..={})",
                                frame.len(),
                                address,
                                min_len,
                                max_len
                            );
                            continue;
                        }
                        match sensor::decode(&frame) {
                            Ok(msg) => {
                                log::trace!("[UDP] {} <- {}", msg.name(), address);
                                queue.put(Envelope::sensor(address, msg, Arc::clone(&link)));
                            }
                            Err(e) => log::debug!("[UDP] malformed frame from {}: {}", address, e),
                        }
                    }
                    Ok(None) => {}
                    Err(LinkError::Codec(e)) => log::debug!("[UDP] bad envelope: {}", e),
                    Err(e) => {
                        if !link.is_open() {
                            break;
                        }
                        log::warn!("[UDP] {} receive failed: {}", link.name(), e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            log::debug!("[UDP] reader for {} stopped", link.name());
        })
}

// ---------------------------------------------------------------------------
// Socket factory
// ---------------------------------------------------------------------------

/// Factory for the real UDP and TCP links.
pub struct SocketLinkFactory {
    broker_host: String,
    broker_port: u16,
    forwarder_timeout: Duration,
    min_frame_length: usize,
    max_frame_length: usize,
    queue: Arc<MessageQueue>,
}

impl SocketLinkFactory {
    pub fn new(config: &GatewayConfig, queue: Arc<MessageQueue>) -> Self {
        Self {
            broker_host: config.broker.host.clone(),
            broker_port: config.broker.port,
            forwarder_timeout: config.forwarder_timeout(),
            min_frame_length: config.min_frame_length,
            max_frame_length: config.max_frame_length,
            queue,
        }
    }
}

impl LinkFactory for SocketLinkFactory {
    fn broker_link(&self, owner: &Address) -> Box<dyn BrokerLink> {
        Box::new(TcpBrokerLink::new(
            &self.broker_host,
            self.broker_port,
            owner.clone(),
            Arc::clone(&self.queue),
        ))
    }

    fn device_link(&self, config: &DeviceLinkConfig) -> Result<Arc<dyn DeviceLink>, LinkError> {
        let link: Arc<dyn DeviceLink> = match config {
            DeviceLinkConfig::Udp { port } => {
                Arc::new(UdpDeviceLink::bind(*port, self.forwarder_timeout)?)
            }
        };
        spawn_device_reader(
            Arc::clone(&link),
            Arc::clone(&self.queue),
            self.min_frame_length,
            self.max_frame_length,
        )?;
        Ok(link)
    }
}
