// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN 1.2 to MQTT 3.1 transparent gateway.
//!
//! Sensor devices speak the compact datagram protocol (MQTT-SN). Each device
//! gets its own broker connection, so the broker sees one MQTT client per
//! device while the device never leaves its radio or UDP network.
//!
//! # Architecture
//!
//! ```text
//!  Devices (MQTT-SN/UDP)        Gateway                       Broker (MQTT/TCP)
//!        |                         |                                 |
//!        |-- datagram -> [device link reader] --+                    |
//!        |                                      v                    |
//!        |                 [MessageQueue] <- [broker link readers] <-|
//!        |                        |      <- [timer tasks]            |
//!        |                        v                                  |
//!        |                  [Dispatcher]                             |
//!        |                   /        \                              |
//!        |     GatewaySession          ClientSession (per device)    |
//!        |<-- ADVERTISE/GWINFO         translate + handshakes ------>|
//!        |<------------------------------------------- per-device TCP |
//! ```
//!
//! All session state is mutated on the dispatcher thread. Readers and timers
//! only enqueue [`Envelope`]s; control messages jump to the front of the
//! queue.
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`sensor`] | MQTT-SN codec |
//! | [`broker`] | MQTT 3.1 codec and stream framing |
//! | [`session`] | Per-device state machine |
//! | [`gateway`] | Gateway self-session (keep-alive, advertise, discovery) |
//! | [`dispatcher`] | Queue drain and session table |
//! | [`timer`] | Periodic timeout tasks |
//! | [`udp`] / [`tcp`] | Socket transports |

pub mod address;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod link;
pub mod queue;
pub mod sensor;
pub mod session;
pub mod tcp;
pub mod timer;
pub mod topics;
pub mod udp;

// Re-exports for convenience.
pub use address::{Address, Encapsulation};
pub use broker::MqttMessage;
pub use config::{
    BrokerConfig, ConfigError, ConnectConfig, DeviceLinkConfig, GatewayConfig, PredefinedTopic,
};
pub use dispatcher::{Dispatcher, Flow};
pub use error::{CodecError, GatewayError, LinkError};
pub use gateway::GatewaySession;
pub use link::{BrokerLink, DeviceLink, LinkFactory, SocketLinkFactory};
pub use queue::{ControlKind, Envelope, MessageQueue, Payload};
pub use sensor::{Flags, QoS, ReturnCode, SnMessage, TopicIdType, TopicRef};
pub use session::{ClientSession, ClientState, Disposition, Handshakes, SessionContext};
pub use timer::TimerService;
pub use topics::TopicMappingTable;

#[cfg(test)]
mod tests;
