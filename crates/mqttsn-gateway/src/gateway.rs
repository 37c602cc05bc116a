// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Gateway self-session.
//
// Owns the bootstrap broker connection, the device links and the periodic
// keep-alive that also drives advertisement and the inactivity sweep.

use std::sync::Arc;

use crate::address::Address;
use crate::broker::{self, MqttMessage};
use crate::error::GatewayError;
use crate::link::{BrokerLink, DeviceLink};
use crate::queue::{ControlKind, Envelope};
use crate::sensor::{self, QoS, SnMessage, TopicIdType};
use crate::session::SessionContext;
use crate::topics::TopicMappingTable;

/// The gateway's own broker client.
pub struct GatewaySession {
    address: Address,
    ctx: SessionContext,
    broker: Box<dyn BrokerLink>,
    device_links: Vec<Arc<dyn DeviceLink>>,
    topics: TopicMappingTable,
    connected: bool,
    /// Seconds since the last ADVERTISE.
    adv_elapsed: u64,
    /// Seconds since the last inactivity sweep.
    check_elapsed: u64,
}

impl GatewaySession {
    pub fn new(ctx: SessionContext) -> Self {
        let address = ctx.gateway.clone();
        let broker = ctx.links.broker_link(&address);
        let topics = ctx.topic_table();
        Self {
            address,
            ctx,
            broker,
            device_links: Vec::new(),
            topics,
            connected: false,
            adv_elapsed: 0,
            check_elapsed: 0,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn client_id(&self) -> String {
        format!("Gateway_{}", self.ctx.config.gw_id)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn device_links(&self) -> &[Arc<dyn DeviceLink>] {
        &self.device_links
    }

    /// Open the broker link and send the gateway CONNECT.
    ///
    /// The session is connected once the broker CONNACK is dispatched.
    pub fn connect(&mut self) -> Result<(), GatewayError> {
        let config = &self.ctx.config;
        let keep_alive = u16::try_from(config.keep_alive_period_secs).unwrap_or(u16::MAX);
        let connect = broker::Connect {
            protocol_name: config.connect.protocol_name.clone(),
            protocol_version: config.connect.protocol_version,
            clean_session: config.connect.clean_session,
            will: config.connect.will(),
            ..broker::Connect::new(self.client_id(), keep_alive)
        };

        log::info!(
            "[GATEWAY] connecting to {}:{} as '{}'",
            config.broker.host,
            config.broker.port,
            connect.client_id
        );
        self.broker.open()?;
        if let Err(e) = self.broker.send(&MqttMessage::Connect(connect)) {
            self.broker.close();
            return Err(e.into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Broker side
    // -----------------------------------------------------------------------

    pub fn on_broker_message(&mut self, msg: MqttMessage) -> Result<(), GatewayError> {
        match msg {
            MqttMessage::Connack { return_code } => self.handle_connack(return_code),
            MqttMessage::Pingresp => {
                log::trace!("[GATEWAY] PINGRESP");
                Ok(())
            }
            other => {
                log::debug!("[GATEWAY] unexpected broker {} dropped", other.name());
                Ok(())
            }
        }
    }

    fn handle_connack(&mut self, return_code: u8) -> Result<(), GatewayError> {
        if self.connected {
            log::debug!("[GATEWAY] duplicate CONNACK dropped");
            return Ok(());
        }
        if return_code != broker::CONNACK_ACCEPTED {
            log::error!(
                "[GATEWAY] broker refused the connection (return code {})",
                return_code
            );
            self.broker.close();
            return Err(GatewayError::ConnectionRefused(return_code));
        }

        self.connected = true;
        log::info!("[GATEWAY] connected to the broker");
        self.open_device_links()?;

        self.send_broker(MqttMessage::Pingreq)?;
        self.ctx.timers.schedule(
            &self.address,
            ControlKind::SendKeepAlive,
            self.ctx.config.keep_alive_period(),
        );
        Ok(())
    }

    fn open_device_links(&mut self) -> Result<(), GatewayError> {
        for config in &self.ctx.config.device_links {
            match self.ctx.links.device_link(config) {
                Ok(link) => {
                    log::info!("[GATEWAY] device link {} open", link.name());
                    self.device_links.push(link);
                }
                Err(e) => log::error!("[GATEWAY] device link {} failed: {}", config.name(), e),
            }
        }
        if self.device_links.is_empty() {
            return Err(GatewayError::NoDeviceLinks);
        }
        Ok(())
    }

    fn send_broker(&mut self, msg: MqttMessage) -> Result<(), GatewayError> {
        self.broker.send(&msg).map_err(|e| {
            log::error!("[GATEWAY] failed to send {}: {}", msg.name(), e);
            GatewayError::BrokerConnectionLost
        })
    }

    // -----------------------------------------------------------------------
    // Device side
    // -----------------------------------------------------------------------

    pub fn on_sensor_message(
        &mut self,
        msg: SnMessage,
        _link: Arc<dyn DeviceLink>,
    ) -> Result<(), GatewayError> {
        match msg {
            SnMessage::SearchGw { radius } => {
                self.answer_search(radius);
                Ok(())
            }
            SnMessage::Publish {
                flags,
                topic_id,
                data,
                ..
            } if flags.qos == QoS::MinusOne => {
                self.relay_qos_minus_one(flags.topic_id_type, topic_id, data)
            }
            other => {
                log::debug!("[GATEWAY] unexpected device {} dropped", other.name());
                Ok(())
            }
        }
    }

    fn answer_search(&self, radius: u8) {
        let reply = SnMessage::GwInfo {
            gw_id: self.ctx.config.gw_id,
            gw_addr: Vec::new(),
        };
        for link in &self.device_links {
            if let Err(e) = link.broadcast_radius(radius, &reply) {
                log::warn!("[GATEWAY] GWINFO on {} failed: {}", link.name(), e);
            }
        }
    }

    fn relay_qos_minus_one(
        &mut self,
        id_type: TopicIdType,
        topic_id: u16,
        data: Vec<u8>,
    ) -> Result<(), GatewayError> {
        if !self.connected {
            log::debug!("[GATEWAY] QoS -1 PUBLISH before the broker connection dropped");
            return Ok(());
        }
        let topic = match id_type {
            TopicIdType::Normal => None,
            TopicIdType::Predefined if self.topics.is_predefined(topic_id) => {
                self.topics.get_topic_name(topic_id).map(str::to_string)
            }
            TopicIdType::Predefined => None,
            TopicIdType::Short => Some(sensor::short_topic_name(topic_id)),
        };
        let Some(topic) = topic else {
            log::debug!(
                "[GATEWAY] QoS -1 PUBLISH on topic id {} ({:?}) dropped",
                topic_id,
                id_type
            );
            return Ok(());
        };

        self.send_broker(MqttMessage::Publish(broker::Publish {
            dup: false,
            qos: 0,
            retain: false,
            topic,
            msg_id: 0,
            payload: data,
        }))
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    pub fn on_control_message(&mut self, kind: ControlKind) -> Result<(), GatewayError> {
        match kind {
            ControlKind::ConnectionLost => {
                log::error!("[GATEWAY] broker connection lost");
                self.connected = false;
                Err(GatewayError::BrokerConnectionLost)
            }
            ControlKind::SendKeepAlive => self.keep_alive(),
            ControlKind::ShutDown => {
                self.shut_down();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn keep_alive(&mut self) -> Result<(), GatewayError> {
        if !self.connected {
            return Ok(());
        }
        self.send_broker(MqttMessage::Pingreq)?;

        let config = &self.ctx.config;
        let period = config.keep_alive_period_secs;

        self.adv_elapsed += period;
        if self.adv_elapsed >= config.adv_period_secs {
            self.adv_elapsed = 0;
            let advertise = SnMessage::Advertise {
                gw_id: config.gw_id,
                duration: u16::try_from(config.adv_period_secs).unwrap_or(u16::MAX),
            };
            for link in &self.device_links {
                if let Err(e) = link.broadcast(&advertise) {
                    log::warn!("[GATEWAY] ADVERTISE on {} failed: {}", link.name(), e);
                }
            }
        }

        self.check_elapsed += period;
        if self.check_elapsed >= config.checking_period_secs {
            self.check_elapsed = 0;
            self.ctx
                .queue
                .put(Envelope::broadcast(ControlKind::CheckInactivity));
        }
        Ok(())
    }

    fn shut_down(&mut self) {
        log::info!("[GATEWAY] shutting down");
        if self.broker.is_open() {
            let _ = self.broker.send(&MqttMessage::Disconnect);
        }
        self.broker.close();
        self.connected = false;
        for link in self.device_links.drain(..) {
            link.close();
        }
        self.ctx.timers.unregister_all(&self.address);
    }
}
