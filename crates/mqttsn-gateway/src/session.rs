// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-device translation state machine.
//
// One ClientSession per device address. All handlers run on the dispatcher
// thread; the only cross-thread traffic is the queue and the timer service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::Address;
use crate::broker::{self, MqttMessage};
use crate::config::GatewayConfig;
use crate::link::{BrokerLink, DeviceLink, LinkFactory};
use crate::queue::{ControlKind, Envelope, MessageQueue};
use crate::sensor::{self, Flags, QoS, ReturnCode, SnMessage, TopicIdType, TopicRef};
use crate::timer::TimerService;
use crate::topics::{self, TopicMappingTable};

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<GatewayConfig>,
    pub queue: Arc<MessageQueue>,
    pub timers: Arc<TimerService>,
    pub links: Arc<dyn LinkFactory>,
    /// Address of the gateway self-session.
    pub gateway: Address,
}

impl SessionContext {
    pub fn new(
        config: Arc<GatewayConfig>,
        queue: Arc<MessageQueue>,
        links: Arc<dyn LinkFactory>,
    ) -> Self {
        let timers = Arc::new(TimerService::new(Arc::clone(&queue)));
        let gateway = Address::gateway(config.gw_id);
        Self {
            config,
            queue,
            timers,
            links,
            gateway,
        }
    }

    /// Fresh topic table seeded with the predefined topics.
    pub fn topic_table(&self) -> TopicMappingTable {
        TopicMappingTable::with_predefined(
            self.config.predefined_topic_id_size,
            self.config.predefined_entries(),
        )
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NotConnected,
    Connected,
    Disconnected,
}

/// Outstanding handshakes and their retry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshakes {
    pub will_topic: bool,
    pub will_msg: bool,
    /// Broker CONNACK pending for a device CONNECT.
    pub connack: bool,
    pub regack: bool,
    pub suback: bool,
    pub unsuback: bool,
    pub puback: bool,
    pub will_topic_tries: u32,
    pub will_msg_tries: u32,
    pub register_tries: u32,
}

impl Handshakes {
    /// A CONNECT is being processed.
    pub fn establishing(&self) -> bool {
        self.will_topic || self.will_msg || self.connack
    }
}

#[derive(Debug, Clone)]
struct ConnectRequest {
    clean_session: bool,
    duration: u16,
    client_id: String,
}

#[derive(Debug, Clone)]
struct PendingRegister {
    topic_id: u16,
    msg_id: u16,
    topic_name: String,
}

#[derive(Debug, Clone)]
struct PendingPublish {
    topic_id: u16,
    msg_id: u16,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    msg_id: u16,
    topic: TopicRef,
    /// Broker topic name the request was translated to.
    topic_name: String,
}

/// The single in-flight message of each handshake kind.
#[derive(Debug, Default)]
struct Pending {
    connect: Option<ConnectRequest>,
    will_topic: Option<(Flags, String)>,
    register: Option<PendingRegister>,
    broker_publish: Option<broker::Publish>,
    publish: Option<PendingPublish>,
    subscribe: Option<PendingRequest>,
    unsubscribe: Option<PendingRequest>,
}

/// What the dispatcher should do with a session after a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct ClientSession {
    address: Address,
    client_id: String,
    ctx: SessionContext,
    link: Option<Arc<dyn DeviceLink>>,
    broker: Box<dyn BrokerLink>,
    topics: TopicMappingTable,
    state: ClientState,
    handshakes: Handshakes,
    pending: Pending,
    deadline: Instant,
    next_msg_id: u16,
}

impl ClientSession {
    pub fn new(address: Address, ctx: SessionContext) -> Self {
        let broker = ctx.links.broker_link(&address);
        let topics = ctx.topic_table();
        let deadline = Instant::now() + ctx.config.handler_timeout();
        log::info!("[SESSION] {} created", address);
        Self {
            address,
            client_id: String::new(),
            ctx,
            link: None,
            broker,
            topics,
            state: ClientState::NotConnected,
            handshakes: Handshakes::default(),
            pending: Pending::default(),
            deadline,
            next_msg_id: 1,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn handshakes(&self) -> &Handshakes {
        &self.handshakes
    }

    pub fn topics(&self) -> &TopicMappingTable {
        &self.topics
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Adopt the latest transport endpoint of the device.
    pub fn refresh_address(&mut self, seen: &Address) {
        self.address.refresh_from(seen);
    }

    fn touch(&mut self) {
        self.deadline = Instant::now() + self.ctx.config.handler_timeout();
    }

    fn waiting_time(&self) -> Duration {
        self.ctx.config.waiting_time()
    }

    fn new_msg_id(&mut self) -> u16 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.checked_add(1).unwrap_or(1);
        id
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    fn send_device(&self, msg: SnMessage) {
        match &self.link {
            Some(link) => {
                if let Err(e) = link.send(&self.address, &msg) {
                    log::warn!(
                        "[SESSION] {} failed to send {}: {}",
                        self.address,
                        msg.name(),
                        e
                    );
                }
            }
            None => log::warn!(
                "[SESSION] {} has no device link, {} dropped",
                self.address,
                msg.name()
            ),
        }
    }

    /// Send to the broker; a failure tears the session down.
    fn send_broker(&mut self, msg: MqttMessage) -> bool {
        match self.broker.send(&msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "[SESSION] {} failed to send {} to the broker: {}",
                    self.address,
                    msg.name(),
                    e
                );
                self.connection_lost();
                false
            }
        }
    }

    fn reply_invalid_topic_puback(&self, topic_id: u16, msg_id: u16) {
        self.send_device(SnMessage::Puback {
            topic_id,
            msg_id,
            return_code: ReturnCode::InvalidTopicId,
        });
    }

    /// Answer a request that needs a connected session.
    fn reject_not_connected(&self, what: &str) {
        log::debug!(
            "[SESSION] {} sent {} while not connected",
            self.address,
            what
        );
        self.send_device(SnMessage::Disconnect { duration: None });
    }

    // -----------------------------------------------------------------------
    // Device side
    // -----------------------------------------------------------------------

    pub fn on_sensor_message(&mut self, msg: SnMessage, link: Arc<dyn DeviceLink>) {
        self.touch();
        self.link = Some(Arc::clone(&link));

        match msg {
            SnMessage::SearchGw { .. } => {
                self.ctx
                    .queue
                    .put(Envelope::sensor(self.ctx.gateway.clone(), msg, link));
            }
            SnMessage::Connect {
                flags,
                duration,
                client_id,
                ..
            } => self.handle_connect(flags, duration, client_id),
            SnMessage::WillTopic { flags, topic } => {
                self.handle_will_topic(flags.unwrap_or_default(), topic)
            }
            SnMessage::WillMsg { message } => self.handle_will_msg(message),
            SnMessage::Register {
                msg_id, topic_name, ..
            } => self.handle_register(msg_id, &topic_name),
            SnMessage::Regack {
                topic_id,
                msg_id,
                return_code,
            } => self.handle_regack(topic_id, msg_id, return_code),
            SnMessage::Publish { flags, .. } if flags.qos == QoS::MinusOne => {
                self.ctx
                    .queue
                    .put(Envelope::sensor(self.ctx.gateway.clone(), msg, link));
            }
            SnMessage::Publish {
                flags,
                topic_id,
                msg_id,
                data,
            } => self.handle_publish(flags, topic_id, msg_id, data),
            SnMessage::Puback {
                topic_id,
                msg_id,
                return_code,
            } => self.handle_puback(topic_id, msg_id, return_code),
            SnMessage::Pubrec { msg_id } => {
                self.relay_to_broker("PUBREC", MqttMessage::Pubrec { msg_id })
            }
            SnMessage::Pubrel { msg_id } => {
                self.relay_to_broker("PUBREL", MqttMessage::Pubrel { msg_id })
            }
            SnMessage::Pubcomp { msg_id } => {
                self.relay_to_broker("PUBCOMP", MqttMessage::Pubcomp { msg_id })
            }
            SnMessage::Subscribe {
                flags,
                msg_id,
                topic,
            } => self.handle_subscribe(flags, msg_id, topic),
            SnMessage::Unsubscribe {
                flags,
                msg_id,
                topic,
            } => self.handle_unsubscribe(flags, msg_id, topic),
            SnMessage::Pingreq { .. } => self.relay_to_broker("PINGREQ", MqttMessage::Pingreq),
            SnMessage::Pingresp => self.relay_to_broker("PINGRESP", MqttMessage::Pingresp),
            SnMessage::Disconnect { .. } => self.handle_disconnect(),
            SnMessage::WillTopicUpd { topic, .. } => {
                log::info!(
                    "[SESSION] {} WILLTOPICUPD '{}' ignored (no broker-side update)",
                    self.address,
                    topic
                );
            }
            SnMessage::WillMsgUpd { message } => {
                log::info!(
                    "[SESSION] {} WILLMSGUPD ({} bytes) ignored (no broker-side update)",
                    self.address,
                    message.len()
                );
            }
            other => {
                log::debug!(
                    "[SESSION] {} unexpected {} from device dropped",
                    self.address,
                    other.name()
                );
            }
        }
    }

    fn handle_connect(&mut self, flags: Flags, duration: u16, client_id: String) {
        log::info!(
            "[SESSION] {} CONNECT client_id='{}' will={} clean={}",
            self.address,
            client_id,
            flags.will,
            flags.clean_session
        );
        self.client_id = client_id.clone();

        if self.is_connected() {
            self.send_device(SnMessage::Connack {
                return_code: ReturnCode::Accepted,
            });
            return;
        }
        if self.handshakes.connack {
            log::warn!(
                "[SESSION] {} broker never answered CONNECT, reconnecting",
                self.address
            );
            self.broker.close();
            self.handshakes.connack = false;
        }
        if self.handshakes.establishing() {
            log::warn!(
                "[SESSION] {} already establishing a connection, CONNECT dropped",
                self.address
            );
            return;
        }

        let request = ConnectRequest {
            clean_session: flags.clean_session,
            duration,
            client_id,
        };

        if !flags.will {
            self.connect_broker(request, None);
            return;
        }

        self.pending.connect = Some(request);
        self.send_device(SnMessage::WillTopicReq);
        self.handshakes.will_topic = true;
        self.handshakes.will_topic_tries = 1;
        self.ctx.timers.register(
            &self.address,
            ControlKind::WaitingWillTopicTimeout,
            self.waiting_time(),
        );
    }

    fn handle_will_topic(&mut self, flags: Flags, topic: String) {
        if !self.handshakes.will_topic {
            log::warn!("[SESSION] {} unexpected WILLTOPIC dropped", self.address);
            return;
        }
        self.handshakes.will_topic = false;
        self.handshakes.will_topic_tries = 0;
        self.ctx
            .timers
            .unregister(&self.address, ControlKind::WaitingWillTopicTimeout);

        self.pending.will_topic = Some((flags, topic));
        self.send_device(SnMessage::WillMsgReq);
        self.handshakes.will_msg = true;
        self.handshakes.will_msg_tries = 1;
        self.ctx.timers.register(
            &self.address,
            ControlKind::WaitingWillMsgTimeout,
            self.waiting_time(),
        );
    }

    fn handle_will_msg(&mut self, message: Vec<u8>) {
        if !self.handshakes.will_msg {
            log::warn!("[SESSION] {} unexpected WILLMSG dropped", self.address);
            return;
        }
        self.handshakes.will_msg = false;
        self.handshakes.will_msg_tries = 0;
        self.ctx
            .timers
            .unregister(&self.address, ControlKind::WaitingWillMsgTimeout);

        let (Some(request), Some((flags, topic))) =
            (self.pending.connect.take(), self.pending.will_topic.take())
        else {
            log::warn!(
                "[SESSION] {} WILLMSG without a stored CONNECT/WILLTOPIC",
                self.address
            );
            return;
        };

        // An empty will topic deletes the will
        let will = (!topic.is_empty()).then(|| broker::Will {
            topic,
            message,
            qos: flags.qos.level().unwrap_or(0),
            retain: flags.retain,
        });
        self.connect_broker(request, will);
    }

    /// Open the broker link and send the merged CONNECT.
    fn connect_broker(&mut self, request: ConnectRequest, will: Option<broker::Will>) {
        let defaults = &self.ctx.config.connect;
        let connect = broker::Connect {
            protocol_name: defaults.protocol_name.clone(),
            protocol_version: defaults.protocol_version,
            client_id: request.client_id,
            clean_session: request.clean_session,
            keep_alive: request.duration,
            will,
            username: None,
            password: None,
        };

        if let Err(e) = self.broker.open() {
            log::error!(
                "[SESSION] {} cannot reach the broker: {}",
                self.address,
                e
            );
            return;
        }
        if let Err(e) = self.broker.send(&MqttMessage::Connect(connect)) {
            log::error!(
                "[SESSION] {} failed to send CONNECT: {}",
                self.address,
                e
            );
            self.broker.close();
            return;
        }
        self.handshakes.connack = true;
    }

    fn handle_register(&mut self, msg_id: u16, topic_name: &str) {
        if !self.is_connected() {
            self.reject_not_connected("REGISTER");
            return;
        }
        let (topic_id, return_code) = match self.topics.register(topic_name) {
            Some(id) => (id, ReturnCode::Accepted),
            None => {
                log::warn!("[SESSION] {} topic id space exhausted", self.address);
                (0, ReturnCode::Congestion)
            }
        };
        self.send_device(SnMessage::Regack {
            topic_id,
            msg_id,
            return_code,
        });
    }

    fn handle_regack(&mut self, topic_id: u16, msg_id: u16, return_code: ReturnCode) {
        if !self.is_connected() {
            self.reject_not_connected("REGACK");
            return;
        }
        if !self.handshakes.regack {
            log::debug!("[SESSION] {} unexpected REGACK dropped", self.address);
            return;
        }
        let expected = match (&self.pending.register, &self.pending.broker_publish) {
            (Some(register), Some(_)) => Some(register.msg_id),
            _ => None,
        };
        let Some(expected) = expected else {
            self.finish_register();
            return;
        };
        if msg_id != expected {
            log::debug!(
                "[SESSION] {} REGACK msg_id {} does not match {}",
                self.address,
                msg_id,
                expected
            );
            return;
        }

        let register = self.pending.register.take();
        let publish = self.pending.broker_publish.take();
        self.finish_register();
        let (Some(register), Some(publish)) = (register, publish) else {
            return;
        };

        if return_code != ReturnCode::Accepted {
            log::info!(
                "[SESSION] {} rejected topic '{}' ({:?}), buffered PUBLISH dropped",
                self.address,
                register.topic_name,
                return_code
            );
            return;
        }
        if topic_id != register.topic_id {
            log::debug!(
                "[SESSION] {} REGACK echoed topic id {} instead of {}",
                self.address,
                topic_id,
                register.topic_id
            );
        }

        self.topics.assign(register.topic_id, &register.topic_name);
        self.send_device(SnMessage::Publish {
            flags: Flags::data(
                publish.dup,
                QoS::from_level(publish.qos).unwrap_or_default(),
                publish.retain,
                TopicIdType::Normal,
            ),
            topic_id: register.topic_id,
            msg_id: publish.msg_id,
            data: publish.payload,
        });
    }

    fn finish_register(&mut self) {
        self.handshakes.regack = false;
        self.handshakes.register_tries = 0;
        self.pending.register = None;
        self.pending.broker_publish = None;
        self.ctx
            .timers
            .unregister(&self.address, ControlKind::WaitingRegackTimeout);
    }

    fn handle_publish(&mut self, flags: Flags, topic_id: u16, msg_id: u16, data: Vec<u8>) {
        if !self.is_connected() {
            self.reject_not_connected("PUBLISH");
            return;
        }
        if self.handshakes.puback && flags.qos == QoS::AtLeastOnce {
            log::debug!(
                "[SESSION] {} QoS 1 PUBLISH already in flight, msg_id {} dropped",
                self.address,
                msg_id
            );
            return;
        }

        let topic = match flags.topic_id_type {
            TopicIdType::Normal => {
                if self.topics.is_predefined(topic_id) {
                    None
                } else {
                    self.topics.get_topic_name(topic_id).map(str::to_string)
                }
            }
            TopicIdType::Predefined => {
                if self.topics.is_predefined(topic_id) {
                    self.topics.get_topic_name(topic_id).map(str::to_string)
                } else {
                    None
                }
            }
            TopicIdType::Short => Some(sensor::short_topic_name(topic_id)),
        };
        let Some(topic) = topic else {
            log::info!(
                "[SESSION] {} PUBLISH on invalid topic id {} ({:?})",
                self.address,
                topic_id,
                flags.topic_id_type
            );
            self.reply_invalid_topic_puback(topic_id, msg_id);
            return;
        };

        let qos = flags.qos.level().unwrap_or(0);
        let sent = self.send_broker(MqttMessage::Publish(broker::Publish {
            dup: flags.dup,
            qos,
            retain: flags.retain,
            topic,
            msg_id,
            payload: data,
        }));
        // QoS 2 is relayed without tracking
        if sent && qos == 1 {
            self.handshakes.puback = true;
            self.pending.publish = Some(PendingPublish { topic_id, msg_id });
        }
    }

    fn handle_puback(&mut self, topic_id: u16, msg_id: u16, return_code: ReturnCode) {
        if !self.is_connected() {
            self.reject_not_connected("PUBACK");
            return;
        }
        if return_code == ReturnCode::InvalidTopicId {
            if self.topics.remove_id(topic_id) {
                log::info!(
                    "[SESSION] {} device rejected topic id {}, mapping removed",
                    self.address,
                    topic_id
                );
            }
            return;
        }
        self.send_broker(MqttMessage::Puback { msg_id });
    }

    fn relay_to_broker(&mut self, what: &str, msg: MqttMessage) {
        if !self.is_connected() {
            self.reject_not_connected(what);
            return;
        }
        self.send_broker(msg);
    }

    /// Broker topic name for a SUBSCRIBE/UNSUBSCRIBE reference.
    fn resolve_request_topic(&self, topic: &TopicRef) -> Option<String> {
        match topic {
            TopicRef::Name(name) => Some(name.clone()),
            TopicRef::Short(bytes) => Some(sensor::short_topic_str(bytes)),
            TopicRef::Predefined(id) if self.topics.is_predefined(*id) => {
                self.topics.get_topic_name(*id).map(str::to_string)
            }
            TopicRef::Predefined(_) => None,
        }
    }

    fn handle_subscribe(&mut self, flags: Flags, msg_id: u16, topic: TopicRef) {
        if !self.is_connected() {
            self.reject_not_connected("SUBSCRIBE");
            return;
        }
        if self.handshakes.suback {
            log::debug!(
                "[SESSION] {} SUBSCRIBE already in flight, msg_id {} dropped",
                self.address,
                msg_id
            );
            return;
        }
        let Some(topic_name) = self.resolve_request_topic(&topic) else {
            let id = match topic {
                TopicRef::Predefined(id) => id,
                _ => 0,
            };
            self.send_device(SnMessage::Suback {
                flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Predefined),
                topic_id: id,
                msg_id,
                return_code: ReturnCode::InvalidTopicId,
            });
            return;
        };

        let requested = flags.qos.level().unwrap_or(0);
        let sent = self.send_broker(MqttMessage::Subscribe {
            dup: flags.dup,
            msg_id,
            topics: vec![(topic_name.clone(), requested)],
        });
        if sent {
            self.handshakes.suback = true;
            self.pending.subscribe = Some(PendingRequest {
                msg_id,
                topic,
                topic_name,
            });
        }
    }

    fn handle_unsubscribe(&mut self, flags: Flags, msg_id: u16, topic: TopicRef) {
        if !self.is_connected() {
            self.reject_not_connected("UNSUBSCRIBE");
            return;
        }
        if self.handshakes.unsuback {
            log::debug!(
                "[SESSION] {} UNSUBSCRIBE already in flight, msg_id {} dropped",
                self.address,
                msg_id
            );
            return;
        }
        let Some(topic_name) = self.resolve_request_topic(&topic) else {
            log::debug!(
                "[SESSION] {} UNSUBSCRIBE on invalid predefined topic dropped",
                self.address
            );
            return;
        };

        let sent = self.send_broker(MqttMessage::Unsubscribe {
            dup: flags.dup,
            msg_id,
            topics: vec![topic_name.clone()],
        });
        if sent {
            self.handshakes.unsuback = true;
            self.pending.unsubscribe = Some(PendingRequest {
                msg_id,
                topic,
                topic_name,
            });
        }
    }

    fn handle_disconnect(&mut self) {
        if !self.is_connected() && !self.handshakes.establishing() {
            log::debug!("[SESSION] {} DISCONNECT while not connected", self.address);
            return;
        }
        log::info!("[SESSION] {} DISCONNECT from device", self.address);
        if self.broker.is_open() {
            let _ = self.broker.send(&MqttMessage::Disconnect);
        }
        self.disconnect_device();
    }

    // -----------------------------------------------------------------------
    // Broker side
    // -----------------------------------------------------------------------

    pub fn on_broker_message(&mut self, msg: MqttMessage) {
        self.touch();

        if let MqttMessage::Connack { return_code } = msg {
            self.handle_connack(return_code);
            return;
        }
        if !self.is_connected() {
            log::debug!(
                "[SESSION] {} broker {} while not connected dropped",
                self.address,
                msg.name()
            );
            return;
        }

        match msg {
            MqttMessage::Publish(publish) => self.handle_broker_publish(publish),
            MqttMessage::Puback { msg_id } => self.handle_broker_puback(msg_id),
            MqttMessage::Pubrec { msg_id } => self.send_device(SnMessage::Pubrec { msg_id }),
            MqttMessage::Pubrel { msg_id } => self.send_device(SnMessage::Pubrel { msg_id }),
            MqttMessage::Pubcomp { msg_id } => self.send_device(SnMessage::Pubcomp { msg_id }),
            MqttMessage::Suback { msg_id, granted_qos } => {
                self.handle_suback(msg_id, granted_qos.first().copied().unwrap_or(0))
            }
            MqttMessage::Unsuback { msg_id } => self.handle_unsuback(msg_id),
            MqttMessage::Pingreq => self.send_device(SnMessage::Pingreq { client_id: None }),
            MqttMessage::Pingresp => self.send_device(SnMessage::Pingresp),
            other => log::debug!(
                "[SESSION] {} unexpected broker {} dropped",
                self.address,
                other.name()
            ),
        }
    }

    fn handle_connack(&mut self, return_code: u8) {
        if !self.handshakes.connack {
            log::debug!("[SESSION] {} unexpected CONNACK dropped", self.address);
            return;
        }
        self.handshakes.connack = false;

        if return_code != broker::CONNACK_ACCEPTED {
            log::warn!(
                "[SESSION] {} broker refused '{}' (return code {})",
                self.address,
                self.client_id,
                return_code
            );
            self.disconnect_device();
            return;
        }
        self.state = ClientState::Connected;
        log::info!(
            "[SESSION] {} connected as '{}'",
            self.address,
            self.client_id
        );
        self.send_device(SnMessage::Connack {
            return_code: ReturnCode::Accepted,
        });
    }

    fn handle_broker_publish(&mut self, publish: broker::Publish) {
        let max = self.ctx.config.max_frame_length;
        if publish.payload.len() > max.saturating_sub(7) {
            log::warn!(
                "[SESSION] {} PUBLISH payload of {} bytes too long for the device",
                self.address,
                publish.payload.len()
            );
            return;
        }
        if publish.topic.len() > max.saturating_sub(6) {
            log::warn!(
                "[SESSION] {} PUBLISH topic '{}' too long for the device",
                self.address,
                publish.topic
            );
            return;
        }

        let qos = QoS::from_level(publish.qos).unwrap_or_default();
        let topic_id = self.topics.get_topic_id(&publish.topic);
        if topic_id != 0 {
            let id_type = if self.topics.is_predefined(topic_id) {
                TopicIdType::Predefined
            } else {
                TopicIdType::Normal
            };
            self.send_device(SnMessage::Publish {
                flags: Flags::data(publish.dup, qos, publish.retain, id_type),
                topic_id,
                msg_id: publish.msg_id,
                data: publish.payload,
            });
            return;
        }

        if let Some(short) = sensor::short_topic_id(&publish.topic) {
            self.send_device(SnMessage::Publish {
                flags: Flags::data(publish.dup, qos, publish.retain, TopicIdType::Short),
                topic_id: short,
                msg_id: publish.msg_id,
                data: publish.payload,
            });
            return;
        }

        if self.handshakes.regack {
            log::debug!(
                "[SESSION] {} REGISTER outstanding, PUBLISH on '{}' dropped",
                self.address,
                publish.topic
            );
            return;
        }

        let Some(topic_id) = self.topics.allocate_id() else {
            log::warn!(
                "[SESSION] {} topic id space exhausted, PUBLISH on '{}' dropped",
                self.address,
                publish.topic
            );
            return;
        };
        let register = PendingRegister {
            topic_id,
            msg_id: self.new_msg_id(),
            topic_name: publish.topic.clone(),
        };
        self.send_device(SnMessage::Register {
            topic_id: register.topic_id,
            msg_id: register.msg_id,
            topic_name: register.topic_name.clone(),
        });
        self.pending.register = Some(register);
        self.pending.broker_publish = Some(publish);
        self.handshakes.regack = true;
        self.handshakes.register_tries = 1;
        self.ctx.timers.register(
            &self.address,
            ControlKind::WaitingRegackTimeout,
            self.waiting_time(),
        );
    }

    fn handle_broker_puback(&mut self, msg_id: u16) {
        if !self.handshakes.puback {
            log::debug!("[SESSION] {} unexpected PUBACK dropped", self.address);
            return;
        }
        let Some(pending) = &self.pending.publish else {
            self.handshakes.puback = false;
            return;
        };
        if pending.msg_id != msg_id {
            log::debug!(
                "[SESSION] {} PUBACK msg_id {} does not match {}",
                self.address,
                msg_id,
                pending.msg_id
            );
            return;
        }
        let topic_id = pending.topic_id;
        self.handshakes.puback = false;
        self.pending.publish = None;
        self.send_device(SnMessage::Puback {
            topic_id,
            msg_id,
            return_code: ReturnCode::Accepted,
        });
    }

    fn handle_suback(&mut self, msg_id: u16, granted: u8) {
        if !self.handshakes.suback {
            log::debug!("[SESSION] {} unexpected SUBACK dropped", self.address);
            return;
        }
        let Some(request) = self.pending.subscribe.take() else {
            self.handshakes.suback = false;
            return;
        };
        if request.msg_id != msg_id {
            log::debug!(
                "[SESSION] {} SUBACK msg_id {} does not match {}",
                self.address,
                msg_id,
                request.msg_id
            );
            self.pending.subscribe = Some(request);
            return;
        }
        self.handshakes.suback = false;

        let (id_type, topic_id) = match &request.topic {
            TopicRef::Name(name) if topics::is_wildcard(name) => (TopicIdType::Normal, 0),
            TopicRef::Name(name) => (TopicIdType::Normal, self.topics.register(name).unwrap_or(0)),
            TopicRef::Short(bytes) => (TopicIdType::Short, u16::from_be_bytes(*bytes)),
            TopicRef::Predefined(id) => (TopicIdType::Predefined, *id),
        };
        let qos = QoS::from_level(granted).unwrap_or_default();
        self.send_device(SnMessage::Suback {
            flags: Flags::data(false, qos, false, id_type),
            topic_id,
            msg_id,
            return_code: ReturnCode::Accepted,
        });
    }

    fn handle_unsuback(&mut self, msg_id: u16) {
        if !self.handshakes.unsuback {
            log::debug!("[SESSION] {} unexpected UNSUBACK dropped", self.address);
            return;
        }
        let Some(request) = self.pending.unsubscribe.take() else {
            self.handshakes.unsuback = false;
            return;
        };
        if request.msg_id != msg_id {
            log::debug!(
                "[SESSION] {} UNSUBACK msg_id {} does not match {}",
                self.address,
                msg_id,
                request.msg_id
            );
            self.pending.unsubscribe = Some(request);
            return;
        }
        self.handshakes.unsuback = false;
        if matches!(request.topic, TopicRef::Name(_)) {
            self.topics.remove_name(&request.topic_name);
        }
        self.send_device(SnMessage::Unsuback { msg_id });
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    pub fn on_control_message(&mut self, kind: ControlKind) -> Disposition {
        match kind {
            ControlKind::ConnectionLost => self.connection_lost(),
            ControlKind::WaitingWillTopicTimeout => self.will_topic_timeout(),
            ControlKind::WaitingWillMsgTimeout => self.will_msg_timeout(),
            ControlKind::WaitingRegackTimeout => self.regack_timeout(),
            ControlKind::CheckInactivity => return self.check_inactivity(),
            ControlKind::ShutDown => self.shut_down(),
            ControlKind::SendKeepAlive => {}
        }
        Disposition::Keep
    }

    fn max_retries(&self) -> u32 {
        self.ctx.config.max_retries
    }

    fn will_topic_timeout(&mut self) {
        if !self.handshakes.will_topic {
            return;
        }
        if self.handshakes.will_topic_tries > self.max_retries() {
            log::debug!("[SESSION] {} WILLTOPICREQ abandoned", self.address);
            self.handshakes.will_topic = false;
            self.handshakes.will_topic_tries = 0;
            self.ctx
                .timers
                .unregister(&self.address, ControlKind::WaitingWillTopicTimeout);
            self.pending.connect = None;
        } else {
            self.send_device(SnMessage::WillTopicReq);
            self.handshakes.will_topic_tries += 1;
        }
    }

    fn will_msg_timeout(&mut self) {
        if !self.handshakes.will_msg {
            return;
        }
        if self.handshakes.will_msg_tries > self.max_retries() {
            log::debug!("[SESSION] {} WILLMSGREQ abandoned", self.address);
            self.handshakes.will_msg = false;
            self.handshakes.will_msg_tries = 0;
            self.ctx
                .timers
                .unregister(&self.address, ControlKind::WaitingWillMsgTimeout);
            self.pending.connect = None;
            self.pending.will_topic = None;
        } else {
            self.send_device(SnMessage::WillMsgReq);
            self.handshakes.will_msg_tries += 1;
        }
    }

    fn regack_timeout(&mut self) {
        if !self.handshakes.regack {
            return;
        }
        if self.handshakes.register_tries > self.max_retries() || self.pending.register.is_none() {
            log::debug!("[SESSION] {} REGISTER abandoned", self.address);
            self.finish_register();
            return;
        }
        let msg_id = self.new_msg_id();
        if let Some(register) = self.pending.register.as_mut() {
            register.msg_id = msg_id;
            let msg = SnMessage::Register {
                topic_id: register.topic_id,
                msg_id,
                topic_name: register.topic_name.clone(),
            };
            self.send_device(msg);
            self.handshakes.register_tries += 1;
        }
    }

    fn check_inactivity(&mut self) -> Disposition {
        if Instant::now() <= self.deadline {
            return Disposition::Keep;
        }
        log::info!("[SESSION] {} inactive, removing", self.address);
        self.broker.close();
        self.ctx.timers.unregister_all(&self.address);
        Disposition::Remove
    }

    fn shut_down(&mut self) {
        if (self.is_connected() || self.handshakes.establishing()) && self.broker.is_open() {
            let _ = self.broker.send(&MqttMessage::Disconnect);
        }
        self.broker.close();
        self.ctx.timers.unregister_all(&self.address);
    }

    fn connection_lost(&mut self) {
        if !self.is_connected() && !self.handshakes.establishing() {
            return;
        }
        log::warn!(
            "[SESSION] {} lost its broker connection",
            self.address
        );
        self.disconnect_device();
    }

    /// Tear the session down and tell the device.
    fn disconnect_device(&mut self) {
        self.send_device(SnMessage::Disconnect { duration: None });
        self.state = ClientState::Disconnected;
        self.ctx.timers.unregister_all(&self.address);
        self.handshakes = Handshakes::default();
        self.pending = Pending::default();
        self.broker.close();
    }
}
