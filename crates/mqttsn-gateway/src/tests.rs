// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Tests for mqttsn-gateway.
//
// Scenario tests drive the dispatcher with recording device and broker
// links: connection setup, topic registration, subscriptions, retries,
// gateway keep-alive and shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::address::{Address, Encapsulation};
use crate::broker::{self, MqttMessage};
use crate::config::{DeviceLinkConfig, GatewayConfig, PredefinedTopic};
use crate::dispatcher::{Dispatcher, Flow};
use crate::error::{GatewayError, LinkError};
use crate::link::{BrokerLink, DeviceLink, LinkFactory};
use crate::queue::{ControlKind, Envelope, MessageQueue};
use crate::sensor::{self, Flags, QoS, ReturnCode, SnMessage, TopicIdType, TopicRef};
use crate::session::ClientState;

// -----------------------------------------------------------------------
// Mocks
// -----------------------------------------------------------------------

#[derive(Default)]
struct RecordingDeviceLink {
    sent: Mutex<Vec<(Address, SnMessage)>>,
    broadcasts: Mutex<Vec<(u8, SnMessage)>>,
    closed: AtomicBool,
}

impl RecordingDeviceLink {
    fn take_sent(&self) -> Vec<(Address, SnMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn take_to(&self, to: &Address) -> Vec<SnMessage> {
        self.take_sent()
            .into_iter()
            .filter(|(a, _)| a == to)
            .map(|(_, m)| m)
            .collect()
    }

    fn take_broadcasts(&self) -> Vec<(u8, SnMessage)> {
        std::mem::take(&mut *self.broadcasts.lock())
    }
}

impl DeviceLink for RecordingDeviceLink {
    fn name(&self) -> &str {
        "mock"
    }

    fn receive(&self) -> Result<Option<(Address, Vec<u8>)>, LinkError> {
        Ok(None)
    }

    fn send(&self, to: &Address, msg: &SnMessage) -> Result<(), LinkError> {
        self.sent.lock().push((to.clone(), msg.clone()));
        Ok(())
    }

    fn broadcast(&self, msg: &SnMessage) -> Result<(), LinkError> {
        self.broadcast_radius(0, msg)
    }

    fn broadcast_radius(&self, radius: u8, msg: &SnMessage) -> Result<(), LinkError> {
        self.broadcasts.lock().push((radius, msg.clone()));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct BrokerState {
    sent: Vec<MqttMessage>,
    open: bool,
    opens: usize,
    fail_open: bool,
    fail_send: bool,
}

struct RecordingBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl BrokerLink for RecordingBroker {
    fn open(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(LinkError::NotOpen);
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn send(&mut self, msg: &MqttMessage) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(LinkError::NotOpen);
        }
        if state.fail_send {
            state.open = false;
            return Err(LinkError::Send(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        state.sent.push(msg.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[derive(Default)]
struct MockLinks {
    device: Arc<RecordingDeviceLink>,
    brokers: Mutex<Vec<(Address, Arc<Mutex<BrokerState>>)>>,
    fail_broker_open: AtomicBool,
    fail_device_links: AtomicBool,
    device_links_opened: AtomicUsize,
}

impl MockLinks {
    fn broker(&self, owner: &Address) -> Arc<Mutex<BrokerState>> {
        self.brokers
            .lock()
            .iter()
            .rev()
            .find(|(a, _)| a == owner)
            .map(|(_, s)| Arc::clone(s))
            .expect("no broker link for owner")
    }

    fn take_broker_sent(&self, owner: &Address) -> Vec<MqttMessage> {
        std::mem::take(&mut self.broker(owner).lock().sent)
    }

    fn link(&self) -> Arc<dyn DeviceLink> {
        Arc::clone(&self.device) as Arc<dyn DeviceLink>
    }
}

impl LinkFactory for MockLinks {
    fn broker_link(&self, owner: &Address) -> Box<dyn BrokerLink> {
        let state = Arc::new(Mutex::new(BrokerState {
            fail_open: self.fail_broker_open.load(Ordering::SeqCst),
            ..Default::default()
        }));
        self.brokers.lock().push((owner.clone(), Arc::clone(&state)));
        Box::new(RecordingBroker { state })
    }

    fn device_link(&self, _config: &DeviceLinkConfig) -> Result<Arc<dyn DeviceLink>, LinkError> {
        if self.fail_device_links.load(Ordering::SeqCst) {
            return Err(LinkError::NotOpen);
        }
        self.device_links_opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.link())
    }
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn test_config() -> GatewayConfig {
    GatewayConfig {
        predefined_topic_id_size: 3,
        predefined_topics: vec![PredefinedTopic {
            id: 1,
            name: "sys/clock".into(),
        }],
        max_retries: 2,
        waiting_time_secs: 60,
        ..Default::default()
    }
}

fn setup_with(config: GatewayConfig) -> (Dispatcher, Arc<MockLinks>) {
    let links = Arc::new(MockLinks::default());
    let factory: Arc<dyn LinkFactory> = Arc::clone(&links) as Arc<dyn LinkFactory>;
    let dispatcher = Dispatcher::new(config, factory, Arc::new(MessageQueue::new())).unwrap();
    (dispatcher, links)
}

fn setup() -> (Dispatcher, Arc<MockLinks>) {
    setup_with(test_config())
}

fn gateway_addr() -> Address {
    Address::gateway(1)
}

fn device(port: u16) -> Address {
    let endpoint: SocketAddr = ([127, 0, 0, 1], port).into();
    Address::device(endpoint)
}

/// Bootstrap the gateway and accept its CONNECT.
fn start_gateway(d: &mut Dispatcher, links: &MockLinks) {
    d.bootstrap().unwrap();
    d.put_message(Envelope::broker(
        gateway_addr(),
        MqttMessage::Connack { return_code: 0 },
    ));
    assert_eq!(d.drain().unwrap(), Flow::Continue);
    links.take_broker_sent(&gateway_addr());
    links.device.take_sent();
}

fn from_device(d: &mut Dispatcher, links: &MockLinks, addr: &Address, msg: SnMessage) {
    d.put_message(Envelope::sensor(addr.clone(), msg, links.link()));
    d.drain().unwrap();
}

fn from_broker(d: &mut Dispatcher, addr: &Address, msg: MqttMessage) {
    d.put_message(Envelope::broker(addr.clone(), msg));
    d.drain().unwrap();
}

fn control(d: &mut Dispatcher, addr: &Address, kind: ControlKind) {
    d.put_message(Envelope::control(Some(addr.clone()), kind));
    d.drain().unwrap();
}

fn connect_msg(client_id: &str, will: bool) -> SnMessage {
    SnMessage::Connect {
        flags: Flags {
            will,
            clean_session: true,
            ..Default::default()
        },
        protocol_id: sensor::PROTOCOL_ID,
        duration: 30,
        client_id: client_id.into(),
    }
}

/// Bring a device session to Connected and clear the recordings.
fn connect_device(d: &mut Dispatcher, links: &MockLinks, addr: &Address) {
    from_device(d, links, addr, connect_msg("d1", false));
    from_broker(d, addr, MqttMessage::Connack { return_code: 0 });
    assert_eq!(d.session(addr).unwrap().state(), ClientState::Connected);
    links.device.take_sent();
    links.take_broker_sent(addr);
}

fn publish_msg(qos: QoS, id_type: TopicIdType, topic_id: u16, msg_id: u16) -> SnMessage {
    SnMessage::Publish {
        flags: Flags::data(false, qos, false, id_type),
        topic_id,
        msg_id,
        data: b"42".to_vec(),
    }
}

fn broker_publish(topic: &str, payload: &[u8]) -> MqttMessage {
    MqttMessage::Publish(broker::Publish {
        dup: false,
        qos: 0,
        retain: false,
        topic: topic.into(),
        msg_id: 0,
        payload: payload.to_vec(),
    })
}

// -----------------------------------------------------------------------
// 1. Connection setup
// -----------------------------------------------------------------------

#[test]
fn test_connect_waits_for_broker_connack() {
    let (mut d, links) = setup();
    let dev = device(5000);

    from_device(&mut d, &links, &dev, connect_msg("d1", false));

    let sent = links.take_broker_sent(&dev);
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        MqttMessage::Connect(c) => {
            assert_eq!(c.client_id, "d1");
            assert_eq!(c.keep_alive, 30);
            assert_eq!(c.protocol_name, broker::PROTOCOL_NAME);
            assert!(c.clean_session);
            assert!(c.will.is_none());
        }
        other => panic!("expected CONNECT, got {:?}", other),
    }
    // no premature CONNACK
    assert!(links.device.take_sent().is_empty());
    let session = d.session(&dev).unwrap();
    assert_eq!(session.state(), ClientState::NotConnected);
    assert!(session.handshakes().connack);

    from_broker(&mut d, &dev, MqttMessage::Connack { return_code: 0 });
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Connack {
            return_code: ReturnCode::Accepted
        }]
    );
    let session = d.session(&dev).unwrap();
    assert_eq!(session.state(), ClientState::Connected);
    assert_eq!(session.client_id(), "d1");
    assert!(!session.handshakes().establishing());
}

#[test]
fn test_connect_refused_by_broker() {
    let (mut d, links) = setup();
    let dev = device(5001);

    from_device(&mut d, &links, &dev, connect_msg("d1", false));
    from_broker(&mut d, &dev, MqttMessage::Connack { return_code: 5 });

    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Disconnect { duration: None }]
    );
    assert_eq!(d.session(&dev).unwrap().state(), ClientState::Disconnected);
    assert!(!links.broker(&dev).lock().open);
}

#[test]
fn test_connect_with_will_handshake() {
    let (mut d, links) = setup();
    let dev = device(5002);
    let timers = Arc::clone(&d.context().timers);

    from_device(&mut d, &links, &dev, connect_msg("d1", true));
    assert_eq!(links.device.take_to(&dev), vec![SnMessage::WillTopicReq]);
    assert_eq!(timers.count(&dev, ControlKind::WaitingWillTopicTimeout), 1);
    assert!(links.take_broker_sent(&dev).is_empty());

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::WillTopic {
            flags: Some(Flags::data(false, QoS::AtLeastOnce, true, TopicIdType::Normal)),
            topic: "dev/status".into(),
        },
    );
    assert_eq!(links.device.take_to(&dev), vec![SnMessage::WillMsgReq]);
    assert!(!timers.is_registered(&dev, ControlKind::WaitingWillTopicTimeout));
    assert!(timers.is_registered(&dev, ControlKind::WaitingWillMsgTimeout));

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::WillMsg {
            message: b"gone".to_vec(),
        },
    );
    assert!(!timers.is_registered(&dev, ControlKind::WaitingWillMsgTimeout));

    let sent = links.take_broker_sent(&dev);
    match &sent[..] {
        [MqttMessage::Connect(c)] => {
            assert_eq!(
                c.will,
                Some(broker::Will {
                    topic: "dev/status".into(),
                    message: b"gone".to_vec(),
                    qos: 1,
                    retain: true,
                })
            );
        }
        other => panic!("expected one CONNECT, got {:?}", other),
    }
    assert!(d.session(&dev).unwrap().handshakes().connack);
}

#[test]
fn test_duplicate_connect_does_not_add_timer() {
    let (mut d, links) = setup();
    let dev = device(5003);
    let timers = Arc::clone(&d.context().timers);

    from_device(&mut d, &links, &dev, connect_msg("d1", true));
    from_device(&mut d, &links, &dev, connect_msg("d1", true));

    assert_eq!(timers.count(&dev, ControlKind::WaitingWillTopicTimeout), 1);
    // second CONNECT dropped while establishing
    assert_eq!(links.device.take_to(&dev), vec![SnMessage::WillTopicReq]);
}

#[test]
fn test_connect_retried_when_broker_never_acknowledges() {
    let (mut d, links) = setup();
    let dev = device(5005);

    from_device(&mut d, &links, &dev, connect_msg("d1", false));
    assert_eq!(links.take_broker_sent(&dev).len(), 1);
    assert!(d.session(&dev).unwrap().handshakes().connack);

    // broker stays silent, the device tries again
    from_device(&mut d, &links, &dev, connect_msg("d2", false));
    let sent = links.take_broker_sent(&dev);
    match &sent[..] {
        [MqttMessage::Connect(c)] => assert_eq!(c.client_id, "d2"),
        other => panic!("expected one CONNECT, got {:?}", other),
    }
    {
        let broker = links.broker(&dev);
        let state = broker.lock();
        assert_eq!(state.opens, 2);
        assert!(state.open);
    }
    assert!(d.session(&dev).unwrap().handshakes().connack);

    from_broker(&mut d, &dev, MqttMessage::Connack { return_code: 0 });
    assert_eq!(d.session(&dev).unwrap().state(), ClientState::Connected);
    assert_eq!(d.session(&dev).unwrap().client_id(), "d2");
}

#[test]
fn test_connect_while_connected_is_reacknowledged() {
    let (mut d, links) = setup();
    let dev = device(5004);
    connect_device(&mut d, &links, &dev);

    from_device(&mut d, &links, &dev, connect_msg("d1", false));
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Connack {
            return_code: ReturnCode::Accepted
        }]
    );
    assert!(links.take_broker_sent(&dev).is_empty());
}

#[test]
fn test_will_topic_retries_then_abandons() {
    let (mut d, links) = setup();
    let dev = device(5005);
    let timers = Arc::clone(&d.context().timers);

    from_device(&mut d, &links, &dev, connect_msg("d1", true));
    links.device.take_sent();

    for _ in 0..4 {
        control(&mut d, &dev, ControlKind::WaitingWillTopicTimeout);
    }
    // max_retries = 2
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::WillTopicReq, SnMessage::WillTopicReq]
    );
    assert!(!d.session(&dev).unwrap().handshakes().will_topic);
    assert!(!timers.is_registered(&dev, ControlKind::WaitingWillTopicTimeout));
}

// -----------------------------------------------------------------------
// 2. Requests before CONNECT
// -----------------------------------------------------------------------

#[test]
fn test_request_before_connect_is_rejected() {
    let (mut d, links) = setup();
    let dev = device(5010);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Register {
            topic_id: 0,
            msg_id: 1,
            topic_name: "a/b".into(),
        },
    );
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Disconnect { duration: None }]
    );
    assert_eq!(d.session(&dev).unwrap().state(), ClientState::NotConnected);
    assert!(d.session(&dev).unwrap().topics().get_topic_id("a/b") == 0);
}

// -----------------------------------------------------------------------
// 3. Device publish
// -----------------------------------------------------------------------

#[test]
fn test_publish_with_unassigned_topic_id() {
    let (mut d, links) = setup();
    let dev = device(5020);
    connect_device(&mut d, &links, &dev);

    from_device(&mut d, &links, &dev, publish_msg(QoS::AtMostOnce, TopicIdType::Normal, 5, 9));
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Puback {
            topic_id: 5,
            msg_id: 9,
            return_code: ReturnCode::InvalidTopicId
        }]
    );
    assert!(links.take_broker_sent(&dev).is_empty());

    // a normal-typed id inside the predefined range is invalid too
    from_device(&mut d, &links, &dev, publish_msg(QoS::AtMostOnce, TopicIdType::Normal, 1, 10));
    assert_eq!(links.device.take_to(&dev).len(), 1);
    assert!(links.take_broker_sent(&dev).is_empty());
}

#[test]
fn test_publish_qos1_round_trip() {
    let (mut d, links) = setup();
    let dev = device(5021);
    connect_device(&mut d, &links, &dev);

    from_device(
        &mut d,
        &links,
        &dev,
        publish_msg(QoS::AtLeastOnce, TopicIdType::Predefined, 1, 5),
    );
    assert_eq!(
        links.take_broker_sent(&dev),
        vec![MqttMessage::Publish(broker::Publish {
            dup: false,
            qos: 1,
            retain: false,
            topic: "sys/clock".into(),
            msg_id: 5,
            payload: b"42".to_vec(),
        })]
    );
    assert!(d.session(&dev).unwrap().handshakes().puback);

    // second QoS 1 publish while the first is unacknowledged
    from_device(
        &mut d,
        &links,
        &dev,
        publish_msg(QoS::AtLeastOnce, TopicIdType::Predefined, 1, 6),
    );
    assert!(links.take_broker_sent(&dev).is_empty());

    from_broker(&mut d, &dev, MqttMessage::Puback { msg_id: 5 });
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Puback {
            topic_id: 1,
            msg_id: 5,
            return_code: ReturnCode::Accepted
        }]
    );
    assert!(!d.session(&dev).unwrap().handshakes().puback);
}

#[test]
fn test_publish_short_topic() {
    let (mut d, links) = setup();
    let dev = device(5022);
    connect_device(&mut d, &links, &dev);

    let id = sensor::short_topic_id("ab").unwrap();
    from_device(&mut d, &links, &dev, publish_msg(QoS::AtMostOnce, TopicIdType::Short, id, 0));
    match &links.take_broker_sent(&dev)[..] {
        [MqttMessage::Publish(p)] => assert_eq!(p.topic, "ab"),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_broker_send_failure_disconnects_device() {
    let (mut d, links) = setup();
    let dev = device(5023);
    connect_device(&mut d, &links, &dev);
    links.broker(&dev).lock().fail_send = true;

    from_device(
        &mut d,
        &links,
        &dev,
        publish_msg(QoS::AtMostOnce, TopicIdType::Predefined, 1, 0),
    );
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Disconnect { duration: None }]
    );
    assert_eq!(d.session(&dev).unwrap().state(), ClientState::Disconnected);
}

// -----------------------------------------------------------------------
// 4. Topic registration
// -----------------------------------------------------------------------

#[test]
fn test_device_register_and_puback_removal() {
    let (mut d, links) = setup();
    let dev = device(5030);
    connect_device(&mut d, &links, &dev);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Register {
            topic_id: 0,
            msg_id: 3,
            topic_name: "x/y".into(),
        },
    );
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Regack {
            topic_id: 4,
            msg_id: 3,
            return_code: ReturnCode::Accepted
        }]
    );
    assert_eq!(d.session(&dev).unwrap().topics().get_topic_id("x/y"), 4);

    // accepted PUBACK is relayed
    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Puback {
            topic_id: 4,
            msg_id: 8,
            return_code: ReturnCode::Accepted,
        },
    );
    assert_eq!(links.take_broker_sent(&dev), vec![MqttMessage::Puback { msg_id: 8 }]);

    // invalid-topic PUBACK drops the mapping and is not relayed
    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Puback {
            topic_id: 4,
            msg_id: 9,
            return_code: ReturnCode::InvalidTopicId,
        },
    );
    assert!(links.take_broker_sent(&dev).is_empty());
    assert_eq!(d.session(&dev).unwrap().topics().get_topic_id("x/y"), 0);
}

#[test]
fn test_broker_publish_registers_unknown_topic() {
    let (mut d, links) = setup();
    let dev = device(5031);
    let timers = Arc::clone(&d.context().timers);
    connect_device(&mut d, &links, &dev);

    from_broker(&mut d, &dev, broker_publish("room/temp", b"21.5"));
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Register {
            topic_id: 4,
            msg_id: 1,
            topic_name: "room/temp".into()
        }]
    );
    assert!(timers.is_registered(&dev, ControlKind::WaitingRegackTimeout));

    // second unmapped name while the REGISTER is outstanding
    from_broker(&mut d, &dev, broker_publish("room/hum", b"40"));
    assert!(links.device.take_to(&dev).is_empty());

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Regack {
            topic_id: 4,
            msg_id: 1,
            return_code: ReturnCode::Accepted,
        },
    );
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Publish {
            flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Normal),
            topic_id: 4,
            msg_id: 0,
            data: b"21.5".to_vec(),
        }]
    );
    assert!(!timers.is_registered(&dev, ControlKind::WaitingRegackTimeout));
    assert_eq!(d.session(&dev).unwrap().topics().get_topic_id("room/temp"), 4);

    // now mapped: delivered directly
    from_broker(&mut d, &dev, broker_publish("room/temp", b"22"));
    match &links.device.take_to(&dev)[..] {
        [SnMessage::Publish { topic_id, .. }] => assert_eq!(*topic_id, 4),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_rejected_regack_drops_buffered_publish() {
    let (mut d, links) = setup();
    let dev = device(5032);
    connect_device(&mut d, &links, &dev);

    from_broker(&mut d, &dev, broker_publish("room/temp", b"21.5"));
    links.device.take_sent();
    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Regack {
            topic_id: 4,
            msg_id: 1,
            return_code: ReturnCode::Congestion,
        },
    );
    assert!(links.device.take_to(&dev).is_empty());
    let session = d.session(&dev).unwrap();
    assert!(!session.handshakes().regack);
    assert_eq!(session.topics().get_topic_id("room/temp"), 0);
}

#[test]
fn test_register_retries_exactly_max_retries() {
    let (mut d, links) = setup();
    let dev = device(5033);
    let timers = Arc::clone(&d.context().timers);
    connect_device(&mut d, &links, &dev);

    from_broker(&mut d, &dev, broker_publish("room/temp", b"21.5"));
    for _ in 0..4 {
        control(&mut d, &dev, ControlKind::WaitingRegackTimeout);
    }

    let registers: Vec<u16> = links
        .device
        .take_to(&dev)
        .into_iter()
        .map(|m| match m {
            SnMessage::Register { msg_id, topic_id, .. } => {
                assert_eq!(topic_id, 4);
                msg_id
            }
            other => panic!("expected REGISTER, got {:?}", other),
        })
        .collect();
    // first send plus two retransmissions, each with a fresh msg id
    assert_eq!(registers, vec![1, 2, 3]);

    let session = d.session(&dev).unwrap();
    assert!(!session.handshakes().regack);
    assert_eq!(session.handshakes().register_tries, 0);
    assert!(!timers.is_registered(&dev, ControlKind::WaitingRegackTimeout));

    // the abandoned topic can be registered again
    from_broker(&mut d, &dev, broker_publish("room/temp", b"1"));
    assert_eq!(links.device.take_to(&dev).len(), 1);
}

#[test]
fn test_broker_publish_short_and_predefined_names() {
    let (mut d, links) = setup();
    let dev = device(5034);
    connect_device(&mut d, &links, &dev);

    from_broker(&mut d, &dev, broker_publish("ab", b"1"));
    from_broker(&mut d, &dev, broker_publish("sys/clock", b"2"));
    let sent = links.device.take_to(&dev);
    assert_eq!(
        sent,
        vec![
            SnMessage::Publish {
                flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Short),
                topic_id: sensor::short_topic_id("ab").unwrap(),
                msg_id: 0,
                data: b"1".to_vec(),
            },
            SnMessage::Publish {
                flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Predefined),
                topic_id: 1,
                msg_id: 0,
                data: b"2".to_vec(),
            },
        ]
    );
}

#[test]
fn test_broker_publish_too_long_is_dropped() {
    let (mut d, links) = setup();
    let dev = device(5035);
    connect_device(&mut d, &links, &dev);

    from_broker(&mut d, &dev, broker_publish("sys/clock", &[0u8; 249]));
    assert!(links.device.take_to(&dev).is_empty());

    from_broker(&mut d, &dev, broker_publish("sys/clock", &[0u8; 248]));
    assert_eq!(links.device.take_to(&dev).len(), 1);
}

// -----------------------------------------------------------------------
// 5. Subscriptions
// -----------------------------------------------------------------------

#[test]
fn test_wildcard_subscribe_gets_topic_id_zero() {
    let (mut d, links) = setup();
    let dev = device(5040);
    connect_device(&mut d, &links, &dev);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Subscribe {
            flags: Flags::data(false, QoS::AtLeastOnce, false, TopicIdType::Normal),
            msg_id: 7,
            topic: TopicRef::Name("a/#".into()),
        },
    );
    assert_eq!(
        links.take_broker_sent(&dev),
        vec![MqttMessage::Subscribe {
            dup: false,
            msg_id: 7,
            topics: vec![("a/#".into(), 1)],
        }]
    );

    from_broker(
        &mut d,
        &dev,
        MqttMessage::Suback {
            msg_id: 7,
            granted_qos: vec![1],
        },
    );
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Suback {
            flags: Flags::data(false, QoS::AtLeastOnce, false, TopicIdType::Normal),
            topic_id: 0,
            msg_id: 7,
            return_code: ReturnCode::Accepted,
        }]
    );
}

#[test]
fn test_subscribe_name_registers_topic_and_unsubscribe_removes_it() {
    let (mut d, links) = setup();
    let dev = device(5041);
    connect_device(&mut d, &links, &dev);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Subscribe {
            flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Normal),
            msg_id: 2,
            topic: TopicRef::Name("home/door".into()),
        },
    );
    from_broker(
        &mut d,
        &dev,
        MqttMessage::Suback {
            msg_id: 2,
            granted_qos: vec![0],
        },
    );
    match &links.device.take_to(&dev)[..] {
        [SnMessage::Suback { topic_id, .. }] => assert_eq!(*topic_id, 4),
        other => panic!("expected SUBACK, got {:?}", other),
    }
    assert_eq!(d.session(&dev).unwrap().topics().get_topic_id("home/door"), 4);
    links.take_broker_sent(&dev);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Unsubscribe {
            flags: Flags::default(),
            msg_id: 3,
            topic: TopicRef::Name("home/door".into()),
        },
    );
    assert_eq!(
        links.take_broker_sent(&dev),
        vec![MqttMessage::Unsubscribe {
            dup: false,
            msg_id: 3,
            topics: vec!["home/door".into()],
        }]
    );
    from_broker(&mut d, &dev, MqttMessage::Unsuback { msg_id: 3 });
    assert_eq!(links.device.take_to(&dev), vec![SnMessage::Unsuback { msg_id: 3 }]);
    assert_eq!(d.session(&dev).unwrap().topics().get_topic_id("home/door"), 0);
}

#[test]
fn test_subscribe_invalid_predefined_id() {
    let (mut d, links) = setup();
    let dev = device(5042);
    connect_device(&mut d, &links, &dev);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Subscribe {
            flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Predefined),
            msg_id: 4,
            topic: TopicRef::Predefined(2),
        },
    );
    assert!(links.take_broker_sent(&dev).is_empty());
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Suback {
            flags: Flags::data(false, QoS::AtMostOnce, false, TopicIdType::Predefined),
            topic_id: 2,
            msg_id: 4,
            return_code: ReturnCode::InvalidTopicId,
        }]
    );
}

#[test]
fn test_suback_with_wrong_msg_id_is_ignored() {
    let (mut d, links) = setup();
    let dev = device(5043);
    connect_device(&mut d, &links, &dev);

    from_device(
        &mut d,
        &links,
        &dev,
        SnMessage::Subscribe {
            flags: Flags::default(),
            msg_id: 11,
            topic: TopicRef::Predefined(1),
        },
    );
    from_broker(
        &mut d,
        &dev,
        MqttMessage::Suback {
            msg_id: 12,
            granted_qos: vec![0],
        },
    );
    assert!(links.device.take_to(&dev).is_empty());
    assert!(d.session(&dev).unwrap().handshakes().suback);

    from_broker(
        &mut d,
        &dev,
        MqttMessage::Suback {
            msg_id: 11,
            granted_qos: vec![0],
        },
    );
    match &links.device.take_to(&dev)[..] {
        [SnMessage::Suback { flags, topic_id, .. }] => {
            assert_eq!(flags.topic_id_type, TopicIdType::Predefined);
            assert_eq!(*topic_id, 1);
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

// -----------------------------------------------------------------------
// 6. Relays and disconnect
// -----------------------------------------------------------------------

#[test]
fn test_ping_and_qos2_relay() {
    let (mut d, links) = setup();
    let dev = device(5050);
    connect_device(&mut d, &links, &dev);

    from_device(&mut d, &links, &dev, SnMessage::Pingreq { client_id: None });
    from_device(&mut d, &links, &dev, SnMessage::Pubrec { msg_id: 3 });
    assert_eq!(
        links.take_broker_sent(&dev),
        vec![MqttMessage::Pingreq, MqttMessage::Pubrec { msg_id: 3 }]
    );

    from_broker(&mut d, &dev, MqttMessage::Pingresp);
    from_broker(&mut d, &dev, MqttMessage::Pubrel { msg_id: 3 });
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Pingresp, SnMessage::Pubrel { msg_id: 3 }]
    );
}

#[test]
fn test_device_disconnect() {
    let (mut d, links) = setup();
    let dev = device(5051);
    let timers = Arc::clone(&d.context().timers);
    connect_device(&mut d, &links, &dev);
    from_broker(&mut d, &dev, broker_publish("room/temp", b"1"));
    links.device.take_sent();

    from_device(&mut d, &links, &dev, SnMessage::Disconnect { duration: None });
    assert_eq!(links.take_broker_sent(&dev), vec![MqttMessage::Disconnect]);
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Disconnect { duration: None }]
    );
    let session = d.session(&dev).unwrap();
    assert_eq!(session.state(), ClientState::Disconnected);
    assert!(!session.handshakes().regack);
    assert!(!timers.is_registered(&dev, ControlKind::WaitingRegackTimeout));
    assert!(!links.broker(&dev).lock().open);
}

#[test]
fn test_broker_connection_lost() {
    let (mut d, links) = setup();
    let dev = device(5052);
    connect_device(&mut d, &links, &dev);

    control(&mut d, &dev, ControlKind::ConnectionLost);
    assert_eq!(
        links.device.take_to(&dev),
        vec![SnMessage::Disconnect { duration: None }]
    );
    assert_eq!(d.session(&dev).unwrap().state(), ClientState::Disconnected);

    // a second loss report is ignored
    control(&mut d, &dev, ControlKind::ConnectionLost);
    assert!(links.device.take_to(&dev).is_empty());
}

// -----------------------------------------------------------------------
// 7. Dispatcher
// -----------------------------------------------------------------------

#[test]
fn test_single_session_under_concurrent_first_contact() {
    let (mut d, links) = setup();
    let dev = device(5060);
    let queue = Arc::clone(d.queue());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let link = links.link();
            let dev = dev.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    queue.put(Envelope::sensor(
                        dev.clone(),
                        SnMessage::Pingreq { client_id: None },
                        Arc::clone(&link),
                    ));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    d.drain().unwrap();
    assert_eq!(d.session_count(), 1);
    assert_eq!(links.device.take_to(&dev).len(), 80);
}

#[test]
fn test_roaming_device_keeps_its_session() {
    let (mut d, links) = setup();
    let first: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let second: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let fwd = Encapsulation::Forwarder { ctrl: 0 };
    let dev_a = Address::encapsulated(vec![0xAA], first, fwd);
    let dev_b = Address::encapsulated(vec![0xAA], second, fwd);

    from_device(&mut d, &links, &dev_a, connect_msg("roamer", false));
    from_device(&mut d, &links, &dev_b, SnMessage::Pingreq { client_id: None });

    assert_eq!(d.session_count(), 1);
    assert_eq!(d.session(&dev_a).unwrap().address().endpoint(), Some(second));
    let sent = links.device.take_sent();
    let (to, _) = sent.last().unwrap();
    assert_eq!(to.endpoint(), Some(second));
}

#[test]
fn test_broker_message_for_unknown_session_is_dropped() {
    let (mut d, _links) = setup();
    d.put_message(Envelope::broker(device(5061), MqttMessage::Pingresp));
    assert_eq!(d.drain().unwrap(), Flow::Continue);
    assert_eq!(d.session_count(), 0);
}

#[test]
fn test_inactive_sessions_are_evicted() {
    let config = GatewayConfig {
        handler_timeout_secs: 0,
        ..test_config()
    };
    let (mut d, links) = setup_with(config);
    let idle = device(5062);
    connect_device(&mut d, &links, &idle);

    std::thread::sleep(Duration::from_millis(20));
    d.put_message(Envelope::broadcast(ControlKind::CheckInactivity));
    d.drain().unwrap();

    assert_eq!(d.session_count(), 0);
    assert!(!links.broker(&idle).lock().open);
}

#[test]
fn test_active_sessions_survive_the_sweep() {
    let (mut d, links) = setup();
    let dev = device(5063);
    connect_device(&mut d, &links, &dev);

    d.put_message(Envelope::broadcast(ControlKind::CheckInactivity));
    d.drain().unwrap();
    assert_eq!(d.session_count(), 1);
}

// -----------------------------------------------------------------------
// 8. Gateway self-session
// -----------------------------------------------------------------------

#[test]
fn test_gateway_bootstrap() {
    let (mut d, links) = setup();
    let gw = gateway_addr();

    d.bootstrap().unwrap();
    match &links.take_broker_sent(&gw)[..] {
        [MqttMessage::Connect(c)] => {
            assert_eq!(c.client_id, "Gateway_1");
            assert_eq!(c.keep_alive, 60);
        }
        other => panic!("expected CONNECT, got {:?}", other),
    }
    assert!(!d.gateway().is_connected());
    assert_eq!(links.device_links_opened.load(Ordering::SeqCst), 0);

    d.put_message(Envelope::broker(gw.clone(), MqttMessage::Connack { return_code: 0 }));
    d.drain().unwrap();

    assert!(d.gateway().is_connected());
    assert_eq!(d.gateway().device_links().len(), 1);
    assert_eq!(links.take_broker_sent(&gw), vec![MqttMessage::Pingreq]);
    assert!(d
        .context()
        .timers
        .is_registered(&gw, ControlKind::SendKeepAlive));
}

#[test]
fn test_gateway_bootstrap_failures() {
    let (mut d, _links) = setup();
    d.bootstrap().unwrap();
    d.put_message(Envelope::broker(gateway_addr(), MqttMessage::Connack { return_code: 5 }));
    assert!(matches!(d.drain(), Err(GatewayError::ConnectionRefused(5))));

    let (mut d, links) = setup();
    links.fail_device_links.store(true, Ordering::SeqCst);
    d.bootstrap().unwrap();
    d.put_message(Envelope::broker(gateway_addr(), MqttMessage::Connack { return_code: 0 }));
    assert!(matches!(d.drain(), Err(GatewayError::NoDeviceLinks)));

    let links = Arc::new(MockLinks::default());
    links.fail_broker_open.store(true, Ordering::SeqCst);
    let factory: Arc<dyn LinkFactory> = Arc::clone(&links) as Arc<dyn LinkFactory>;
    let mut d = Dispatcher::new(test_config(), factory, Arc::new(MessageQueue::new())).unwrap();
    assert!(matches!(d.run(), Err(GatewayError::Link(_))));
}

#[test]
fn test_invalid_config_is_rejected() {
    let links: Arc<dyn LinkFactory> = Arc::new(MockLinks::default());
    let config = GatewayConfig {
        waiting_time_secs: 0,
        ..test_config()
    };
    assert!(matches!(
        Dispatcher::new(config, links, Arc::new(MessageQueue::new())),
        Err(GatewayError::Config(crate::ConfigError::Invalid(_)))
    ));
}

#[test]
fn test_search_gw_answered_on_every_link() {
    let (mut d, links) = setup();
    start_gateway(&mut d, &links);
    let dev = device(5070);

    from_device(&mut d, &links, &dev, SnMessage::SearchGw { radius: 2 });
    assert_eq!(
        links.device.take_broadcasts(),
        vec![(
            2,
            SnMessage::GwInfo {
                gw_id: 1,
                gw_addr: Vec::new()
            }
        )]
    );
}

#[test]
fn test_qos_minus_one_publish_goes_through_gateway() {
    let (mut d, links) = setup();
    start_gateway(&mut d, &links);
    let gw = gateway_addr();
    let dev = device(5071);

    let short = sensor::short_topic_id("ab").unwrap();
    from_device(&mut d, &links, &dev, publish_msg(QoS::MinusOne, TopicIdType::Short, short, 0));
    from_device(&mut d, &links, &dev, publish_msg(QoS::MinusOne, TopicIdType::Predefined, 1, 0));
    // normal ids are not usable without a connection
    from_device(&mut d, &links, &dev, publish_msg(QoS::MinusOne, TopicIdType::Normal, 4, 0));
    // unmapped predefined id
    from_device(&mut d, &links, &dev, publish_msg(QoS::MinusOne, TopicIdType::Predefined, 2, 0));

    let topics: Vec<(String, u8)> = links
        .take_broker_sent(&gw)
        .into_iter()
        .map(|m| match m {
            MqttMessage::Publish(p) => (p.topic, p.qos),
            other => panic!("expected PUBLISH, got {:?}", other),
        })
        .collect();
    assert_eq!(topics, vec![("ab".to_string(), 0), ("sys/clock".to_string(), 0)]);
    // the device never connected
    assert!(links.take_broker_sent(&dev).is_empty());
}

#[test]
fn test_gateway_keep_alive_cycle() {
    let config = GatewayConfig {
        keep_alive_period_secs: 60,
        adv_period_secs: 120,
        checking_period_secs: 60,
        ..test_config()
    };
    let (mut d, links) = setup_with(config);
    start_gateway(&mut d, &links);
    let gw = gateway_addr();

    d.put_message(Envelope::control(Some(gw.clone()), ControlKind::SendKeepAlive));
    d.drain().unwrap();
    assert_eq!(links.take_broker_sent(&gw), vec![MqttMessage::Pingreq]);
    assert!(links.device.take_broadcasts().is_empty());

    d.put_message(Envelope::control(Some(gw.clone()), ControlKind::SendKeepAlive));
    d.drain().unwrap();
    assert_eq!(links.take_broker_sent(&gw), vec![MqttMessage::Pingreq]);
    assert_eq!(
        links.device.take_broadcasts(),
        vec![(
            0,
            SnMessage::Advertise {
                gw_id: 1,
                duration: 120
            }
        )]
    );
}

#[test]
fn test_gateway_connection_loss_is_fatal() {
    let (mut d, links) = setup();
    d.put_message(Envelope::broker(gateway_addr(), MqttMessage::Connack { return_code: 0 }));
    d.put_message(Envelope::control(Some(gateway_addr()), ControlKind::ConnectionLost));

    assert!(matches!(d.run(), Err(GatewayError::BrokerConnectionLost)));
    assert!(d.context().timers.is_empty());
    assert!(!links.broker(&gateway_addr()).lock().open);
}

#[test]
fn test_shutdown_disconnects_everything() {
    let (mut d, links) = setup();
    start_gateway(&mut d, &links);
    let gw = gateway_addr();
    let dev = device(5080);
    connect_device(&mut d, &links, &dev);

    d.put_message(Envelope::broadcast(ControlKind::ShutDown));
    assert_eq!(d.drain().unwrap(), Flow::Stop);

    assert_eq!(links.take_broker_sent(&dev), vec![MqttMessage::Disconnect]);
    assert!(!links.broker(&dev).lock().open);
    assert_eq!(links.take_broker_sent(&gw), vec![MqttMessage::Disconnect]);
    assert!(!links.broker(&gw).lock().open);
    assert!(!links.device.is_open());
    assert!(d.context().timers.is_empty());
}

#[test]
fn test_run_stops_on_shutdown() {
    let (mut d, _links) = setup();
    d.put_message(Envelope::broadcast(ControlKind::ShutDown));
    d.run().unwrap();
    assert!(!d.gateway().is_connected());
}
