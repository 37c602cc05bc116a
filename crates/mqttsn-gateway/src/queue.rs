// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatcher input queue.
//!
//! Every reader thread and timer task hands its work to the dispatcher
//! through one [`MessageQueue`]. Control messages jump the line: they are
//! inserted at the front, everything else at the back.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::address::Address;
use crate::broker::MqttMessage;
use crate::link::DeviceLink;
use crate::sensor::SnMessage;

/// Internal control signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    ConnectionLost,
    WaitingWillTopicTimeout,
    WaitingWillMsgTimeout,
    WaitingRegackTimeout,
    CheckInactivity,
    SendKeepAlive,
    ShutDown,
}

impl ControlKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::WaitingWillTopicTimeout => "WAITING_WILLTOPIC_TIMEOUT",
            Self::WaitingWillMsgTimeout => "WAITING_WILLMSG_TIMEOUT",
            Self::WaitingRegackTimeout => "WAITING_REGACK_TIMEOUT",
            Self::CheckInactivity => "CHECK_INACTIVITY",
            Self::SendKeepAlive => "SEND_KEEP_ALIVE",
            Self::ShutDown => "SHUT_DOWN",
        }
    }
}

pub enum Payload {
    /// Decoded device frame plus the link it arrived on.
    Sensor {
        message: SnMessage,
        link: Arc<dyn DeviceLink>,
    },
    Broker(MqttMessage),
    Control(ControlKind),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor { message, link } => f
                .debug_struct("Sensor")
                .field("message", message)
                .field("link", &link.name())
                .finish(),
            Self::Broker(m) => f.debug_tuple("Broker").field(m).finish(),
            Self::Control(k) => f.debug_tuple("Control").field(k).finish(),
        }
    }
}

/// Unit of work on the dispatcher queue.
#[derive(Debug)]
pub struct Envelope {
    /// Target (or source) session. `None` on a control message means broadcast.
    pub address: Option<Address>,
    pub payload: Payload,
}

impl Envelope {
    pub fn sensor(address: Address, message: SnMessage, link: Arc<dyn DeviceLink>) -> Self {
        Self {
            address: Some(address),
            payload: Payload::Sensor { message, link },
        }
    }

    pub fn broker(address: Address, message: MqttMessage) -> Self {
        Self {
            address: Some(address),
            payload: Payload::Broker(message),
        }
    }

    pub fn control(address: Option<Address>, kind: ControlKind) -> Self {
        Self {
            address,
            payload: Payload::Control(kind),
        }
    }

    /// Control message for every session.
    pub fn broadcast(kind: ControlKind) -> Self {
        Self::control(None, kind)
    }

    pub fn is_control(&self) -> bool {
        matches!(self.payload, Payload::Control(_))
    }
}

/// Blocking FIFO with a front lane for control messages.
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<Envelope>>,
    available: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, envelope: Envelope) {
        let mut items = self.items.lock();
        if envelope.is_control() {
            items.push_front(envelope);
        } else {
            items.push_back(envelope);
        }
        drop(items);
        self.available.notify_one();
    }

    /// Block until an envelope is available.
    pub fn take(&self) -> Envelope {
        let mut items = self.items.lock();
        loop {
            if let Some(envelope) = items.pop_front() {
                return envelope;
            }
            self.available.wait(&mut items);
        }
    }

    /// Like [`take`](Self::take) but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(envelope) = items.pop_front() {
                return Some(envelope);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn try_take(&self) -> Option<Envelope> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
