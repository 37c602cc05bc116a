// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Dispatcher main loop.
//
// Drains the shared queue on a single thread, resolves the target session
// for each envelope and routes it to the matching entry point.

use std::sync::Arc;

use crate::address::Address;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::GatewaySession;
use crate::link::{DeviceLink, LinkFactory};
use crate::queue::{ControlKind, Envelope, MessageQueue, Payload};
use crate::sensor::SnMessage;
use crate::session::{ClientSession, Disposition, SessionContext};

/// Outcome of dispatching one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Owner of the session table and the gateway self-session.
pub struct Dispatcher {
    ctx: SessionContext,
    gateway: GatewaySession,
    sessions: Vec<ClientSession>,
}

impl Dispatcher {
    /// Validate the configuration and build an idle dispatcher.
    pub fn new(
        config: GatewayConfig,
        links: Arc<dyn LinkFactory>,
        queue: Arc<MessageQueue>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let ctx = SessionContext::new(Arc::new(config), queue, links);
        let gateway = GatewaySession::new(ctx.clone());
        Ok(Self {
            ctx,
            gateway,
            sessions: Vec::new(),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.ctx.queue
    }

    pub fn gateway(&self) -> &GatewaySession {
        &self.gateway
    }

    pub fn session(&self, address: &Address) -> Option<&ClientSession> {
        self.sessions.iter().find(|s| s.address() == address)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn put_message(&self, envelope: Envelope) {
        self.ctx.queue.put(envelope);
    }

    /// Connect the gateway self-session to the broker.
    pub fn bootstrap(&mut self) -> Result<(), GatewayError> {
        self.gateway.connect()
    }

    /// Bootstrap, then dispatch until SHUT_DOWN or a fatal gateway error.
    pub fn run(&mut self) -> Result<(), GatewayError> {
        let result = self.bootstrap().and_then(|()| loop {
            let envelope = self.ctx.queue.take();
            if self.dispatch(envelope)? == Flow::Stop {
                break Ok(());
            }
        });
        if let Err(e) = &result {
            log::error!("[DISPATCHER] fatal: {}", e);
            self.shut_down_all();
        }
        result
    }

    /// Dispatch every envelope already queued.
    pub fn drain(&mut self) -> Result<Flow, GatewayError> {
        while let Some(envelope) = self.ctx.queue.try_take() {
            if self.dispatch(envelope)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Route one envelope.
    pub fn dispatch(&mut self, envelope: Envelope) -> Result<Flow, GatewayError> {
        let Envelope { address, payload } = envelope;
        match payload {
            Payload::Control(kind) => match address {
                None => return Ok(self.broadcast_control(kind)),
                Some(address) => self.dispatch_control(&address, kind)?,
            },
            Payload::Sensor { message, link } => match address {
                Some(address) => self.dispatch_sensor(address, message, link)?,
                None => log::debug!("[DISPATCHER] unaddressed {} dropped", message.name()),
            },
            Payload::Broker(message) => match address {
                Some(address) if address == *self.gateway.address() => {
                    self.gateway.on_broker_message(message)?
                }
                Some(address) => match self.session_mut(&address) {
                    Some(session) => session.on_broker_message(message),
                    None => log::debug!(
                        "[DISPATCHER] broker {} for unknown {} dropped",
                        message.name(),
                        address
                    ),
                },
                None => log::debug!("[DISPATCHER] unaddressed {} dropped", message.name()),
            },
        }
        Ok(Flow::Continue)
    }

    fn session_mut(&mut self, address: &Address) -> Option<&mut ClientSession> {
        self.sessions.iter_mut().find(|s| s.address() == address)
    }

    fn dispatch_sensor(
        &mut self,
        address: Address,
        message: SnMessage,
        link: Arc<dyn DeviceLink>,
    ) -> Result<(), GatewayError> {
        if address == *self.gateway.address() {
            return self.gateway.on_sensor_message(message, link);
        }

        let index = match self.sessions.iter().position(|s| *s.address() == address) {
            Some(index) => {
                self.sessions[index].refresh_address(&address);
                index
            }
            None => {
                self.sessions.push(ClientSession::new(address, self.ctx.clone()));
                self.sessions.len() - 1
            }
        };
        self.sessions[index].on_sensor_message(message, link);
        Ok(())
    }

    fn dispatch_control(
        &mut self,
        address: &Address,
        kind: ControlKind,
    ) -> Result<(), GatewayError> {
        if *address == *self.gateway.address() {
            return self.gateway.on_control_message(kind);
        }
        let Some(index) = self.sessions.iter().position(|s| s.address() == address) else {
            log::debug!(
                "[DISPATCHER] {} for unknown {} dropped",
                kind.name(),
                address
            );
            return Ok(());
        };
        if self.sessions[index].on_control_message(kind) == Disposition::Remove {
            let session = self.sessions.remove(index);
            log::info!("[DISPATCHER] session {} removed", session.address());
        }
        Ok(())
    }

    /// Deliver a control message to the gateway and then every session.
    fn broadcast_control(&mut self, kind: ControlKind) -> Flow {
        if kind == ControlKind::ShutDown {
            self.shut_down_all();
            return Flow::Stop;
        }
        if let Err(e) = self.gateway.on_control_message(kind) {
            log::warn!("[DISPATCHER] gateway {} failed: {}", kind.name(), e);
        }
        let before = self.sessions.len();
        self.sessions
            .retain_mut(|s| s.on_control_message(kind) == Disposition::Keep);
        let removed = before - self.sessions.len();
        if removed > 0 {
            log::info!("[DISPATCHER] {} removed {} session(s)", kind.name(), removed);
        }
        Flow::Continue
    }

    fn shut_down_all(&mut self) {
        log::info!(
            "[DISPATCHER] shutting down {} session(s)",
            self.sessions.len()
        );
        let _ = self.gateway.on_control_message(ControlKind::ShutDown);
        for session in &mut self.sessions {
            session.on_control_message(ControlKind::ShutDown);
        }
        self.ctx.timers.shutdown();
    }
}
