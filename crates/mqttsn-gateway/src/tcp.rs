// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// TCP broker link. One connection per session.

use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::address::Address;
use crate::broker::{self, MqttMessage};
use crate::error::LinkError;
use crate::link::BrokerLink;
use crate::queue::{ControlKind, Envelope, MessageQueue};

pub struct TcpBrokerLink {
    target: String,
    owner: Address,
    queue: Arc<MessageQueue>,
    stream: Option<TcpStream>,
    /// Cleared by close(); a reader error while set means the broker dropped us.
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl TcpBrokerLink {
    pub fn new(host: &str, port: u16, owner: Address, queue: Arc<MessageQueue>) -> Self {
        Self {
            target: format!("{}:{}", host, port),
            owner,
            queue,
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn spawn_reader(&self, stream: TcpStream) -> std::io::Result<JoinHandle<()>> {
        let owner = self.owner.clone();
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        std::thread::Builder::new()
            .name("mqttsn-broker-reader".into())
            .spawn(move || {
                let mut reader = BufReader::new(stream);
                loop {
                    match broker::read_frame(&mut reader) {
                        Ok(frame) => match broker::decode(&frame) {
                            Ok(msg) => {
                                log::trace!("[BROKER] {} -> {}", msg.name(), owner);
                                queue.put(Envelope::broker(owner.clone(), msg));
                            }
                            Err(e) => log::debug!("[BROKER] malformed frame for {}: {}", owner, e),
                        },
                        Err(e) => {
                            if running.swap(false, Ordering::SeqCst) {
                                log::warn!("[BROKER] connection of {} lost: {}", owner, e);
                                queue.put(Envelope::control(Some(owner), ControlKind::ConnectionLost));
                            }
                            break;
                        }
                    }
                }
            })
    }
}

impl BrokerLink for TcpBrokerLink {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.is_open() {
            return Ok(());
        }
        // Reap a connection the broker already dropped
        self.close();
        let stream = TcpStream::connect(&self.target).map_err(|source| LinkError::Connect {
            target: self.target.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;

        self.running = Arc::new(AtomicBool::new(true));
        self.reader = Some(self.spawn_reader(read_half)?);
        self.stream = Some(stream);
        log::debug!("[BROKER] {} connected to {}", self.owner, self.target);
        Ok(())
    }

    fn send(&mut self, msg: &MqttMessage) -> Result<(), LinkError> {
        let bytes = broker::encode(msg)?;
        let stream = self.stream.as_mut().ok_or(LinkError::NotOpen)?;
        if let Err(e) = stream.write_all(&bytes) {
            self.close();
            return Err(LinkError::Send(e));
        }
        log::trace!("[BROKER] {} <- {}", msg.name(), self.owner);
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("[BROKER] {} disconnected from {}", self.owner, self.target);
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some() && self.running.load(Ordering::SeqCst)
    }
}

impl Drop for TcpBrokerLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Payload;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_frames_and_connection_loss_reach_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let queue = Arc::new(MessageQueue::new());
        let owner = Address::gateway(1);

        let mut link = TcpBrokerLink::new("127.0.0.1", port, owner.clone(), Arc::clone(&queue));
        link.open().unwrap();
        assert!(link.is_open());
        let (mut server, _) = listener.accept().unwrap();

        link.send(&MqttMessage::Pingreq).unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xC0, 0x00]);

        server
            .write_all(&broker::encode(&MqttMessage::Connack { return_code: 0 }).unwrap())
            .unwrap();
        let envelope = queue.take_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(envelope.address, Some(owner.clone()));
        assert!(matches!(
            envelope.payload,
            Payload::Broker(MqttMessage::Connack { return_code: 0 })
        ));

        drop(server);
        let envelope = queue.take_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            envelope.payload,
            Payload::Control(ControlKind::ConnectionLost)
        ));
        assert!(!link.is_open());
    }

    #[test]
    fn test_close_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let queue = Arc::new(MessageQueue::new());

        let mut link = TcpBrokerLink::new("127.0.0.1", port, Address::gateway(2), Arc::clone(&queue));
        link.open().unwrap();
        let _server = listener.accept().unwrap();
        link.close();
        assert!(!link.is_open());
        assert!(queue.is_empty());
        assert!(matches!(link.send(&MqttMessage::Pingreq), Err(LinkError::NotOpen)));
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut link = TcpBrokerLink::new(
            "127.0.0.1",
            port,
            Address::gateway(3),
            Arc::new(MessageQueue::new()),
        );
        assert!(matches!(link.open(), Err(LinkError::Connect { .. })));
    }
}
