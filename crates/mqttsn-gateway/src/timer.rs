// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic wake-ups keyed by (address, control kind).
//!
//! Each task is a named thread parked on a stop channel with
//! `recv_timeout(period)`. Every expiry puts a control envelope on the
//! dispatcher queue. Dropping the stop sender disconnects the channel and
//! the thread exits; the handle is then joined.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::address::Address;
use crate::queue::{ControlKind, Envelope, MessageQueue};

struct TimerTask {
    address: Address,
    kind: ControlKind,
    /// Dropping this signals the thread to exit.
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TimerTask {
    fn spawn(queue: Arc<MessageQueue>, address: Address, kind: ControlKind, period: Duration) -> Self {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let target = address.clone();

        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let thread = std::thread::Builder::new()
            .name(format!("mqttsn-timer-{}", kind.name().to_ascii_lowercase()))
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        log::trace!("[TIMER] {} fired for {}", kind.name(), target);
                        queue.put(Envelope::control(Some(target.clone()), kind));
                    }
                    // Disconnected (or an explicit stop)
                    _ => break,
                }
            })
            .expect("failed to spawn timer thread");

        Self {
            address,
            kind,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owner of every timer task of the gateway.
pub struct TimerService {
    queue: Arc<MessageQueue>,
    tasks: Mutex<Vec<TimerTask>>,
}

impl TimerService {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self {
            queue,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start a periodic task unless one already runs for (address, kind).
    ///
    /// Returns `false` when the key was already active.
    pub fn register(&self, address: &Address, kind: ControlKind, period: Duration) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|t| t.address == *address && t.kind == kind) {
            log::debug!("[TIMER] {} already armed for {}", kind.name(), address);
            return false;
        }
        tasks.push(TimerTask::spawn(Arc::clone(&self.queue), address.clone(), kind, period));
        true
    }

    /// Start a periodic task even if the key is already active.
    pub fn schedule(&self, address: &Address, kind: ControlKind, period: Duration) {
        let task = TimerTask::spawn(Arc::clone(&self.queue), address.clone(), kind, period);
        self.tasks.lock().push(task);
    }

    /// Cancel every task for (address, kind). Returns how many were stopped.
    pub fn unregister(&self, address: &Address, kind: ControlKind) -> usize {
        self.cancel(|t| t.address == *address && t.kind == kind)
    }

    /// Cancel every task for `address`.
    pub fn unregister_all(&self, address: &Address) -> usize {
        self.cancel(|t| t.address == *address)
    }

    pub fn is_registered(&self, address: &Address, kind: ControlKind) -> bool {
        self.count(address, kind) > 0
    }

    pub fn count(&self, address: &Address, kind: ControlKind) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| t.address == *address && t.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Stop every task.
    pub fn shutdown(&self) {
        let stopped = self.cancel(|_| true);
        if stopped > 0 {
            log::debug!("[TIMER] stopped {} task(s)", stopped);
        }
    }

    fn cancel<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&TimerTask) -> bool,
    {
        // Removed tasks are joined after the lock is released.
        let removed: Vec<TimerTask> = {
            let mut tasks = self.tasks.lock();
            let (removed, kept) = std::mem::take(&mut *tasks).into_iter().partition(|t| matches(t));
            *tasks = kept;
            removed
        };
        removed.len()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Payload;

    #[test]
    fn test_register_is_idempotent_schedule_is_not() {
        let queue = Arc::new(MessageQueue::new());
        let timers = TimerService::new(Arc::clone(&queue));
        let addr = Address::gateway(1);

        assert!(timers.register(&addr, ControlKind::WaitingRegackTimeout, Duration::from_secs(60)));
        assert!(!timers.register(&addr, ControlKind::WaitingRegackTimeout, Duration::from_secs(60)));
        assert_eq!(timers.count(&addr, ControlKind::WaitingRegackTimeout), 1);

        timers.schedule(&addr, ControlKind::SendKeepAlive, Duration::from_secs(60));
        timers.schedule(&addr, ControlKind::SendKeepAlive, Duration::from_secs(60));
        assert_eq!(timers.count(&addr, ControlKind::SendKeepAlive), 2);

        assert_eq!(timers.unregister(&addr, ControlKind::SendKeepAlive), 2);
        assert_eq!(timers.unregister_all(&addr), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_task_fires_into_queue() {
        let queue = Arc::new(MessageQueue::new());
        let timers = TimerService::new(Arc::clone(&queue));
        let addr = Address::gateway(7);

        timers.register(&addr, ControlKind::CheckInactivity, Duration::from_millis(20));
        let envelope = queue
            .take_timeout(Duration::from_secs(2))
            .expect("timer did not fire");
        assert_eq!(envelope.address, Some(addr.clone()));
        assert!(matches!(
            envelope.payload,
            Payload::Control(ControlKind::CheckInactivity)
        ));

        timers.unregister(&addr, ControlKind::CheckInactivity);
        // drain what fired before cancellation, then nothing more arrives
        while queue.try_take().is_some() {}
        std::thread::sleep(Duration::from_millis(60));
        assert!(queue.is_empty());
    }
}
