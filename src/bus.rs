//! The process-wide `message_queue`: a bounded FIFO of
//! `(AdapterTag, Message)` pairs shared by every adapter, plus the
//! registry used to fan a message out to every adapter but its origin.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::packet::Publication;

/// Stand-in for the original's `adapter_settings_ptr` identity: a
/// small, `Copy` tag naming the adapter a bus message originated from
/// or is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterTag(pub u32);

/// A single `(topic, payload, origin, qos)` record, reusing the wire
/// publication shape (§3 Glossary) since that is exactly what crosses
/// the bus in both directions — a fan-out dispatcher needs the topic,
/// not just the raw payload bytes the source's two divergent `message`
/// declarations disagreed on (spec.md §9).
pub type Message = Publication;

#[derive(Debug, Clone)]
pub struct BusItem {
    pub origin: AdapterTag,
    pub message: Message,
}

/// Bounded producer/consumer queue; push never blocks indefinitely,
/// pop supports a timed wait so the reactor's run loop can interleave
/// bus draining with socket I/O.
pub struct MessageQueue {
    sender: Sender<BusItem>,
    receiver: Receiver<BusItem>,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self { sender, receiver }
    }

    pub fn sender(&self) -> Sender<BusItem> {
        self.sender.clone()
    }

    /// Pushes one item; per §7's bus-error policy the queue push never
    /// fails outwardly — if the bound is hit, the oldest semantics are
    /// approximated by dropping this push and logging a warning.
    pub fn push(&self, origin: AdapterTag, message: Message) {
        match self.sender.try_send(BusItem { origin, message }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("message_queue full, dropping message from adapter {origin:?}", origin = origin);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("message_queue has no receiver");
            }
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<BusItem> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drains everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<BusItem> {
        let mut items = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            items.push(item);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str) -> Message {
        Publication {
            origin_ip: 0,
            origin_port: 0,
            qos: 0,
            topic: topic.to_string(),
            origin_client_id: "test".to_string(),
            payload: b"hi".to_vec(),
        }
    }

    #[test]
    fn push_then_drain_preserves_order() {
        let queue = MessageQueue::new(8);
        queue.push(AdapterTag(1), msg("a"));
        queue.push(AdapterTag(2), msg("b"));
        let items = queue.drain();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].origin, AdapterTag(1));
        assert_eq!(items[1].origin, AdapterTag(2));
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let queue = MessageQueue::new(1);
        assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn full_queue_drops_without_erroring() {
        let queue = MessageQueue::new(1);
        queue.push(AdapterTag(1), msg("a"));
        queue.push(AdapterTag(2), msg("b")); // dropped, logged
        let items = queue.drain();
        assert_eq!(items.len(), 1);
    }
}
