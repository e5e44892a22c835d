//! Queue of host-originated changes waiting to be sent back to a scene.
//!
//! Any thread may push. The owning scene drains the queue while it holds the
//! world guard. PUT and DELETE are last-write-wins per key: a newer change
//! replaces the queued one in place. APPEND always queues.

use crate::id::{ComponentKey, EntityKey};
use crate::message::{encoded_len, MessageKind, Payload};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A queued change. Timestamps are assigned when the queue is drained.
#[derive(Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub entity: EntityKey,
    pub component: ComponentKey,
    pub payload: Payload,
}

impl OutgoingMessage {
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.kind, self.payload.len())
    }
}

#[derive(Debug, Default)]
struct Queue {
    messages: Vec<OutgoingMessage>,
    /// Position of the queued LWW message per key.
    lww_index: HashMap<(EntityKey, ComponentKey), usize>,
    payload_len: usize,
    encoded_len: usize,
}

impl Queue {
    fn push_lww(&mut self, message: OutgoingMessage) {
        self.payload_len += message.payload.len();
        self.encoded_len += message.encoded_len();
        let key = (message.entity, message.component);
        match self.lww_index.get(&key) {
            Some(&index) => {
                let replaced = std::mem::replace(&mut self.messages[index], message);
                self.payload_len -= replaced.payload.len();
                self.encoded_len -= replaced.encoded_len();
            }
            None => {
                self.lww_index.insert(key, self.messages.len());
                self.messages.push(message);
            }
        }
    }

    fn push_append(&mut self, message: OutgoingMessage) {
        self.payload_len += message.payload.len();
        self.encoded_len += message.encoded_len();
        self.messages.push(message);
    }

    fn reset_totals(&mut self) {
        self.lww_index.clear();
        self.payload_len = 0;
        self.encoded_len = 0;
    }
}

/// Drained contents of the queue, in queue order.
pub struct OutgoingBatch<'a> {
    drain: std::vec::Drain<'a, OutgoingMessage>,
    payload_len: usize,
    encoded_len: usize,
}

impl OutgoingBatch<'_> {
    /// Payload bytes across the batch.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Exact serialized size of the batch.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }
}

impl Iterator for OutgoingBatch<'_> {
    type Item = OutgoingMessage;

    fn next(&mut self) -> Option<OutgoingMessage> {
        self.drain.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.drain.size_hint()
    }
}

impl ExactSizeIterator for OutgoingBatch<'_> {}

/// The locked queue, not yet drained.
pub struct PendingBatch<'a> {
    queue: &'a mut Queue,
}

impl<'a> PendingBatch<'a> {
    pub fn messages(&self) -> &[OutgoingMessage] {
        &self.queue.messages
    }

    /// Exact serialized size of the queued messages.
    pub fn encoded_len(&self) -> usize {
        self.queue.encoded_len
    }

    /// Take every queued message, leaving the queue empty.
    pub fn commit(self) -> OutgoingBatch<'a> {
        let queue = self.queue;
        let payload_len = queue.payload_len;
        let encoded_len = queue.encoded_len;
        queue.reset_totals();
        OutgoingBatch {
            drain: queue.messages.drain(..),
            payload_len,
            encoded_len,
        }
    }
}

/// Thread-safe outgoing delta queue. One per scene.
#[derive(Debug, Default)]
pub struct OutgoingDeltaCollector {
    queue: Mutex<Queue>,
}

impl OutgoingDeltaCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, entity: EntityKey, component: ComponentKey, payload: Payload) {
        self.queue.lock().push_lww(OutgoingMessage {
            kind: MessageKind::Put,
            entity,
            component,
            payload,
        });
    }

    pub fn delete(&self, entity: EntityKey, component: ComponentKey) {
        self.queue.lock().push_lww(OutgoingMessage {
            kind: MessageKind::Delete,
            entity,
            component,
            payload: Payload::empty(),
        });
    }

    pub fn append(&self, entity: EntityKey, component: ComponentKey, payload: Payload) {
        self.queue.lock().push_append(OutgoingMessage {
            kind: MessageKind::Append,
            entity,
            component,
            payload,
        });
    }

    /// Hand every queued message to `f` and leave the queue empty. The
    /// queue stays locked until `f` returns; messages `f` does not consume
    /// are dropped.
    pub fn drain_with<R>(&self, f: impl FnOnce(OutgoingBatch<'_>) -> R) -> R {
        self.stage_with(|pending| f(pending.commit()))
    }

    /// Show the queue to `f` under the lock. Nothing leaves the queue unless
    /// `f` calls [`PendingBatch::commit`], so a caller that fails before
    /// committing keeps every message for the next drain.
    pub fn stage_with<R>(&self, f: impl FnOnce(PendingBatch<'_>) -> R) -> R {
        let mut queue = self.queue.lock();
        f(PendingBatch { queue: &mut *queue })
    }

    /// Inspect the queue without clearing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&[OutgoingMessage]) -> R) -> R {
        f(&self.queue.lock().messages)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().messages.is_empty()
    }

    pub fn payload_len(&self) -> usize {
        self.queue.lock().payload_len
    }

    pub fn encoded_len(&self) -> usize {
        self.queue.lock().encoded_len
    }

    /// Drop every queued message, releasing payloads.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.messages.clear();
        queue.reset_totals();
    }
}
