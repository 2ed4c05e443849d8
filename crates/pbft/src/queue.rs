//! Bounded inbound queue drained by the consensus worker.
//!
//! Transport threads push raw frames; the single worker pops them with a
//! short timed wait so timers keep running even when the network is quiet.
//! A condvar signal from inserters wakes the worker promptly.

use covenant_messages::MsgId;
use covenant_types::{PublicKey, ValidatorIndex};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// One queued consensus frame.
#[derive(Debug, Clone)]
pub struct MsgPacket {
    /// Roster index of the delivering peer.
    pub from_idx: ValidatorIndex,
    /// Public key of the delivering peer.
    pub from: PublicKey,
    /// Message kind, peeked from the frame header.
    pub msg_id: MsgId,
    /// The full encoded frame (kept intact for forwarding).
    pub data: Vec<u8>,
}

/// Bounded MPMC queue with a single consumer (the worker).
pub struct MsgQueue {
    inner: Mutex<VecDeque<MsgPacket>>,
    not_empty: Condvar,
    capacity: usize,
}

impl MsgQueue {
    /// Create a queue bounded at `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Push a packet, waking the worker. Returns false (and drops the packet)
    /// when the queue is full — backpressure against message storms.
    pub fn push(&self, packet: MsgPacket) -> bool {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            warn!(
                from = %packet.from.abridged(),
                msg_id = ?packet.msg_id,
                "Inbound queue full, dropping message"
            );
            return false;
        }
        inner.push_back(packet);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Pop the next packet, waiting up to `wait` when the queue is empty.
    pub fn try_pop(&self, wait: Duration) -> Option<MsgPacket> {
        let mut inner = self.inner.lock();
        if let Some(packet) = inner.pop_front() {
            return Some(packet);
        }
        if wait.is_zero() {
            return None;
        }
        self.not_empty.wait_for(&mut inner, wait);
        inner.pop_front()
    }

    /// Wake the worker without enqueueing anything (timer fast paths).
    pub fn notify(&self) {
        self.not_empty.notify_all();
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
