//! Loopback network hub with partitions.
//!
//! Every node's transport pushes frames into one shared hub; the cluster
//! driver drains the hub between worker ticks, so delivery order is
//! deterministic. Partitions drop frames at send time and also report the
//! target as disconnected, which is what the engine's disconnected-leader
//! fast path keys off.

use covenant_pbft::Transport;
use covenant_types::PublicKey;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

struct HubInner {
    peers: Vec<PublicKey>,
    connected: HashSet<PublicKey>,
    /// Directional drops: a frame from `.0` to `.1` is discarded.
    partitions: HashSet<(PublicKey, PublicKey)>,
    in_flight: VecDeque<(PublicKey, PublicKey, Vec<u8>)>,
}

/// The shared message hub.
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    /// Create a hub for the given set of node keys, all connected.
    pub fn new(peers: Vec<PublicKey>) -> Arc<Self> {
        let connected = peers.iter().copied().collect();
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                peers,
                connected,
                partitions: HashSet::new(),
                in_flight: VecDeque::new(),
            }),
        })
    }

    /// A transport endpoint for one node.
    pub fn transport_for(self: &Arc<Self>, me: PublicKey) -> NodeTransport {
        NodeTransport {
            me,
            hub: self.clone(),
        }
    }

    /// Take every in-flight frame, in send order.
    pub fn drain(&self) -> Vec<(PublicKey, PublicKey, Vec<u8>)> {
        self.inner.lock().in_flight.drain(..).collect()
    }

    /// Drop all in-flight frames without delivering them.
    pub fn clear_in_flight(&self) {
        self.inner.lock().in_flight.clear();
    }

    /// Cut both directions between two nodes.
    pub fn partition_bidirectional(&self, a: PublicKey, b: PublicKey) {
        let mut inner = self.inner.lock();
        inner.partitions.insert((a, b));
        inner.partitions.insert((b, a));
    }

    /// Cut a node off from everyone.
    pub fn isolate(&self, node: PublicKey) {
        let mut inner = self.inner.lock();
        let others: Vec<PublicKey> = inner.peers.iter().copied().filter(|p| *p != node).collect();
        for other in others {
            inner.partitions.insert((node, other));
            inner.partitions.insert((other, node));
        }
        inner.connected.remove(&node);
    }

    /// Restore full connectivity.
    pub fn heal_all(&self) {
        let mut inner = self.inner.lock();
        inner.partitions.clear();
        inner.connected = inner.peers.iter().copied().collect();
    }

    /// Mark a node as disconnected without touching partitions.
    pub fn set_connected(&self, node: PublicKey, connected: bool) {
        let mut inner = self.inner.lock();
        if connected {
            inner.connected.insert(node);
        } else {
            inner.connected.remove(&node);
        }
    }
}

/// One node's view of the hub.
pub struct NodeTransport {
    me: PublicKey,
    hub: Arc<Hub>,
}

impl Transport for NodeTransport {
    fn peer_ids(&self) -> Vec<PublicKey> {
        let inner = self.hub.inner.lock();
        inner
            .peers
            .iter()
            .copied()
            .filter(|p| *p != self.me && inner.connected.contains(p))
            .collect()
    }

    fn is_connected(&self, peer: &PublicKey) -> bool {
        let inner = self.hub.inner.lock();
        inner.connected.contains(peer) && !inner.partitions.contains(&(self.me, *peer))
    }

    fn send(&self, peer: &PublicKey, bytes: &[u8]) {
        let mut inner = self.hub.inner.lock();
        if inner.partitions.contains(&(self.me, *peer)) {
            return;
        }
        inner.in_flight.push_back((self.me, *peer, bytes.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_types::test_utils::test_keypair;

    #[test]
    fn frames_flow_until_partitioned() {
        let a = test_keypair(1).public_key();
        let b = test_keypair(2).public_key();
        let hub = Hub::new(vec![a, b]);
        let ta = hub.transport_for(a);

        ta.send(&b, b"one");
        assert_eq!(hub.drain().len(), 1);

        hub.partition_bidirectional(a, b);
        ta.send(&b, b"two");
        assert!(hub.drain().is_empty());
        assert!(!ta.is_connected(&b));

        hub.heal_all();
        ta.send(&b, b"three");
        assert_eq!(hub.drain().len(), 1);
    }

    #[test]
    fn isolation_removes_connectivity() {
        let keys: Vec<PublicKey> = (1..=3).map(|s| test_keypair(s).public_key()).collect();
        let hub = Hub::new(keys.clone());
        hub.isolate(keys[0]);

        let t1 = hub.transport_for(keys[1]);
        assert!(!t1.peer_ids().contains(&keys[0]));
        t1.send(&keys[0], b"msg");
        assert!(hub.drain().is_empty());
    }
}
