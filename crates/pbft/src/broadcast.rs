//! Outbound fan-out with per-peer echo suppression.
//!
//! Every outbound frame carries a string key (hash or signature hex). For
//! each peer the broadcaster keeps one bounded LRU per message kind; a key
//! already recorded for a peer is not sent again, and peers in the exclusion
//! set (the delivering peer and the indexed originator) are marked as if sent
//! so the same message never bounces back. Expected footprint per consensus
//! message is O(N) sends network-wide.

use crate::config::PbftConfig;
use crate::traits::Transport;
use covenant_messages::MsgId;
use covenant_types::{PublicKey, Roster, ValidatorRole};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use tracing::trace;

/// Per-peer already-seen key caches, one LRU per message kind.
struct PeerFilters {
    prepare: LruCache<String, ()>,
    sign: LruCache<String, ()>,
    commit: LruCache<String, ()>,
    view_change: LruCache<String, ()>,
}

impl PeerFilters {
    fn new(config: &PbftConfig) -> Self {
        let cap = |n: usize| NonZeroUsize::new(n.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            prepare: LruCache::new(cap(config.known_prepare_cap)),
            sign: LruCache::new(cap(config.known_sign_cap)),
            commit: LruCache::new(cap(config.known_commit_cap)),
            view_change: LruCache::new(cap(config.known_view_change_cap)),
        }
    }

    fn cache_for(&mut self, id: MsgId) -> &mut LruCache<String, ()> {
        match id {
            MsgId::Prepare => &mut self.prepare,
            MsgId::Sign => &mut self.sign,
            MsgId::Commit => &mut self.commit,
            MsgId::ViewChange => &mut self.view_change,
        }
    }
}

/// Applies the broadcast policy over the injected transport.
pub struct Broadcaster {
    config: PbftConfig,
    filters: Mutex<HashMap<PublicKey, PeerFilters>>,
}

impl Broadcaster {
    /// Create a broadcaster with the given filter capacities and policy.
    pub fn new(config: PbftConfig) -> Self {
        Self {
            config,
            filters: Mutex::new(HashMap::new()),
        }
    }

    /// Send `bytes` (keyed by `key`) to every eligible connected peer.
    ///
    /// - Observer peers are skipped unless the message is a view change or
    ///   the engine is configured to broadcast to observers.
    /// - Peers in `except` are marked as having seen the key but not sent to.
    /// - Peers whose filter already holds the key are skipped.
    pub fn broadcast(
        &self,
        transport: &dyn Transport,
        roster: &Roster,
        key: &str,
        id: MsgId,
        bytes: &[u8],
        except: &HashSet<PublicKey>,
    ) {
        let mut filters = self.filters.lock();
        for peer in transport.peer_ids() {
            let Some(role) = roster.role_of(&peer) else {
                trace!(peer = %peer.abridged(), "Skipping peer outside the roster");
                continue;
            };

            if id != MsgId::ViewChange
                && role != ValidatorRole::Miner
                && !self.config.broadcast_to_observers
            {
                continue;
            }

            let peer_filters = filters
                .entry(peer)
                .or_insert_with(|| PeerFilters::new(&self.config));
            let cache = peer_filters.cache_for(id);

            if except.contains(&peer) {
                cache.put(key.to_string(), ());
                continue;
            }
            if cache.contains(key) {
                continue;
            }

            transport.send(&peer, bytes);
            cache.put(key.to_string(), ());
        }
    }

    /// Forget everything sent so far, for every peer.
    ///
    /// Used when a round restarts (view change, committed-prepare replay) to
    /// guarantee the new round's messages are actually written.
    pub fn clear(&self) {
        self.filters.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_types::test_utils::test_roster;

    /// Transport stub recording every send.
    struct RecordingTransport {
        peers: Vec<PublicKey>,
        sent: Mutex<Vec<(PublicKey, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new(peers: Vec<PublicKey>) -> Self {
            Self {
                peers,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_to(&self) -> Vec<PublicKey> {
            self.sent.lock().iter().map(|(p, _)| *p).collect()
        }
    }

    impl Transport for RecordingTransport {
        fn peer_ids(&self) -> Vec<PublicKey> {
            self.peers.clone()
        }
        fn is_connected(&self, peer: &PublicKey) -> bool {
            self.peers.contains(peer)
        }
        fn send(&self, peer: &PublicKey, bytes: &[u8]) {
            self.sent.lock().push((*peer, bytes.to_vec()));
        }
    }

    #[test]
    fn sends_once_per_key() {
        let (keys, roster) = test_roster(4);
        let peers: Vec<PublicKey> = keys.iter().skip(1).map(|k| k.public_key()).collect();
        let transport = RecordingTransport::new(peers);
        let caster = Broadcaster::new(PbftConfig::default());

        caster.broadcast(&transport, &roster, "k1", MsgId::Sign, b"m", &HashSet::new());
        assert_eq!(transport.sent_to().len(), 3);

        // Same key again: filtered everywhere.
        caster.broadcast(&transport, &roster, "k1", MsgId::Sign, b"m", &HashSet::new());
        assert_eq!(transport.sent_to().len(), 3);

        // New key flows again.
        caster.broadcast(&transport, &roster, "k2", MsgId::Sign, b"m", &HashSet::new());
        assert_eq!(transport.sent_to().len(), 6);
    }

    #[test]
    fn excluded_peers_are_marked_not_sent() {
        let (keys, roster) = test_roster(3);
        let peers: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();
        let transport = RecordingTransport::new(peers.clone());
        let caster = Broadcaster::new(PbftConfig::default());

        let except: HashSet<PublicKey> = [peers[0]].into_iter().collect();
        caster.broadcast(&transport, &roster, "k", MsgId::Commit, b"m", &except);
        assert!(!transport.sent_to().contains(&peers[0]));
        assert_eq!(transport.sent_to().len(), 2);

        // The marked peer must stay suppressed even without the exclusion.
        caster.broadcast(&transport, &roster, "k", MsgId::Commit, b"m", &HashSet::new());
        assert!(!transport.sent_to().contains(&peers[0]));
    }

    #[test]
    fn clear_resends() {
        let (keys, roster) = test_roster(2);
        let peers: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();
        let transport = RecordingTransport::new(peers);
        let caster = Broadcaster::new(PbftConfig::default());

        caster.broadcast(&transport, &roster, "k", MsgId::Prepare, b"m", &HashSet::new());
        caster.clear();
        caster.broadcast(&transport, &roster, "k", MsgId::Prepare, b"m", &HashSet::new());
        assert_eq!(transport.sent_to().len(), 4);
    }

    #[test]
    fn observers_only_get_view_changes_by_default() {
        use covenant_types::{Roster, ValidatorIndex, ValidatorInfo};

        let (keys, _) = test_roster(3);
        let infos: Vec<ValidatorInfo> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| ValidatorInfo {
                index: ValidatorIndex(i as u32),
                public_key: k.public_key(),
                role: if i < 2 {
                    ValidatorRole::Miner
                } else {
                    ValidatorRole::Observer
                },
            })
            .collect();
        let roster = Roster::new(infos).unwrap();
        let observer = keys[2].public_key();
        let transport = RecordingTransport::new(vec![observer]);
        let caster = Broadcaster::new(PbftConfig::default());

        caster.broadcast(&transport, &roster, "s", MsgId::Sign, b"m", &HashSet::new());
        assert!(transport.sent_to().is_empty());

        caster.broadcast(&transport, &roster, "v", MsgId::ViewChange, b"m", &HashSet::new());
        assert_eq!(transport.sent_to(), vec![observer]);
    }

    #[test]
    fn unknown_peer_is_skipped() {
        let (keys, roster) = test_roster(2);
        let stranger = covenant_types::test_utils::test_keypair(99).public_key();
        let mut peers: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();
        peers.push(stranger);
        let transport = RecordingTransport::new(peers);
        let caster = Broadcaster::new(PbftConfig::default());

        caster.broadcast(&transport, &roster, "k", MsgId::Sign, b"m", &HashSet::new());
        assert!(!transport.sent_to().contains(&stranger));
    }
}
