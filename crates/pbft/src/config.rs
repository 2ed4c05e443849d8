//! Engine configuration.

use std::time::Duration;

/// Tunables for the consensus engine.
///
/// Defaults match a small permissioned deployment; deployments override the
/// view timeout to suit their network diameter.
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Base view-change timeout. Backed off multiplicatively (×1.5 per
    /// consecutive failed view) up to `max_change_cycle`.
    pub view_timeout: Duration,

    /// Cap on the back-off exponent, bounding the timer interval.
    pub max_change_cycle: u32,

    /// How often stale sign/commit cache entries are garbage collected.
    pub collect_interval: Duration,

    /// Refuse to seal blocks with zero transactions, forcing a view change
    /// until useful work exists.
    pub omit_empty_block: bool,

    /// Whether Prepare/Sign/Commit traffic also goes to observer peers.
    /// View changes are always sent to every connected peer.
    pub broadcast_to_observers: bool,

    /// Per-peer LRU capacity for already-seen Prepare keys.
    pub known_prepare_cap: usize,
    /// Per-peer LRU capacity for already-seen Sign keys.
    pub known_sign_cap: usize,
    /// Per-peer LRU capacity for already-seen Commit keys.
    pub known_commit_cap: usize,
    /// Per-peer LRU capacity for already-seen ViewChange keys.
    pub known_view_change_cap: usize,

    /// Bound on the inbound message queue; excess messages are dropped.
    pub queue_capacity: usize,

    /// Messages this many blocks behind the local head are handled but not
    /// forwarded to other peers.
    pub stale_height_window: u64,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            view_timeout: Duration::from_secs(3),
            max_change_cycle: 20,
            collect_interval: Duration::from_secs(60),
            omit_empty_block: true,
            broadcast_to_observers: false,
            known_prepare_cap: 1024,
            known_sign_cap: 1024,
            known_commit_cap: 1024,
            known_view_change_cap: 1024,
            queue_capacity: 1024,
            stale_height_window: 10,
        }
    }
}

impl PbftConfig {
    /// The view timeout in milliseconds.
    pub fn view_timeout_ms(&self) -> u64 {
        self.view_timeout.as_millis() as u64
    }

    /// The garbage-collection interval in milliseconds.
    pub fn collect_interval_ms(&self) -> u64 {
        self.collect_interval.as_millis() as u64
    }
}
