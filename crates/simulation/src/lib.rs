//! In-process cluster harness for Covenant consensus.
//!
//! Wires N engines together over a loopback [`Hub`], each with its own
//! [`MemChain`] and in-memory backup, under one manually advanced clock.
//! The driver is synchronous and deterministic: each [`Cluster::step`] runs
//! proposals, delivers in-flight frames, ticks every engine, and imports
//! whatever got sealed.
//!
//! End-to-end scenario tests live in this crate's `tests/` directory.

mod chain;
mod network;

pub use chain::{MemChain, StaticOracle};
pub use network::{Hub, NodeTransport};

use covenant_pbft::{ChainFacade, Clock, ManualClock, MemoryBackup, PbftConfig, PbftEngine};
use covenant_types::test_utils::test_roster;
use covenant_types::{Hash, KeyPair, PublicKey, Roster, SealedBlock};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Simulation clocks start here so zeroed timeout anchors always fire.
pub const CLOCK_START: u64 = 1_700_000_000_000;

/// Ticks each engine gets per step, enough to drain a burst of frames.
const TICKS_PER_STEP: usize = 12;

/// One simulated validator node.
pub struct SimNode {
    /// Position in the roster (and in `Cluster::nodes`).
    pub index: usize,
    /// The node's long-term key.
    pub key: KeyPair,
    /// The node's private copy of the chain.
    pub chain: Arc<MemChain>,
    /// The node's durable message backup.
    pub backup: Arc<MemoryBackup>,
    /// The consensus engine under test.
    pub engine: Arc<PbftEngine>,
    sealed: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
    last_proposed: Option<(u64, u64)>,
}

impl SimNode {
    /// Blocks sealed by this node and not yet imported by the driver.
    pub fn pending_sealed(&self) -> usize {
        self.sealed.lock().len()
    }
}

/// A deterministic cluster of validator nodes.
pub struct Cluster {
    /// All nodes, in roster order.
    pub nodes: Vec<SimNode>,
    /// The loopback network.
    pub hub: Arc<Hub>,
    /// The shared simulated clock.
    pub clock: Arc<ManualClock>,
    config: PbftConfig,
    roster: Roster,
    keys: Vec<KeyPair>,
    oracle: Arc<StaticOracle>,
    mempool: Mutex<Vec<Vec<u8>>>,
    silenced: HashSet<usize>,
    /// When set, leaders propose even with an empty mempool (used to exercise
    /// the receiver side of empty-block suppression).
    pub propose_empty: bool,
}

impl Cluster {
    /// Build an `n`-validator cluster with the given engine configuration.
    pub fn new(n: u8, config: PbftConfig) -> Self {
        let (keys, roster) = test_roster(n);
        let oracle = Arc::new(StaticOracle::new(roster.clone()));
        let hub = Hub::new(keys.iter().map(|k| k.public_key()).collect());
        let clock = Arc::new(ManualClock::new(CLOCK_START));

        let mut cluster = Self {
            nodes: Vec::new(),
            hub,
            clock,
            config,
            roster,
            keys,
            oracle,
            mempool: Mutex::new(Vec::new()),
            silenced: HashSet::new(),
            propose_empty: false,
        };
        for index in 0..n as usize {
            let node = cluster.build_node(index, Arc::new(MemoryBackup::new()), None);
            cluster.nodes.push(node);
        }
        cluster
    }

    fn build_node(
        &self,
        index: usize,
        backup: Arc<MemoryBackup>,
        chain: Option<Arc<MemChain>>,
    ) -> SimNode {
        let key = self.keys[index].clone();
        let chain = chain.unwrap_or_else(|| Arc::new(MemChain::new(self.oracle.clone())));
        let transport = Arc::new(self.hub.transport_for(key.public_key()));
        let engine = PbftEngine::new(
            self.config.clone(),
            key.clone(),
            chain.clone(),
            self.oracle.clone(),
            transport,
            backup.clone(),
            self.clock.clone(),
        );
        let sealed = Arc::new(Mutex::new(Vec::new()));
        let sink = sealed.clone();
        engine.on_seal_generated(Box::new(move |bytes, by_self| {
            sink.lock().push((bytes.to_vec(), by_self));
        }));
        SimNode {
            index,
            key,
            chain,
            backup,
            engine,
            sealed,
            last_proposed: None,
        }
    }

    /// Recreate a node's engine over its existing chain and backup, as if
    /// the process crashed and restarted.
    pub fn restart_node(&mut self, index: usize) {
        let backup = self.nodes[index].backup.clone();
        let chain = self.nodes[index].chain.clone();
        self.nodes[index] = self.build_node(index, backup, Some(chain));
    }

    /// Queue a transaction for the next proposal.
    pub fn submit_tx(&self, tx: Vec<u8>) {
        self.mempool.lock().push(tx);
    }

    /// Stop a node from proposing (it still votes and forwards).
    pub fn silence(&mut self, index: usize) {
        self.silenced.insert(index);
    }

    /// Allow a silenced node to propose again.
    pub fn unsilence(&mut self, index: usize) {
        self.silenced.remove(&index);
    }

    /// Public key of node `index`.
    pub fn pk(&self, index: usize) -> PublicKey {
        self.keys[index].public_key()
    }

    /// The shared roster.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// One driver step: propose, deliver, tick, import, advance time.
    pub fn step(&mut self, dt_ms: u64) {
        // Proposals. A node proposes once per (height, view).
        for index in 0..self.nodes.len() {
            if self.silenced.contains(&index) {
                continue;
            }
            if !self.nodes[index].engine.should_seal() {
                continue;
            }
            let round = (
                self.nodes[index].engine.consensus_block_number(),
                self.nodes[index].engine.view(),
            );
            if self.nodes[index].last_proposed == Some(round) {
                continue;
            }
            let transactions = self.mempool.lock().clone();
            if transactions.is_empty() && !self.propose_empty {
                if self.config.omit_empty_block {
                    self.nodes[index].engine.change_view_for_empty_block();
                }
                continue;
            }
            let Some(self_idx) = self.nodes[index].engine.self_index() else {
                continue;
            };
            let (header, bytes) =
                self.nodes[index]
                    .chain
                    .make_candidate(transactions, self_idx, self.clock.now_ms());
            if let Some(view) = self.nodes[index].engine.generate_seal(&header, &bytes) {
                self.nodes[index].engine.generate_commit(&header, &bytes, view);
                self.nodes[index].last_proposed = Some(round);
            }
        }

        // Deliver everything currently in flight.
        for (from, to, bytes) in self.hub.drain() {
            if let Some(node) = self.nodes.iter().find(|n| n.key.public_key() == to) {
                node.engine.on_msg(from, &bytes);
            }
        }

        // Tick every engine enough to drain the burst.
        for node in &self.nodes {
            for _ in 0..TICKS_PER_STEP {
                node.engine.run_once(Duration::ZERO);
            }
        }

        // Import whatever was sealed this step.
        for index in 0..self.nodes.len() {
            let sealed: Vec<(Vec<u8>, bool)> =
                self.nodes[index].sealed.lock().drain(..).collect();
            for (bytes, _by_self) in sealed {
                match self.nodes[index].chain.import_sealed(&bytes) {
                    Ok(()) => {
                        let head = self.nodes[index].chain.head_hash();
                        let header = self.nodes[index].chain.current_header();
                        self.nodes[index].engine.report_block(&header);
                        self.nodes[index].last_proposed = None;
                        debug!(node = index, head = %head.abridged(), "Node imported block");
                        if let Ok(sealed_block) = SealedBlock::decode(&bytes) {
                            let mut mempool = self.mempool.lock();
                            mempool.retain(|tx| !sealed_block.block.transactions.contains(tx));
                        }
                    }
                    Err(e) => debug!(node = index, error = %e, "Import rejected"),
                }
            }
        }

        self.clock.advance(dt_ms);
    }

    /// Step until `done` holds or `max_steps` elapse. Returns whether the
    /// predicate was satisfied.
    pub fn run_until(
        &mut self,
        max_steps: usize,
        dt_ms: u64,
        done: impl Fn(&Cluster) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            self.step(dt_ms);
        }
        done(self)
    }

    /// Heights of every node's chain.
    pub fn heights(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.chain.height()).collect()
    }

    /// The block hash every node has at `height`, if they all have one and
    /// they all agree.
    pub fn agreed_hash_at(&self, height: u64) -> Option<Hash> {
        let mut hashes = self
            .nodes
            .iter()
            .map(|n| n.chain.block_by_number(height).map(|b| b.block.hash_without_seal()));
        let first = hashes.next()??;
        for other in hashes {
            if other? != first {
                return None;
            }
        }
        Some(first)
    }
}
