//! The PBFT consensus state machine.
//!
//! One coarse mutex owns every piece of consensus state; all public entry
//! points (`on_msg`, `report_block`, `should_seal`, `generate_seal`,
//! `generate_commit`, the worker tick) acquire it. The message path is not
//! hot, and a single worker plus one big lock is the simplest provably
//! correct choice here — ordering bugs in this file are safety violations.
//!
//! # Phases
//!
//! Per height and view: **Prepare → Sign → Commit → Seal**, with
//! **ViewChange** as the out-of-band recovery. A Prepare that reaches sign
//! quorum is persisted to the durable backup *before* any Commit leaves this
//! node, which is what makes crash recovery safe.

use crate::backup::{decode_committed, encode_committed, MsgBackup, BACKUP_KEY_COMMITTED};
use crate::broadcast::Broadcaster;
use crate::config::PbftConfig;
use crate::queue::{MsgPacket, MsgQueue};
use crate::traits::{
    ChainFacade, Clock, SealCallback, Transport, ValidatorOracle, ViewChangeCallback,
};
use covenant_messages::{
    CommitReq, MsgId, PrepareReq, ProtocolMsg, SignReq, SignedMsg, ViewChangeReq,
};
use covenant_types::{
    Block, BlockHeader, Hash, KeyPair, PublicKey, Roster, SealedBlock, Signature, ValidatorIndex,
    ValidatorRole,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Everything the engine mutates, behind the one coarse mutex.
struct EngineState {
    // ═══════════════════════════════════════════════════════════════════════
    // Roster-derived configuration (refreshed on every imported block)
    // ═══════════════════════════════════════════════════════════════════════
    /// The full roster at the current height, miners first.
    roster: Option<Roster>,
    /// Number of miners (N).
    node_count: u32,
    /// Byzantine tolerance, `(N - 1) / 3`.
    f: u32,
    /// Our roster position, if we are in the roster at all.
    self_index: Option<ValidatorIndex>,
    /// Whether we are a voting member.
    is_miner: bool,
    /// Set when the roster lookup failed or we are not in it; the engine
    /// keeps validating and importing but refuses to seal or sign.
    cfg_err: bool,

    // ═══════════════════════════════════════════════════════════════════════
    // View state
    // ═══════════════════════════════════════════════════════════════════════
    /// The view consensus is currently running in.
    view: u64,
    /// The view the next view change is aiming for.
    to_view: u64,
    /// Header of the highest imported block.
    highest_block: BlockHeader,
    /// The height currently under consensus (`highest + 1`).
    consensus_block_number: u64,
    /// Consecutive failed views at this height; drives timeout back-off.
    change_cycle: u32,
    /// True between a timeout firing and the next successful view change.
    leader_failed: bool,
    /// Marks that the pending view change was caused by empty-block
    /// suppression, which is logged as routine rather than as a failure.
    empty_block_flag: bool,

    // ═══════════════════════════════════════════════════════════════════════
    // Timers (milliseconds since epoch; zero forces an immediate timeout)
    // ═══════════════════════════════════════════════════════════════════════
    last_consensus_time: u64,
    last_sign_time: u64,
    last_collect_time: u64,

    // ═══════════════════════════════════════════════════════════════════════
    // Message caches
    // ═══════════════════════════════════════════════════════════════════════
    /// The Prepare as received from the wire, before re-execution.
    raw_prepare: Option<PrepareReq>,
    /// The Prepare after executing the candidate, in canonical form.
    prepare: Option<PrepareReq>,
    /// The raw Prepare that first reached sign quorum; mirrored in the
    /// durable backup.
    committed_prepare: Option<PrepareReq>,
    /// Single parking slot for a Prepare from a future (height, view).
    future_prepare: Option<(ValidatorIndex, PrepareReq)>,
    /// Sign votes per block hash, keyed by signature hex.
    sign_cache: HashMap<Hash, HashMap<String, SignReq>>,
    /// Commit votes per block hash, keyed by signature hex.
    commit_cache: HashMap<Hash, HashMap<String, CommitReq>>,
    /// Buffered view-change requests per target view, one per sender.
    view_change_cache: BTreeMap<u64, HashMap<ValidatorIndex, ViewChangeReq>>,
}

/// A snapshot of where the engine currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// Height of the highest imported block.
    pub highest_block: u64,
    /// Height currently under consensus.
    pub consensus_block_number: u64,
    /// Current view.
    pub view: u64,
    /// Target view of the pending view change, if any.
    pub to_view: u64,
    /// Back-off exponent for the view-change timer.
    pub change_cycle: u32,
    /// The proposer for the current round, when one exists.
    pub leader: Option<ValidatorIndex>,
    /// Size of the voting roster.
    pub node_count: u32,
    /// Whether this node votes.
    pub is_miner: bool,
    /// Whether the roster configuration is currently broken.
    pub cfg_err: bool,
}

/// The PBFT consensus engine.
///
/// Construct with [`PbftEngine::new`], register the seal callback, then
/// either spawn the worker ([`crate::WorkerHandle`]) or drive
/// [`PbftEngine::run_once`] manually.
pub struct PbftEngine {
    config: PbftConfig,
    key_pair: KeyPair,
    chain: Arc<dyn ChainFacade>,
    oracle: Arc<dyn ValidatorOracle>,
    transport: Arc<dyn Transport>,
    backup: Arc<dyn MsgBackup>,
    clock: Arc<dyn Clock>,
    broadcaster: Broadcaster,
    queue: MsgQueue,
    state: Mutex<EngineState>,
    /// Roster snapshot for sender resolution on transport threads. Kept in a
    /// separate lock so `on_msg` never contends with (or deadlocks against)
    /// the consensus mutex.
    peer_roster: RwLock<Option<Roster>>,
    on_seal_generated: Mutex<Option<SealCallback>>,
    on_view_change: Mutex<Option<ViewChangeCallback>>,
}

impl PbftEngine {
    /// Build an engine around its collaborators.
    ///
    /// Reads the committed-prepare record back from the durable backup and
    /// derives the initial roster from the chain head.
    pub fn new(
        config: PbftConfig,
        key_pair: KeyPair,
        chain: Arc<dyn ChainFacade>,
        oracle: Arc<dyn ValidatorOracle>,
        transport: Arc<dyn Transport>,
        backup: Arc<dyn MsgBackup>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let highest = chain.current_header();
        let now = clock.now_ms();

        let committed_prepare = match backup.get(BACKUP_KEY_COMMITTED) {
            Ok(Some(bytes)) => match decode_committed(&bytes) {
                Ok(Some(req)) => {
                    info!(
                        height = req.height,
                        hash = %req.block_hash.abridged(),
                        idx = %req.idx,
                        "Reloaded committed prepare from backup"
                    );
                    Some(req)
                }
                Ok(None) => None,
                Err(e) => {
                    error!(error = %e, "Failed to decode committed prepare backup");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "Failed to read committed prepare backup");
                None
            }
        };

        let state = EngineState {
            roster: None,
            node_count: 0,
            f: 0,
            self_index: None,
            is_miner: false,
            cfg_err: true,
            view: 0,
            to_view: 0,
            consensus_block_number: highest.number + 1,
            highest_block: highest,
            change_cycle: 0,
            leader_failed: false,
            empty_block_flag: false,
            last_consensus_time: now,
            last_sign_time: 0,
            last_collect_time: now,
            raw_prepare: None,
            prepare: None,
            committed_prepare,
            future_prepare: None,
            sign_cache: HashMap::new(),
            commit_cache: HashMap::new(),
            view_change_cache: BTreeMap::new(),
        };

        let queue_capacity = config.queue_capacity;
        let engine = Arc::new(Self {
            broadcaster: Broadcaster::new(config.clone()),
            config,
            key_pair,
            chain,
            oracle,
            transport,
            backup,
            clock,
            queue: MsgQueue::new(queue_capacity),
            state: Mutex::new(state),
            peer_roster: RwLock::new(None),
            on_seal_generated: Mutex::new(None),
            on_view_change: Mutex::new(None),
        });

        {
            let mut st = engine.state.lock();
            engine.reset_config(&mut st);
        }
        engine
    }

    /// Register the sealed-block callback.
    pub fn on_seal_generated(&self, callback: SealCallback) {
        *self.on_seal_generated.lock() = Some(callback);
    }

    /// Register the view-change diagnostic callback.
    pub fn on_view_change(&self, callback: ViewChangeCallback) {
        *self.on_view_change.lock() = Some(callback);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Public entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Entry point for the transport: enqueue one encoded frame from a peer.
    ///
    /// Frames from peers outside the roster are dropped here; everything else
    /// waits for the worker.
    pub fn on_msg(&self, from: PublicKey, data: &[u8]) {
        let msg_id = match covenant_messages::peek_msg_id(data) {
            Ok(id) => id,
            Err(e) => {
                debug!(from = %from.abridged(), error = %e, "Dropping undecodable frame");
                return;
            }
        };
        let Some(from_idx) = self
            .peer_roster
            .read()
            .as_ref()
            .and_then(|r| r.index_of(&from))
        else {
            warn!(from = %from.abridged(), "Consensus message from unknown peer");
            return;
        };
        self.queue.push(MsgPacket {
            from_idx,
            from,
            msg_id,
            data: data.to_vec(),
        });
    }

    /// One worker tick: drain at most one message, then run the timer,
    /// future-prepare, and garbage-collection duties.
    pub fn run_once(&self, wait: Duration) {
        if let Some(packet) = self.queue.try_pop(wait) {
            self.handle_packet(packet);
        }
        self.check_timeout();
        self.handle_future_block();
        self.collect_garbage();
    }

    /// Whether this node should build and propose a block right now.
    ///
    /// Also the hook for two recovery paths: replaying a committed-but-unsaved
    /// Prepare, and forcing a view change when the current leader is known to
    /// be disconnected.
    pub fn should_seal(&self) -> bool {
        let mut st = self.state.lock();

        if st.cfg_err || !st.is_miner {
            return false;
        }

        let Some(leader) = Self::leader(&st) else {
            return false;
        };

        if Some(leader) != st.self_index {
            let leader_key = st.roster.as_ref().and_then(|r| r.miner_key(leader));
            if let Some(key) = leader_key {
                if !self.transport.is_connected(&key) {
                    warn!(leader = %leader, "Leader disconnected, forcing view change");
                    st.last_consensus_time = 0;
                    st.last_sign_time = 0;
                    self.queue.notify();
                }
            }
            return false;
        }

        // A committed-but-unsaved block takes priority over a new proposal.
        if let Some(committed) = st.committed_prepare.clone() {
            if st.consensus_block_number == committed.height {
                if st.raw_prepare.as_ref().map(|r| r.height) != Some(committed.height) {
                    self.rehandle_prepare(&mut st, &committed);
                }
                return false;
            }
        }

        true
    }

    /// Leader path, phase one: broadcast a Prepare for a freshly built block.
    ///
    /// Returns the view the proposal was issued in, to be passed back to
    /// [`PbftEngine::generate_commit`].
    pub fn generate_seal(&self, header: &BlockHeader, block_data: &[u8]) -> Option<u64> {
        let mut st = self.state.lock();
        if st.cfg_err || !st.is_miner {
            return None;
        }
        let self_idx = st.self_index?;
        let view = st.view;

        let req = PrepareReq::signed(
            &self.key_pair,
            header.number,
            view,
            self_idx,
            self.clock.now_ms(),
            header.hash_without_seal(),
            block_data.to_vec(),
        );
        info!(
            height = req.height,
            view,
            hash = %req.block_hash.abridged(),
            "Proposing block"
        );
        self.broadcast_proto(&st, &req.block_hash.to_hex(), &ProtocolMsg::Prepare(req.clone()));
        st.raw_prepare = Some(req);
        Some(view)
    }

    /// Leader path, phase two: install our own executed proposal and vote.
    ///
    /// Fails (returns false) when the view moved on since `generate_seal`.
    pub fn generate_commit(&self, header: &BlockHeader, block_data: &[u8], view: u64) -> bool {
        let mut st = self.state.lock();
        if view != st.view {
            info!(view, current = st.view, "View changed, abandoning own proposal");
            return false;
        }
        let Some(self_idx) = st.self_index else {
            return false;
        };

        let req = PrepareReq::signed(
            &self.key_pair,
            header.number,
            view,
            self_idx,
            self.clock.now_ms(),
            header.hash_without_seal(),
            block_data.to_vec(),
        );
        self.add_prepare(&mut st, req);
        self.broadcast_sign(&mut st);
        self.check_and_commit(&mut st);
        true
    }

    /// Notify the engine that a block was imported (by us or by sync).
    pub fn report_block(&self, header: &BlockHeader) {
        let mut st = self.state.lock();

        st.highest_block = header.clone();

        if st.highest_block.number >= st.consensus_block_number {
            st.view = 0;
            st.to_view = 0;
            st.change_cycle = 0;
            st.leader_failed = false;
            st.last_consensus_time = self.clock.now_ms();
            st.consensus_block_number = st.highest_block.number + 1;
            Self::purge_view_changes(&mut st);
        }

        self.reset_config(&mut st);

        let imported_hash = header.hash_without_seal();
        Self::purge_block_caches(&mut st, &imported_hash);

        info!(
            height = st.highest_block.number,
            hash = %imported_hash.abridged(),
            next = st.consensus_block_number,
            "Chain advanced"
        );
    }

    /// Trigger an immediate view change because we would otherwise seal an
    /// empty block (proposer-side path of empty-block suppression).
    pub fn change_view_for_empty_block(&self) {
        let mut st = self.state.lock();
        info!(to_view = st.to_view, "Empty block, forcing view change");
        self.trigger_empty_block_change(&mut st);
        // Keeps the empty-block proposer from immediately proposing again.
        st.leader_failed = true;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read-only accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// The current view.
    pub fn view(&self) -> u64 {
        self.state.lock().view
    }

    /// The view the pending view change is aiming for.
    pub fn to_view(&self) -> u64 {
        self.state.lock().to_view
    }

    /// The height currently under consensus.
    pub fn consensus_block_number(&self) -> u64 {
        self.state.lock().consensus_block_number
    }

    /// Height of the highest imported block.
    pub fn highest_block_number(&self) -> u64 {
        self.state.lock().highest_block.number
    }

    /// Hash of the committed-but-unsaved Prepare, if any.
    pub fn committed_hash(&self) -> Option<Hash> {
        self.state.lock().committed_prepare.as_ref().map(|c| c.block_hash)
    }

    /// Whether this node currently votes.
    pub fn is_miner(&self) -> bool {
        self.state.lock().is_miner
    }

    /// Whether the engine is in roster-configuration error state.
    pub fn cfg_err(&self) -> bool {
        self.state.lock().cfg_err
    }

    /// Our roster position.
    pub fn self_index(&self) -> Option<ValidatorIndex> {
        self.state.lock().self_index
    }

    /// A point-in-time snapshot for diagnostics and RPC surfaces.
    pub fn status(&self) -> EngineStatus {
        let st = self.state.lock();
        EngineStatus {
            highest_block: st.highest_block.number,
            consensus_block_number: st.consensus_block_number,
            view: st.view,
            to_view: st.to_view,
            change_cycle: st.change_cycle,
            leader: Self::leader(&st),
            node_count: st.node_count,
            is_miner: st.is_miner,
            cfg_err: st.cfg_err,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leader rule and quorum
    // ═══════════════════════════════════════════════════════════════════════

    /// The proposer for the current (height, view), or `None` while the
    /// configuration is broken or a leader has already been voted out.
    fn leader(st: &EngineState) -> Option<ValidatorIndex> {
        if st.cfg_err || st.leader_failed || st.node_count == 0 {
            return None;
        }
        let slot = (st.view + st.highest_block.number) % st.node_count as u64;
        Some(ValidatorIndex(slot as u32))
    }

    /// `Q = N - f`, the 2f+1 threshold.
    fn quorum(st: &EngineState) -> u32 {
        st.node_count - st.f
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Roster refresh
    // ═══════════════════════════════════════════════════════════════════════

    /// Recompute `(N, self_index, f, miner_list)` from the oracle at the
    /// current head. On failure the engine keeps the previous roster but
    /// enters `cfg_err` until the next successful refresh.
    fn reset_config(&self, st: &mut EngineState) {
        let height = st.highest_block.number;
        let roster = match self.oracle.roster_at(height) {
            Ok(r) => r,
            Err(e) => {
                error!(height, error = %e, "Roster lookup failed, stop sealing");
                st.cfg_err = true;
                return;
            }
        };

        let self_key = self.key_pair.public_key();
        let Some(me) = roster.find(&self_key).cloned() else {
            error!(height, "Cannot find own key in roster, stop sealing");
            st.cfg_err = true;
            return;
        };

        let node_count = roster.miner_count();
        if node_count == 0 {
            error!(height, "Roster has no miners, stop sealing");
            st.cfg_err = true;
            return;
        }

        if st.node_count != node_count || st.self_index != Some(me.index) {
            st.node_count = node_count;
            st.self_index = Some(me.index);
            st.f = (node_count - 1) / 3;
            st.prepare = None;
            st.sign_cache.clear();
            st.view_change_cache.clear();
            info!(idx = %me.index, n = node_count, "Consensus configuration changed");
        }

        st.is_miner = me.role == ValidatorRole::Miner;
        *self.peer_roster.write() = Some(roster.clone());
        st.roster = Some(roster);
        st.cfg_err = false;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message dispatch and forwarding
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_packet(&self, packet: MsgPacket) {
        let msg = match covenant_messages::decode(&packet.data) {
            Ok(m) => m,
            Err(e) => {
                debug!(from = %packet.from.abridged(), error = %e, "Dropping malformed message");
                return;
            }
        };

        // Forwarding metadata, captured before the handler consumes the message.
        let (key, height, idx, timestamp) = match &msg {
            ProtocolMsg::Prepare(r) => (r.block_hash.to_hex(), r.height, r.idx, r.timestamp),
            ProtocolMsg::Sign(r) => (r.sig.to_hex(), r.height, r.idx, r.timestamp),
            ProtocolMsg::Commit(r) => (r.sig.to_hex(), r.height, r.idx, r.timestamp),
            ProtocolMsg::ViewChange(r) => (
                format!("{}{}", r.sig.to_hex(), r.view),
                r.height,
                r.idx,
                r.timestamp,
            ),
        };

        let now = self.clock.now_ms();
        let mut st = self.state.lock();

        match msg {
            ProtocolMsg::Prepare(req) => self.handle_prepare(&mut st, packet.from_idx, req, false),
            ProtocolMsg::Sign(req) => self.handle_sign(&mut st, packet.from_idx, req),
            ProtocolMsg::Commit(req) => self.handle_commit(&mut st, packet.from_idx, req),
            ProtocolMsg::ViewChange(req) => {
                self.handle_view_change(&mut st, packet.from_idx, req)
            }
        }

        // Forward fresh traffic to the rest of the network. Old messages are
        // handled but die here rather than echo around forever.
        let fresh_time =
            timestamp >= now || now - timestamp < self.config.view_timeout_ms();
        let fresh_height = height > st.highest_block.number
            || st.highest_block.number - height < self.config.stale_height_window;
        if fresh_time && fresh_height {
            let mut except: HashSet<PublicKey> = HashSet::new();
            except.insert(packet.from);
            if let Some(origin) = st.roster.as_ref().and_then(|r| r.public_key(idx)) {
                except.insert(origin);
            }
            self.broadcast_raw(&st, &key, packet.msg_id, &packet.data, &except);
        }
    }

    fn broadcast_raw(
        &self,
        st: &EngineState,
        key: &str,
        id: MsgId,
        bytes: &[u8],
        except: &HashSet<PublicKey>,
    ) {
        let Some(roster) = &st.roster else {
            return;
        };
        self.broadcaster
            .broadcast(self.transport.as_ref(), roster, key, id, bytes, except);
    }

    fn broadcast_proto(&self, st: &EngineState, key: &str, msg: &ProtocolMsg) {
        let bytes = match covenant_messages::encode(msg) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "Failed to encode outbound message");
                return;
            }
        };
        self.broadcast_raw(st, key, msg.msg_id(), &bytes, &HashSet::new());
    }

    /// Verify both signatures of a voting message against the miner at its
    /// claimed index. Out-of-roster indices fail here.
    fn verify_vote<M: SignedMsg>(&self, st: &EngineState, msg: &M) -> bool {
        let Some(key) = st.roster.as_ref().and_then(|r| r.miner_key(msg.idx())) else {
            debug!(idx = %msg.idx(), "Vote from unknown or non-miner index");
            return false;
        };
        msg.verify(&key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Prepare
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_prepare(
        &self,
        st: &mut EngineState,
        from: ValidatorIndex,
        req: PrepareReq,
        self_injected: bool,
    ) {
        trace!(
            idx = %req.idx,
            view = req.view,
            height = req.height,
            hash = %req.block_hash.abridged(),
            from = %from,
            "handle_prepare"
        );

        if st
            .raw_prepare
            .as_ref()
            .is_some_and(|p| p.block_hash == req.block_hash)
        {
            trace!("Discarding duplicated prepare");
            return;
        }

        if !self_injected && Some(req.idx) == st.self_index {
            warn!(idx = %req.idx, "Discarding prepare claiming to be our own");
            return;
        }

        if req.height < st.consensus_block_number || req.view < st.view {
            trace!(
                height = req.height,
                view = req.view,
                "Discarding stale prepare"
            );
            return;
        }

        if req.height > st.consensus_block_number || req.view > st.view {
            self.recv_future_prepare(st, from, req);
            return;
        }

        st.raw_prepare = Some(req.clone());

        if Self::leader(st) != Some(req.idx) {
            warn!(idx = %req.idx, "Discarding prepare from non-leader");
            return;
        }

        if let Some(committed) = &st.committed_prepare {
            if committed.height == req.height && committed.block_hash != req.block_hash {
                info!(
                    committed = %committed.block_hash.abridged(),
                    proposed = %req.block_hash.abridged(),
                    "Discarding prepare conflicting with committed block"
                );
                return;
            }
        }

        if !self.verify_vote(st, &req) {
            warn!(idx = %req.idx, "Prepare signature check failed");
            return;
        }

        let executed = match self.chain.execute_candidate(&req.block) {
            Ok(e) => e,
            Err(e) => {
                warn!(hash = %req.block_hash.abridged(), error = %e, "Candidate execution failed");
                return;
            }
        };

        if executed.header.hash_without_seal() != req.block_hash {
            warn!(
                proposed = %req.block_hash.abridged(),
                executed = %executed.header.hash_without_seal().abridged(),
                "Executed block hash does not match proposal"
            );
            return;
        }

        if executed.tx_count == 0 && self.config.omit_empty_block {
            info!(
                height = req.height,
                hash = %req.block_hash.abridged(),
                "Empty block proposed, switching view"
            );
            self.trigger_empty_block_change(st);
            return;
        }

        // Re-seal the candidate in its canonical executed form; from here on
        // the canonical prepare is what we vote on and seal.
        let canonical_hash = executed.header.hash_without_seal();
        let canonical_block = executed.canonical.clone();
        self.chain.add_block_cache(executed);

        let canonical = PrepareReq::signed(
            &self.key_pair,
            req.height,
            req.view,
            req.idx,
            self.clock.now_ms(),
            canonical_hash,
            canonical_block,
        );
        self.add_prepare(st, canonical);

        debug!(
            height = req.height,
            hash = %canonical_hash.abridged(),
            "Prepare accepted"
        );

        if st.is_miner {
            self.broadcast_sign(st);
        }

        self.check_and_commit(st);
    }

    fn recv_future_prepare(&self, st: &mut EngineState, from: ValidatorIndex, req: PrepareReq) {
        let already = st
            .future_prepare
            .as_ref()
            .is_some_and(|(_, parked)| parked.block_hash == req.block_hash);
        if !already {
            info!(
                height = req.height,
                view = req.view,
                hash = %req.block_hash.abridged(),
                "Parking future prepare"
            );
            st.future_prepare = Some((from, req));
        }
    }

    /// Install the canonical prepare and drop cached votes from other views.
    fn add_prepare(&self, st: &mut EngineState, req: PrepareReq) {
        let hash = req.block_hash;
        let view = req.view;
        st.prepare = Some(req);

        if let Some(signs) = st.sign_cache.get_mut(&hash) {
            signs.retain(|_, s| s.view == view);
        }
        if let Some(commits) = st.commit_cache.get_mut(&hash) {
            commits.retain(|_, c| c.view == view);
        }
    }

    /// Replay a committed-but-unsaved Prepare as if we were the leader.
    fn rehandle_prepare(&self, st: &mut EngineState, committed: &PrepareReq) {
        info!(
            height = committed.height,
            hash = %committed.block_hash.abridged(),
            "Found committed but unsaved block, replaying prepare"
        );

        // Make sure the replayed messages actually reach every peer.
        self.broadcaster.clear();

        let Some(self_idx) = st.self_index else {
            return;
        };
        let req = PrepareReq::signed(
            &self.key_pair,
            committed.height,
            st.view,
            self_idx,
            self.clock.now_ms(),
            committed.block_hash,
            committed.block.clone(),
        );
        self.broadcast_proto(st, &req.block_hash.to_hex(), &ProtocolMsg::Prepare(req.clone()));
        self.handle_prepare(st, self_idx, req, true);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sign
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_sign(&self, st: &mut EngineState, from: ValidatorIndex, req: SignReq) {
        trace!(
            idx = %req.idx,
            view = req.view,
            height = req.height,
            hash = %req.block_hash.abridged(),
            from = %from,
            "handle_sign"
        );

        if Self::is_cached(&st.sign_cache, &req.block_hash, &req.sig) {
            trace!("Discarding duplicated sign");
            return;
        }

        if Some(req.idx) == st.self_index {
            warn!(idx = %req.idx, "Discarding sign claiming to be our own");
            return;
        }

        let matches_prepare = st
            .prepare
            .as_ref()
            .is_some_and(|p| p.block_hash == req.block_hash);
        if !matches_prepare {
            // Votes racing ahead of their Prepare are kept; they complete the
            // quorum the moment the matching Prepare lands.
            let future = req.height >= st.consensus_block_number || req.view > st.view;
            if future && self.verify_vote(st, &req) {
                debug!(hash = %req.block_hash.abridged(), "Caching early sign");
                st.sign_cache
                    .entry(req.block_hash)
                    .or_default()
                    .insert(req.sig.to_hex(), req);
            }
            return;
        }

        if st.prepare.as_ref().map(|p| p.view) != Some(req.view) {
            info!(view = req.view, "Discarding sign from a different view");
            return;
        }

        if !self.verify_vote(st, &req) {
            warn!(idx = %req.idx, "Sign signature check failed");
            return;
        }

        st.sign_cache
            .entry(req.block_hash)
            .or_default()
            .insert(req.sig.to_hex(), req);

        self.check_and_commit(st);
    }

    fn broadcast_sign(&self, st: &mut EngineState) {
        let Some(prepare) = st.prepare.clone() else {
            return;
        };
        let Some(self_idx) = st.self_index else {
            return;
        };
        let req = SignReq::signed(
            &self.key_pair,
            prepare.height,
            prepare.view,
            self_idx,
            self.clock.now_ms(),
            prepare.block_hash,
        );
        self.broadcast_proto(st, &req.sig.to_hex(), &ProtocolMsg::Sign(req.clone()));
        st.sign_cache
            .entry(req.block_hash)
            .or_default()
            .insert(req.sig.to_hex(), req);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_commit(&self, st: &mut EngineState, from: ValidatorIndex, req: CommitReq) {
        trace!(
            idx = %req.idx,
            view = req.view,
            height = req.height,
            hash = %req.block_hash.abridged(),
            from = %from,
            "handle_commit"
        );

        if Self::is_cached(&st.commit_cache, &req.block_hash, &req.sig) {
            trace!("Discarding duplicated commit");
            return;
        }

        if Some(req.idx) == st.self_index {
            warn!(idx = %req.idx, "Discarding commit claiming to be our own");
            return;
        }

        let matches_prepare = st
            .prepare
            .as_ref()
            .is_some_and(|p| p.block_hash == req.block_hash);
        if !matches_prepare {
            let future = req.height >= st.consensus_block_number || req.view > st.view;
            if future && self.verify_vote(st, &req) {
                debug!(hash = %req.block_hash.abridged(), "Caching early commit");
                st.commit_cache
                    .entry(req.block_hash)
                    .or_default()
                    .insert(req.sig.to_hex(), req);
            }
            return;
        }

        if st.prepare.as_ref().map(|p| p.view) != Some(req.view) {
            info!(view = req.view, "Discarding commit from a different view");
            return;
        }

        if !self.verify_vote(st, &req) {
            warn!(idx = %req.idx, "Commit signature check failed");
            return;
        }

        st.commit_cache
            .entry(req.block_hash)
            .or_default()
            .insert(req.sig.to_hex(), req);

        self.check_and_save(st);
    }

    fn broadcast_commit(&self, st: &mut EngineState) {
        let Some(prepare) = st.prepare.clone() else {
            return;
        };
        let Some(self_idx) = st.self_index else {
            return;
        };
        let req = CommitReq::signed(
            &self.key_pair,
            prepare.height,
            prepare.view,
            self_idx,
            self.clock.now_ms(),
            prepare.block_hash,
        );
        self.broadcast_proto(st, &req.sig.to_hex(), &ProtocolMsg::Commit(req.clone()));
        st.commit_cache
            .entry(req.block_hash)
            .or_default()
            .insert(req.sig.to_hex(), req);
    }

    fn is_cached<V>(
        cache: &HashMap<Hash, HashMap<String, V>>,
        hash: &Hash,
        sig: &Signature,
    ) -> bool {
        cache
            .get(hash)
            .is_some_and(|entries| entries.contains_key(&sig.to_hex()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Quorum transitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Fires exactly once per view, when the sign count reaches quorum:
    /// persist the raw prepare, then broadcast our Commit.
    fn check_and_commit(&self, st: &mut EngineState) {
        let Some(prepare) = st.prepare.clone() else {
            return;
        };
        let have_sign = st
            .sign_cache
            .get(&prepare.block_hash)
            .map_or(0, |m| m.len()) as u32;
        if have_sign != Self::quorum(st) {
            return;
        }

        info!(
            height = prepare.height,
            hash = %prepare.block_hash.abridged(),
            have_sign,
            quorum = Self::quorum(st),
            "Sign quorum reached"
        );

        if prepare.view != st.view {
            info!(
                prepare_view = prepare.view,
                view = st.view,
                "View changed, discarding sign quorum"
            );
            return;
        }

        // Persist before any Commit leaves this node: the durable record is
        // what stops a restarted node from signing a different hash here.
        if let Some(raw) = st.raw_prepare.clone() {
            match encode_committed(&raw) {
                Ok(bytes) => {
                    if let Err(e) = self.backup.put(BACKUP_KEY_COMMITTED, &bytes) {
                        error!(error = %e, "Failed to back up committed prepare");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode committed prepare"),
            }
            st.committed_prepare = Some(raw);
        }

        if st.is_miner {
            self.broadcast_commit(st);
        }

        // Grant the commit phase its own timeout window.
        st.last_sign_time = self.clock.now_ms();

        self.check_and_save(st);
    }

    /// When both quorums hold, assemble the sealed block and hand it to the
    /// host for import.
    fn check_and_save(&self, st: &mut EngineState) {
        let Some(prepare) = st.prepare.clone() else {
            return;
        };
        let have_sign = st
            .sign_cache
            .get(&prepare.block_hash)
            .map_or(0, |m| m.len()) as u32;
        let have_commit = st
            .commit_cache
            .get(&prepare.block_hash)
            .map_or(0, |m| m.len()) as u32;
        let quorum = Self::quorum(st);
        if !(have_sign >= quorum && have_commit == quorum) {
            return;
        }

        info!(
            height = prepare.height,
            hash = %prepare.block_hash.abridged(),
            have_sign,
            have_commit,
            "Commit quorum reached"
        );

        if prepare.view != st.view {
            info!(
                prepare_view = prepare.view,
                view = st.view,
                "View changed, discarding commit quorum"
            );
            return;
        }

        if prepare.height <= st.highest_block.number {
            info!(
                height = prepare.height,
                highest = st.highest_block.number,
                "Discarding sealed block, a later block already won"
            );
            return;
        }

        let block = match Block::decode(&prepare.block) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "Committed prepare holds an undecodable block");
                return;
            }
        };

        let mut sig_list: Vec<(ValidatorIndex, Signature)> = st
            .commit_cache
            .get(&prepare.block_hash)
            .map(|m| m.values().map(|c| (c.idx, c.sig)).collect())
            .unwrap_or_default();
        sig_list.sort_by_key(|(idx, _)| idx.0);

        let sealed = SealedBlock { block, sig_list };
        match sealed.encode() {
            Ok(bytes) => {
                let by_self = Some(prepare.idx) == st.self_index;
                info!(
                    height = prepare.height,
                    hash = %prepare.block_hash.abridged(),
                    signatures = sealed.sig_list.len(),
                    by_self,
                    "Sealed block generated"
                );
                if let Some(callback) = self.on_seal_generated.lock().as_ref() {
                    callback(&bytes, by_self);
                }
            }
            Err(e) => error!(error = %e, "Failed to encode sealed block"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════

    /// Timer duty: fire a view change when no progress was made within the
    /// backed-off interval. Returns whether `to_view` advanced.
    fn check_timeout(&self) -> bool {
        let advanced = {
            let mut st = self.state.lock();
            let now = self.clock.now_ms();
            let last = st.last_consensus_time.max(st.last_sign_time);
            let interval = (self.config.view_timeout_ms() as f64
                * 1.5f64.powi(st.change_cycle as i32)) as u64;
            if now.saturating_sub(last) < interval {
                false
            } else {
                st.leader_failed = true;
                st.to_view += 1;
                st.change_cycle = (st.change_cycle + 1).min(self.config.max_change_cycle);
                st.last_consensus_time = now;

                // Buffered requests for the target view that disagree with our
                // chain are from a different fork or a stale sender: purge.
                let highest_number = st.highest_block.number;
                let highest_hash = st.highest_block.hash_without_seal();
                let to_view = st.to_view;
                if let Some(buffered) = st.view_change_cache.get_mut(&to_view) {
                    buffered.retain(|_, r| {
                        r.height >= highest_number
                            && !(r.height == highest_number && r.block_hash != highest_hash)
                    });
                }

                if st.view + 1 == st.to_view {
                    info!(view = st.view, to_view = st.to_view, "Starting view change");
                } else {
                    warn!(
                        view = st.view,
                        to_view = st.to_view,
                        change_cycle = st.change_cycle,
                        "Timeout, view change escalating"
                    );
                }

                self.broadcast_view_change(&mut st);
                self.check_and_change_view(&mut st);
                true
            }
        };

        if advanced {
            if let Some(callback) = self.on_view_change.lock().as_ref() {
                callback();
            }
        }
        advanced
    }

    fn broadcast_view_change(&self, st: &mut EngineState) {
        info!(
            height = st.highest_block.number,
            view = st.view,
            to_view = st.to_view,
            change_cycle = st.change_cycle,
            "Ready to broadcast view change"
        );

        if !st.is_miner {
            debug!("Not a miner, skipping view change broadcast");
            return;
        }
        let Some(self_idx) = st.self_index else {
            return;
        };

        if st.empty_block_flag {
            st.empty_block_flag = false;
        }

        let req = ViewChangeReq::signed(
            &self.key_pair,
            st.highest_block.number,
            st.to_view,
            self_idx,
            self.clock.now_ms(),
            st.highest_block.hash_without_seal(),
        );
        let key = format!("{}{}", req.sig.to_hex(), req.view);
        self.broadcast_proto(st, &key, &ProtocolMsg::ViewChange(req));
    }

    fn handle_view_change(&self, st: &mut EngineState, from: ValidatorIndex, req: ViewChangeReq) {
        trace!(
            idx = %req.idx,
            view = req.view,
            height = req.height,
            hash = %req.block_hash.abridged(),
            from = %from,
            "handle_view_change"
        );

        if st
            .view_change_cache
            .get(&req.view)
            .is_some_and(|m| m.contains_key(&req.idx))
        {
            trace!("Discarding duplicated view change");
            return;
        }

        if Some(req.idx) == st.self_index {
            warn!(idx = %req.idx, "Discarding view change claiming to be our own");
            return;
        }

        // A sender more than one view behind us has missed the round; answer
        // with our own request so it can catch up without waiting for its
        // timer. The +1 keeps the just-switching boundary quiet.
        if req.view + 1 < st.to_view {
            info!(
                their_view = req.view,
                to_view = st.to_view,
                "Re-emitting view change for lagging peer"
            );
            self.broadcast_view_change(st);
        }

        if req.height < st.highest_block.number || req.view <= st.view {
            trace!(
                height = req.height,
                view = req.view,
                "Discarding stale view change"
            );
            return;
        }

        if req.height == st.highest_block.number
            && req.block_hash != st.highest_block.hash_without_seal()
            && self.chain.block_by_hash(&req.block_hash).is_none()
        {
            info!(
                theirs = %req.block_hash.abridged(),
                ours = %st.highest_block.hash_without_seal().abridged(),
                "Same-height view change with unknown hash, possible fork; staying put"
            );
            return;
        }

        if !self.verify_vote(st, &req) {
            warn!(idx = %req.idx, "View change signature check failed");
            return;
        }

        let req_view = req.view;
        st.view_change_cache
            .entry(req_view)
            .or_default()
            .insert(req.idx, req);

        if req_view == st.to_view {
            self.check_and_change_view(st);
        } else {
            self.maybe_fast_forward(st);
        }
    }

    /// One vote per sender across all buffered views above `to_view`: when
    /// more than `f` distinct senders are already ahead of us, jump straight
    /// to just below the smallest such view and let the timer fire.
    fn maybe_fast_forward(&self, st: &mut EngineState) {
        let mut best_view: HashMap<ValidatorIndex, u64> = HashMap::new();
        let mut min_view = u64::MAX;
        let mut min_height = u64::MAX;
        let highest_number = st.highest_block.number;

        for (&view, buffered) in st.view_change_cache.range(st.to_view + 1..) {
            for (&idx, r) in buffered {
                if r.height < highest_number {
                    continue;
                }
                let entry = best_view.entry(idx).or_insert(0);
                if view > *entry {
                    *entry = view;
                    if view < min_view {
                        min_view = view;
                    }
                    if r.height < min_height {
                        min_height = r.height;
                    }
                }
            }
        }

        let count = best_view.len() as u32;
        if count == 0 {
            return;
        }

        // If the block under consensus is committed but not yet on disk,
        // hold: switching now would orphan a block the network already
        // agreed on, and the replay path will finish it first.
        let committed_height = st.committed_prepare.as_ref().map(|c| c.height);
        let hold =
            min_height == st.consensus_block_number && Some(min_height) == committed_height;

        if count > st.f && !hold {
            info!(
                to_view = st.to_view,
                min_view,
                peers_ahead = count,
                "Fast-forwarding view change"
            );
            st.last_consensus_time = 0;
            st.last_sign_time = 0;
            // The timer path will advance this to min_view on the next tick.
            st.to_view = min_view - 1;
            self.queue.notify();
        }
    }

    /// Complete the view change once `Q - 1` peers agree (we count
    /// implicitly as the Q-th).
    fn check_and_change_view(&self, st: &mut EngineState) {
        let count = st
            .view_change_cache
            .get(&st.to_view)
            .map_or(0, |m| m.len()) as u32;
        if count < Self::quorum(st).saturating_sub(1) {
            return;
        }

        info!(to_view = st.to_view, "View change quorum reached");

        st.leader_failed = false;
        st.view = st.to_view;

        st.raw_prepare = None;
        st.prepare = None;
        st.sign_cache.clear();
        st.commit_cache.clear();

        let view = st.view;
        st.view_change_cache.retain(|&v, _| v > view);

        // New round, new traffic: every peer must see this round's messages.
        self.broadcaster.clear();
    }

    /// Receiver-side empty-block suppression: reset the back-off and force
    /// the timeout to fire on the next tick.
    fn trigger_empty_block_change(&self, st: &mut EngineState) {
        st.last_consensus_time = 0;
        st.last_sign_time = 0;
        st.change_cycle = 0;
        st.empty_block_flag = true;
        self.queue.notify();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Housekeeping
    // ═══════════════════════════════════════════════════════════════════════

    /// Replay the parked future Prepare once its (height, view) is current.
    fn handle_future_block(&self) {
        let mut st = self.state.lock();
        let ready = st.future_prepare.as_ref().is_some_and(|(_, parked)| {
            parked.height == st.consensus_block_number && parked.view == st.view
        });
        if !ready {
            return;
        }
        if let Some((from, req)) = st.future_prepare.take() {
            info!(height = req.height, "Handling parked future prepare");
            self.handle_prepare(&mut st, from, req, false);
        }
    }

    /// Periodically drop sign/commit votes for heights already on chain.
    fn collect_garbage(&self) {
        let mut st = self.state.lock();
        let now = self.clock.now_ms();
        if now.saturating_sub(st.last_collect_time) < self.config.collect_interval_ms() {
            return;
        }

        let highest = st.highest_block.number;
        st.sign_cache.retain(|_, entries| {
            entries.retain(|_, r| r.height >= highest);
            !entries.is_empty()
        });
        st.commit_cache.retain(|_, entries| {
            entries.retain(|_, r| r.height >= highest);
            !entries.is_empty()
        });
        st.last_collect_time = now;
        debug!(highest, "Collected stale consensus caches");
    }

    /// Drop buffered view changes that a just-imported block made stale or
    /// revealed as conflicting.
    fn purge_view_changes(st: &mut EngineState) {
        let highest_number = st.highest_block.number;
        let highest_hash = st.highest_block.hash_without_seal();
        st.view_change_cache.retain(|_, buffered| {
            buffered.retain(|_, r| {
                r.height >= highest_number
                    && !(r.height == highest_number && r.block_hash != highest_hash)
            });
            !buffered.is_empty()
        });
    }

    /// Drop sign/commit votes for an imported hash, and the prepare with it.
    fn purge_block_caches(st: &mut EngineState, hash: &Hash) {
        st.sign_cache.remove(hash);
        st.commit_cache.remove(hash);
        if st.prepare.as_ref().is_some_and(|p| p.block_hash == *hash) {
            st.prepare = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MemoryBackup;
    use crate::config::PbftConfig;
    use crate::traits::{ChainError, ExecutedCandidate, ManualClock};
    use crate::verifier::check_block_sign;
    use covenant_types::test_utils::test_roster;
    use covenant_types::{compute_tx_root, RosterError};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Chain stub: executes whatever decodes, remembers imported blocks.
    struct TestChain {
        genesis: BlockHeader,
        known: Mutex<HashMap<Hash, SealedBlock>>,
    }

    impl TestChain {
        fn new(roster: &Roster) -> Self {
            Self {
                genesis: BlockHeader::genesis(roster.miners()),
                known: Mutex::new(HashMap::new()),
            }
        }
    }

    impl ChainFacade for TestChain {
        fn current_header(&self) -> BlockHeader {
            self.genesis.clone()
        }
        fn block_by_number(&self, _number: u64) -> Option<SealedBlock> {
            None
        }
        fn block_by_hash(&self, hash: &Hash) -> Option<SealedBlock> {
            self.known.lock().get(hash).cloned()
        }
        fn last_hashes(&self) -> Vec<Hash> {
            vec![self.genesis.hash_without_seal()]
        }
        fn execute_candidate(&self, block: &[u8]) -> Result<ExecutedCandidate, ChainError> {
            let decoded =
                Block::decode(block).map_err(|e| ChainError::Malformed(e.to_string()))?;
            Ok(ExecutedCandidate {
                header: decoded.header.clone(),
                tx_count: decoded.transactions.len(),
                canonical: block.to_vec(),
            })
        }
        fn add_block_cache(&self, _executed: ExecutedCandidate) {}
        fn import_sealed(&self, _sealed: &[u8]) -> Result<(), ChainError> {
            Ok(())
        }
    }

    /// Transport stub recording every frame written.
    struct TestTransport {
        peers: Vec<PublicKey>,
        connected: Mutex<HashSet<PublicKey>>,
        sent: Mutex<Vec<(PublicKey, Vec<u8>)>>,
    }

    impl TestTransport {
        fn new(peers: Vec<PublicKey>) -> Self {
            let connected = peers.iter().copied().collect();
            Self {
                peers,
                connected: Mutex::new(connected),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Unique outbound messages of one kind, decoded. Includes frames the
        /// engine merely forwarded, not just ones it originated.
        fn sent_of_kind(&self, id: MsgId) -> Vec<ProtocolMsg> {
            let mut seen: HashSet<Vec<u8>> = HashSet::new();
            let mut out = Vec::new();
            for (_, bytes) in self.sent.lock().iter() {
                if !seen.insert(bytes.clone()) {
                    continue;
                }
                if let Ok(msg) = covenant_messages::decode(bytes) {
                    if msg.msg_id() == id {
                        out.push(msg);
                    }
                }
            }
            out
        }

        /// Unique outbound messages of one kind carrying the given sender
        /// index — the engine's own votes, as opposed to forwarded traffic.
        fn sent_from(&self, id: MsgId, idx: u32) -> usize {
            self.sent_of_kind(id)
                .iter()
                .filter(|m| {
                    let sender = match m {
                        ProtocolMsg::Prepare(r) => r.idx,
                        ProtocolMsg::Sign(r) => r.idx,
                        ProtocolMsg::Commit(r) => r.idx,
                        ProtocolMsg::ViewChange(r) => r.idx,
                    };
                    sender.0 == idx
                })
                .count()
        }

        fn disconnect(&self, peer: &PublicKey) {
            self.connected.lock().remove(peer);
        }
    }

    impl Transport for TestTransport {
        fn peer_ids(&self) -> Vec<PublicKey> {
            self.peers.clone()
        }
        fn is_connected(&self, peer: &PublicKey) -> bool {
            self.connected.lock().contains(peer)
        }
        fn send(&self, peer: &PublicKey, bytes: &[u8]) {
            self.sent.lock().push((*peer, bytes.to_vec()));
        }
    }

    struct StaticOracle {
        roster: Roster,
    }

    impl ValidatorOracle for StaticOracle {
        fn roster_at(&self, _height: u64) -> Result<Roster, RosterError> {
            Ok(self.roster.clone())
        }
    }

    const CLOCK_START: u64 = 1_700_000_000_000;

    struct Fixture {
        keys: Vec<KeyPair>,
        roster: Roster,
        chain: Arc<TestChain>,
        transport: Arc<TestTransport>,
        backup: Arc<MemoryBackup>,
        clock: Arc<ManualClock>,
        engine: Arc<PbftEngine>,
        sealed: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
        view_changes: Arc<AtomicU32>,
    }

    impl Fixture {
        fn new(n: u8, self_pos: usize) -> Self {
            Self::with_config(n, self_pos, Fixture::config())
        }

        fn config() -> PbftConfig {
            PbftConfig {
                omit_empty_block: false,
                ..PbftConfig::default()
            }
        }

        fn with_config(n: u8, self_pos: usize, config: PbftConfig) -> Self {
            let (keys, roster) = test_roster(n);
            let chain = Arc::new(TestChain::new(&roster));
            let peers: Vec<PublicKey> = keys
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != self_pos)
                .map(|(_, k)| k.public_key())
                .collect();
            let transport = Arc::new(TestTransport::new(peers));
            let backup = Arc::new(MemoryBackup::new());
            let clock = Arc::new(ManualClock::new(CLOCK_START));
            Self::build(keys, roster, chain, transport, backup, clock, self_pos, config)
        }

        #[allow(clippy::too_many_arguments)]
        fn build(
            keys: Vec<KeyPair>,
            roster: Roster,
            chain: Arc<TestChain>,
            transport: Arc<TestTransport>,
            backup: Arc<MemoryBackup>,
            clock: Arc<ManualClock>,
            self_pos: usize,
            config: PbftConfig,
        ) -> Self {
            let engine = PbftEngine::new(
                config,
                keys[self_pos].clone(),
                chain.clone(),
                Arc::new(StaticOracle {
                    roster: roster.clone(),
                }),
                transport.clone(),
                backup.clone(),
                clock.clone(),
            );
            let sealed = Arc::new(Mutex::new(Vec::new()));
            let sealed_sink = sealed.clone();
            engine.on_seal_generated(Box::new(move |bytes, by_self| {
                sealed_sink.lock().push((bytes.to_vec(), by_self));
            }));
            let view_changes = Arc::new(AtomicU32::new(0));
            let view_change_counter = view_changes.clone();
            engine.on_view_change(Box::new(move || {
                view_change_counter.fetch_add(1, Ordering::SeqCst);
            }));
            Self {
                keys,
                roster,
                chain,
                transport,
                backup,
                clock,
                engine,
                sealed,
                view_changes,
            }
        }

        /// Recreate the engine over the same chain and backup, as a restart.
        fn restart(&self, self_pos: usize) -> Self {
            Self::build(
                self.keys.clone(),
                self.roster.clone(),
                self.chain.clone(),
                Arc::new(TestTransport::new(self.transport.peers.clone())),
                self.backup.clone(),
                self.clock.clone(),
                self_pos,
                Fixture::config(),
            )
        }

        fn pk(&self, pos: usize) -> PublicKey {
            self.keys[pos].public_key()
        }

        fn deliver(&self, from: usize, frame: &[u8]) {
            self.engine.on_msg(self.pk(from), frame);
            self.engine.run_once(Duration::ZERO);
        }

        fn genesis_hash(&self) -> Hash {
            self.chain.genesis.hash_without_seal()
        }

        fn make_block(&self, number: u64, parent: Hash, txs: Vec<Vec<u8>>) -> (Block, Vec<u8>) {
            let header = BlockHeader {
                number,
                parent_hash: parent,
                state_root: Hash::digest(format!("state-{number}")),
                receipts_root: Hash::digest(format!("receipts-{number}")),
                tx_root: compute_tx_root(&txs),
                timestamp: CLOCK_START,
                proposer: ValidatorIndex(((number - 1) % self.roster.miner_count() as u64) as u32),
                node_list: self.roster.miners(),
            };
            let block = Block {
                header,
                transactions: txs,
            };
            let bytes = block.encode().unwrap();
            (block, bytes)
        }

        fn prepare_frame(
            &self,
            from: usize,
            height: u64,
            view: u64,
            hash: Hash,
            block: Vec<u8>,
        ) -> Vec<u8> {
            let req = PrepareReq::signed(
                &self.keys[from],
                height,
                view,
                ValidatorIndex(from as u32),
                self.clock.now_ms(),
                hash,
                block,
            );
            covenant_messages::encode(&ProtocolMsg::Prepare(req)).unwrap()
        }

        fn sign_frame(&self, from: usize, height: u64, view: u64, hash: Hash) -> Vec<u8> {
            let req = SignReq::signed(
                &self.keys[from],
                height,
                view,
                ValidatorIndex(from as u32),
                self.clock.now_ms(),
                hash,
            );
            covenant_messages::encode(&ProtocolMsg::Sign(req)).unwrap()
        }

        fn commit_frame(&self, from: usize, height: u64, view: u64, hash: Hash) -> Vec<u8> {
            let req = CommitReq::signed(
                &self.keys[from],
                height,
                view,
                ValidatorIndex(from as u32),
                self.clock.now_ms(),
                hash,
            );
            covenant_messages::encode(&ProtocolMsg::Commit(req)).unwrap()
        }

        fn view_change_frame(&self, from: usize, height: u64, view: u64, hash: Hash) -> Vec<u8> {
            let req = ViewChangeReq::signed(
                &self.keys[from],
                height,
                view,
                ValidatorIndex(from as u32),
                self.clock.now_ms(),
                hash,
            );
            covenant_messages::encode(&ProtocolMsg::ViewChange(req)).unwrap()
        }

        /// Drive the fixture engine (as node 3, leader 0) to sign quorum on a
        /// fresh height-1 block. Returns the block hash.
        fn reach_sign_quorum(&self) -> Hash {
            let (block, bytes) = self.make_block(1, self.genesis_hash(), vec![b"tx".to_vec()]);
            let hash = block.hash_without_seal();
            self.deliver(0, &self.prepare_frame(0, 1, 0, hash, bytes));
            self.deliver(1, &self.sign_frame(1, 1, 0, hash));
            self.deliver(2, &self.sign_frame(2, 1, 0, hash));
            hash
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Happy path
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn happy_path_seals_block_with_quorum_signatures() {
        let fx = Fixture::new(4, 3);
        let hash = fx.reach_sign_quorum();

        // Sign quorum: our own Sign and Commit both went out.
        assert_eq!(fx.transport.sent_from(MsgId::Sign, 3), 1);
        assert_eq!(fx.transport.sent_from(MsgId::Commit, 3), 1);

        fx.deliver(1, &fx.commit_frame(1, 1, 0, hash));
        fx.deliver(2, &fx.commit_frame(2, 1, 0, hash));

        let sealed = fx.sealed.lock();
        assert_eq!(sealed.len(), 1);
        let (bytes, by_self) = &sealed[0];
        assert!(!by_self, "proposal came from node 0, not us");

        let sealed_block = SealedBlock::decode(bytes).unwrap();
        assert_eq!(sealed_block.block.hash_without_seal(), hash);
        assert_eq!(sealed_block.sig_list.len(), 3);

        // Ascending validator index, and acceptable to the import verifier.
        let indices: Vec<u32> = sealed_block.sig_list.iter().map(|(i, _)| i.0).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
        check_block_sign(
            &sealed_block.block.header,
            &sealed_block.sig_list,
            &StaticOracle {
                roster: fx.roster.clone(),
            },
        )
        .unwrap();
    }

    #[test]
    fn sign_quorum_persists_committed_prepare() {
        let fx = Fixture::new(4, 3);
        let hash = fx.reach_sign_quorum();

        assert_eq!(fx.engine.committed_hash(), Some(hash));
        let stored = fx.backup.get(BACKUP_KEY_COMMITTED).unwrap().unwrap();
        let decoded = decode_committed(&stored).unwrap().unwrap();
        assert_eq!(decoded.block_hash, hash);
        assert_eq!(decoded.height, 1);
    }

    #[test]
    fn leader_self_flow_generates_seal_and_commit() {
        let fx = Fixture::new(4, 0); // node 0 is leader at height 1, view 0
        assert!(fx.engine.should_seal());

        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();

        let view = fx.engine.generate_seal(&block.header, &bytes).unwrap();
        assert_eq!(view, 0);
        assert_eq!(fx.transport.sent_of_kind(MsgId::Prepare).len(), 1);

        assert!(fx.engine.generate_commit(&block.header, &bytes, view));
        assert_eq!(fx.transport.sent_of_kind(MsgId::Sign).len(), 1);

        fx.deliver(1, &fx.sign_frame(1, 1, 0, hash));
        fx.deliver(2, &fx.sign_frame(2, 1, 0, hash));
        fx.deliver(1, &fx.commit_frame(1, 1, 0, hash));
        fx.deliver(2, &fx.commit_frame(2, 1, 0, hash));

        let sealed = fx.sealed.lock();
        assert_eq!(sealed.len(), 1);
        assert!(sealed[0].1, "we proposed this block");
    }

    #[test]
    fn generate_commit_fails_after_view_moved() {
        let fx = Fixture::new(4, 0);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let view = fx.engine.generate_seal(&block.header, &bytes).unwrap();
        fx.engine.state.lock().view = view + 1;
        assert!(!fx.engine.generate_commit(&block.header, &bytes, view));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Prepare validation ladder
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn duplicate_prepare_is_idempotent() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();
        let frame = fx.prepare_frame(0, 1, 0, hash, bytes);

        fx.deliver(0, &frame);
        fx.deliver(0, &frame);

        assert_eq!(fx.transport.sent_of_kind(MsgId::Sign).len(), 1);
    }

    #[test]
    fn duplicate_sign_is_idempotent() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();
        fx.deliver(0, &fx.prepare_frame(0, 1, 0, hash, bytes));

        let sign = fx.sign_frame(1, 1, 0, hash);
        fx.deliver(1, &sign);
        fx.deliver(1, &sign);

        let st = fx.engine.state.lock();
        // Own sign plus exactly one from node 1.
        assert_eq!(st.sign_cache.get(&hash).unwrap().len(), 2);
    }

    #[test]
    fn prepare_from_non_leader_installs_raw_but_never_votes() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();

        fx.deliver(1, &fx.prepare_frame(1, 1, 0, hash, bytes));

        let st = fx.engine.state.lock();
        assert_eq!(st.raw_prepare.as_ref().map(|r| r.block_hash), Some(hash));
        assert!(st.prepare.is_none());
        drop(st);
        assert!(fx.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    #[test]
    fn prepare_with_tampered_view_fails_signature_binding() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();

        // Sign for view 1, then claim view 0: sig still verifies, sig2 must not.
        let mut req = PrepareReq::signed(
            &fx.keys[0],
            1,
            1,
            ValidatorIndex(0),
            fx.clock.now_ms(),
            hash,
            bytes,
        );
        req.view = 0;
        let frame = covenant_messages::encode(&ProtocolMsg::Prepare(req)).unwrap();
        fx.deliver(0, &frame);

        assert!(fx.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    #[test]
    fn stale_prepare_is_dropped() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();

        // Height 0 is already on chain.
        fx.deliver(0, &fx.prepare_frame(0, 0, 0, hash, bytes));

        let st = fx.engine.state.lock();
        assert!(st.raw_prepare.is_none());
    }

    #[test]
    fn prepare_conflicting_with_committed_block_is_dropped() {
        let fx = Fixture::new(4, 3);
        let (other, other_bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"other".to_vec()]);
        fx.engine.state.lock().committed_prepare = Some(PrepareReq::signed(
            &fx.keys[0],
            1,
            0,
            ValidatorIndex(0),
            fx.clock.now_ms(),
            other.hash_without_seal(),
            other_bytes,
        ));

        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        fx.deliver(0, &fx.prepare_frame(0, 1, 0, block.hash_without_seal(), bytes));

        assert!(fx.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    #[test]
    fn mismatched_execution_hash_is_dropped() {
        let fx = Fixture::new(4, 3);
        let (_, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        // Claim a hash the block does not execute to.
        let bogus = Hash::digest(b"bogus");
        fx.deliver(0, &fx.prepare_frame(0, 1, 0, bogus, bytes));

        assert!(fx.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Future messages
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn future_prepare_parks_then_replays() {
        let fx = Fixture::new(4, 3);

        // Height 2 arrives while we are still on height 1.
        let (block1, _) = fx.make_block(1, fx.genesis_hash(), vec![b"tx1".to_vec()]);
        let h1_hash = block1.hash_without_seal();
        let (block2, bytes2) = fx.make_block(2, h1_hash, vec![b"tx2".to_vec()]);
        let h2_hash = block2.hash_without_seal();

        // Leader for height 2 (highest = 1): (0 + 1) % 4 = node 1.
        fx.deliver(1, &fx.prepare_frame(1, 2, 0, h2_hash, bytes2));
        {
            let st = fx.engine.state.lock();
            assert!(st.future_prepare.is_some());
            assert!(st.raw_prepare.is_none());
        }

        // Import height 1; the parked prepare becomes current on the next tick.
        fx.engine.report_block(&block1.header);
        fx.engine.run_once(Duration::ZERO);

        let st = fx.engine.state.lock();
        assert!(st.future_prepare.is_none());
        assert_eq!(st.raw_prepare.as_ref().map(|r| r.height), Some(2));
        drop(st);
        // We voted on the replayed prepare.
        assert!(!fx.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    #[test]
    fn early_signs_complete_quorum_when_prepare_lands() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();

        // Votes arrive before their proposal.
        fx.deliver(1, &fx.sign_frame(1, 1, 0, hash));
        fx.deliver(2, &fx.sign_frame(2, 1, 0, hash));
        assert!(fx.transport.sent_of_kind(MsgId::Commit).is_empty());

        fx.deliver(0, &fx.prepare_frame(0, 1, 0, hash, bytes));

        // Quorum completed the moment we added our own sign.
        assert_eq!(fx.engine.committed_hash(), Some(hash));
        assert_eq!(fx.transport.sent_of_kind(MsgId::Commit).len(), 1);
    }

    #[test]
    fn commit_from_wrong_view_is_not_counted() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();
        fx.deliver(0, &fx.prepare_frame(0, 1, 0, hash, bytes));

        fx.deliver(1, &fx.commit_frame(1, 1, 1, hash));

        let st = fx.engine.state.lock();
        assert!(st.commit_cache.get(&hash).is_none());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn view_change_quorum_advances_view() {
        let fx = Fixture::new(4, 3);
        let head = fx.genesis_hash();

        fx.deliver(0, &fx.view_change_frame(0, 0, 1, head));
        assert_eq!(fx.engine.view(), 0);
        fx.deliver(1, &fx.view_change_frame(1, 0, 1, head));

        // Two peers ahead (> f) fast-forwarded us; the forced timeout then
        // completed the change with Q-1 buffered requests.
        assert_eq!(fx.engine.view(), 1);
        assert_eq!(fx.engine.to_view(), 1);
        assert!(fx.view_changes.load(Ordering::SeqCst) >= 1);
        assert!(!fx.transport.sent_of_kind(MsgId::ViewChange).is_empty());
    }

    #[test]
    fn view_never_decreases() {
        let fx = Fixture::new(4, 3);
        let head = fx.genesis_hash();
        fx.deliver(0, &fx.view_change_frame(0, 0, 1, head));
        fx.deliver(1, &fx.view_change_frame(1, 0, 1, head));
        assert_eq!(fx.engine.view(), 1);

        // Old view-change traffic cannot move the view backwards.
        fx.deliver(2, &fx.view_change_frame(2, 0, 1, head));
        assert_eq!(fx.engine.view(), 1);
    }

    #[test]
    fn timeout_backs_off_multiplicatively() {
        let fx = Fixture::new(4, 3);
        let timeout = fx.engine.config.view_timeout_ms();

        fx.clock.advance(timeout);
        fx.engine.run_once(Duration::ZERO);
        assert_eq!(fx.engine.to_view(), 1);

        // Next interval is 1.5×; the base interval is no longer enough.
        fx.clock.advance(timeout);
        fx.engine.run_once(Duration::ZERO);
        assert_eq!(fx.engine.to_view(), 1);

        fx.clock.advance(timeout / 2 + 1);
        fx.engine.run_once(Duration::ZERO);
        assert_eq!(fx.engine.to_view(), 2);
    }

    #[test]
    fn forked_view_change_is_refused() {
        let fx = Fixture::new(4, 3);
        let forked = Hash::digest(b"forked-head");

        fx.deliver(0, &fx.view_change_frame(0, 0, 1, forked));
        fx.deliver(1, &fx.view_change_frame(1, 0, 1, forked));

        // Force our own timeout; with the forked requests dropped there is
        // no quorum, so the view must not advance.
        {
            let mut st = fx.engine.state.lock();
            st.last_consensus_time = 0;
        }
        fx.engine.run_once(Duration::ZERO);
        assert_eq!(fx.engine.to_view(), 1);
        assert_eq!(fx.engine.view(), 0);
    }

    #[test]
    fn lagging_peer_receives_current_view_change() {
        let fx = Fixture::new(4, 3);
        fx.engine.state.lock().to_view = 3;

        fx.deliver(0, &fx.view_change_frame(0, 0, 1, fx.genesis_hash()));

        let sent = fx.transport.sent_of_kind(MsgId::ViewChange);
        assert!(sent.iter().any(|m| match m {
            ProtocolMsg::ViewChange(r) => r.view == 3,
            _ => false,
        }));
    }

    #[test]
    fn disconnected_leader_forces_view_change() {
        let fx = Fixture::new(4, 3);
        fx.transport.disconnect(&fx.pk(0)); // node 0 leads height 1, view 0

        assert!(!fx.engine.should_seal());
        fx.engine.run_once(Duration::ZERO);

        assert_eq!(fx.engine.to_view(), 1);
        assert!(!fx.transport.sent_of_kind(MsgId::ViewChange).is_empty());
    }

    #[test]
    fn empty_block_triggers_immediate_view_change() {
        let fx = Fixture::with_config(
            4,
            3,
            PbftConfig {
                omit_empty_block: true,
                ..PbftConfig::default()
            },
        );
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![]);
        let hash = block.hash_without_seal();

        fx.deliver(0, &fx.prepare_frame(0, 1, 0, hash, bytes));

        // No vote, and the back-off was reset for a fresh, immediate change.
        assert!(fx.transport.sent_of_kind(MsgId::Sign).is_empty());
        {
            let st = fx.engine.state.lock();
            assert_eq!(st.change_cycle, 0);
            assert_eq!(st.last_consensus_time, 0);
        }
        fx.engine.run_once(Duration::ZERO);
        assert_eq!(fx.engine.to_view(), 1);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Block import and recovery
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn report_block_resets_round_state() {
        let fx = Fixture::new(4, 3);
        let head = fx.genesis_hash();
        fx.deliver(0, &fx.view_change_frame(0, 0, 1, head));
        fx.deliver(1, &fx.view_change_frame(1, 0, 1, head));
        assert_eq!(fx.engine.view(), 1);

        let (block, _) = fx.make_block(1, head, vec![b"tx".to_vec()]);
        fx.engine.report_block(&block.header);

        assert_eq!(fx.engine.view(), 0);
        assert_eq!(fx.engine.to_view(), 0);
        assert_eq!(fx.engine.consensus_block_number(), 2);
        assert_eq!(fx.engine.highest_block_number(), 1);
        let st = fx.engine.state.lock();
        assert_eq!(st.change_cycle, 0);
        assert!(!st.leader_failed);
    }

    #[test]
    fn restart_replays_committed_prepare() {
        // Node 0 is the leader: seal, reach sign quorum, then "crash".
        let fx = Fixture::new(4, 0);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();
        let view = fx.engine.generate_seal(&block.header, &bytes).unwrap();
        fx.engine.generate_commit(&block.header, &bytes, view);
        fx.deliver(1, &fx.sign_frame(1, 1, 0, hash));
        fx.deliver(2, &fx.sign_frame(2, 1, 0, hash));
        assert_eq!(fx.engine.committed_hash(), Some(hash));

        // New engine over the same durable backup.
        let restarted = fx.restart(0);
        assert_eq!(restarted.engine.committed_hash(), Some(hash));

        // should_seal finds the committed-but-unsaved block and replays it.
        assert!(!restarted.engine.should_seal());
        let prepares = restarted.transport.sent_of_kind(MsgId::Prepare);
        assert_eq!(prepares.len(), 1);
        match &prepares[0] {
            ProtocolMsg::Prepare(r) => {
                assert_eq!(r.block_hash, hash);
                assert_eq!(r.height, 1);
            }
            _ => unreachable!(),
        }
        // And votes on its own replayed proposal.
        assert!(!restarted.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    #[test]
    fn sealing_skipped_when_behind() {
        // A commit quorum for an already-imported height is discarded.
        let fx = Fixture::new(4, 3);
        let hash = fx.reach_sign_quorum();
        fx.deliver(1, &fx.commit_frame(1, 1, 0, hash));

        // Import height 1 out from under the pending quorum.
        let (block, _) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        fx.engine.report_block(&block.header);

        fx.deliver(2, &fx.commit_frame(2, 1, 0, hash));
        assert!(fx.sealed.lock().is_empty());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leader rule
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn leader_rotates_with_view_and_height() {
        let fx = Fixture::new(4, 3);
        {
            let st = fx.engine.state.lock();
            assert_eq!(PbftEngine::leader(&st), Some(ValidatorIndex(0)));
        }
        {
            let mut st = fx.engine.state.lock();
            st.view = 1;
            assert_eq!(PbftEngine::leader(&st), Some(ValidatorIndex(1)));
            st.view = 5;
            assert_eq!(PbftEngine::leader(&st), Some(ValidatorIndex(1)));
            st.view = 0;
        }
    }

    #[test]
    fn no_leader_while_failed_or_misconfigured() {
        let fx = Fixture::new(4, 3);
        {
            let mut st = fx.engine.state.lock();
            st.leader_failed = true;
            assert_eq!(PbftEngine::leader(&st), None);
            st.leader_failed = false;
            st.cfg_err = true;
            assert_eq!(PbftEngine::leader(&st), None);
        }
    }

    #[test]
    fn single_node_network_seals_alone() {
        let fx = Fixture::new(1, 0);
        assert!(fx.engine.should_seal());
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let view = fx.engine.generate_seal(&block.header, &bytes).unwrap();
        fx.engine.generate_commit(&block.header, &bytes, view);

        let sealed = fx.sealed.lock();
        assert_eq!(sealed.len(), 1);
        let decoded = SealedBlock::decode(&sealed[0].0).unwrap();
        assert_eq!(decoded.sig_list.len(), 1);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sender hygiene
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn message_claiming_our_own_index_is_dropped() {
        let fx = Fixture::new(4, 3);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();
        fx.deliver(0, &fx.prepare_frame(0, 1, 0, hash, bytes));

        // A sign forged under our own index (but another key) is suspicious.
        let forged = fx.sign_frame(3, 1, 0, hash);
        fx.deliver(1, &forged);

        let st = fx.engine.state.lock();
        // Only our genuine sign is present.
        assert_eq!(st.sign_cache.get(&hash).unwrap().len(), 1);
    }

    #[test]
    fn frames_from_unknown_peers_never_enqueue() {
        let fx = Fixture::new(4, 3);
        let stranger = covenant_types::test_utils::test_keypair(42);
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let frame = fx.prepare_frame(0, 1, 0, block.hash_without_seal(), bytes);

        fx.engine.on_msg(stranger.public_key(), &frame);
        assert!(fx.engine.queue.is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped_without_effect() {
        let fx = Fixture::new(4, 3);
        fx.engine.on_msg(fx.pk(0), b"garbage");
        assert!(fx.engine.queue.is_empty());

        // A well-formed header with a corrupt payload is dropped by the worker.
        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let mut frame = fx.prepare_frame(0, 1, 0, block.hash_without_seal(), bytes);
        frame[6] ^= 0xff; // clobber the SBOR payload prefix
        fx.deliver(0, &frame);

        let st = fx.engine.state.lock();
        assert!(st.raw_prepare.is_none());
    }
    // ═══════════════════════════════════════════════════════════════════════
    // Roles and configuration
    // ═══════════════════════════════════════════════════════════════════════

    /// Build a fixture whose roster has `miners` miners plus one observer,
    /// with the engine running as the observer.
    fn observer_fixture(miners: u8) -> Fixture {
        use covenant_types::{Roster, ValidatorInfo, ValidatorRole};

        let keys: Vec<KeyPair> = (0..=miners)
            .map(|s| covenant_types::test_utils::test_keypair(s))
            .collect();
        let infos: Vec<ValidatorInfo> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| ValidatorInfo {
                index: ValidatorIndex(i as u32),
                public_key: k.public_key(),
                role: if i < miners as usize {
                    ValidatorRole::Miner
                } else {
                    ValidatorRole::Observer
                },
            })
            .collect();
        let roster = Roster::new(infos).unwrap();
        let self_pos = miners as usize;
        let chain = Arc::new(TestChain::new(&roster));
        let peers: Vec<PublicKey> = keys
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self_pos)
            .map(|(_, k)| k.public_key())
            .collect();
        Fixture::build(
            keys,
            roster,
            chain,
            Arc::new(TestTransport::new(peers)),
            Arc::new(MemoryBackup::new()),
            Arc::new(ManualClock::new(CLOCK_START)),
            self_pos,
            Fixture::config(),
        )
    }

    #[test]
    fn observer_validates_but_never_votes() {
        let fx = observer_fixture(4);
        assert!(!fx.engine.is_miner());
        assert!(!fx.engine.cfg_err());
        assert!(!fx.engine.should_seal());

        let (block, bytes) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        let hash = block.hash_without_seal();
        fx.deliver(0, &fx.prepare_frame(0, 1, 0, hash, bytes));

        // The proposal was accepted and installed, but no vote went out.
        {
            let st = fx.engine.state.lock();
            assert_eq!(st.prepare.as_ref().map(|p| p.block_hash), Some(hash));
        }
        assert_eq!(fx.transport.sent_from(MsgId::Sign, 4), 0);

        // Nor does an observer broadcast view changes on timeout.
        fx.clock.advance(fx.engine.config.view_timeout_ms());
        fx.engine.run_once(Duration::ZERO);
        assert_eq!(fx.engine.to_view(), 1);
        assert_eq!(fx.transport.sent_from(MsgId::ViewChange, 4), 0);
    }

    #[test]
    fn key_outside_roster_disables_sealing() {
        let (keys, roster) = test_roster(4);
        let outsider = covenant_types::test_utils::test_keypair(99);
        let chain = Arc::new(TestChain::new(&roster));
        let peers: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();
        let engine = PbftEngine::new(
            Fixture::config(),
            outsider,
            chain,
            Arc::new(StaticOracle { roster }),
            Arc::new(TestTransport::new(peers)),
            Arc::new(MemoryBackup::new()),
            Arc::new(ManualClock::new(CLOCK_START)),
        );

        assert!(engine.cfg_err());
        assert!(!engine.should_seal());
        let status = engine.status();
        assert!(status.cfg_err);
        assert_eq!(status.leader, None);
    }

    #[test]
    fn status_reflects_round_state() {
        let fx = Fixture::new(4, 3);
        let status = fx.engine.status();
        assert_eq!(status.highest_block, 0);
        assert_eq!(status.consensus_block_number, 1);
        assert_eq!(status.view, 0);
        assert_eq!(status.leader, Some(ValidatorIndex(0)));
        assert_eq!(status.node_count, 4);
        assert!(status.is_miner);
        assert!(!status.cfg_err);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Forwarding and housekeeping
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn stale_timestamps_are_not_forwarded() {
        let fx = Fixture::new(4, 3);
        let hash = Hash::digest(b"somewhere-else");

        // Valid cacheable sign, but timestamped a full two timeouts ago.
        let old = CLOCK_START - 2 * fx.engine.config.view_timeout_ms();
        let req = SignReq::signed(&fx.keys[1], 1, 0, ValidatorIndex(1), old, hash);
        let frame = covenant_messages::encode(&ProtocolMsg::Sign(req)).unwrap();
        fx.deliver(1, &frame);

        // Handled (cached for later) but not echoed to other peers.
        {
            let st = fx.engine.state.lock();
            assert_eq!(st.sign_cache.get(&hash).map(|m| m.len()), Some(1));
        }
        assert!(fx.transport.sent_of_kind(MsgId::Sign).is_empty());
    }

    #[test]
    fn garbage_collection_prunes_votes_below_the_head() {
        let fx = Fixture::new(4, 3);

        // Import height 1, then plant a leftover vote for height 0.
        let (block, _) = fx.make_block(1, fx.genesis_hash(), vec![b"tx".to_vec()]);
        fx.engine.report_block(&block.header);
        let stale_hash = Hash::digest(b"stale");
        {
            let mut st = fx.engine.state.lock();
            let stale = SignReq::signed(
                &fx.keys[1],
                0,
                0,
                ValidatorIndex(1),
                CLOCK_START,
                stale_hash,
            );
            st.sign_cache
                .entry(stale_hash)
                .or_default()
                .insert(stale.sig.to_hex(), stale);
        }

        fx.clock
            .advance(fx.engine.config.collect_interval_ms() + 1);
        fx.engine.run_once(Duration::ZERO);

        let st = fx.engine.state.lock();
        assert!(st.sign_cache.get(&stale_hash).is_none());
    }
}

