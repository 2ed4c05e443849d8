//! Collaborator capabilities injected into the engine at construction.
//!
//! The engine never reaches for globals: block execution, roster lookup, and
//! peer delivery are all constructor-injected trait objects, and sealed
//! blocks flow back to the host through registered callbacks.

use covenant_types::{BlockHeader, Hash, PublicKey, Roster, RosterError, SealedBlock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors surfaced by the chain facade.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Candidate execution failed: {0}")]
    Execution(String),

    #[error("Block import failed: {0}")]
    Import(String),

    #[error("Malformed block payload: {0}")]
    Malformed(String),
}

/// The result of deterministically executing a candidate block.
#[derive(Debug, Clone)]
pub struct ExecutedCandidate {
    /// The real header after execution, with recomputed roots.
    pub header: BlockHeader,
    /// How many transactions the block carries.
    pub tx_count: usize,
    /// The canonical re-encoding of the executed block.
    pub canonical: Vec<u8>,
}

/// What the engine needs from the blockchain.
pub trait ChainFacade: Send + Sync {
    /// The header of the current chain head.
    fn current_header(&self) -> BlockHeader;

    /// Look up an imported block by number.
    fn block_by_number(&self, number: u64) -> Option<SealedBlock>;

    /// Look up an imported block by seal-free header hash.
    fn block_by_hash(&self, hash: &Hash) -> Option<SealedBlock>;

    /// Seal-free hashes of the most recent blocks, newest first.
    fn last_hashes(&self) -> Vec<Hash>;

    /// Execute a candidate block's transactions against the current state and
    /// return the real post-execution header.
    fn execute_candidate(&self, block: &[u8]) -> Result<ExecutedCandidate, ChainError>;

    /// Cache an executed candidate so a later import can skip re-execution.
    fn add_block_cache(&self, executed: ExecutedCandidate);

    /// Import a sealed block (header + quorum signatures).
    fn import_sealed(&self, sealed: &[u8]) -> Result<(), ChainError>;
}

/// Roster lookup from the on-chain system contracts.
pub trait ValidatorOracle: Send + Sync {
    /// The roster recorded on chain at `height`.
    ///
    /// Consensus for height `h` runs over `roster_at(h - 1)`.
    fn roster_at(&self, height: u64) -> Result<Roster, RosterError>;
}

/// Authenticated, ordered, per-peer byte streams to every known validator.
///
/// Delivery is fire-and-forget: the transport owns retries and teardown, and
/// the engine only ever addresses peers by their roster public key.
pub trait Transport: Send + Sync {
    /// Public keys of currently connected peers.
    fn peer_ids(&self) -> Vec<PublicKey>;

    /// Whether a specific peer is currently connected.
    fn is_connected(&self, peer: &PublicKey) -> bool;

    /// Write one encoded frame to a peer's stream.
    fn send(&self, peer: &PublicKey, bytes: &[u8]);
}

/// Callback invoked when the engine assembles a sealed block.
///
/// Arguments are the encoded [`SealedBlock`] and whether this node proposed
/// it. Called with the engine lock held: implementations must hand the block
/// off (queue it for import) rather than call back into the engine.
pub type SealCallback = Box<dyn Fn(&[u8], bool) + Send + Sync>;

/// Callback invoked whenever a view-change attempt begins (`to_view`
/// advanced). Used by the host for diagnostics only.
pub type ViewChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Time source, milliseconds since the Unix epoch.
///
/// Injected so the state machine can be driven with simulated time in tests;
/// production uses [`SystemClock`].
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Start at the given time.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Move time forward.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
