//! Deterministic in-memory chain for simulation.
//!
//! Candidate execution is a pure function of the parent block and the
//! transaction payloads, so every honest node that executes the same
//! candidate computes the same post-state root — which is exactly what the
//! consensus hash checks rely on.

use covenant_pbft::{check_block_sign, ChainError, ChainFacade, ExecutedCandidate, ValidatorOracle};
use covenant_types::{
    compute_tx_root, Block, BlockHeader, Hash, Roster, RosterError, SealedBlock, ValidatorIndex,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A fixed roster for every height, as in a static permissioned deployment.
pub struct StaticOracle {
    roster: Roster,
}

impl StaticOracle {
    /// Wrap a roster.
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }

    /// The underlying roster.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }
}

impl ValidatorOracle for StaticOracle {
    fn roster_at(&self, _height: u64) -> Result<Roster, RosterError> {
        Ok(self.roster.clone())
    }
}

struct ChainInner {
    /// Imported blocks, indexed by height.
    blocks: Vec<SealedBlock>,
    by_hash: HashMap<Hash, u64>,
    /// Canonical bytes of executed candidates, keyed by header hash.
    exec_cache: HashMap<Hash, Vec<u8>>,
}

/// In-memory blockchain with deterministic execution.
pub struct MemChain {
    oracle: Arc<StaticOracle>,
    inner: Mutex<ChainInner>,
}

impl MemChain {
    /// Create a chain holding only the genesis block.
    pub fn new(oracle: Arc<StaticOracle>) -> Self {
        let genesis = SealedBlock {
            block: Block {
                header: BlockHeader::genesis(oracle.roster().miners()),
                transactions: vec![],
            },
            sig_list: vec![],
        };
        let hash = genesis.block.hash_without_seal();
        Self {
            oracle,
            inner: Mutex::new(ChainInner {
                blocks: vec![genesis],
                by_hash: [(hash, 0)].into_iter().collect(),
                exec_cache: HashMap::new(),
            }),
        }
    }

    /// Height of the chain head.
    pub fn height(&self) -> u64 {
        self.inner.lock().blocks.len() as u64 - 1
    }

    /// Seal-free hash of the chain head.
    pub fn head_hash(&self) -> Hash {
        self.current_header().hash_without_seal()
    }

    /// Deterministic post-state root for a child of `parent` carrying `txs`.
    fn exec_state_root(parent: &BlockHeader, tx_root: &Hash) -> Hash {
        let mut acc = Vec::with_capacity(Hash::LENGTH * 2);
        acc.extend_from_slice(parent.state_root.as_bytes());
        acc.extend_from_slice(tx_root.as_bytes());
        Hash::digest(acc)
    }

    /// Deterministic receipts root.
    fn exec_receipts_root(tx_root: &Hash) -> Hash {
        let mut acc = Vec::with_capacity(Hash::LENGTH + 8);
        acc.extend_from_slice(tx_root.as_bytes());
        acc.extend_from_slice(b"receipts");
        Hash::digest(acc)
    }

    /// Build a candidate block on top of the current head.
    ///
    /// Returns the header and the canonical block bytes the proposer hands to
    /// `generate_seal`.
    pub fn make_candidate(
        &self,
        transactions: Vec<Vec<u8>>,
        proposer: ValidatorIndex,
        timestamp: u64,
    ) -> (BlockHeader, Vec<u8>) {
        let parent = self.current_header();
        let tx_root = compute_tx_root(&transactions);
        let header = BlockHeader {
            number: parent.number + 1,
            parent_hash: parent.hash_without_seal(),
            state_root: Self::exec_state_root(&parent, &tx_root),
            receipts_root: Self::exec_receipts_root(&tx_root),
            tx_root,
            timestamp,
            proposer,
            node_list: self.oracle.roster().miners(),
        };
        let block = Block {
            header: header.clone(),
            transactions,
        };
        let bytes = block
            .encode()
            .unwrap_or_default();
        (header, bytes)
    }
}

impl ChainFacade for MemChain {
    fn current_header(&self) -> BlockHeader {
        let inner = self.inner.lock();
        inner.blocks[inner.blocks.len() - 1].block.header.clone()
    }

    fn block_by_number(&self, number: u64) -> Option<SealedBlock> {
        self.inner.lock().blocks.get(number as usize).cloned()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<SealedBlock> {
        let inner = self.inner.lock();
        inner
            .by_hash
            .get(hash)
            .and_then(|&n| inner.blocks.get(n as usize))
            .cloned()
    }

    fn last_hashes(&self) -> Vec<Hash> {
        let inner = self.inner.lock();
        inner
            .blocks
            .iter()
            .rev()
            .take(256)
            .map(|b| b.block.hash_without_seal())
            .collect()
    }

    fn execute_candidate(&self, block: &[u8]) -> Result<ExecutedCandidate, ChainError> {
        let decoded = Block::decode(block).map_err(|e| ChainError::Malformed(e.to_string()))?;
        let parent = self.current_header();

        if decoded.header.number != parent.number + 1 {
            return Err(ChainError::Execution(format!(
                "candidate number {} does not extend head {}",
                decoded.header.number, parent.number
            )));
        }
        if decoded.header.parent_hash != parent.hash_without_seal() {
            return Err(ChainError::Execution("candidate parent hash mismatch".into()));
        }

        let tx_root = compute_tx_root(&decoded.transactions);
        let header = BlockHeader {
            number: decoded.header.number,
            parent_hash: decoded.header.parent_hash,
            state_root: Self::exec_state_root(&parent, &tx_root),
            receipts_root: Self::exec_receipts_root(&tx_root),
            tx_root,
            timestamp: decoded.header.timestamp,
            proposer: decoded.header.proposer,
            node_list: self.oracle.roster().miners(),
        };
        let tx_count = decoded.transactions.len();
        let canonical = Block {
            header: header.clone(),
            transactions: decoded.transactions,
        }
        .encode()
        .map_err(|e| ChainError::Execution(e.to_string()))?;

        Ok(ExecutedCandidate {
            header,
            tx_count,
            canonical,
        })
    }

    fn add_block_cache(&self, executed: ExecutedCandidate) {
        self.inner
            .lock()
            .exec_cache
            .insert(executed.header.hash_without_seal(), executed.canonical);
    }

    fn import_sealed(&self, sealed: &[u8]) -> Result<(), ChainError> {
        let sealed = SealedBlock::decode(sealed).map_err(|e| ChainError::Malformed(e.to_string()))?;
        let hash = sealed.block.hash_without_seal();

        let mut inner = self.inner.lock();
        if inner.by_hash.contains_key(&hash) {
            return Ok(());
        }

        let head_number = inner.blocks.len() as u64 - 1;
        if sealed.block.header.number != head_number + 1 {
            return Err(ChainError::Import(format!(
                "block {} does not extend head {}",
                sealed.block.header.number, head_number
            )));
        }

        check_block_sign(&sealed.block.header, &sealed.sig_list, self.oracle.as_ref())
            .map_err(|e| ChainError::Import(e.to_string()))?;

        // Replay the execution unless this exact candidate was cached.
        if inner.exec_cache.remove(&hash).is_none() {
            let parent = inner.blocks[head_number as usize].block.header.clone();
            let tx_root = compute_tx_root(&sealed.block.transactions);
            if sealed.block.header.tx_root != tx_root
                || sealed.block.header.state_root != Self::exec_state_root(&parent, &tx_root)
            {
                return Err(ChainError::Import("state root mismatch".into()));
            }
        }

        debug!(
            number = sealed.block.header.number,
            hash = %hash.abridged(),
            signatures = sealed.sig_list.len(),
            "Imported sealed block"
        );
        let number = sealed.block.header.number;
        inner.by_hash.insert(hash, number);
        inner.blocks.push(sealed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_types::test_utils::test_roster;

    fn chain() -> (Vec<covenant_types::KeyPair>, Arc<StaticOracle>, MemChain) {
        let (keys, roster) = test_roster(4);
        let oracle = Arc::new(StaticOracle::new(roster));
        let chain = MemChain::new(oracle.clone());
        (keys, oracle, chain)
    }

    #[test]
    fn genesis_is_height_zero() {
        let (_, _, chain) = chain();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.current_header().number, 0);
    }

    #[test]
    fn execution_is_deterministic() {
        let (_, _, chain) = chain();
        let (header, bytes) = chain.make_candidate(vec![b"tx".to_vec()], ValidatorIndex(0), 7);
        let a = chain.execute_candidate(&bytes).unwrap();
        let b = chain.execute_candidate(&bytes).unwrap();
        assert_eq!(a.header, b.header);
        assert_eq!(a.header.hash_without_seal(), header.hash_without_seal());
        assert_eq!(a.tx_count, 1);
    }

    #[test]
    fn execution_rejects_wrong_parent() {
        let (_, _, chain) = chain();
        let (_, bytes) = chain.make_candidate(vec![], ValidatorIndex(0), 7);
        let mut block = Block::decode(&bytes).unwrap();
        block.header.parent_hash = Hash::digest(b"elsewhere");
        let bytes = block.encode().unwrap();
        assert!(chain.execute_candidate(&bytes).is_err());
    }

    #[test]
    fn import_requires_quorum_signatures() {
        let (keys, _, chain) = chain();
        let (header, bytes) = chain.make_candidate(vec![b"tx".to_vec()], ValidatorIndex(0), 7);
        let hash = header.hash_without_seal();
        let block = Block::decode(&bytes).unwrap();

        let underfull = SealedBlock {
            block: block.clone(),
            sig_list: vec![(ValidatorIndex(0), keys[0].sign(hash.as_bytes()))],
        };
        assert!(chain.import_sealed(&underfull.encode().unwrap()).is_err());

        let sealed = SealedBlock {
            block,
            sig_list: (0..3)
                .map(|i| (ValidatorIndex(i as u32), keys[i].sign(hash.as_bytes())))
                .collect(),
        };
        chain.import_sealed(&sealed.encode().unwrap()).unwrap();
        assert_eq!(chain.height(), 1);

        // Importing the same block twice is a no-op.
        chain.import_sealed(&sealed.encode().unwrap()).unwrap();
        assert_eq!(chain.height(), 1);
    }
}
