//! Block header, block payload, and the sealed form carried on the wire.

use crate::{Hash, PublicKey, Signature, ValidatorIndex};
use sbor::prelude::BasicSbor;
use thiserror::Error;

/// Errors from block encoding and decoding.
#[derive(Debug, Error)]
pub enum BlockCodecError {
    #[error("Block encode error: {0}")]
    Encode(String),

    #[error("Block decode error: {0}")]
    Decode(String),
}

/// A block header.
///
/// `node_list` records the miner set the block was sealed under (the miner
/// subset of the roster at `number - 1`), so imports can be verified without
/// replaying roster history.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeader {
    /// Height of this block.
    pub number: u64,
    /// Hash of the parent header (without seal).
    pub parent_hash: Hash,
    /// Post-state root after executing this block.
    pub state_root: Hash,
    /// Root over the transaction receipts.
    pub receipts_root: Hash,
    /// Root over the transaction payloads.
    pub tx_root: Hash,
    /// Wall-clock at proposal, milliseconds since epoch.
    pub timestamp: u64,
    /// Index of the proposing validator.
    pub proposer: ValidatorIndex,
    /// Ordered miner public keys at `number - 1`.
    pub node_list: Vec<PublicKey>,
}

impl BlockHeader {
    /// The header hash excluding any seal material.
    ///
    /// Every consensus message refers to a block by this hash.
    pub fn hash_without_seal(&self) -> Hash {
        // The header carries no seal fields itself; the signatures live on
        // SealedBlock, so hashing the encoded header is already seal-free.
        match sbor::basic_encode(self) {
            Ok(bytes) => Hash::digest(bytes),
            // Unreachable for a well-formed header; keep a stable sentinel
            // rather than panicking in consensus paths.
            Err(_) => Hash::ZERO,
        }
    }

    /// Build a genesis header for the given initial miner set.
    pub fn genesis(node_list: Vec<PublicKey>) -> Self {
        Self {
            number: 0,
            parent_hash: Hash::ZERO,
            state_root: Hash::digest(b"genesis-state"),
            receipts_root: Hash::ZERO,
            tx_root: Hash::ZERO,
            timestamp: 0,
            proposer: ValidatorIndex(0),
            node_list,
        }
    }
}

/// Compute the transaction root over opaque transaction payloads.
pub fn compute_tx_root(transactions: &[Vec<u8>]) -> Hash {
    let mut acc = Vec::with_capacity(transactions.len() * Hash::LENGTH);
    for tx in transactions {
        acc.extend_from_slice(Hash::digest(tx).as_bytes());
    }
    Hash::digest(acc)
}

/// An unsealed block: header plus opaque transaction payloads.
///
/// Transaction contents are owned by the execution layer; consensus treats
/// them as bytes and only ever recomputes `tx_root` over them.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Block {
    /// The header.
    pub header: BlockHeader,
    /// Opaque transaction payloads, in order.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    /// Encode to the canonical byte form carried inside a Prepare.
    pub fn encode(&self) -> Result<Vec<u8>, BlockCodecError> {
        sbor::basic_encode(self).map_err(|e| BlockCodecError::Encode(format!("{e:?}")))
    }

    /// Decode from canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockCodecError> {
        sbor::basic_decode(bytes).map_err(|e| BlockCodecError::Decode(format!("{e:?}")))
    }

    /// The header hash without seal.
    pub fn hash_without_seal(&self) -> Hash {
        self.header.hash_without_seal()
    }
}

/// A block extended with its commit signatures, ready for import.
///
/// The signature list is ordered by ascending validator index so the encoded
/// form is deterministic across implementations.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SealedBlock {
    /// The block being sealed.
    pub block: Block,
    /// `(validator index, commit signature over the header hash)` pairs.
    pub sig_list: Vec<(ValidatorIndex, Signature)>,
}

impl SealedBlock {
    /// Encode to the byte form handed to block import.
    pub fn encode(&self) -> Result<Vec<u8>, BlockCodecError> {
        sbor::basic_encode(self).map_err(|e| BlockCodecError::Encode(format!("{e:?}")))
    }

    /// Decode from import bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockCodecError> {
        sbor::basic_decode(bytes).map_err(|e| BlockCodecError::Decode(format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_roster;

    fn sample_header() -> BlockHeader {
        let (_, roster) = test_roster(4);
        BlockHeader {
            number: 7,
            parent_hash: Hash::digest(b"parent"),
            state_root: Hash::digest(b"state"),
            receipts_root: Hash::digest(b"receipts"),
            tx_root: Hash::digest(b"txs"),
            timestamp: 1_700_000_000_000,
            proposer: ValidatorIndex(2),
            node_list: roster.miners(),
        }
    }

    #[test]
    fn header_hash_changes_with_contents() {
        let a = sample_header();
        let mut b = a.clone();
        b.number = 8;
        assert_ne!(a.hash_without_seal(), b.hash_without_seal());
    }

    #[test]
    fn header_hash_is_stable() {
        let a = sample_header();
        assert_eq!(a.hash_without_seal(), a.clone().hash_without_seal());
    }

    #[test]
    fn block_round_trip() {
        let block = Block {
            header: sample_header(),
            transactions: vec![b"tx-one".to_vec(), b"tx-two".to_vec()],
        };
        let bytes = block.encode().unwrap();
        let decoded = Block::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn sealed_block_round_trip() {
        let block = Block {
            header: sample_header(),
            transactions: vec![b"tx".to_vec()],
        };
        let sealed = SealedBlock {
            block,
            sig_list: vec![
                (ValidatorIndex(0), Signature::zero()),
                (ValidatorIndex(2), Signature::zero()),
            ],
        };
        let bytes = sealed.encode().unwrap();
        assert_eq!(SealedBlock::decode(&bytes).unwrap(), sealed);
    }

    #[test]
    fn tx_root_depends_on_order() {
        let a = compute_tx_root(&[b"a".to_vec(), b"b".to_vec()]);
        let b = compute_tx_root(&[b"b".to_vec(), b"a".to_vec()]);
        assert_ne!(a, b);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Block::decode(b"not a block").is_err());
    }
}
