//! The leader's block proposal.

use crate::signed::{impl_signed_msg, unsigned_fields};
use covenant_types::{Hash, KeyPair, Signature, ValidatorIndex};
use sbor::prelude::BasicSbor;

/// Proposal for one `(height, view)`: the only message that carries the block.
///
/// The payload is the canonical encoding of the proposed block; receivers
/// re-execute it and refuse to vote unless the recomputed header hash matches
/// `block_hash`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PrepareReq {
    /// Height being proposed.
    pub height: u64,
    /// View the proposal belongs to.
    pub view: u64,
    /// Roster index of the proposer.
    pub idx: ValidatorIndex,
    /// Sender wall-clock, milliseconds since epoch.
    pub timestamp: u64,
    /// Hash of the proposed header, without seal.
    pub block_hash: Hash,
    /// Signature over `block_hash`.
    pub sig: Signature,
    /// Signature over all fields except `block`.
    pub sig2: Signature,
    /// Canonical block bytes.
    pub block: Vec<u8>,
}

impl PrepareReq {
    /// Build and sign a proposal.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        key: &KeyPair,
        height: u64,
        view: u64,
        idx: ValidatorIndex,
        timestamp: u64,
        block_hash: Hash,
        block: Vec<u8>,
    ) -> Self {
        let sig = key.sign(block_hash.as_bytes());
        let sig2 = key.sign(&unsigned_fields(height, view, idx, timestamp, &block_hash));
        Self {
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
            sig2,
            block,
        }
    }
}

impl_signed_msg!(PrepareReq);
