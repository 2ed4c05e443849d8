//! Second-phase vote on a sign-quorum block.

use crate::signed::{impl_signed_msg, unsigned_fields};
use covenant_types::{Hash, KeyPair, Signature, ValidatorIndex};
use sbor::prelude::BasicSbor;

/// A miner's second-phase vote, sent only after witnessing sign quorum.
///
/// The `sig` of each Commit is what ends up in the sealed block's signature
/// list, so it is exactly a signature over the header hash.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct CommitReq {
    /// Height being committed.
    pub height: u64,
    /// View the vote belongs to.
    pub view: u64,
    /// Roster index of the voter.
    pub idx: ValidatorIndex,
    /// Sender wall-clock, milliseconds since epoch.
    pub timestamp: u64,
    /// Hash of the header being committed.
    pub block_hash: Hash,
    /// Signature over `block_hash`.
    pub sig: Signature,
    /// Signature over all other fields.
    pub sig2: Signature,
}

impl CommitReq {
    /// Build and sign a commit vote.
    pub fn signed(
        key: &KeyPair,
        height: u64,
        view: u64,
        idx: ValidatorIndex,
        timestamp: u64,
        block_hash: Hash,
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
        }
    }
}

impl_signed_msg!(CommitReq);
