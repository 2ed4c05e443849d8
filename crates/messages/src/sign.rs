//! First-phase vote on a proposed block.

use crate::signed::{impl_signed_msg, unsigned_fields};
use covenant_types::{Hash, KeyPair, Signature, ValidatorIndex};
use sbor::prelude::BasicSbor;

/// A miner's first-phase vote: "I executed this proposal and got this hash".
///
/// `Q` distinct Sign votes on one hash commit the proposal locally; the `sig`
/// field doubles as the vote's identity in the sign cache.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SignReq {
    /// Height being voted on.
    pub height: u64,
    /// View the vote belongs to.
    pub view: u64,
    /// Roster index of the voter.
    pub idx: ValidatorIndex,
    /// Sender wall-clock, milliseconds since epoch.
    pub timestamp: u64,
    /// Hash of the header being voted on.
    pub block_hash: Hash,
    /// Signature over `block_hash`.
    pub sig: Signature,
    /// Signature over all other fields.
    pub sig2: Signature,
}

impl SignReq {
    /// Build and sign a vote.
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

impl_signed_msg!(SignReq);
