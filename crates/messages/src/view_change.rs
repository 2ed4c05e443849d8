//! Request to abandon the current view.

use crate::signed::{impl_signed_msg, unsigned_fields};
use covenant_types::{Hash, KeyPair, Signature, ValidatorIndex};
use sbor::prelude::BasicSbor;

/// A signed announcement that the sender wants to move to view `view`.
///
/// Unlike the voting messages, `height` is the sender's *current* chain head
/// and `block_hash` is that head's seal-free hash; receivers use the pair to
/// detect stale senders and forked peers.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ViewChangeReq {
    /// The sender's highest imported block number.
    pub height: u64,
    /// The view the sender wants to move to.
    pub view: u64,
    /// Roster index of the sender.
    pub idx: ValidatorIndex,
    /// Sender wall-clock, milliseconds since epoch.
    pub timestamp: u64,
    /// Seal-free hash of the sender's highest block.
    pub block_hash: Hash,
    /// Signature over `block_hash`.
    pub sig: Signature,
    /// Signature over all other fields.
    pub sig2: Signature,
}

impl ViewChangeReq {
    /// Build and sign a view-change request.
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

impl_signed_msg!(ViewChangeReq);
