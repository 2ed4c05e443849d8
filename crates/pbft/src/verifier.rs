//! Signature verification for incoming sealed blocks.
//!
//! Used by the chain on import: a block is acceptable only if its header
//! records exactly the miner set of the roster at `number - 1` and it carries
//! at least a quorum of valid, distinct miner signatures over the seal-free
//! header hash.

use crate::traits::ValidatorOracle;
use covenant_types::{BlockHeader, RosterError, Signature, ValidatorIndex};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Why a sealed block was rejected.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("No roster for height {height}: {source}")]
    RosterLookup {
        height: u64,
        #[source]
        source: RosterError,
    },

    #[error("Genesis blocks carry no seal")]
    Genesis,

    #[error("Header node list does not match the roster miners at height {0}")]
    NodeListMismatch(u64),

    #[error("Not enough signatures: got {got}, quorum is {quorum}")]
    NotEnoughSignatures { got: usize, quorum: usize },

    #[error("Signer index {0} out of range for {1} miners")]
    IndexOutOfRange(u32, usize),

    #[error("Duplicate signer index {0}")]
    DuplicateSigner(u32),

    #[error("Invalid signature from index {0}")]
    BadSignature(u32),
}

/// Verify the signature list attached to an imported block.
pub fn check_block_sign(
    header: &BlockHeader,
    sig_list: &[(ValidatorIndex, Signature)],
    oracle: &dyn ValidatorOracle,
) -> Result<(), VerifyError> {
    if header.number == 0 {
        return Err(VerifyError::Genesis);
    }

    let roster_height = header.number - 1;
    let roster = oracle
        .roster_at(roster_height)
        .map_err(|source| VerifyError::RosterLookup {
            height: roster_height,
            source,
        })?;
    let miners = roster.miners();

    if header.node_list != miners {
        return Err(VerifyError::NodeListMismatch(roster_height));
    }

    let n = miners.len();
    let quorum = n - (n - 1) / 3;
    if sig_list.len() < quorum {
        return Err(VerifyError::NotEnoughSignatures {
            got: sig_list.len(),
            quorum,
        });
    }

    let hash = header.hash_without_seal();
    let mut seen: HashSet<u32> = HashSet::with_capacity(sig_list.len());
    for (idx, sig) in sig_list {
        if idx.as_usize() >= n {
            return Err(VerifyError::IndexOutOfRange(idx.0, n));
        }
        if !seen.insert(idx.0) {
            return Err(VerifyError::DuplicateSigner(idx.0));
        }
        if !miners[idx.as_usize()].verify(hash.as_bytes(), sig) {
            return Err(VerifyError::BadSignature(idx.0));
        }
    }

    debug!(
        number = header.number,
        hash = %hash.abridged(),
        signatures = sig_list.len(),
        "Sealed block signatures verified"
    );
    Ok(())
}
