//! Core types for Covenant consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, cryptographic keys and signatures
//! - **Identity**: ValidatorIndex, ValidatorRole, Roster
//! - **Chain types**: BlockHeader, Block, SealedBlock
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod block;
mod crypto;
mod hash;
mod validator;

pub use block::{compute_tx_root, Block, BlockCodecError, BlockHeader, SealedBlock};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use validator::{Roster, RosterError, ValidatorIndex, ValidatorInfo, ValidatorRole};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Create a deterministic keypair from a seed byte.
    pub fn test_keypair(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed; 32])
    }

    /// Build a dense all-miner roster from `n` seeded keypairs.
    ///
    /// Returns the keypairs alongside the roster so tests can sign as any member.
    pub fn test_roster(n: u8) -> (Vec<KeyPair>, Roster) {
        let keys: Vec<KeyPair> = (0..n).map(test_keypair).collect();
        let validators: Vec<ValidatorInfo> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| ValidatorInfo {
                index: ValidatorIndex(i as u32),
                public_key: k.public_key(),
                role: ValidatorRole::Miner,
            })
            .collect();
        let roster = Roster::new(validators).expect("dense test roster");
        (keys, roster)
    }
}
