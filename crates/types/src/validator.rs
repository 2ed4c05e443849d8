//! Validator identity and the per-height roster.
//!
//! The roster is sourced from on-chain system contracts by the validator
//! oracle. Miners occupy a dense index prefix `[0, miner_count)`; observers
//! follow. Consensus arithmetic (leader rule, quorum) runs over the miner
//! prefix only.

use crate::PublicKey;
use sbor::prelude::BasicSbor;
use std::fmt;
use thiserror::Error;

/// Position of a validator in the roster, dense in `[0, N)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
pub struct ValidatorIndex(pub u32);

impl ValidatorIndex {
    /// The raw index.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ValidatorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for ValidatorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a roster member is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum ValidatorRole {
    /// Votes in consensus and may propose blocks.
    Miner,
    /// Receives blocks and consensus traffic but never votes.
    Observer,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ValidatorInfo {
    /// Position in the roster.
    pub index: ValidatorIndex,
    /// The validator's long-term public key.
    pub public_key: PublicKey,
    /// Miner or observer.
    pub role: ValidatorRole,
}

/// Errors from roster construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("Roster is empty")]
    Empty,

    #[error("Roster indices are not dense in [0, {expected}): found {found} at position {position}")]
    SparseIndices {
        expected: u32,
        found: u32,
        position: usize,
    },

    #[error("Duplicate public key at index {0}")]
    DuplicateKey(u32),

    #[error("Miner at index {0} appears after an observer; miners must form a dense prefix")]
    MinersNotPrefix(u32),

    #[error("No roster available for height {0}")]
    Unavailable(u64),
}

/// The ordered validator set for one block height.
///
/// Invariants enforced at construction: non-empty, indices dense `[0, N)` in
/// order, unique public keys, and all miners preceding all observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    validators: Vec<ValidatorInfo>,
    miner_count: u32,
}

impl Roster {
    /// Validate and build a roster from ordered entries.
    pub fn new(validators: Vec<ValidatorInfo>) -> Result<Self, RosterError> {
        if validators.is_empty() {
            return Err(RosterError::Empty);
        }

        let expected = validators.len() as u32;
        let mut seen_observer = false;
        let mut miner_count = 0u32;

        for (position, info) in validators.iter().enumerate() {
            if info.index.0 != position as u32 {
                return Err(RosterError::SparseIndices {
                    expected,
                    found: info.index.0,
                    position,
                });
            }
            match info.role {
                ValidatorRole::Miner => {
                    if seen_observer {
                        return Err(RosterError::MinersNotPrefix(info.index.0));
                    }
                    miner_count += 1;
                }
                ValidatorRole::Observer => seen_observer = true,
            }
        }

        for (i, a) in validators.iter().enumerate() {
            if validators[..i].iter().any(|b| b.public_key == a.public_key) {
                return Err(RosterError::DuplicateKey(a.index.0));
            }
        }

        Ok(Self {
            validators,
            miner_count,
        })
    }

    /// Total roster size (miners + observers).
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// True when the roster holds no entries. Never true for a constructed roster.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Number of miners (the voting committee size, N).
    pub fn miner_count(&self) -> u32 {
        self.miner_count
    }

    /// The entry at `index`, if in range.
    pub fn get(&self, index: ValidatorIndex) -> Option<&ValidatorInfo> {
        self.validators.get(index.as_usize())
    }

    /// Public key of the validator at `index`.
    pub fn public_key(&self, index: ValidatorIndex) -> Option<PublicKey> {
        self.get(index).map(|v| v.public_key)
    }

    /// Public key of the *miner* at `index`; `None` for observers or out of range.
    pub fn miner_key(&self, index: ValidatorIndex) -> Option<PublicKey> {
        if index.0 < self.miner_count {
            self.public_key(index)
        } else {
            None
        }
    }

    /// Look up a member by public key.
    pub fn find(&self, key: &PublicKey) -> Option<&ValidatorInfo> {
        self.validators.iter().find(|v| v.public_key == *key)
    }

    /// Index of a member by public key.
    pub fn index_of(&self, key: &PublicKey) -> Option<ValidatorIndex> {
        self.find(key).map(|v| v.index)
    }

    /// Role of a member by public key.
    pub fn role_of(&self, key: &PublicKey) -> Option<ValidatorRole> {
        self.find(key).map(|v| v.role)
    }

    /// The ordered miner public keys (the block header `node_list`).
    pub fn miners(&self) -> Vec<PublicKey> {
        self.validators[..self.miner_count as usize]
            .iter()
            .map(|v| v.public_key)
            .collect()
    }

    /// Iterate all entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.iter()
    }
}
