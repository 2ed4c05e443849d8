//! Keccak-256 hash primitive.

use sbor::prelude::BasicSbor;
use sha3::{Digest, Keccak256};
use std::fmt;
use thiserror::Error;

/// A 32-byte keccak-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
pub struct Hash([u8; 32]);

/// Errors from parsing a hash out of a hex string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Wrong length: expected 32 bytes, got {0}")]
    WrongLength(usize),
}

impl Hash {
    /// The all-zero hash, used as a sentinel (genesis parent, cleared caches).
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Length in bytes.
    pub const LENGTH: usize = 32;

    /// Hash arbitrary bytes with keccak-256.
    pub fn digest(data: impl AsRef<[u8]>) -> Self {
        let out = Keccak256::digest(data.as_ref());
        Hash(out.into())
    }

    /// Wrap raw bytes as a hash.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True for the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Full lowercase hex, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::LENGTH {
            return Err(HexError::WrongLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }

    /// Short form for logs: first four bytes as hex.
    pub fn abridged(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.abridged())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
