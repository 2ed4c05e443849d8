//! The common authenticated core shared by all consensus messages.

use covenant_types::{Hash, PublicKey, Signature, ValidatorIndex};

/// Domain tag for the fields-without-block signature.
const FIELDS_DOMAIN: &[u8] = b"pbft-fields:";

/// Serialize the signed fields of a message, excluding the block payload.
///
/// This is the preimage of `sig2`. Fixed-width little-endian fields behind a
/// domain tag; deliberately independent of the wire codec so that re-encoding
/// a message can never change what was signed.
pub fn unsigned_fields(
    height: u64,
    view: u64,
    idx: ValidatorIndex,
    timestamp: u64,
    block_hash: &Hash,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(FIELDS_DOMAIN.len() + 28 + Hash::LENGTH);
    out.extend_from_slice(FIELDS_DOMAIN);
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&view.to_le_bytes());
    out.extend_from_slice(&idx.0.to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(block_hash.as_bytes());
    out
}

/// Accessor trait over the authenticated core of a consensus message.
///
/// Gives the engine one verification path for all four message kinds.
pub trait SignedMsg {
    /// Block height the message refers to.
    fn height(&self) -> u64;
    /// View the message was produced in (for view changes, the target view).
    fn view(&self) -> u64;
    /// Roster index of the sender.
    fn idx(&self) -> ValidatorIndex;
    /// Sender wall-clock at send, milliseconds since epoch.
    fn timestamp(&self) -> u64;
    /// The block hash being voted on or referenced.
    fn block_hash(&self) -> Hash;
    /// Signature over the block hash alone.
    fn sig(&self) -> &Signature;
    /// Signature over all fields except the block payload.
    fn sig2(&self) -> &Signature;

    /// The preimage of `sig2`.
    fn unsigned_bytes(&self) -> Vec<u8> {
        unsigned_fields(
            self.height(),
            self.view(),
            self.idx(),
            self.timestamp(),
            &self.block_hash(),
        )
    }

    /// Check both signatures under the given public key.
    ///
    /// A message is authentic only if *both* verify: `sig` alone could be
    /// replayed onto a different (height, view), `sig2` alone carries no
    /// aggregatable vote on the hash.
    fn verify(&self, key: &PublicKey) -> bool {
        key.verify(self.block_hash().as_bytes(), self.sig())
            && key.verify(&self.unsigned_bytes(), self.sig2())
    }
}

/// Implement [`SignedMsg`] for a struct with the standard field names.
macro_rules! impl_signed_msg {
    ($ty:ty) => {
        impl $crate::signed::SignedMsg for $ty {
            fn height(&self) -> u64 {
                self.height
            }
            fn view(&self) -> u64 {
                self.view
            }
            fn idx(&self) -> covenant_types::ValidatorIndex {
                self.idx
            }
            fn timestamp(&self) -> u64 {
                self.timestamp
            }
            fn block_hash(&self) -> covenant_types::Hash {
                self.block_hash
            }
            fn sig(&self) -> &covenant_types::Signature {
                &self.sig
            }
            fn sig2(&self) -> &covenant_types::Signature {
                &self.sig2
            }
        }
    };
}
pub(crate) use impl_signed_msg;
