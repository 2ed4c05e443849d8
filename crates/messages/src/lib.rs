//! PBFT wire messages for Covenant consensus.
//!
//! Four message kinds drive the protocol:
//!
//! - [`PrepareReq`]: the leader's proposal, carrying the block payload
//! - [`SignReq`]: a first-phase vote on a block hash
//! - [`CommitReq`]: a second-phase vote on a block hash
//! - [`ViewChangeReq`]: a request to move to a higher view
//!
//! All four share the same authenticated core: `(height, view, idx, timestamp,
//! block_hash)` plus two signatures. `sig` covers only the block hash (cheap to
//! collect into the seal); `sig2` covers every field except the block payload
//! and binds the sender to this exact message.

mod codec;
mod commit;
mod prepare;
mod sign;
mod signed;
mod view_change;

pub use codec::{
    decode, encode, peek_msg_id, CodecError, MsgId, ProtocolMsg, MAX_WIRE_LEN, WIRE_VERSION,
};
pub use commit::CommitReq;
pub use prepare::PrepareReq;
pub use sign::SignReq;
pub use signed::{unsigned_fields, SignedMsg};
pub use view_change::ViewChangeReq;
