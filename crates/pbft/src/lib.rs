//! PBFT consensus engine for the Covenant permissioned chain.
//!
//! The engine coordinates a fixed roster of authenticated validators through
//! a Prepare → Sign → Commit → Seal pipeline, tolerating up to `f` Byzantine
//! members out of `3f + 1`, with view changes as the out-of-band recovery
//! path.
//!
//! # Architecture
//!
//! ```text
//!            transport threads                     worker thread
//!  peers ──► on_msg ──► MsgQueue ──► run_once ──► handlers ──► broadcasts
//!                                        │
//!                                        ├── check_timeout (view change)
//!                                        ├── handle_future_block
//!                                        └── collect_garbage
//! ```
//!
//! One coarse mutex owns all consensus state; a dedicated worker drains the
//! inbound queue and drives timers. Collaborators are injected at
//! construction: a [`ChainFacade`] for execution and import, a
//! [`ValidatorOracle`] for the per-height roster, a [`Transport`] for the
//! authenticated peer streams, and a [`MsgBackup`] for the durable
//! committed-prepare record.

mod backup;
mod broadcast;
mod config;
mod engine;
mod queue;
mod traits;
mod verifier;
mod worker;

pub use backup::{
    decode_committed, encode_committed, BackupError, MemoryBackup, MsgBackup, RocksBackup,
    BACKUP_KEY_COMMITTED,
};
pub use broadcast::Broadcaster;
pub use config::PbftConfig;
pub use engine::{EngineStatus, PbftEngine};
pub use queue::{MsgPacket, MsgQueue};
pub use traits::{
    ChainError, ChainFacade, Clock, ExecutedCandidate, ManualClock, SealCallback, SystemClock,
    Transport, ValidatorOracle, ViewChangeCallback,
};
pub use verifier::{check_block_sign, VerifyError};
pub use worker::WorkerHandle;
