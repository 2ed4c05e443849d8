//! Durable backup of the committed Prepare.
//!
//! Crash-recovery invariant: a Prepare that reached sign quorum is persisted
//! *before* any Commit is broadcast, so a restarted node can never be tricked
//! into signing a different hash at the same height.
//!
//! All operations are synchronous blocking I/O; writes are short and happen
//! under the engine lock.

use covenant_messages::PrepareReq;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// The single key under which the last sign-quorum Prepare is stored.
pub const BACKUP_KEY_COMMITTED: &str = "committed";

/// Error type for backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Stored record failed to decode
    #[error("Corrupt backup record: {0}")]
    Corrupt(String),
}

/// Key→bytes store with per-key atomic put/get.
pub trait MsgBackup: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), BackupError>;

    /// Fetch the value under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackupError>;
}

/// Encode a committed Prepare for storage.
///
/// The record is the message wrapped in a single-element list, leaving room
/// for future multi-record backups without a format break.
pub fn encode_committed(req: &PrepareReq) -> Result<Vec<u8>, BackupError> {
    sbor::basic_encode(&vec![req.clone()]).map_err(|e| BackupError::Corrupt(format!("{e:?}")))
}

/// Decode a committed Prepare from storage.
pub fn decode_committed(bytes: &[u8]) -> Result<Option<PrepareReq>, BackupError> {
    let list: Vec<PrepareReq> =
        sbor::basic_decode(bytes).map_err(|e| BackupError::Corrupt(format!("{e:?}")))?;
    Ok(list.into_iter().next())
}

/// RocksDB-backed message backup for production use.
pub struct RocksBackup {
    db: rocksdb::DB,
}

impl RocksBackup {
    /// Open or create the backup database at `path`.
    ///
    /// Failure here is fatal for the node: running consensus without a
    /// durable backup silently weakens crash safety.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BackupError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(256);
        let db = rocksdb::DB::open(&opts, path)
            .map_err(|e| BackupError::DatabaseError(e.to_string()))?;
        Ok(Self { db })
    }
}

impl MsgBackup for RocksBackup {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), BackupError> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| BackupError::DatabaseError(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackupError> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| BackupError::DatabaseError(e.to_string()))
    }
}

/// In-memory backup for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryBackup {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackup {
    /// Create an empty backup.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MsgBackup for MemoryBackup {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), BackupError> {
        self.map.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackupError> {
        Ok(self.map.lock().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_types::test_utils::test_keypair;
    use covenant_types::{Hash, ValidatorIndex};

    fn sample_prepare() -> PrepareReq {
        PrepareReq::signed(
            &test_keypair(1),
            4,
            1,
            ValidatorIndex(1),
            123,
            Hash::digest(b"block"),
            b"block-bytes".to_vec(),
        )
    }

    #[test]
    fn committed_record_round_trip() {
        let req = sample_prepare();
        let bytes = encode_committed(&req).unwrap();
        let decoded = decode_committed(&bytes).unwrap().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_committed(b"junk").is_err());
    }

    #[test]
    fn memory_backup_put_get() {
        let backup = MemoryBackup::new();
        assert!(backup.get(BACKUP_KEY_COMMITTED).unwrap().is_none());
        backup.put(BACKUP_KEY_COMMITTED, b"abc").unwrap();
        assert_eq!(
            backup.get(BACKUP_KEY_COMMITTED).unwrap(),
            Some(b"abc".to_vec())
        );
        backup.put(BACKUP_KEY_COMMITTED, b"def").unwrap();
        assert_eq!(
            backup.get(BACKUP_KEY_COMMITTED).unwrap(),
            Some(b"def".to_vec())
        );
    }

    #[test]
    fn rocks_backup_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let req = sample_prepare();
        {
            let backup = RocksBackup::open(dir.path()).unwrap();
            backup
                .put(BACKUP_KEY_COMMITTED, &encode_committed(&req).unwrap())
                .unwrap();
        }
        let backup = RocksBackup::open(dir.path()).unwrap();
        let stored = backup.get(BACKUP_KEY_COMMITTED).unwrap().unwrap();
        assert_eq!(decode_committed(&stored).unwrap().unwrap(), req);
    }
}
