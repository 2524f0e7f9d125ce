//! Per-shard storage collaborator.
//!
//! The real log/compaction engine is out of scope; this service owns the
//! per-shard storage root and a small key-value store used by the raft group
//! manager to persist consensus metadata. It follows the construct/start/stop
//! lifecycle: construction allocates state and the on-disk directory, start
//! makes the engine available, stop flushes and quiesces.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{NodeError, NodeResult};
use crate::types::ShardId;

/// In-memory key-value store handle exposed to consensus metadata consumers.
#[derive(Default)]
pub struct KvStore {
    entries: DashMap<String, Bytes>,
}

impl KvStore {
    pub fn put(&self, key: impl Into<String>, value: Bytes) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-shard storage service.
///
/// The storage root is laid out with one subdirectory per core:
///
/// ```text
/// <data_directory>/
///   - shard-0/
///   - shard-1/
///   - ... #cores
/// ```
pub struct Storage {
    shard: ShardId,
    directory: PathBuf,
    kv: KvStore,
    started: AtomicBool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("shard", &self.shard)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Construct the storage service, creating the per-shard directory.
    pub fn new(shard: ShardId, data_directory: &Path) -> NodeResult<Self> {
        if data_directory.is_file() {
            return Err(NodeError::Config(format!(
                "data directory {:?} is a regular file",
                data_directory
            )));
        }
        let directory = data_directory.join(format!("shard-{}", shard));
        std::fs::create_dir_all(&directory)?;

        Ok(Self {
            shard,
            directory,
            kv: KvStore::default(),
            started: AtomicBool::new(false),
        })
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(shard = self.shard, directory = ?self.directory, "Storage started");
    }

    /// Flush and quiesce. Failure here is logged by the teardown stack, not
    /// propagated.
    pub fn stop(&self) -> Result<(), NodeError> {
        self.started.store(false, Ordering::SeqCst);
        debug!(
            shard = self.shard,
            keys = self.kv.len(),
            "Storage stopped"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_shard_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(3, dir.path()).unwrap();
        assert!(storage.directory().ends_with("shard-3"));
        assert!(storage.directory().is_dir());
        assert!(!storage.is_started());
    }

    #[test]
    fn test_new_rejects_file_as_data_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Storage::new(0, file.path()).unwrap_err();
        assert!(err.to_string().contains("regular file"));
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(0, dir.path()).unwrap();
        storage.start();
        assert!(storage.is_started());
        storage.stop().unwrap();
        assert!(!storage.is_started());
    }

    #[test]
    fn test_kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(0, dir.path()).unwrap();
        storage.kv().put("raft/7/term", Bytes::from_static(b"4"));
        assert_eq!(
            storage.kv().get("raft/7/term"),
            Some(Bytes::from_static(b"4"))
        );
        assert_eq!(storage.kv().remove("raft/7/term"), Some(Bytes::from_static(b"4")));
        assert!(storage.kv().is_empty());
    }
}
