//! Key-value engine abstraction and its two backends.
//!
//! The store is written against a tiny sorted key-value interface so the
//! same code runs over RocksDB in production and over an in-memory map
//! in tests. Writes only ever happen through an atomic batch; point
//! `put`/`delete` is the job of the versioned overlay layered on top.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::VmError;

/// A single staged mutation: `Some` writes the value, `None` deletes the
/// key.
pub type BatchOp = (Vec<u8>, Option<Vec<u8>>);

/// Minimal sorted key-value engine interface.
pub trait KeyValue: Send {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmError>;

    /// Applies all operations atomically, in order.
    fn write_batch(&mut self, ops: Vec<BatchOp>) -> Result<(), VmError>;

    /// Returns every key currently present, in sorted order. Used by the
    /// wipe-before-init path; the key space of a single chain is small
    /// enough that a full scan is acceptable there.
    fn keys(&self) -> Result<Vec<Vec<u8>>, VmError>;
}

/// In-memory engine backed by a shared `BTreeMap`.
///
/// Cloned handles share the same underlying map, which is what lets
/// tests simulate a VM restart: drop the first VM, hand a clone of the
/// same engine to the next one.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys. Test helper.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory kv lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValue for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmError> {
        let entries = self.entries.lock().expect("memory kv lock poisoned");
        Ok(entries.get(key).cloned())
    }

    fn write_batch(&mut self, ops: Vec<BatchOp>) -> Result<(), VmError> {
        let mut entries = self.entries.lock().expect("memory kv lock poisoned");
        for (key, value) in ops {
            match value {
                Some(v) => {
                    entries.insert(key, v);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, VmError> {
        let entries = self.entries.lock().expect("memory kv lock poisoned");
        Ok(entries.keys().cloned().collect())
    }
}

/// RocksDB-backed engine.
pub struct RocksKv {
    db: rocksdb::DB,
}

impl RocksKv {
    /// Opens (or creates) a RocksDB database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VmError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path.as_ref())
            .map_err(|e| VmError::Store(format!("failed to open rocksdb: {e}")))?;
        Ok(RocksKv { db })
    }
}

impl KeyValue for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmError> {
        self.db
            .get(key)
            .map_err(|e| VmError::Store(format!("rocksdb get failed: {e}")))
    }

    fn write_batch(&mut self, ops: Vec<BatchOp>) -> Result<(), VmError> {
        let mut batch = rocksdb::WriteBatch::default();
        for (key, value) in ops {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| VmError::Store(format!("rocksdb batch write failed: {e}")))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, VmError> {
        let mut keys = Vec::new();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, _) =
                item.map_err(|e| VmError::Store(format!("rocksdb iterator failed: {e}")))?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_engine(kv: &mut dyn KeyValue) {
        assert_eq!(kv.get(b"a").unwrap(), None);

        kv.write_batch(vec![
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), Some(b"2".to_vec())),
        ])
        .unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b").unwrap(), Some(b"2".to_vec()));

        // Delete and overwrite in one atomic batch.
        kv.write_batch(vec![
            (b"a".to_vec(), None),
            (b"b".to_vec(), Some(b"3".to_vec())),
        ])
        .unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
        assert_eq!(kv.get(b"b").unwrap(), Some(b"3".to_vec()));

        assert_eq!(kv.keys().unwrap(), vec![b"b".to_vec()]);
    }

    #[test]
    fn memory_engine_roundtrip() {
        let mut kv = MemoryKv::new();
        exercise_engine(&mut kv);
    }

    #[test]
    fn memory_clones_share_state() {
        let mut kv = MemoryKv::new();
        let other = kv.clone();
        kv.write_batch(vec![(b"k".to_vec(), Some(b"v".to_vec()))])
            .unwrap();
        assert_eq!(other.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn rocks_engine_roundtrip() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let mut kv = RocksKv::open(tmp.path()).expect("open rocksdb");
        exercise_engine(&mut kv);
    }

    #[test]
    fn rocks_engine_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        {
            let mut kv = RocksKv::open(tmp.path()).expect("open rocksdb");
            kv.write_batch(vec![(b"k".to_vec(), Some(b"v".to_vec()))])
                .unwrap();
        }
        let kv = RocksKv::open(tmp.path()).expect("reopen rocksdb");
        assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
