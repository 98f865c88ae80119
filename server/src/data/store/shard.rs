//! One shard: an ordered embedded key/value store plus its SHARD_INFO record
//!
//! Each configured data directory holds exactly one fjall keyspace (under
//! `store/`) and a `SHARD_INFO` JSON file stamping the shard's place in the
//! daemon's shard set. Batched writes are atomic within a shard; there is no
//! cross-shard atomicity.

use std::ops::Bound;
use std::path::{Path, PathBuf};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use crate::data::error::DataError;

/// Name of the per-shard metadata file.
pub const SHARD_INFO_FILE: &str = "SHARD_INFO";

/// Subdirectory holding the embedded store's files.
const STORE_SUBDIR: &str = "store";

/// Partition holding every key family of a shard.
const MAIN_PARTITION: &str = "spans";

/// Per-shard metadata, written once at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    #[serde(rename = "LayoutVersion")]
    pub layout_version: u32,
    #[serde(rename = "DaemonId")]
    pub daemon_id: u64,
    #[serde(rename = "ShardIndex")]
    pub shard_index: u32,
    #[serde(rename = "TotalShards")]
    pub total_shards: u32,
}

impl ShardInfo {
    pub fn read(dir: &Path) -> Result<Option<ShardInfo>, DataError> {
        let path = dir.join(SHARD_INFO_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let info = serde_json::from_str(&contents).map_err(|e| {
            DataError::load_mismatch(format!(
                "Failed to parse {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(info))
    }

    pub fn write(&self, dir: &Path) -> Result<(), DataError> {
        let body = serde_json::to_string(self).expect("ShardInfo serializes");
        std::fs::write(dir.join(SHARD_INFO_FILE), body)?;
        Ok(())
    }
}

/// A single shard's key/value store.
pub struct ShardStore {
    path: PathBuf,
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore").field("path", &self.path).finish()
    }
}

impl ShardStore {
    /// Open (or create) the embedded store under `dir`.
    pub fn open(dir: &Path) -> Result<ShardStore, DataError> {
        let keyspace = fjall::Config::new(dir.join(STORE_SUBDIR)).open()?;
        let partition =
            keyspace.open_partition(MAIN_PARTITION, PartitionCreateOptions::default())?;
        Ok(ShardStore {
            path: dir.to_path_buf(),
            keyspace,
            partition,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DataError> {
        Ok(self.partition.get(key)?.map(|slice| slice.to_vec()))
    }

    /// Commit a set of entries as one atomic batch.
    pub fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), DataError> {
        let mut batch = self.keyspace.batch();
        for (key, value) in entries {
            batch.insert(&self.partition, key.as_slice(), value.as_slice());
        }
        batch.commit()?;
        Ok(())
    }

    /// Delete a set of keys as one atomic batch.
    pub fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<(), DataError> {
        let mut batch = self.keyspace.batch();
        for key in keys {
            batch.remove(&self.partition, key.as_slice());
        }
        batch.commit()?;
        Ok(())
    }

    /// Ordered scan over `[lower, upper)`, optionally reversed.
    pub fn range_scan<'a>(
        &'a self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        reverse: bool,
    ) -> Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>> + 'a> {
        let range = (lower, upper);
        if reverse {
            Box::new(self.partition.range(range).rev())
        } else {
            Box::new(self.partition.range(range))
        }
    }

    /// Forward scan of every key starting with `prefix`.
    pub fn prefix_scan<'a>(
        &'a self,
        prefix: &[u8],
    ) -> Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>> + 'a> {
        Box::new(self.partition.prefix(prefix.to_vec()))
    }

    /// Flush the journal to disk. Called once per shard at shutdown.
    pub fn close(&self) -> Result<(), DataError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_info_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ShardInfo::read(dir.path()).unwrap(), None);
        let info = ShardInfo {
            layout_version: 3,
            daemon_id: 0xdead_beef,
            shard_index: 1,
            total_shards: 2,
        };
        info.write(dir.path()).unwrap();
        assert_eq!(ShardInfo::read(dir.path()).unwrap(), Some(info));
        // Field names in the JSON blob are stable across releases.
        let raw = std::fs::read_to_string(dir.path().join(SHARD_INFO_FILE)).unwrap();
        for field in ["LayoutVersion", "DaemonId", "ShardIndex", "TotalShards"] {
            assert!(raw.contains(field), "missing {field} in {raw}");
        }
    }

    #[test]
    fn test_put_get_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::open(dir.path()).unwrap();
        store
            .put_batch(&[
                (b"b".to_vec(), b"2".to_vec()),
                (b"a".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"z").unwrap(), None);

        let keys: Vec<Vec<u8>> = store
            .range_scan(
                Bound::Included(b"a".to_vec()),
                Bound::Excluded(b"c".to_vec()),
                false,
            )
            .map(|kv| kv.unwrap().0.to_vec())
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        let reversed: Vec<Vec<u8>> = store
            .range_scan(Bound::Unbounded, Bound::Unbounded, true)
            .map(|kv| kv.unwrap().0.to_vec())
            .collect();
        assert_eq!(reversed, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_delete_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::open(dir.path()).unwrap();
        store
            .put_batch(&[
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ])
            .unwrap();
        store.delete_batch(&[b"a".to_vec()]).unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }
}
