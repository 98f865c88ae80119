//! Shard set discovery and validation
//!
//! On first startup (or with `data.store.clear=true`) every configured
//! directory is initialized with a fresh SHARD_INFO stamped with one shared
//! DaemonId. On later startups all directories must agree on DaemonId,
//! TotalShards, and LayoutVersion, whatever order the configuration lists
//! them in.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::data::error::DataError;
use crate::data::store::shard::{ShardInfo, ShardStore};

/// On-disk layout version this daemon reads and writes.
pub const CURRENT_LAYOUT_VERSION: u32 = 3;

/// One opened shard, in ShardIndex order.
#[derive(Debug)]
pub struct LoadedShard {
    pub info: ShardInfo,
    pub store: Arc<ShardStore>,
}

pub struct ShardLoader {
    dirs: Vec<PathBuf>,
    clear: bool,
}

impl ShardLoader {
    pub fn new(dirs: Vec<PathBuf>, clear: bool) -> Self {
        ShardLoader { dirs, clear }
    }

    /// Open every configured shard, creating the set if none exists yet.
    pub fn load(&self) -> Result<Vec<LoadedShard>, DataError> {
        if self.dirs.is_empty() {
            return Err(DataError::load_mismatch("No shard directories found."));
        }
        self.check_duplicate_dirs()?;

        if self.clear {
            for dir in &self.dirs {
                if dir.exists() {
                    tracing::info!(dir = %dir.display(), "Clearing shard directory");
                    std::fs::remove_dir_all(dir)?;
                }
            }
        }
        for dir in &self.dirs {
            std::fs::create_dir_all(dir)?;
        }

        let infos = self
            .dirs
            .iter()
            .map(|dir| ShardInfo::read(dir))
            .collect::<Result<Vec<_>, _>>()?;

        let present = infos.iter().filter(|i| i.is_some()).count();
        if present == 0 {
            self.create_shards()
        } else if present == self.dirs.len() {
            let infos: Vec<ShardInfo> = infos.into_iter().map(|i| i.unwrap()).collect();
            self.open_shards(infos)
        } else {
            let missing = self
                .dirs
                .iter()
                .zip(&infos)
                .find(|(_, info)| info.is_none())
                .map(|(dir, _)| dir.display().to_string())
                .unwrap_or_default();
            Err(DataError::load_mismatch(format!(
                "Shard directory {} is missing its {} record.",
                missing,
                super::shard::SHARD_INFO_FILE
            )))
        }
    }

    /// The same directory configured twice would contend on one store lock.
    fn check_duplicate_dirs(&self) -> Result<(), DataError> {
        let mut seen = HashSet::new();
        for dir in &self.dirs {
            let resolved = normalize(dir);
            if !seen.insert(resolved) {
                return Err(DataError::LockConflict {
                    path: dir.display().to_string(),
                });
            }
        }
        Ok(())
    }

    fn create_shards(&self) -> Result<Vec<LoadedShard>, DataError> {
        let daemon_id: u64 = rand::random();
        let total = self.dirs.len() as u32;
        tracing::info!(
            daemon_id = format!("{:016x}", daemon_id),
            total_shards = total,
            "Creating new shard set"
        );
        let mut shards = Vec::with_capacity(self.dirs.len());
        for (index, dir) in self.dirs.iter().enumerate() {
            let info = ShardInfo {
                layout_version: CURRENT_LAYOUT_VERSION,
                daemon_id,
                shard_index: index as u32,
                total_shards: total,
            };
            info.write(dir)?;
            shards.push(LoadedShard {
                info,
                store: Arc::new(ShardStore::open(dir)?),
            });
        }
        Ok(shards)
    }

    fn open_shards(&self, infos: Vec<ShardInfo>) -> Result<Vec<LoadedShard>, DataError> {
        let first = infos[0];
        if infos.iter().any(|i| i.daemon_id != first.daemon_id) {
            return Err(DataError::load_mismatch("DaemonId mismatch."));
        }
        if infos.iter().any(|i| i.total_shards != first.total_shards) {
            return Err(DataError::load_mismatch("TotalShards mismatch."));
        }
        if first.total_shards as usize != self.dirs.len() {
            return Err(DataError::load_mismatch(format!(
                "The TotalShards field of all shards is {}, but we have {} shards.",
                first.total_shards,
                self.dirs.len()
            )));
        }
        if infos.iter().any(|i| i.layout_version != first.layout_version) {
            return Err(DataError::load_mismatch("LayoutVersion mismatch."));
        }
        if first.layout_version != CURRENT_LAYOUT_VERSION {
            return Err(DataError::load_mismatch(format!(
                "The layout version of all shards is {}, but we only support {}.",
                first.layout_version, CURRENT_LAYOUT_VERSION
            )));
        }
        let indexes: HashSet<u32> = infos.iter().map(|i| i.shard_index).collect();
        if indexes.len() != infos.len() || indexes.iter().any(|&i| i as usize >= infos.len()) {
            return Err(DataError::load_mismatch("ShardIndex mismatch."));
        }

        // Present shards in ShardIndex order, whatever order the
        // configuration listed the directories in.
        let mut shards: Vec<LoadedShard> = self
            .dirs
            .iter()
            .zip(infos)
            .map(|(dir, info)| {
                Ok(LoadedShard {
                    info,
                    store: Arc::new(ShardStore::open(dir)?),
                })
            })
            .collect::<Result<Vec<_>, DataError>>()?;
        shards.sort_by_key(|s| s.info.shard_index);
        tracing::debug!(
            daemon_id = format!("{:016x}", first.daemon_id),
            total_shards = first.total_shards,
            "Loaded existing shard set"
        );
        Ok(shards)
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}
