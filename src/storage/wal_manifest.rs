use std::fs;
use serde::{Deserialize, Serialize};
use crate::core::error::Result;
use crate::storage::layout::{write_atomic, StorageLayout};

/// Retained WAL files, by start lsn, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalManifest {
    pub files: Vec<u64>,
    /// Last lsn written before the most recent rotation.
    pub last_lsn: u64,
}

impl WalManifest {
    pub fn load(storage: &StorageLayout) -> Result<Option<Self>> {
        let path = storage.wal_manifest_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(path)?;
        let manifest = bincode::deserialize(&data)?;
        Ok(Some(manifest))
    }

    pub fn save(&self, storage: &StorageLayout) -> Result<()> {
        let data = bincode::serialize(self)?;
        write_atomic(&storage.wal_manifest_path(), &data)
    }

    pub fn newest(&self) -> Option<u64> {
        self.files.last().copied()
    }

    /// Start lsn of the file following `start`, if any.
    pub fn next_start(&self, start: u64) -> Option<u64> {
        let pos = self.files.iter().position(|&s| s == start)?;
        self.files.get(pos + 1).copied()
    }
}
