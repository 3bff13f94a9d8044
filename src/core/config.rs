use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::core::error::Result;
use crate::storage::wal::SyncMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_path: PathBuf,
    /// Slower medium used by the "swap" archive policy. Defaults to
    /// `<storage_path>/secondary` when unset.
    pub secondary_path: Option<PathBuf>,

    // WAL
    pub wal_file_capacity: u64,
    pub wal_sync_mode: SyncMode,

    // Insert buffer
    pub insert_buffer_rows: usize,
    pub insert_buffer_bytes: usize,
    pub auto_flush_interval_ms: u64,
    pub flush_retries: u32,

    // Merge / index build
    pub merge_target_rows: u64,
    pub merge_min_segments: usize,
    pub merge_max_segments: usize,
    pub merge_interval_ms: u64,
    pub index_build_min_rows: u64,

    // Archive / cleanup
    pub archive_policy: String,
    pub archive_interval_secs: u64,
    pub file_cleanup_grace_ms: u64,

    pub worker_threads: usize,
    pub cache_capacity_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            secondary_path: None,

            wal_file_capacity: 64 * 1024 * 1024,       // 64MB per log file
            wal_sync_mode: SyncMode::Immediate,

            insert_buffer_rows: 100_000,
            insert_buffer_bytes: 128 * 1024 * 1024,    // 128MB
            auto_flush_interval_ms: 1000,
            flush_retries: 3,

            merge_target_rows: 262_144,
            merge_min_segments: 2,
            merge_max_segments: 16,
            merge_interval_ms: 2000,
            index_build_min_rows: 4096,

            archive_policy: "delete".to_string(),
            archive_interval_secs: 3600,
            file_cleanup_grace_ms: 10_000,

            worker_threads: num_cpus::get().clamp(2, 8),
            cache_capacity_bytes: 1024 * 1024 * 1024,  // 1GB
        }
    }
}

impl Config {
    pub fn with_storage_path(path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: path.into(),
            ..Config::default()
        }
    }

    /// Load from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn secondary_dir(&self) -> PathBuf {
        self.secondary_path
            .clone()
            .unwrap_or_else(|| self.storage_path.join("secondary"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn json_file_overrides_only_given_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vexis.json");
        std::fs::write(&path, r#"{"storage_path": "/tmp/vexis", "wal_sync_mode": "Batch", "worker_threads": 3}"#).unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("/tmp/vexis"));
        assert_eq!(config.wal_sync_mode, SyncMode::Batch);
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.flush_retries, Config::default().flush_retries);
        assert_eq!(config.secondary_dir(), PathBuf::from("/tmp/vexis/secondary"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::from_json_file(&path).unwrap_err();
        assert!(err.is(crate::core::error::ErrorKind::Parse));
    }
}
