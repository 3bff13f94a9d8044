use std::path::{Path, PathBuf};
use std::fs;
use serde::{Deserialize, Serialize};
use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::types::SegmentId;

/// Storage medium a segment's files live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Medium {
    #[default]
    Primary,
    /// Slower tier used by the swap archive policy.
    Secondary,
}

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,       // Root directory
    pub segments_dir: PathBuf,   // Segment data (.seg) and deleted sets (.del)
    pub idx_dir: PathBuf,        // Built index artifacts (.idx)
    pub wal_dir: PathBuf,        // Write-ahead log files + MANIFEST
    pub meta_dir: PathBuf,       // Metadata record set
    pub secondary_dir: PathBuf,  // Archive tier, same sub-layout
}

impl StorageLayout {
    pub fn new(config: &Config) -> Result<Self> {
        let base_dir = config.storage_path.clone();
        let secondary_dir = config.secondary_dir();
        let layout = StorageLayout {
            segments_dir: base_dir.join("segments"),
            idx_dir: base_dir.join("idx"),
            wal_dir: base_dir.join("wal"),
            meta_dir: base_dir.join("meta"),
            secondary_dir,
            base_dir,
        };

        fs::create_dir_all(&layout.segments_dir)?;
        fs::create_dir_all(&layout.idx_dir)?;
        fs::create_dir_all(&layout.wal_dir)?;
        fs::create_dir_all(&layout.meta_dir)?;
        fs::create_dir_all(layout.secondary_dir.join("segments"))?;
        fs::create_dir_all(layout.secondary_dir.join("idx"))?;

        Ok(layout)
    }

    fn root(&self, medium: Medium) -> (PathBuf, PathBuf) {
        match medium {
            Medium::Primary => (self.segments_dir.clone(), self.idx_dir.clone()),
            Medium::Secondary => (self.secondary_dir.join("segments"), self.secondary_dir.join("idx")),
        }
    }

    pub fn segment_path(&self, medium: Medium, id: SegmentId) -> PathBuf {
        self.root(medium).0.join(format!("{}.seg", id.0))
    }

    pub fn deleted_path(&self, medium: Medium, id: SegmentId) -> PathBuf {
        self.root(medium).0.join(format!("{}.del", id.0))
    }

    pub fn index_path(&self, medium: Medium, id: SegmentId) -> PathBuf {
        self.root(medium).1.join(format!("{}.idx", id.0))
    }

    /// Every file a segment may own on `medium`.
    pub fn segment_files(&self, medium: Medium, id: SegmentId) -> [PathBuf; 3] {
        [
            self.segment_path(medium, id),
            self.deleted_path(medium, id),
            self.index_path(medium, id),
        ]
    }

    pub fn wal_path(&self, start_lsn: u64) -> PathBuf {
        self.wal_dir.join(format!("wal_{:020}.log", start_lsn))
    }

    pub fn wal_manifest_path(&self) -> PathBuf {
        self.wal_dir.join("MANIFEST")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.meta_dir.join("meta.bin")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }
}

/// Temp sibling used for write-then-rename.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to a temp file, fsync it, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
