use std::fs;
use std::path::PathBuf;
use parking_lot::Mutex;
use crate::core::error::Result;
use crate::meta::state::MetaState;
use crate::storage::layout::write_atomic;

/// Durable home of the metadata record set.
pub trait MetaBackend: Send + Sync {
    /// Last committed state, `None` on a fresh store.
    fn load(&self) -> Result<Option<MetaState>>;

    /// Persist `state` atomically: after a crash either the old or the new
    /// state is loaded, never a mix.
    fn commit(&self, state: &MetaState) -> Result<()>;
}

/// Whole record set as one bincode file, replaced by write-temp + rename.
pub struct FileMetaBackend {
    pub path: PathBuf,
}

impl FileMetaBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileMetaBackend { path: path.into() }
    }
}

impl MetaBackend for FileMetaBackend {
    fn load(&self) -> Result<Option<MetaState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        Ok(Some(bincode::deserialize(&data)?))
    }

    fn commit(&self, state: &MetaState) -> Result<()> {
        let data = bincode::serialize(state)?;
        write_atomic(&self.path, &data)
    }
}

/// Volatile backend for tests and embedding.
#[derive(Default)]
pub struct MemoryMetaBackend {
    state: Mutex<Option<MetaState>>,
}

impl MemoryMetaBackend {
    pub fn new() -> Self {
        MemoryMetaBackend::default()
    }
}

impl MetaBackend for MemoryMetaBackend {
    fn load(&self) -> Result<Option<MetaState>> {
        Ok(self.state.lock().clone())
    }

    fn commit(&self, state: &MetaState) -> Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}
