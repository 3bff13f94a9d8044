use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::archive::ArchiveConf;
use crate::cache::CacheManager;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::fault::FaultInjector;
use crate::core::id_generator::IdGenerator;
use crate::memtable::MemTableManager;
use crate::meta::MetaManager;
use crate::storage::layout::StorageLayout;
use crate::storage::merge_policy::MergePolicy;
use crate::storage::wal::{Wal, WalOp};

/// Components shared by the request path and the background workers.
pub struct EngineContext {
    pub config: Config,
    pub storage: StorageLayout,
    pub meta: MetaManager,
    pub wal: Mutex<Wal>,
    pub memtables: MemTableManager,
    pub cache: CacheManager,
    pub ids: IdGenerator,
    pub archive: ArchiveConf,
    pub merge_policy: Box<dyn MergePolicy>,
    pub faults: Arc<dyn FaultInjector>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    flush_failures: Mutex<HashMap<String, Error>>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        storage: StorageLayout,
        meta: MetaManager,
        wal: Wal,
        cache: CacheManager,
        archive: ArchiveConf,
        merge_policy: Box<dyn MergePolicy>,
        faults: Arc<dyn FaultInjector>,
    ) -> Self {
        EngineContext {
            config,
            storage,
            meta,
            wal: Mutex::new(wal),
            memtables: MemTableManager::new(),
            cache,
            ids: IdGenerator::new(),
            archive,
            merge_policy,
            faults,
            gates: Mutex::new(HashMap::new()),
            flush_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Append `op` and apply it to the buffers under the WAL lock. A reclaim
    /// (which also holds the lock) therefore never sees a logged record that
    /// is not yet buffered.
    pub fn log_and_apply(&self, op: WalOp, apply: impl FnOnce(u64)) -> Result<u64> {
        let mut wal = self.wal.lock();
        let lsn = wal.append(op)?;
        apply(lsn);
        Ok(lsn)
    }

    /// `log_and_apply` after `check` passes under the WAL lock. Partition
    /// drops hold the same lock, so a checked insert never lands in the
    /// buffer of a partition dropped after the caller validated it.
    pub fn log_and_apply_checked(
        &self,
        op: WalOp,
        check: impl FnOnce() -> Result<()>,
        apply: impl FnOnce(u64),
    ) -> Result<u64> {
        let mut wal = self.wal.lock();
        check()?;
        let lsn = wal.append(op)?;
        apply(lsn);
        Ok(lsn)
    }

    /// Per-table write gate: flush, merge, compaction, archive and
    /// drop-by-date of one table never overlap.
    pub fn gate(&self, table: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.lock().entry(table.to_string()).or_default())
    }

    pub fn record_flush_failure(&self, table: &str, error: Error) {
        self.flush_failures.lock().insert(table.to_string(), error);
    }

    pub fn take_flush_failure(&self, table: &str) -> Option<Error> {
        self.flush_failures.lock().remove(table)
    }

    pub fn take_all_flush_failures(&self) -> Vec<(String, Error)> {
        self.flush_failures.lock().drain().collect()
    }
}
