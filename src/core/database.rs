use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use crate::archive::ArchiveConf;
use crate::cache::{CacheKind, CacheManager};
use crate::core::config::Config;
use crate::core::context::EngineContext;
use crate::core::date::{DateBucket, DateRange};
use crate::core::error::{Error, Result};
use crate::core::fault::{FaultInjector, FaultPoint, NoFaults};
use crate::core::stats::{DatabaseStats, PartitionStat, SegmentStat, TableInfo};
use crate::core::types::{SegmentId, VectorBatch, VectorId};
use crate::engine::{EngineType, SearchParams, TableIndex};
use crate::meta::state::{MetaState, PartitionSchema, SegmentSchema, TableSchema};
use crate::memtable::BufferSnapshot;
use crate::meta::{FileMetaBackend, MetaManager};
use crate::query::resolver::{resolve, resolve_file_ids};
use crate::query::{QueryExecutor, QueryResult};
use crate::scheduler::{flush, index, merge, Scheduler, Task};
use crate::storage::file_lock::FileLock;
use crate::storage::layout::{remove_if_exists, StorageLayout};
use crate::storage::merge_policy::TieredMergePolicy;
use crate::storage::wal::{Wal, WalOp};

/// One vector database over one data directory.
///
/// `open` recovers from the WAL and starts the background workers. After
/// `stop` every operation fails with `NotReady` until `start` is called again.
pub struct Database {
    ctx: Arc<EngineContext>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    running: AtomicBool,
    /// Serializes start / stop.
    lifecycle: Mutex<()>,
    _lock: FileLock,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_faults(config, Arc::new(NoFaults))
    }

    pub fn open_with_faults(config: Config, faults: Arc<dyn FaultInjector>) -> Result<Self> {
        let storage = StorageLayout::new(&config)?;
        let lock = FileLock::acquire(&storage)?;

        let archive = ArchiveConf::parse(&config.archive_policy)?;
        let meta = MetaManager::open(Box::new(FileMetaBackend::new(storage.meta_path())))?;

        // A brand-new log must start past every lsn already flushed
        let fresh_start = meta.snapshot().tables.values().map(|t| t.flush_lsn).max().unwrap_or(0) + 1;
        let wal = Wal::open(&storage, config.wal_file_capacity, config.wal_sync_mode, fresh_start)?;

        let cache = CacheManager::new(storage.clone(), config.cache_capacity_bytes);
        let merge_policy = TieredMergePolicy {
            target_rows: config.merge_target_rows,
            min_segments_to_merge: config.merge_min_segments,
            max_segments_to_merge: config.merge_max_segments,
        };

        let ctx = Arc::new(EngineContext::new(
            config,
            storage,
            meta,
            wal,
            cache,
            archive,
            Box::new(merge_policy),
            faults,
        ));

        let db = Database {
            ctx,
            scheduler: Mutex::new(None),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            _lock: lock,
        };
        db.start()?;
        Ok(db)
    }

    /// Replay the WAL into fresh buffers, then start the workers.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.ctx.memtables.clear();
        let replayed = self.recover()?;

        *self.scheduler.lock() = Some(Arc::new(Scheduler::start(Arc::clone(&self.ctx))?));
        self.running.store(true, Ordering::Release);
        info!(path = %self.ctx.storage.base_dir.display(), replayed, "database started");
        Ok(())
    }

    /// Stop the workers, flush every buffer and sync the WAL.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }

        let flushed = if self.ctx.faults.should_fail(FaultPoint::ShutdownFlush) {
            warn!("skipping shutdown flush");
            Ok(())
        } else {
            flush::flush_all(&self.ctx)
        };
        self.ctx.wal.lock().sync()?;
        info!("database stopped");
        flushed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::not_ready())
        }
    }

    fn scheduler(&self) -> Result<Arc<Scheduler>> {
        self.scheduler.lock().clone().ok_or_else(Error::not_ready)
    }

    fn submit(&self, task: Task) {
        if let Ok(scheduler) = self.scheduler() {
            if let Err(e) = scheduler.submit(task) {
                debug!(error = %e, "background task not queued");
            }
        }
    }

    // Recovery

    /// Apply every record not yet covered by its table's flush lsn. Runs
    /// single-threaded before workers start. Returns records applied.
    fn recover(&self) -> Result<usize> {
        let ctx = &self.ctx;
        let state = ctx.meta.snapshot();
        let from_lsn = state
            .tables
            .values()
            .filter(|t| t.is_live())
            .map(|t| t.flush_lsn + 1)
            .min()
            .unwrap_or(1);

        let mut applied = 0;
        let mut flush_all = false;
        let mut flush_tables: BTreeSet<String> = BTreeSet::new();
        let mut max_id: Option<VectorId> = None;

        let records = ctx.wal.lock().replay(from_lsn);
        for record in records {
            let record = record?;
            if ctx.faults.should_fail(FaultPoint::WalReplayRecord) {
                return Err(Error::recovery(format!("injected failure replaying lsn {}", record.lsn)));
            }

            // Dropped tables and records already in segments are skipped
            let schema = match record.op.table() {
                Some(table) => match state.table(table) {
                    Ok(schema) if record.lsn > schema.flush_lsn => Some(schema),
                    _ => continue,
                },
                None => None,
            };

            match (record.op, schema) {
                (WalOp::Insert { table, partition_tag, ids, vectors }, Some(schema)) => {
                    // The partition must exist and be younger than the record
                    if !partition_tag.is_empty()
                        && !state
                            .partition_by_tag(&table, &partition_tag)
                            .is_some_and(|p| record.lsn > p.created_lsn)
                    {
                        continue;
                    }
                    max_id = ids.iter().copied().max().max(max_id);
                    ctx.memtables
                        .get_or_create(&table, schema.dimension)
                        .apply_insert(&partition_tag, &ids, &vectors, record.lsn);
                }
                (WalOp::Delete { table, ids }, Some(schema)) => {
                    ctx.memtables.get_or_create(&table, schema.dimension).apply_delete(&ids, record.lsn);
                }
                (WalOp::Flush { table: Some(table) }, _) => {
                    flush_tables.insert(table);
                }
                (WalOp::Flush { table: None }, _) => flush_all = true,
                _ => continue,
            }
            applied += 1;
        }

        if let Some(id) = max_id {
            ctx.ids.advance_past(id);
        }

        // Flushes requested before the crash are honoured now
        if flush_all {
            flush::flush_all(ctx)?;
        } else {
            for table in &flush_tables {
                flush::flush_table(ctx, table)?;
            }
        }

        if applied > 0 {
            info!(records = applied, from_lsn, "replayed wal");
        }
        Ok(applied)
    }

    // Tables

    pub fn create_table(&self, name: &str, dimension: usize, index: TableIndex) -> Result<()> {
        self.ensure_running()?;
        let mut schema = TableSchema::new(name, dimension);
        schema.index = index;
        // Older records of a dropped table with the same name must not replay
        let wal = self.ctx.wal.lock();
        schema.flush_lsn = wal.current_lsn();
        self.ctx.meta.create_table(schema)?;
        // Buffers a racing writer left behind for the old table
        self.ctx.memtables.remove(name);
        Ok(())
    }

    pub fn describe_table(&self, name: &str) -> Result<TableSchema> {
        self.ensure_running()?;
        self.ctx.meta.describe_table(name)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.ensure_running()?;
        Ok(self.ctx.meta.has_table(name))
    }

    pub fn all_tables(&self) -> Result<Vec<TableSchema>> {
        self.ensure_running()?;
        Ok(self.ctx.meta.all_tables())
    }

    /// Drop a whole table, or with `dates` only its segments dated in range.
    pub fn drop_table(&self, name: &str, dates: Option<&DateRange>) -> Result<()> {
        self.ensure_running()?;
        match dates {
            None => {
                let _wal = self.ctx.wal.lock();
                self.ctx.meta.drop_table(name)?;
                self.ctx.memtables.remove(name);
                Ok(())
            }
            Some(range) => {
                self.ctx.meta.describe_table(name)?;
                // Buffered rows are dated today; give them a segment first
                self.flush(Some(name))?;

                let gate = self.ctx.gate(name);
                let _gate = gate.lock();
                let buckets: BTreeSet<DateBucket> = range.buckets().into_iter().collect();
                for id in self.ctx.meta.drop_table_dates(name, &buckets)? {
                    self.ctx.cache.invalidate(id);
                }
                Ok(())
            }
        }
    }

    // Partitions

    pub fn create_partition(&self, table: &str, name: Option<&str>, tag: &str) -> Result<String> {
        self.ensure_running()?;
        // Replay skips inserts logged for an earlier partition with this tag
        let wal = self.ctx.wal.lock();
        self.ctx.meta.create_partition(table, name, tag, wal.current_lsn())
    }

    pub fn drop_partition(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        let state = self.ctx.meta.snapshot();
        let partition = state
            .partitions
            .get(name)
            .filter(|p| p.is_live())
            .ok_or_else(|| Error::not_found("partition", name))?;
        self.drop_partition_with_buffers(&partition.table, &partition.tag, || self.ctx.meta.drop_partition(name))
    }

    pub fn drop_partition_by_tag(&self, table: &str, tag: &str) -> Result<()> {
        self.ensure_running()?;
        let tag = tag.trim();
        self.drop_partition_with_buffers(table, tag, || self.ctx.meta.drop_partition_by_tag(table, tag))
    }

    /// Run `drop` and discard the partition's unflushed rows. The gate keeps
    /// flushes out; the WAL lock keeps inserts out.
    fn drop_partition_with_buffers(&self, table: &str, tag: &str, drop: impl FnOnce() -> Result<()>) -> Result<()> {
        let gate = self.ctx.gate(table);
        let _gate = gate.lock();
        let _wal = self.ctx.wal.lock();
        drop()?;
        if let Some(buffers) = self.ctx.memtables.get(table) {
            let discarded = buffers.discard_tag(tag);
            debug!(table = %table, tag = %tag, rows = discarded, "dropped partition");
        }
        Ok(())
    }

    pub fn show_partitions(&self, table: &str) -> Result<Vec<PartitionSchema>> {
        self.ensure_running()?;
        self.ctx.meta.show_partitions(table)
    }

    // Data

    /// Insert into the partition with `tag` (empty for the root). Ids left
    /// empty in `batch` are generated and written back. Returns the ids.
    pub fn insert_vectors(&self, table: &str, tag: &str, batch: &mut VectorBatch) -> Result<Vec<VectorId>> {
        self.ensure_running()?;
        let state = self.ctx.meta.snapshot();
        let schema = state.table(table)?;
        let count = batch.validate(schema.dimension)?;

        let tag = tag.trim();
        if !tag.is_empty() && state.partition_by_tag(table, tag).is_none() {
            return Err(Error::not_found("partition tag", tag));
        }

        if batch.ids.is_empty() {
            batch.ids = self.ctx.ids.next_ids(count);
        } else if let Some(&max) = batch.ids.iter().max() {
            self.ctx.ids.advance_past(max);
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let buffers = self.ctx.memtables.get_or_create(table, schema.dimension);
        let op = WalOp::Insert {
            table: table.to_string(),
            partition_tag: tag.to_string(),
            ids: batch.ids.clone(),
            vectors: batch.vectors.clone(),
        };
        let still_there = || {
            let state = self.ctx.meta.snapshot();
            state.table(table)?;
            if !tag.is_empty() && state.partition_by_tag(table, tag).is_none() {
                return Err(Error::not_found("partition tag", tag));
            }
            Ok(())
        };
        self.ctx.log_and_apply_checked(op, still_there, |lsn| {
            buffers.apply_insert(tag, &batch.ids, &batch.vectors, lsn)
        })?;

        // Threshold-triggered flush; never waits
        let (rows, bytes) = buffers.usage();
        if rows >= self.ctx.config.insert_buffer_rows || bytes >= self.ctx.config.insert_buffer_bytes {
            self.submit(Task::Flush { table: table.to_string(), reply: None });
        }
        Ok(batch.ids.clone())
    }

    pub fn delete_vector(&self, table: &str, id: VectorId) -> Result<()> {
        self.delete_vectors(table, &[id])
    }

    pub fn delete_vectors(&self, table: &str, ids: &[VectorId]) -> Result<()> {
        self.ensure_running()?;
        let schema = self.ctx.meta.describe_table(table)?;
        if ids.is_empty() {
            return Ok(());
        }

        let buffers = self.ctx.memtables.get_or_create(table, schema.dimension);
        let op = WalOp::Delete { table: table.to_string(), ids: ids.to_vec() };
        let still_there = || self.ctx.meta.snapshot().table(table).map(|_| ());
        self.ctx.log_and_apply_checked(op, still_there, |lsn| buffers.apply_delete(ids, lsn))?;
        Ok(())
    }

    /// Make everything inserted so far durable in segment form. `None`
    /// flushes every table. A failed background flush since the last call is
    /// reported here.
    pub fn flush(&self, table: Option<&str>) -> Result<()> {
        self.ensure_running()?;
        if let Some(table) = table {
            self.ctx.meta.describe_table(table)?;
        }

        let op = WalOp::Flush { table: table.map(str::to_string) };
        self.ctx.log_and_apply(op, |_| {})?;

        self.scheduler()?.flush_and_wait(table)?;

        let earlier = match table {
            Some(table) => self.ctx.take_flush_failure(table),
            None => self.ctx.take_all_flush_failures().into_iter().next().map(|(_, e)| e),
        };
        match earlier {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush, then physically drop deleted rows from the table's segments.
    pub fn compact(&self, table: &str) -> Result<()> {
        self.flush(Some(table))?;
        merge::compact_table(&self.ctx, table)?;
        Ok(())
    }

    // Index

    /// Set the table's index descriptor and build indexes for existing
    /// segments. Setting the same descriptor again is a no-op.
    pub fn create_index(&self, table: &str, index: TableIndex) -> Result<()> {
        self.ensure_running()?;
        self.flush(Some(table))?;
        if self.ctx.meta.set_index(table, index)? {
            info!(table = %table, engine = %index.engine_type, "index descriptor changed");
        }
        index::build_indexes(&self.ctx, table)?;
        Ok(())
    }

    pub fn describe_index(&self, table: &str) -> Result<TableIndex> {
        self.ensure_running()?;
        self.ctx.meta.describe_index(table)
    }

    /// Back to brute-force search; built artifacts are deleted.
    pub fn drop_index(&self, table: &str) -> Result<()> {
        self.ensure_running()?;
        let state = self.ctx.meta.snapshot();
        let cleared = self.ctx.meta.drop_index(table)?;
        for id in &cleared {
            if let Some(segment) = state.segments.get(id) {
                remove_if_exists(&self.ctx.storage.index_path(segment.medium, *id))?;
            }
            self.ctx.cache.invalidate_kind(*id, CacheKind::Index);
        }
        debug!(table = %table, segments = cleared.len(), "dropped index");
        Ok(())
    }

    // Reads

    /// Load every active segment of the table (and its ready index) into the cache.
    pub fn preload_table(&self, table: &str) -> Result<()> {
        self.ensure_running()?;
        let state = self.ctx.meta.snapshot();
        state.table(table)?;
        for segment in state.active_segments(table) {
            self.ctx.cache.segment_data(segment)?;
            self.ctx.cache.deleted_set(segment)?;
            if segment.has_ready_index() {
                self.ctx.cache.index(segment)?;
            }
        }
        Ok(())
    }

    /// Top-`k` nearest neighbours of each row-major query vector.
    pub fn query(
        &self,
        table: &str,
        tags: &[String],
        k: usize,
        params: &SearchParams,
        queries: &[f32],
        dates: Option<&DateRange>,
    ) -> Result<QueryResult> {
        self.ensure_running()?;
        let (buffers, state) = self.buffer_snapshot(table);
        let plan = resolve(&state, buffers, table, tags, dates)?;
        QueryExecutor::new(&self.ctx.cache).execute(&plan, queries, k, params)
    }

    /// Like `query`, restricted to explicit segments of the table.
    pub fn query_by_file_id(
        &self,
        table: &str,
        segments: &[SegmentId],
        k: usize,
        params: &SearchParams,
        queries: &[f32],
    ) -> Result<QueryResult> {
        self.ensure_running()?;
        let (buffers, state) = self.buffer_snapshot(table);
        let plan = resolve_file_ids(&state, buffers, table, segments)?;
        QueryExecutor::new(&self.ctx.cache).execute(&plan, queries, k, params)
    }

    /// Buffers and metadata captured together, so a concurrent flush commit
    /// is seen on exactly one side.
    fn buffer_snapshot(&self, table: &str) -> (BufferSnapshot, Arc<MetaState>) {
        match self.ctx.memtables.get(table) {
            Some(buffers) => buffers.snapshot_with(|| self.ctx.meta.snapshot()),
            None => (Default::default(), self.ctx.meta.snapshot()),
        }
    }

    pub fn get_vector_by_id(&self, table: &str, id: VectorId) -> Result<Vec<f32>> {
        self.ensure_running()?;
        let (buffers, state) = self.buffer_snapshot(table);
        state.table(table)?;
        let missing = || Error::not_found("vector", &id.to_string());

        // Active buffers come before the ones being flushed
        for memtable in &buffers.memtables {
            if let Some(row) = memtable.data.position(id) {
                return Ok(memtable.data.vector(row).to_vec());
            }
        }
        if buffers.is_deleted(id) {
            return Err(missing());
        }

        for segment in state.active_segments(table) {
            let data = self.ctx.cache.segment_data(segment)?;
            if let Some(row) = data.position(id) {
                if self.ctx.cache.deleted_set(segment)?.contains(id) {
                    continue;
                }
                return Ok(data.vector(row).to_vec());
            }
        }
        Err(missing())
    }

    /// Live rows in segments (buffered rows are not counted until flushed).
    pub fn get_table_row_count(&self, table: &str) -> Result<u64> {
        self.ensure_running()?;
        self.ctx.meta.row_count(table)
    }

    pub fn get_table_info(&self, table: &str) -> Result<TableInfo> {
        self.ensure_running()?;
        let state = self.ctx.meta.snapshot();
        state.table(table)?;

        let stat = |segment: &SegmentSchema| SegmentStat {
            id: segment.id,
            date: segment.date,
            row_count: segment.live_rows(),
            byte_size: segment.byte_size,
            index_name: segment
                .index_engine
                .filter(|_| segment.has_ready_index())
                .unwrap_or(EngineType::Flat)
                .name()
                .to_string(),
            medium: segment.medium,
        };
        let partition_stat = |tag: &str, partition: Option<&str>| {
            let segments: Vec<SegmentStat> = state
                .active_segments(table)
                .filter(|s| s.partition.as_deref() == partition)
                .map(&stat)
                .collect();
            PartitionStat {
                tag: tag.to_string(),
                row_count: segments.iter().map(|s| s.row_count).sum(),
                segments,
            }
        };

        let mut partitions = vec![partition_stat("", None)];
        for partition in state.partitions_of(table) {
            partitions.push(partition_stat(&partition.tag, Some(&partition.name)));
        }

        Ok(TableInfo {
            table: table.to_string(),
            row_count: partitions.iter().map(|p| p.row_count).sum(),
            partitions,
        })
    }

    /// Bytes of every active segment plus its index.
    pub fn size(&self) -> Result<u64> {
        self.ensure_running()?;
        Ok(self.ctx.meta.size())
    }

    pub fn cache_usage(&self) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.ctx.cache.usage())
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        self.ensure_running()?;
        let state = self.ctx.meta.snapshot();
        let active: Vec<&SegmentSchema> = state.segments.values().filter(|s| s.is_active()).collect();

        let (buffered_rows, buffered_bytes) = self
            .ctx
            .memtables
            .table_names()
            .iter()
            .filter_map(|t| self.ctx.memtables.get(t))
            .map(|b| b.usage())
            .fold((0, 0), |(r, b), (rows, bytes)| (r + rows, b + bytes));

        Ok(DatabaseStats {
            table_count: state.tables.values().filter(|t| t.is_live()).count(),
            segment_count: active.len(),
            total_rows: active.iter().map(|s| s.live_rows()).sum(),
            deleted_rows: active.iter().map(|s| s.deleted_count).sum(),
            data_size_bytes: active.iter().map(|s| s.byte_size).sum(),
            index_size_bytes: active.iter().map(|s| s.index_byte_size).sum(),
            wal_file_count: self.ctx.wal.lock().file_count(),
            buffered_rows,
            buffered_bytes,
            cache_stats: self.ctx.cache.stats(),
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "shutdown flush failed");
        }
    }
}
