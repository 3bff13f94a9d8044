use std::collections::BTreeSet;
use std::sync::Arc;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use crate::core::date::DateBucket;
use crate::core::error::{Error, Result};
use crate::core::types::SegmentId;
use crate::engine::{EngineType, TableIndex};
use crate::meta::backend::MetaBackend;
use crate::meta::state::{IndexState, MetaState, NewSegment, PartitionSchema, TableSchema};
use crate::storage::layout::Medium;

/// Owner of table / partition / segment records.
///
/// Readers take an `Arc<MetaState>` snapshot. Writers are serialized: each
/// mutation clones the current state, applies the change, commits it through
/// the backend and only then publishes the new snapshot.
pub struct MetaManager {
    backend: Box<dyn MetaBackend>,
    current: RwLock<Arc<MetaState>>,
    commit_lock: Mutex<()>,
}

impl MetaManager {
    pub fn open(backend: Box<dyn MetaBackend>) -> Result<Self> {
        let mut state = backend.load()?.unwrap_or_default();
        let repaired = state.repair_after_crash();
        if repaired > 0 {
            info!(segments = repaired, "reset interrupted index builds");
            backend.commit(&state)?;
        }

        Ok(MetaManager {
            backend,
            current: RwLock::new(Arc::new(state)),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<MetaState> {
        Arc::clone(&self.current.read())
    }

    /// Apply `f` to a copy of the state and commit it; on error nothing changes.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut MetaState) -> Result<R>) -> Result<R> {
        let _guard = self.commit_lock.lock();
        let mut next = MetaState::clone(&self.current.read());
        let result = f(&mut next)?;
        self.backend.commit(&next)?;
        *self.current.write() = Arc::new(next);
        Ok(result)
    }

    // Tables

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let name = schema.name.clone();
        self.mutate(|state| state.create_table(schema))?;
        info!(table = %name, "created table");
        Ok(())
    }

    pub fn describe_table(&self, name: &str) -> Result<TableSchema> {
        self.snapshot().table(name).cloned()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.snapshot().has_table(name)
    }

    pub fn all_tables(&self) -> Vec<TableSchema> {
        self.snapshot()
            .tables
            .values()
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.mutate(|state| state.drop_table(name, Utc::now()))?;
        info!(table = %name, "dropped table");
        Ok(())
    }

    pub fn drop_table_dates(&self, name: &str, dates: &BTreeSet<DateBucket>) -> Result<Vec<SegmentId>> {
        let dropped = self.mutate(|state| state.drop_segments_by_date(name, dates, Utc::now()))?;
        info!(table = %name, segments = dropped.len(), "dropped segments by date");
        Ok(dropped)
    }

    // Partitions

    pub fn create_partition(&self, table: &str, name: Option<&str>, tag: &str, created_lsn: u64) -> Result<String> {
        let name = self.mutate(|state| {
            let name = state.create_partition(table, name, tag)?;
            if let Some(partition) = state.partitions.get_mut(&name) {
                partition.created_lsn = created_lsn;
            }
            Ok(name)
        })?;
        debug!(table = %table, partition = %name, tag = %tag.trim(), "created partition");
        Ok(name)
    }

    pub fn drop_partition(&self, name: &str) -> Result<()> {
        self.mutate(|state| state.drop_partition(name, Utc::now()))
    }

    pub fn drop_partition_by_tag(&self, table: &str, tag: &str) -> Result<()> {
        self.mutate(|state| {
            state.table(table)?;
            let name = state
                .partition_by_tag(table, tag.trim())
                .map(|p| p.name.clone())
                .ok_or_else(|| Error::not_found("partition tag", tag))?;
            state.drop_partition(&name, Utc::now())
        })
    }

    pub fn show_partitions(&self, table: &str) -> Result<Vec<PartitionSchema>> {
        let snapshot = self.snapshot();
        snapshot.table(table)?;
        Ok(snapshot.partitions_of(table).into_iter().cloned().collect())
    }

    // Index descriptor

    pub fn set_index(&self, table: &str, index: TableIndex) -> Result<bool> {
        self.mutate(|state| state.set_index(table, index))
    }

    pub fn describe_index(&self, table: &str) -> Result<TableIndex> {
        Ok(self.snapshot().table(table)?.index)
    }

    pub fn drop_index(&self, table: &str) -> Result<Vec<SegmentId>> {
        self.mutate(|state| state.drop_index(table))
    }

    // Segments

    pub fn register_flush(&self, table: &str, segments: Vec<NewSegment>, flush_lsn: u64) -> Result<()> {
        self.mutate(|state| state.register_flush(table, segments, flush_lsn, Utc::now()))
    }

    pub fn allocate_segment_ids(&self, count: usize) -> Result<Vec<SegmentId>> {
        self.mutate(|state| Ok((0..count).map(|_| state.allocate_segment_id()).collect()))
    }

    pub fn replace_segments(&self, table: &str, sources: &[SegmentId], merged: Option<NewSegment>) -> Result<()> {
        self.mutate(|state| state.replace_segments(table, sources, merged, Utc::now()))
    }

    /// Move an active segment into `Building`; false if it is no longer eligible.
    pub fn begin_index_build(&self, id: SegmentId) -> Result<bool> {
        self.mutate(|state| {
            let segment = state.segment_mut(id)?;
            if !segment.is_active() || matches!(segment.index_state, IndexState::Ready | IndexState::Building) {
                return Ok(false);
            }
            segment.index_state = IndexState::Building;
            Ok(true)
        })
    }

    /// Finish a build. Returns false when the segment was retired meanwhile and
    /// the artifact must be discarded.
    pub fn finish_index_build(&self, id: SegmentId, engine: EngineType, index_bytes: u64) -> Result<bool> {
        self.mutate(|state| {
            let table = state.segment_mut(id)?.table.clone();
            let current_engine = state.table(&table).ok().map(|t| t.index.engine_type);
            let segment = state.segment_mut(id)?;
            if !segment.is_active() || segment.index_state != IndexState::Building {
                return Ok(false);
            }
            // Descriptor changed during the build: the artifact is already stale
            segment.index_state = if current_engine == Some(engine) { IndexState::Ready } else { IndexState::Stale };
            segment.index_engine = Some(engine);
            segment.index_byte_size = index_bytes;
            segment.updated_at = Utc::now();
            Ok(true)
        })
    }

    pub fn abort_index_build(&self, id: SegmentId, previous: IndexState) -> Result<()> {
        self.mutate(|state| {
            let segment = state.segment_mut(id)?;
            if segment.index_state == IndexState::Building {
                segment.index_state = previous;
            }
            Ok(())
        })
    }

    pub fn set_medium(&self, ids: &[SegmentId], medium: Medium) -> Result<()> {
        self.mutate(|state| {
            let now = Utc::now();
            for id in ids {
                let segment = state.segment_mut(*id)?;
                if segment.medium == Medium::Primary && medium == Medium::Secondary {
                    segment.primary_left_at = Some(now);
                }
                segment.medium = medium;
                segment.updated_at = now;
            }
            Ok(())
        })
    }

    /// Primary copies of these segments are gone.
    pub fn clear_primary_copies(&self, ids: &[SegmentId]) -> Result<()> {
        self.mutate(|state| {
            for id in ids {
                if let Some(segment) = state.segments.get_mut(id) {
                    segment.primary_left_at = None;
                }
            }
            Ok(())
        })
    }

    pub fn retire_segments(&self, ids: &[SegmentId]) -> Result<()> {
        self.mutate(|state| {
            let now = Utc::now();
            for id in ids {
                state.segment_mut(*id)?.retire(now);
            }
            Ok(())
        })
    }

    pub fn purge(&self, ids: &[SegmentId]) -> Result<()> {
        self.mutate(|state| {
            state.purge(ids);
            Ok(())
        })
    }

    pub fn size(&self) -> u64 {
        self.snapshot().size()
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        self.snapshot().row_count(table)
    }
}
