use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use crate::core::error::Result;
use crate::core::types::VectorId;
use crate::storage::segment::SegmentData;

/// Unflushed rows of one partition (`tag` is empty for the root).
#[derive(Debug, Clone)]
pub struct MemTable {
    pub tag: String,
    pub data: SegmentData,
}

impl MemTable {
    pub fn new(tag: &str, dimension: usize) -> Self {
        MemTable { tag: tag.to_string(), data: SegmentData::new(dimension) }
    }

    pub fn row_count(&self) -> usize {
        self.data.row_count()
    }

    pub fn byte_size(&self) -> usize {
        self.data.byte_size()
    }
}

#[derive(Default)]
struct BufferState {
    /// Accepting inserts, keyed by tag.
    active: BTreeMap<String, Arc<MemTable>>,
    /// Deleted ids still to be written to segment deleted sets. Buffered
    /// rows are removed at delete time and never consult this.
    pending_deletes: Arc<RoaringTreemap>,
    active_min_lsn: Option<u64>,
    /// Swapped out and being written by a flush.
    immutable: Vec<Arc<MemTable>>,
    flushing_deletes: Arc<RoaringTreemap>,
    immutable_min_lsn: Option<u64>,
    /// Last lsn applied to this table.
    max_lsn: u64,
}

/// Work handed to a flush: everything swapped out so far.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub memtables: Vec<Arc<MemTable>>,
    /// Applied to segments committed before this flush, not to `memtables`.
    pub deletes: Arc<RoaringTreemap>,
    /// Highest lsn covered; becomes the table's flush lsn on commit.
    pub max_lsn: u64,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.memtables.iter().all(|m| m.row_count() == 0) && self.deletes.is_empty()
    }
}

/// Point-in-time view used by queries.
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    pub memtables: Vec<Arc<MemTable>>,
    /// Exclusions for segment rows only.
    pub deletes: RoaringTreemap,
}

impl BufferSnapshot {
    /// Whether a row of an already committed segment is deleted.
    pub fn is_deleted(&self, id: VectorId) -> bool {
        self.deletes.contains(id)
    }
}

/// All insert buffers of one table.
///
/// Records are applied while the WAL lock is held, so buffers always see them
/// in lsn order and a swap never splits an lsn range.
pub struct TableBuffers {
    pub dimension: usize,
    state: RwLock<BufferState>,
}

impl TableBuffers {
    pub fn new(dimension: usize) -> Self {
        TableBuffers {
            dimension,
            state: RwLock::new(BufferState::default()),
        }
    }

    fn note_lsn(state: &mut BufferState, lsn: u64) {
        state.active_min_lsn.get_or_insert(lsn);
        state.max_lsn = state.max_lsn.max(lsn);
    }

    pub fn apply_insert(&self, tag: &str, ids: &[VectorId], vectors: &[f32], lsn: u64) {
        let mut state = self.state.write();
        let dimension = self.dimension;
        let memtable = state
            .active
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(MemTable::new(tag, dimension)));
        let memtable = Arc::make_mut(memtable);
        for (row, &id) in ids.iter().enumerate() {
            memtable.data.push(id, &vectors[row * dimension..(row + 1) * dimension]);
        }
        Self::note_lsn(&mut state, lsn);
    }

    /// Rows buffered so far lose the ids at once; rows inserted later with
    /// the same ids are unaffected. Segment rows are excluded until the next
    /// flush writes the ids into their deleted sets.
    pub fn apply_delete(&self, ids: &[VectorId], lsn: u64) {
        let mut state = self.state.write();
        let doomed: RoaringTreemap = ids.iter().copied().collect();
        let state = &mut *state;
        for memtable in state.active.values_mut().chain(state.immutable.iter_mut()) {
            if memtable.data.ids.iter().any(|id| doomed.contains(*id)) {
                Arc::make_mut(memtable).data.remove_rows(|id| doomed.contains(id));
            }
        }
        *Arc::make_mut(&mut state.pending_deletes) |= doomed;
        Self::note_lsn(state, lsn);
    }

    /// Forget the buffered rows of a dropped partition. Returns rows discarded.
    pub fn discard_tag(&self, tag: &str) -> usize {
        let mut state = self.state.write();
        let mut discarded = state.active.remove(tag).map_or(0, |m| m.row_count());
        state.immutable.retain(|m| {
            if m.tag == tag {
                discarded += m.row_count();
                false
            } else {
                true
            }
        });
        discarded
    }

    /// Buffered (rows, bytes) not yet handed to a flush.
    pub fn usage(&self) -> (usize, usize) {
        let state = self.state.read();
        state.active.values().fold((0, 0), |(rows, bytes), m| (rows + m.row_count(), bytes + m.byte_size()))
    }

    pub fn has_pending(&self) -> bool {
        let state = self.state.read();
        state.active_min_lsn.is_some() || state.immutable_min_lsn.is_some()
    }

    /// Smallest lsn still only held in memory.
    pub fn min_lsn(&self) -> Option<u64> {
        let state = self.state.read();
        match (state.active_min_lsn, state.immutable_min_lsn) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Move active buffers to the immutable side and return the whole
    /// immutable set. Leftovers of a failed flush are included again.
    pub fn swap_for_flush(&self) -> FlushBatch {
        let mut state = self.state.write();

        let active = std::mem::take(&mut state.active);
        state.immutable.extend(active.into_values().filter(|m| m.row_count() > 0));

        let pending = std::mem::take(&mut state.pending_deletes);
        if !pending.is_empty() {
            Arc::make_mut(&mut state.flushing_deletes).extend(pending.iter());
        }

        if let Some(lsn) = state.active_min_lsn.take() {
            state.immutable_min_lsn = Some(state.immutable_min_lsn.map_or(lsn, |m| m.min(lsn)));
        }

        FlushBatch {
            memtables: state.immutable.clone(),
            deletes: Arc::clone(&state.flushing_deletes),
            max_lsn: state.max_lsn,
        }
    }

    /// Run `commit` with queries locked out, then forget the flushed buffers.
    /// Queries see either the buffers or the committed segments, never both.
    pub fn finish_flush<R>(&self, commit: impl FnOnce() -> Result<R>) -> Result<R> {
        let mut state = self.state.write();
        let result = commit()?;
        state.immutable.clear();
        state.flushing_deletes = Arc::default();
        state.immutable_min_lsn = None;
        Ok(result)
    }

    /// Buffers and delete exclusions, captured together with `with` under
    /// the same read lock.
    pub fn snapshot_with<T>(&self, with: impl FnOnce() -> T) -> (BufferSnapshot, T) {
        let state = self.state.read();
        let memtables: Vec<Arc<MemTable>> = state
            .active
            .values()
            .chain(state.immutable.iter())
            .filter(|m| m.row_count() > 0)
            .cloned()
            .collect();
        let mut deletes = (*state.pending_deletes).clone();
        deletes |= &*state.flushing_deletes;
        let extra = with();
        (BufferSnapshot { memtables, deletes }, extra)
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        self.snapshot_with(|| ()).0
    }
}
