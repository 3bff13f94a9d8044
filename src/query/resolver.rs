use std::collections::BTreeSet;
use std::sync::Arc;
use roaring::RoaringTreemap;
use crate::core::date::{DateBucket, DateRange};
use crate::core::error::{Error, Result};
use crate::core::types::SegmentId;
use crate::engine::{EngineType, MetricType};
use crate::memtable::{BufferSnapshot, MemTable};
use crate::meta::state::{MetaState, SegmentSchema};

/// One unit of search work.
#[derive(Debug, Clone)]
pub enum Candidate {
    Segment(SegmentSchema),
    /// Unflushed rows, searched as a segment dated today.
    Buffer(Arc<MemTable>),
}

/// Everything a query needs, resolved from one consistent snapshot.
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub dimension: usize,
    pub metric: MetricType,
    pub engine: EngineType,
    pub candidates: Vec<Candidate>,
    /// Deletes not yet written to segment deleted sets.
    pub pending_deletes: Arc<RoaringTreemap>,
}

impl SearchPlan {
    pub fn segment_count(&self) -> usize {
        self.candidates.iter().filter(|c| matches!(c, Candidate::Segment(_))).count()
    }
}

/// Resolve tags and dates into concrete segments plus matching buffers.
pub fn resolve(
    state: &MetaState,
    buffers: BufferSnapshot,
    table: &str,
    tags: &[String],
    dates: Option<&DateRange>,
) -> Result<SearchPlan> {
    let schema = state.table(table)?;
    let partitions = state.resolve_tags(table, tags)?;
    let buckets: Option<BTreeSet<DateBucket>> = dates.map(|range| range.buckets().into_iter().collect());

    let mut candidates: Vec<Candidate> = state
        .segments_matching(table, &partitions, buckets.as_ref())
        .into_iter()
        .map(Candidate::Segment)
        .collect();

    let today = DateBucket::today();
    if buckets.as_ref().is_none_or(|b| b.contains(&today)) {
        for memtable in buffers.memtables {
            let partition = if memtable.tag.is_empty() {
                None
            } else {
                match state.partition_by_tag(table, &memtable.tag) {
                    Some(p) => Some(p.name.clone()),
                    // Partition dropped after the rows were buffered
                    None => continue,
                }
            };
            if partitions.contains(&partition) {
                candidates.push(Candidate::Buffer(memtable));
            }
        }
    }

    Ok(SearchPlan {
        dimension: schema.dimension,
        metric: schema.index.metric_type,
        engine: schema.index.engine_type,
        candidates,
        pending_deletes: Arc::new(buffers.deletes),
    })
}

/// Plan over explicit segment ids only; no buffers.
pub fn resolve_file_ids(state: &MetaState, buffers: BufferSnapshot, table: &str, ids: &[SegmentId]) -> Result<SearchPlan> {
    let schema = state.table(table)?;
    let segments = state.segments_by_ids(table, ids);
    if segments.is_empty() {
        return Err(Error::not_found(
            "segment",
            &ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
        ));
    }

    Ok(SearchPlan {
        dimension: schema.dimension,
        metric: schema.index.metric_type,
        engine: schema.index.engine_type,
        candidates: segments.into_iter().map(Candidate::Segment).collect(),
        pending_deletes: Arc::new(buffers.deletes),
    })
}
