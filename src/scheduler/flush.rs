use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use crate::cache::CacheKind;
use crate::core::context::EngineContext;
use crate::core::date::DateBucket;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::fault::FaultPoint;
use crate::core::types::SegmentId;
use crate::memtable::{FlushBatch, TableBuffers};
use crate::meta::state::{MetaState, NewSegment};
use crate::storage::layout::{remove_if_exists, Medium};
use crate::storage::segment::SegmentData;
use crate::storage::segment_writer::{write_deleted, write_segment};

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Flush every table that has buffered records.
pub fn flush_all(ctx: &EngineContext) -> Result<()> {
    let mut first_error = None;
    for table in ctx.memtables.pending_tables() {
        if let Err(e) = flush_table(ctx, &table) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Write the table's buffers out as segments and commit them together with
/// the deletes and the new flush lsn. Retries with linear backoff; on final
/// failure the buffers are kept for the next attempt.
pub fn flush_table(ctx: &EngineContext, table: &str) -> Result<()> {
    let Some(buffers) = ctx.memtables.get(table) else {
        return Ok(());
    };
    let gate = ctx.gate(table);
    let _gate = gate.lock();

    let batch = buffers.swap_for_flush();
    if batch.is_empty() {
        buffers.finish_flush(|| Ok(()))?;
        return Ok(());
    }

    let mut attempt = 0;
    loop {
        match write_batch(ctx, table, &buffers, &batch) {
            Ok(rows) => {
                info!(table = %table, rows, lsn = batch.max_lsn, "flushed table");
                break;
            }
            Err(e) if attempt < ctx.config.flush_retries => {
                attempt += 1;
                warn!(table = %table, attempt, error = %e, "flush failed, retrying");
                thread::sleep(RETRY_BACKOFF * attempt);
            }
            Err(e) => {
                error!(table = %table, error = %e, "flush failed, keeping buffers");
                return Err(e);
            }
        }
    }

    reclaim_wal(ctx)
}

/// Drop WAL files whose records all live in segments.
pub fn reclaim_wal(ctx: &EngineContext) -> Result<()> {
    let mut wal = ctx.wal.lock();
    let low_water_mark = ctx.memtables.low_water_mark(wal.current_lsn());
    wal.reclaim(low_water_mark)?;
    Ok(())
}

fn write_batch(ctx: &EngineContext, table: &str, buffers: &TableBuffers, batch: &FlushBatch) -> Result<usize> {
    if ctx.faults.should_fail(FaultPoint::FlushWrite) {
        return Err(Error::new(ErrorKind::Io, format!("injected flush failure for table '{}'", table)));
    }

    let state = ctx.meta.snapshot();
    if state.table(table).is_err() {
        // Dropped while buffered: nothing left to persist
        debug!(table = %table, "discarding buffers of dropped table");
        buffers.finish_flush(|| Ok(()))?;
        return Ok(0);
    }

    // One segment per partition; everything flushed now is dated today
    let mut groups: BTreeMap<Option<String>, SegmentData> = BTreeMap::new();
    for memtable in &batch.memtables {
        let partition = if memtable.tag.is_empty() {
            None
        } else {
            match state.partition_by_tag(table, &memtable.tag) {
                Some(p) => Some(p.name.clone()),
                None => {
                    debug!(table = %table, tag = %memtable.tag, "partition gone, dropping buffered rows");
                    continue;
                }
            }
        };
        // Deletes already took their rows out of the buffers
        let rows = groups.entry(partition).or_insert_with(|| SegmentData::new(buffers.dimension));
        for (row, &id) in memtable.data.ids.iter().enumerate() {
            rows.push(id, memtable.data.vector(row));
        }
    }
    groups.retain(|_, rows| !rows.is_empty());

    let date = DateBucket::today();
    let ids = ctx.meta.allocate_segment_ids(groups.len())?;
    let mut written: Vec<SegmentId> = Vec::new();
    let mut segments = Vec::with_capacity(groups.len());
    let mut rows_flushed = 0;

    let result = (|| -> Result<Vec<(SegmentId, u64)>> {
        for ((partition, rows), id) in groups.into_iter().zip(ids) {
            written.push(id);
            let byte_size = write_segment(&ctx.storage.segment_path(Medium::Primary, id), &rows)?;
            rows_flushed += rows.row_count();
            segments.push(NewSegment {
                id,
                partition,
                date,
                row_count: rows.row_count() as u64,
                byte_size,
            });
        }
        apply_deletes(ctx, table, &state, batch)
    })();

    let deleted_counts = match result {
        Ok(counts) => counts,
        Err(e) => {
            discard_files(ctx, &written);
            return Err(e);
        }
    };

    let commit = buffers.finish_flush(|| {
        ctx.meta.mutate(|next| {
            next.register_flush(table, segments, batch.max_lsn, Utc::now())?;
            for &(id, count) in &deleted_counts {
                next.segment_mut(id)?.deleted_count = count;
            }
            Ok(())
        })?;
        // Before the buffer lock drops, so no query pairs the new state with
        // an old cached deleted set
        for &(id, _) in &deleted_counts {
            ctx.cache.invalidate_kind(id, CacheKind::Deleted);
        }
        Ok(())
    });

    if let Err(e) = commit {
        discard_files(ctx, &written);
        return Err(e);
    }
    Ok(rows_flushed)
}

/// Union the batch's deletes into the deleted set of every segment that was
/// active before this flush and holds one of the ids. Returns the new deleted
/// count per touched segment.
fn apply_deletes(
    ctx: &EngineContext,
    table: &str,
    state: &MetaState,
    batch: &FlushBatch,
) -> Result<Vec<(SegmentId, u64)>> {
    if batch.deletes.is_empty() {
        return Ok(Vec::new());
    }

    let mut counts = Vec::new();
    for segment in state.active_segments(table) {
        let data = ctx.cache.segment_data(segment)?;
        let hits: Vec<u64> = data.ids.iter().copied().filter(|id| batch.deletes.contains(*id)).collect();
        if hits.is_empty() {
            continue;
        }

        let current = ctx.cache.deleted_set(segment)?;
        let mut updated = (*current).clone();
        updated.extend(hits);
        if updated.len() == current.len() {
            continue;
        }
        write_deleted(&ctx.storage.deleted_path(segment.medium, segment.id), &updated)?;
        counts.push((segment.id, updated.len()));
    }
    Ok(counts)
}

fn discard_files(ctx: &EngineContext, ids: &[SegmentId]) {
    for id in ids {
        for path in ctx.storage.segment_files(Medium::Primary, *id) {
            if let Err(e) = remove_if_exists(&path) {
                warn!(file = %path.display(), error = %e, "failed to remove orphaned segment file");
            }
        }
    }
}
