use tracing::{debug, info, warn};
use crate::core::context::EngineContext;
use crate::core::date::DateBucket;
use crate::core::error::Result;
use crate::core::types::SegmentId;
use crate::meta::state::{NewSegment, SegmentSchema};
use crate::storage::layout::{remove_if_exists, Medium};
use crate::storage::merge_policy::group_segments;
use crate::storage::segment::SegmentData;
use crate::storage::segment_writer::write_segment;

/// One merge pass over a table: every (partition, date) group the policy
/// selects is rewritten into a single segment. Returns the number of merges.
pub fn merge_table(ctx: &EngineContext, table: &str) -> Result<usize> {
    let gate = ctx.gate(table);
    let _gate = gate.lock();

    let state = ctx.meta.snapshot();
    if state.table(table).is_err() {
        return Ok(0);
    }

    let mut merged = 0;
    for ((partition, date), segments) in group_segments(state.active_segments(table)) {
        if !ctx.merge_policy.should_merge(&segments) {
            continue;
        }
        let selected = ctx.merge_policy.select_segments_to_merge(&segments);
        if selected.is_empty() {
            continue;
        }

        let rows = live_rows(ctx, &selected)?;
        let sources: Vec<SegmentId> = selected.iter().map(|s| s.id).collect();
        let replacement = if rows.is_empty() {
            None
        } else {
            Some(write_replacement(ctx, partition.clone(), date, &rows)?)
        };

        commit_replacement(ctx, table, &sources, replacement)?;
        info!(
            table = %table,
            partition = ?partition,
            date = %date,
            sources = sources.len(),
            rows = rows.row_count(),
            "merged segments"
        );
        merged += 1;
    }
    Ok(merged)
}

/// Rewrite every segment with deleted rows so the rows are physically gone.
/// Row counts seen by callers stay the same. Returns segments rewritten.
pub fn compact_table(ctx: &EngineContext, table: &str) -> Result<usize> {
    let gate = ctx.gate(table);
    let _gate = gate.lock();

    let state = ctx.meta.snapshot();
    state.table(table)?;

    let mut compacted = 0;
    let targets: Vec<SegmentSchema> = state
        .active_segments(table)
        .filter(|s| s.deleted_count > 0)
        .cloned()
        .collect();

    for segment in targets {
        let rows = live_rows(ctx, std::slice::from_ref(&segment))?;
        let replacement = if rows.is_empty() {
            None
        } else {
            Some(write_replacement(ctx, segment.partition.clone(), segment.date, &rows)?)
        };
        commit_replacement(ctx, table, &[segment.id], replacement)?;
        debug!(table = %table, segment = segment.id.value(), rows = rows.row_count(), "compacted segment");
        compacted += 1;
    }

    if compacted > 0 {
        info!(table = %table, segments = compacted, "compacted table");
    }
    Ok(compacted)
}

/// Rows of `segments` minus their deleted sets, in segment order.
fn live_rows(ctx: &EngineContext, segments: &[SegmentSchema]) -> Result<SegmentData> {
    let mut out: Option<SegmentData> = None;
    for segment in segments {
        let data = ctx.cache.segment_data(segment)?;
        let deleted = ctx.cache.deleted_set(segment)?;
        let rows = out.get_or_insert_with(|| SegmentData::new(data.dimension));
        for (row, &id) in data.ids.iter().enumerate() {
            if !deleted.contains(id) {
                rows.push(id, data.vector(row));
            }
        }
    }
    Ok(out.unwrap_or_default())
}

fn write_replacement(
    ctx: &EngineContext,
    partition: Option<String>,
    date: DateBucket,
    rows: &SegmentData,
) -> Result<NewSegment> {
    let id = ctx.meta.allocate_segment_ids(1)?[0];
    let byte_size = write_segment(&ctx.storage.segment_path(Medium::Primary, id), rows)?;
    Ok(NewSegment {
        id,
        partition,
        date,
        row_count: rows.row_count() as u64,
        byte_size,
    })
}

/// Swap `sources` for `replacement` in one metadata transaction. On failure
/// the new file is removed and the sources stay active.
fn commit_replacement(
    ctx: &EngineContext,
    table: &str,
    sources: &[SegmentId],
    replacement: Option<NewSegment>,
) -> Result<()> {
    let new_id = replacement.as_ref().map(|s| s.id);
    if let Err(e) = ctx.meta.replace_segments(table, sources, replacement) {
        if let Some(id) = new_id {
            for path in ctx.storage.segment_files(Medium::Primary, id) {
                if let Err(err) = remove_if_exists(&path) {
                    warn!(file = %path.display(), error = %err, "failed to remove merge output");
                }
            }
        }
        return Err(e);
    }

    for id in sources {
        ctx.cache.invalidate(*id);
    }
    Ok(())
}
