use chrono::{Duration, Utc};
use tracing::{debug, warn};
use crate::core::context::EngineContext;
use crate::core::error::Result;
use crate::core::types::SegmentId;
use crate::meta::state::{Lifecycle, RecordState};
use crate::storage::layout::{remove_if_exists, Medium};

/// Remove files and records of segments retired longer than the grace
/// period, then purge dropped tables and partitions that own nothing.
/// Primary copies left behind by an archive swap age out the same way.
pub fn run_cleanup(ctx: &EngineContext) -> Result<usize> {
    let grace = Duration::milliseconds(ctx.config.file_cleanup_grace_ms as i64);
    let cutoff = Utc::now() - grace;
    let state = ctx.meta.snapshot();

    let swapped: Vec<SegmentId> = state
        .segments
        .values()
        .filter(|s| s.is_active() && s.primary_left_at.is_some_and(|at| at <= cutoff))
        .map(|s| s.id)
        .collect();
    if !swapped.is_empty() {
        remove_primary_copies(ctx, &swapped)?;
    }

    let expired: Vec<SegmentId> = state
        .segments
        .values()
        .filter(|s| matches!(s.lifecycle, Lifecycle::ToDelete { retired_at } if retired_at <= cutoff))
        .map(|s| s.id)
        .collect();

    let dropped_records = state.tables.values().any(|t| t.state == RecordState::ToDelete)
        || state.partitions.values().any(|p| p.state == RecordState::ToDelete);
    if expired.is_empty() && !dropped_records {
        return Ok(0);
    }

    let mut removed = Vec::with_capacity(expired.len());
    for id in expired {
        match remove_segment_files(ctx, id) {
            Ok(()) => {
                ctx.cache.invalidate(id);
                removed.push(id);
            }
            Err(e) => warn!(segment = id.value(), error = %e, "failed to remove retired segment files"),
        }
    }

    ctx.meta.purge(&removed)?;
    if !removed.is_empty() {
        debug!(segments = removed.len(), "cleaned up retired segments");
    }
    Ok(removed.len())
}

fn remove_primary_copies(ctx: &EngineContext, ids: &[SegmentId]) -> Result<()> {
    let mut removed = Vec::with_capacity(ids.len());
    for &id in ids {
        let result = ctx
            .storage
            .segment_files(Medium::Primary, id)
            .iter()
            .try_for_each(|path| remove_if_exists(path));
        match result {
            Ok(()) => removed.push(id),
            Err(e) => warn!(segment = id.value(), error = %e, "failed to remove swapped-out files"),
        }
    }
    ctx.meta.clear_primary_copies(&removed)?;
    debug!(segments = removed.len(), "removed primary copies of swapped segments");
    Ok(())
}

fn remove_segment_files(ctx: &EngineContext, id: SegmentId) -> Result<()> {
    for medium in [Medium::Primary, Medium::Secondary] {
        for path in ctx.storage.segment_files(medium, id) {
            remove_if_exists(&path)?;
        }
    }
    Ok(())
}
