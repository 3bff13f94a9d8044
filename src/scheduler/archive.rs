use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use tracing::{info, warn};
use crate::archive::ArchiveType;
use crate::core::context::EngineContext;
use crate::core::date::DateBucket;
use crate::core::error::Result;
use crate::core::types::SegmentId;
use crate::meta::state::IndexState;
use crate::storage::layout::{temp_path, Medium};

/// Apply the archive policy once. Returns the number of segments affected.
pub fn run_archive(ctx: &EngineContext) -> Result<usize> {
    let targets = ctx.archive.select_targets(&ctx.meta.snapshot(), DateBucket::today());
    if targets.is_empty() {
        return Ok(0);
    }

    let mut by_table: BTreeMap<String, Vec<SegmentId>> = BTreeMap::new();
    for segment in targets {
        by_table.entry(segment.table.clone()).or_default().push(segment.id);
    }

    let mut affected = 0;
    for (table, ids) in by_table {
        match archive_table(ctx, &table, &ids) {
            Ok(count) => affected += count,
            Err(e) => warn!(table = %table, error = %e, "archive pass failed"),
        }
    }
    Ok(affected)
}

fn archive_table(ctx: &EngineContext, table: &str, ids: &[SegmentId]) -> Result<usize> {
    let gate = ctx.gate(table);
    let _gate = gate.lock();

    // Re-check under the gate; a merge may have retired some meanwhile
    let state = ctx.meta.snapshot();
    let ids: Vec<SegmentId> = ids
        .iter()
        .copied()
        .filter(|id| {
            state.segments.get(id).is_some_and(|s| {
                s.is_active()
                    && match ctx.archive.kind() {
                        ArchiveType::Delete => true,
                        // A build in flight writes next to the primary file
                        ArchiveType::Swap => s.medium == Medium::Primary && s.index_state != IndexState::Building,
                    }
            })
        })
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }

    match ctx.archive.kind() {
        ArchiveType::Delete => {
            ctx.meta.retire_segments(&ids)?;
            for id in &ids {
                ctx.cache.invalidate(*id);
            }
            info!(table = %table, segments = ids.len(), "archived segments by deletion");
        }
        ArchiveType::Swap => {
            for id in &ids {
                copy_segment_files(ctx, *id)?;
            }
            // Primary copies are left for cleanup once the grace period ends
            ctx.meta.set_medium(&ids, Medium::Secondary)?;
            for id in &ids {
                ctx.cache.invalidate(*id);
            }
            info!(table = %table, segments = ids.len(), "moved segments to secondary medium");
        }
    }
    Ok(ids.len())
}

fn copy_segment_files(ctx: &EngineContext, id: SegmentId) -> Result<()> {
    let sources = ctx.storage.segment_files(Medium::Primary, id);
    let targets = ctx.storage.segment_files(Medium::Secondary, id);
    for (source, target) in sources.iter().zip(targets.iter()) {
        if source.exists() {
            copy_durable(source, target)?;
        }
    }
    Ok(())
}

fn copy_durable(source: &Path, target: &Path) -> Result<()> {
    let tmp = temp_path(target);
    fs::copy(source, &tmp)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, target)?;
    Ok(())
}
