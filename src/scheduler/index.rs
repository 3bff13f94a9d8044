use tracing::{debug, info, warn};
use crate::cache::CacheKind;
use crate::core::context::EngineContext;
use crate::core::error::{Error, ErrorKind, Result};
use crate::engine::{backend_for, EngineType, TableIndex};
use crate::meta::state::{IndexState, SegmentSchema};
use crate::storage::layout::remove_if_exists;
use crate::storage::segment_writer::write_index;

/// Build indexes for every eligible segment of `table`. Failures are logged
/// and left for the next pass. Returns the number of indexes built.
pub fn build_indexes(ctx: &EngineContext, table: &str) -> Result<usize> {
    let state = ctx.meta.snapshot();
    let Ok(schema) = state.table(table) else {
        return Ok(0);
    };
    let index = schema.index;
    // Raw files already serve IDMAP searches
    if index.engine_type == EngineType::Flat {
        return Ok(0);
    }

    let candidates: Vec<SegmentSchema> = state
        .active_segments(table)
        .filter(|s| matches!(s.index_state, IndexState::Absent | IndexState::Stale))
        .filter(|s| s.row_count >= ctx.config.index_build_min_rows)
        .cloned()
        .collect();

    let mut built = 0;
    for segment in &candidates {
        match build_one(ctx, &index, segment) {
            Ok(true) => built += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(table = %table, segment = segment.id.value(), error = %e, "index build failed");
            }
        }
    }

    if built > 0 {
        info!(table = %table, engine = %index.engine_type, segments = built, "built indexes");
    }
    Ok(built)
}

fn build_one(ctx: &EngineContext, index: &TableIndex, segment: &SegmentSchema) -> Result<bool> {
    let previous = segment.index_state;
    if !ctx.meta.begin_index_build(segment.id)? {
        return Ok(false);
    }

    let path = ctx.storage.index_path(segment.medium, segment.id);
    let built = ctx
        .cache
        .segment_data(segment)
        .and_then(|data| backend_for(index.engine_type).build(&data, index.metric_type, &index.params))
        .and_then(|artifact| write_index(&path, &artifact));

    let bytes = match built {
        Ok(bytes) => bytes,
        Err(e) => {
            ctx.meta.abort_index_build(segment.id, previous)?;
            return Err(Error::new(
                ErrorKind::IndexBuild,
                format!("segment {}: {}", segment.id, e.context),
            ));
        }
    };

    if !ctx.meta.finish_index_build(segment.id, index.engine_type, bytes)? {
        debug!(segment = segment.id.value(), "segment retired during build, discarding index");
        remove_if_exists(&path)?;
        return Ok(false);
    }
    ctx.cache.invalidate_kind(segment.id, CacheKind::Index);
    Ok(true)
}
