use rayon::prelude::*;
use tracing::{debug, warn};
use crate::cache::CacheManager;
use crate::core::error::Result;
use crate::core::types::VectorId;
use crate::engine::{backend_for, check_queries, flat, SearchParams};
use crate::meta::state::SegmentSchema;
use crate::query::resolver::{Candidate, SearchPlan};
use crate::query::results::{merge_sorted, Hit, QueryResult};

/// Fans a plan out over its candidates in parallel and merges the top-k.
pub struct QueryExecutor<'a> {
    cache: &'a CacheManager,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(cache: &'a CacheManager) -> Self {
        QueryExecutor { cache }
    }

    pub fn execute(&self, plan: &SearchPlan, queries: &[f32], k: usize, params: &SearchParams) -> Result<QueryResult> {
        let nq = check_queries(queries, plan.dimension)?;
        if k == 0 || nq == 0 {
            return Ok(QueryResult::from_hits(vec![Vec::new(); nq]));
        }

        let per_candidate: Vec<Vec<Vec<Hit>>> = plan
            .candidates
            .par_iter()
            .map(|candidate| self.search_candidate(plan, candidate, queries, k, params))
            .collect::<Result<_>>()?;

        let merged = (0..nq)
            .map(|q| {
                let lists: Vec<Vec<Hit>> = per_candidate.iter().map(|hits| hits[q].clone()).collect();
                merge_sorted(plan.metric, k, &lists)
            })
            .collect();

        debug!(candidates = plan.candidates.len(), nq, k, "query executed");
        Ok(QueryResult::from_hits(merged))
    }

    fn search_candidate(
        &self,
        plan: &SearchPlan,
        candidate: &Candidate,
        queries: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Vec<Hit>>> {
        match candidate {
            // Deleted rows are already gone from the buffers
            Candidate::Buffer(memtable) => flat::search_segment(&memtable.data, plan.metric, queries, k, |_| true),
            Candidate::Segment(segment) => self.search_segment(plan, segment, queries, k, params),
        }
    }

    fn search_segment(
        &self,
        plan: &SearchPlan,
        segment: &SegmentSchema,
        queries: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Vec<Hit>>> {
        let deleted = self.cache.deleted_set(segment)?;
        let pending = &plan.pending_deletes;
        let keep = |id: VectorId| !deleted.contains(id) && !pending.contains(id);

        if segment.has_ready_index() {
            if let Some(engine) = segment.index_engine {
                match self.cache.index(segment) {
                    Ok(artifact) => {
                        // Over-fetch by the number of ids that may be filtered out
                        let excluded = deleted.len() + pending.len();
                        let fetch = (k as u64 + excluded).min(artifact.row_count() as u64) as usize;
                        let hits = backend_for(engine).search(&artifact, queries, fetch.max(1), params)?;
                        return Ok(hits
                            .into_iter()
                            .map(|list| list.into_iter().filter(|h| keep(h.id)).take(k).collect())
                            .collect());
                    }
                    Err(e) => {
                        warn!(segment = segment.id.value(), error = %e, "index unreadable, falling back to brute force");
                    }
                }
            }
        }

        let data = self.cache.segment_data(segment)?;
        flat::search_segment(&data, plan.metric, queries, k, keep)
    }
}
