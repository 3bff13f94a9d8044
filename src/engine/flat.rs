use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::VectorId;
use crate::engine::{check_queries, distance, IndexArtifact, IndexBackend, IndexParams, MetricType, SearchParams};
use crate::query::results::{Hit, TopKCollector};
use crate::storage::segment::SegmentData;

/// Exact index: a copy of the id map and vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    pub metric: MetricType,
    pub dimension: usize,
    pub ids: Vec<VectorId>,
    pub vectors: Vec<f32>,
}

impl FlatIndex {
    pub fn byte_size(&self) -> usize {
        self.ids.len() * 8 + self.vectors.len() * 4
    }
}

pub struct FlatBackend;

impl IndexBackend for FlatBackend {
    fn build(&self, data: &SegmentData, metric: MetricType, _params: &IndexParams) -> Result<IndexArtifact> {
        Ok(IndexArtifact::Flat(FlatIndex {
            metric,
            dimension: data.dimension,
            ids: data.ids.clone(),
            vectors: data.vectors.clone(),
        }))
    }

    fn search(
        &self,
        artifact: &IndexArtifact,
        queries: &[f32],
        k: usize,
        _params: &SearchParams,
    ) -> Result<Vec<Vec<Hit>>> {
        let IndexArtifact::Flat(index) = artifact else {
            return Err(Error::new(ErrorKind::Internal, "flat backend given a non-flat artifact".to_string()));
        };
        search_rows(&index.ids, &index.vectors, index.dimension, index.metric, queries, k, |_| true)
    }
}

/// Brute-force scan over raw rows, skipping ids for which `keep` is false.
pub fn search_rows(
    ids: &[VectorId],
    vectors: &[f32],
    dimension: usize,
    metric: MetricType,
    queries: &[f32],
    k: usize,
    keep: impl Fn(VectorId) -> bool + Sync,
) -> Result<Vec<Vec<Hit>>> {
    check_queries(queries, dimension)?;

    let results = queries
        .par_chunks(dimension)
        .map(|query| {
            let mut collector = TopKCollector::new(k, metric);
            for (row, &id) in ids.iter().enumerate() {
                if !keep(id) {
                    continue;
                }
                let vector = &vectors[row * dimension..(row + 1) * dimension];
                collector.collect(Hit::new(id, distance::distance(metric, query, vector)));
            }
            collector.get_results()
        })
        .collect();

    Ok(results)
}

pub fn search_segment(
    data: &SegmentData,
    metric: MetricType,
    queries: &[f32],
    k: usize,
    keep: impl Fn(VectorId) -> bool + Sync,
) -> Result<Vec<Vec<Hit>>> {
    search_rows(&data.ids, &data.vectors, data.dimension, metric, queries, k, keep)
}
