//! Inverted-file index: coarse k-means centroids, one posting list per centroid.
//! With `quantize` set the list payload is 8-bit scalar codes instead of floats.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::VectorId;
use crate::engine::{check_queries, distance, IndexArtifact, IndexBackend, IndexParams, MetricType, SearchParams};
use crate::query::results::{Hit, TopKCollector};
use crate::storage::segment::SegmentData;

const TRAIN_ITERATIONS: usize = 5;
/// Fewer points than this per centroid makes k-means meaningless.
const MIN_POINTS_PER_LIST: usize = 39;

/// Per-dimension min/scale quantizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarQuantizer {
    pub min: Vec<f32>,
    pub scale: Vec<f32>,
}

impl ScalarQuantizer {
    fn train(data: &SegmentData) -> Self {
        let dim = data.dimension;
        let mut min = vec![f32::INFINITY; dim];
        let mut max = vec![f32::NEG_INFINITY; dim];
        for row in 0..data.row_count() {
            for (d, &x) in data.vector(row).iter().enumerate() {
                min[d] = min[d].min(x);
                max[d] = max[d].max(x);
            }
        }
        let scale = min
            .iter()
            .zip(&max)
            .map(|(lo, hi)| if hi > lo { (hi - lo) / 255.0 } else { 1.0 })
            .collect();
        ScalarQuantizer { min, scale }
    }

    fn encode(&self, vector: &[f32], out: &mut Vec<u8>) {
        for (d, &x) in vector.iter().enumerate() {
            let code = ((x - self.min[d]) / self.scale[d]).round().clamp(0.0, 255.0);
            out.push(code as u8);
        }
    }

    fn decode(&self, codes: &[u8], out: &mut [f32]) {
        for (d, &c) in codes.iter().enumerate() {
            out[d] = self.min[d] + c as f32 * self.scale[d];
        }
    }

    fn byte_size(&self) -> usize {
        (self.min.len() + self.scale.len()) * 4
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertedList {
    pub ids: Vec<VectorId>,
    /// Raw floats (IVF flat) ...
    pub vectors: Vec<f32>,
    /// ... or SQ8 codes, one byte per component.
    pub codes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    pub metric: MetricType,
    pub dimension: usize,
    pub centroids: Vec<f32>,
    pub lists: Vec<InvertedList>,
    pub quantizer: Option<ScalarQuantizer>,
}

impl IvfIndex {
    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    pub fn row_count(&self) -> usize {
        self.lists.iter().map(|l| l.ids.len()).sum()
    }

    pub fn byte_size(&self) -> usize {
        let lists: usize = self
            .lists
            .iter()
            .map(|l| l.ids.len() * 8 + l.vectors.len() * 4 + l.codes.len())
            .sum();
        self.centroids.len() * 4 + lists + self.quantizer.as_ref().map_or(0, |q| q.byte_size())
    }

    fn centroid(&self, list: usize) -> &[f32] {
        &self.centroids[list * self.dimension..(list + 1) * self.dimension]
    }

    /// Lists to scan for one query, best first.
    fn probe_order(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut scored: Vec<(f32, usize)> = (0..self.nlist())
            .map(|list| {
                let d = distance::distance(self.metric, query, self.centroid(list));
                let key = match self.metric {
                    MetricType::L2 => d,
                    MetricType::InnerProduct => -d,
                };
                (key, list)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(nprobe.max(1)).map(|(_, list)| list).collect()
    }

    fn search_one(&self, query: &[f32], k: usize, nprobe: usize) -> Vec<Hit> {
        let mut collector = TopKCollector::new(k, self.metric);
        let mut decoded = vec![0.0f32; self.dimension];
        for list_no in self.probe_order(query, nprobe) {
            let list = &self.lists[list_no];
            for (row, &id) in list.ids.iter().enumerate() {
                let range = row * self.dimension..(row + 1) * self.dimension;
                let vector: &[f32] = match &self.quantizer {
                    Some(q) => {
                        q.decode(&list.codes[range], &mut decoded);
                        &decoded
                    }
                    None => &list.vectors[range],
                };
                collector.collect(Hit::new(id, distance::distance(self.metric, query, vector)));
            }
        }
        collector.get_results()
    }
}

pub struct IvfBackend {
    pub quantize: bool,
}

impl IvfBackend {
    fn train_centroids(data: &SegmentData, nlist: usize) -> Vec<f32> {
        let dim = data.dimension;
        let rows = data.row_count();

        // Deterministic spread over the segment as the initial guess.
        let mut centroids = Vec::with_capacity(nlist * dim);
        for c in 0..nlist {
            centroids.extend_from_slice(data.vector(c * rows / nlist));
        }

        for _ in 0..TRAIN_ITERATIONS {
            let assignment = Self::assign(data, &centroids, nlist);

            let mut sums = vec![0.0f32; nlist * dim];
            let mut counts = vec![0usize; nlist];
            for (row, &list) in assignment.iter().enumerate() {
                counts[list] += 1;
                for (d, &x) in data.vector(row).iter().enumerate() {
                    sums[list * dim + d] += x;
                }
            }
            for list in 0..nlist {
                // Empty clusters keep their previous centroid
                if counts[list] == 0 {
                    continue;
                }
                for d in 0..dim {
                    centroids[list * dim + d] = sums[list * dim + d] / counts[list] as f32;
                }
            }
        }
        centroids
    }

    fn assign(data: &SegmentData, centroids: &[f32], nlist: usize) -> Vec<usize> {
        let dim = data.dimension;
        (0..data.row_count())
            .into_par_iter()
            .map(|row| {
                let vector = data.vector(row);
                let mut best = (f32::INFINITY, 0usize);
                for list in 0..nlist {
                    let d = distance::l2_squared(vector, &centroids[list * dim..(list + 1) * dim]);
                    if d < best.0 {
                        best = (d, list);
                    }
                }
                best.1
            })
            .collect()
    }
}

impl IndexBackend for IvfBackend {
    fn build(&self, data: &SegmentData, metric: MetricType, params: &IndexParams) -> Result<IndexArtifact> {
        if data.is_empty() || data.dimension == 0 {
            return Err(Error::new(ErrorKind::IndexBuild, "cannot train an IVF index on an empty segment".to_string()));
        }

        let nlist = params
            .nlist
            .min(data.row_count() / MIN_POINTS_PER_LIST)
            .max(1);
        let centroids = Self::train_centroids(data, nlist);
        let assignment = Self::assign(data, &centroids, nlist);
        let quantizer = self.quantize.then(|| ScalarQuantizer::train(data));

        let mut lists = vec![InvertedList::default(); nlist];
        for (row, &list_no) in assignment.iter().enumerate() {
            let list = &mut lists[list_no];
            list.ids.push(data.ids[row]);
            match &quantizer {
                Some(q) => q.encode(data.vector(row), &mut list.codes),
                None => list.vectors.extend_from_slice(data.vector(row)),
            }
        }

        Ok(IndexArtifact::Ivf(IvfIndex {
            metric,
            dimension: data.dimension,
            centroids,
            lists,
            quantizer,
        }))
    }

    fn search(
        &self,
        artifact: &IndexArtifact,
        queries: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Vec<Hit>>> {
        let IndexArtifact::Ivf(index) = artifact else {
            return Err(Error::new(ErrorKind::Internal, "ivf backend given a non-ivf artifact".to_string()));
        };
        check_queries(queries, index.dimension)?;

        Ok(queries
            .par_chunks(index.dimension)
            .map(|query| index.search_one(query, k, params.nprobe))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered(rows: usize) -> SegmentData {
        let mut data = SegmentData::new(4);
        for i in 0..rows {
            let base = (i % 4) as f32 * 100.0;
            let jitter = (i / 4) as f32 * 0.01;
            data.push(i as u64, &[base + jitter, base, base - jitter, 1.0]);
        }
        data
    }

    #[test]
    fn every_row_lands_in_one_list() {
        let data = clustered(400);
        let artifact = IvfBackend { quantize: false }
            .build(&data, MetricType::L2, &IndexParams { nlist: 8 })
            .unwrap();
        assert_eq!(artifact.row_count(), 400);
        let IndexArtifact::Ivf(index) = artifact else { panic!("expected ivf") };
        assert_eq!(index.nlist(), 8);
    }

    #[test]
    fn finds_exact_row_when_scanning_every_list() {
        let data = clustered(400);
        let backend = IvfBackend { quantize: false };
        let artifact = backend.build(&data, MetricType::L2, &IndexParams { nlist: 4 }).unwrap();
        let query = data.vector(123).to_vec();
        let hits = backend.search(&artifact, &query, 1, &SearchParams { nprobe: 4 }).unwrap();
        assert_eq!(hits[0][0].id, 123);
        assert!(hits[0][0].distance.abs() < 1e-6);
    }

    #[test]
    fn sq8_stays_close_to_exact() {
        let data = clustered(400);
        let backend = IvfBackend { quantize: true };
        let artifact = backend.build(&data, MetricType::L2, &IndexParams { nlist: 4 }).unwrap();
        let query = [200.0, 200.0, 200.0, 1.0];
        let hits = backend.search(&artifact, &query, 5, &SearchParams { nprobe: 4 }).unwrap();
        assert_eq!(hits[0].len(), 5);
        assert!(hits[0].iter().all(|h| h.id % 4 == 2));
    }

    #[test]
    fn small_segment_uses_single_list() {
        let data = clustered(10);
        let artifact = IvfBackend { quantize: true }
            .build(&data, MetricType::InnerProduct, &IndexParams::default())
            .unwrap();
        let IndexArtifact::Ivf(index) = artifact else { panic!("expected ivf") };
        assert_eq!(index.nlist(), 1);
    }

    #[test]
    fn empty_segment_fails_to_build() {
        let err = IvfBackend { quantize: false }
            .build(&SegmentData::new(4), MetricType::L2, &IndexParams::default())
            .unwrap_err();
        assert!(err.is(ErrorKind::IndexBuild));
    }
}
