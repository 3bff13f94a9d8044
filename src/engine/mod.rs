//! Boundary to the nearest-neighbour index library.
//!
//! The core only sees `EngineType`, `IndexArtifact` and the `IndexBackend`
//! trait; each engine kind is served by one backend.

pub mod distance;
pub mod flat;
pub mod ivf;

use std::fmt;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::query::results::Hit;
use crate::storage::segment::SegmentData;
use self::flat::{FlatBackend, FlatIndex};
use self::ivf::{IvfBackend, IvfIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EngineType {
    /// Exact search over an id map.
    #[default]
    Flat,
    IvfFlat,
    IvfSq8,
    /// Hybrid CPU/GPU SQ8; served by the CPU SQ8 backend here.
    IvfSq8Hybrid,
}

impl EngineType {
    pub fn name(&self) -> &'static str {
        match self {
            EngineType::Flat => "IDMAP",
            EngineType::IvfFlat => "IVFFLAT",
            EngineType::IvfSq8 => "IVFSQ8",
            EngineType::IvfSq8Hybrid => "IVFSQ8H",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MetricType {
    #[default]
    L2,
    InnerProduct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub nlist: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        IndexParams { nlist: 16384 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub nprobe: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams { nprobe: 16 }
    }
}

/// Index descriptor of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableIndex {
    pub engine_type: EngineType,
    pub metric_type: MetricType,
    pub params: IndexParams,
}

/// Opaque, serializable index built from one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexArtifact {
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

impl IndexArtifact {
    pub fn byte_size(&self) -> usize {
        match self {
            IndexArtifact::Flat(index) => index.byte_size(),
            IndexArtifact::Ivf(index) => index.byte_size(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            IndexArtifact::Flat(index) => index.ids.len(),
            IndexArtifact::Ivf(index) => index.row_count(),
        }
    }
}

pub trait IndexBackend: Send + Sync {
    fn build(&self, data: &SegmentData, metric: MetricType, params: &IndexParams) -> Result<IndexArtifact>;

    /// One best-first hit list per query vector, at most `k` long.
    fn search(
        &self,
        artifact: &IndexArtifact,
        queries: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Vec<Hit>>>;
}

static FLAT: FlatBackend = FlatBackend;
static IVF_FLAT: IvfBackend = IvfBackend { quantize: false };
static IVF_SQ8: IvfBackend = IvfBackend { quantize: true };

pub fn backend_for(engine: EngineType) -> &'static dyn IndexBackend {
    match engine {
        EngineType::Flat => &FLAT,
        EngineType::IvfFlat => &IVF_FLAT,
        EngineType::IvfSq8 | EngineType::IvfSq8Hybrid => &IVF_SQ8,
    }
}

pub(crate) fn check_queries(queries: &[f32], dimension: usize) -> Result<usize> {
    if dimension == 0 || queries.len() % dimension != 0 {
        return Err(Error::invalid_argument(format!(
            "query data length {} is not a multiple of dimension {}",
            queries.len(),
            dimension
        )));
    }
    Ok(queries.len() / dimension)
}
