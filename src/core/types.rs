use std::fmt;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};

pub type VectorId = u64;

/// Segment identifier, allocated monotonically by the metadata manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SegmentId {
    fn from(id: u64) -> Self {
        SegmentId(id)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A batch of row-major vectors with their ids.
///
/// `ids` may be left empty on insert; the engine fills it with generated ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorBatch {
    pub vectors: Vec<f32>,
    pub ids: Vec<VectorId>,
}

impl VectorBatch {
    pub fn new(vectors: Vec<f32>, ids: Vec<VectorId>) -> Self {
        VectorBatch { vectors, ids }
    }

    pub fn from_vectors(vectors: Vec<f32>) -> Self {
        VectorBatch { vectors, ids: Vec::new() }
    }

    pub fn count(&self, dimension: usize) -> usize {
        if dimension == 0 { 0 } else { self.vectors.len() / dimension }
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Checks that the flat data holds whole vectors of `dimension` and that
    /// supplied ids (if any) match the vector count.
    pub fn validate(&self, dimension: usize) -> Result<usize> {
        if dimension == 0 || self.vectors.len() % dimension != 0 {
            return Err(Error::invalid_argument(format!(
                "vector data length {} is not a multiple of table dimension {}",
                self.vectors.len(),
                dimension
            )));
        }
        let count = self.vectors.len() / dimension;
        if !self.ids.is_empty() && self.ids.len() != count {
            return Err(Error::invalid_argument(format!(
                "{} ids supplied for {} vectors",
                self.ids.len(),
                count
            )));
        }
        Ok(count)
    }
}
