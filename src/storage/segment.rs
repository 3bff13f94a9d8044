use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::VectorId;

/// Raw rows of one segment (or of an insert buffer): ids plus row-major vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentData {
    pub dimension: usize,
    pub ids: Vec<VectorId>,
    pub vectors: Vec<f32>,
}

impl SegmentData {
    pub fn new(dimension: usize) -> Self {
        SegmentData { dimension, ids: Vec::new(), vectors: Vec::new() }
    }

    pub fn row_count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn vector(&self, row: usize) -> &[f32] {
        &self.vectors[row * self.dimension..(row + 1) * self.dimension]
    }

    pub fn push(&mut self, id: VectorId, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimension);
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
    }

    pub fn byte_size(&self) -> usize {
        self.ids.len() * std::mem::size_of::<VectorId>()
            + self.vectors.len() * std::mem::size_of::<f32>()
    }

    /// Row of the most recently pushed copy of `id`.
    pub fn position(&self, id: VectorId) -> Option<usize> {
        self.ids.iter().rposition(|&x| x == id)
    }

    /// Drop every row whose id matches `doomed`. Returns rows removed.
    pub fn remove_rows(&mut self, doomed: impl Fn(VectorId) -> bool) -> usize {
        let dimension = self.dimension;
        let mut kept = 0;
        for row in 0..self.ids.len() {
            let id = self.ids[row];
            if doomed(id) {
                continue;
            }
            if kept != row {
                self.ids[kept] = id;
                self.vectors.copy_within(row * dimension..(row + 1) * dimension, kept * dimension);
            }
            kept += 1;
        }
        let removed = self.ids.len() - kept;
        self.ids.truncate(kept);
        self.vectors.truncate(kept * dimension);
        removed
    }
}

/// Segment file header. The body that follows is `row_count` rows of
/// `id u64 LE | dimension x f32 LE`; `checksum` covers the whole body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u32,
    pub dimension: u32,
    pub row_count: u64,
    pub checksum: u32,  // CRC32 of the body
}

impl SegmentHeader {
    pub const MAGIC: u32 = 0x5645_5853; // "VEXS"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 24; // Fixed header size

    pub fn new(dimension: u32, row_count: u64) -> Self {
        SegmentHeader {
            version: Self::VERSION,
            dimension,
            row_count,
            checksum: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&Self::MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.dimension.to_le_bytes());
        buf[12..20].copy_from_slice(&self.row_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::new(ErrorKind::Parse, "segment header truncated".to_string()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        if u32_at(0) != Self::MAGIC {
            return Err(Error::new(ErrorKind::Parse, "not a segment file".to_string()));
        }
        let version = u32_at(4);
        if version != Self::VERSION {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("incompatible segment version {}", version),
            ));
        }

        let mut rows = [0u8; 8];
        rows.copy_from_slice(&buf[12..20]);
        Ok(SegmentHeader {
            version,
            dimension: u32_at(8),
            row_count: u64::from_le_bytes(rows),
            checksum: u32_at(20),
        })
    }

    /// Expected body length in bytes.
    pub fn body_len(&self) -> usize {
        let rows = self.row_count as usize;
        rows * std::mem::size_of::<VectorId>() + rows * self.dimension as usize * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_fixed_size() {
        let mut header = SegmentHeader::new(128, 42);
        header.checksum = 0xdead_beef;
        let bytes = header.encode();
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.body_len(), 42 * 8 + 42 * 128 * 4);
    }

    #[test]
    fn remove_rows_keeps_vectors_aligned() {
        let mut data = SegmentData::new(2);
        for id in 1..=4u64 {
            data.push(id, &[id as f32, -(id as f32)]);
        }
        assert_eq!(data.remove_rows(|id| id % 2 == 1), 2);
        assert_eq!(data.ids, vec![2, 4]);
        assert_eq!(data.vector(1), &[4.0, -4.0]);
        assert_eq!(data.remove_rows(|_| false), 0);
    }

    #[test]
    fn garbage_header_rejected() {
        assert!(SegmentHeader::decode(&[0u8; 24]).is_err());
        assert!(SegmentHeader::decode(&[1u8; 3]).is_err());
    }
}
