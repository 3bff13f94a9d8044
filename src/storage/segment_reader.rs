use std::fs::File;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use memmap2::{Mmap, MmapOptions};
use roaring::RoaringTreemap;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::VectorId;
use crate::engine::IndexArtifact;
use crate::storage::segment::{SegmentData, SegmentHeader};

/// Read-only view of a segment file, memory mapped.
pub struct SegmentReader {
    pub header: SegmentHeader,
    mmap: Mmap,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < SegmentHeader::SIZE {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("segment file {} is truncated", path.display()),
            ));
        }

        let mmap = unsafe { MmapOptions::new().len(len).map(&file)? };
        let header = SegmentHeader::decode(&mmap[..SegmentHeader::SIZE])?;

        if len != SegmentHeader::SIZE + header.body_len() {
            return Err(Error::new(
                ErrorKind::Parse,
                format!(
                    "segment file {} has {} bytes, header announces {}",
                    path.display(),
                    len,
                    SegmentHeader::SIZE + header.body_len()
                ),
            ));
        }

        Ok(SegmentReader { header, mmap })
    }

    fn body(&self) -> &[u8] {
        &self.mmap[SegmentHeader::SIZE..]
    }

    pub fn verify(&self) -> Result<()> {
        let actual = crc32fast::hash(self.body());
        if actual != self.header.checksum {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("segment checksum mismatch: expected {:08x}, got {:08x}", self.header.checksum, actual),
            ));
        }
        Ok(())
    }

    /// Decode all rows after checking the body checksum.
    pub fn read_data(&self) -> Result<SegmentData> {
        self.verify()?;

        let dimension = self.header.dimension as usize;
        let rows = self.header.row_count as usize;
        let row_len = 8 + dimension * 4;
        let mut data = SegmentData {
            dimension,
            ids: Vec::with_capacity(rows),
            vectors: Vec::with_capacity(rows * dimension),
        };

        for row in self.body().chunks_exact(row_len) {
            let mut id = [0u8; 8];
            id.copy_from_slice(&row[..8]);
            data.ids.push(VectorId::from_le_bytes(id));
            for x in row[8..].chunks_exact(4) {
                data.vectors.push(f32::from_le_bytes([x[0], x[1], x[2], x[3]]));
            }
        }
        Ok(data)
    }
}

/// Load a deleted-id set; a missing file means nothing was deleted.
pub fn read_deleted(path: &Path) -> Result<RoaringTreemap> {
    match File::open(path) {
        Ok(file) => Ok(RoaringTreemap::deserialize_from(std::io::BufReader::new(file))?),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(RoaringTreemap::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn read_index(path: &Path) -> Result<IndexArtifact> {
    let data = std::fs::read(path)?;
    Ok(bincode::deserialize(&data)?)
}
