use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use crc32fast::Hasher;
use roaring::RoaringTreemap;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::VectorId;
use crate::engine::IndexArtifact;
use crate::storage::layout::{temp_path, write_atomic};
use crate::storage::segment::{SegmentData, SegmentHeader};

const FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Streams one segment into a temp file; `finish` publishes it by rename.
pub struct SegmentWriter {
    pub path: PathBuf,
    tmp: PathBuf,
    file: File,
    buffer: Vec<u8>,
    hasher: Hasher,
    dimension: usize,
    row_count: u64,
}

impl SegmentWriter {
    pub fn create(path: &Path, dimension: usize) -> Result<Self> {
        let tmp = temp_path(path);
        let mut file = File::create(&tmp)?;
        // Placeholder, rewritten once the checksum is known
        file.write_all(&[0u8; SegmentHeader::SIZE])?;

        Ok(SegmentWriter {
            path: path.to_path_buf(),
            tmp,
            file,
            buffer: Vec::with_capacity(FLUSH_THRESHOLD),
            hasher: Hasher::new(),
            dimension,
            row_count: 0,
        })
    }

    // [ HEADER (magic, version, dim, rows, crc) ] <- byte 0
    // [ ROW 1: id u64 LE | dim x f32 LE ]
    // [ ROW 2 ]
    // ...
    pub fn write_row(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::new(
                ErrorKind::Internal,
                format!("row of {} floats written to a dimension {} segment", vector.len(), self.dimension),
            ));
        }
        self.buffer.extend_from_slice(&id.to_le_bytes());
        for x in vector {
            self.buffer.extend_from_slice(&x.to_le_bytes());
        }
        self.row_count += 1;

        if self.buffer.len() > FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    pub fn write_data(&mut self, data: &SegmentData) -> Result<()> {
        for (row, &id) in data.ids.iter().enumerate() {
            self.write_row(id, data.vector(row))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.hasher.update(&self.buffer);
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Returns the published file size in bytes.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;

        self.file.seek(SeekFrom::Start(0))?;
        let mut header = SegmentHeader::new(self.dimension as u32, self.row_count);
        header.checksum = self.hasher.finalize();
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;

        let size = self.file.metadata()?.len();
        fs::rename(&self.tmp, &self.path)?;
        Ok(size)
    }
}

/// Write a whole segment in one call.
pub fn write_segment(path: &Path, data: &SegmentData) -> Result<u64> {
    let mut writer = SegmentWriter::create(path, data.dimension)?;
    writer.write_data(data)?;
    writer.finish()
}

/// Persist a segment's deleted-id set.
pub fn write_deleted(path: &Path, deleted: &RoaringTreemap) -> Result<()> {
    let mut bytes = Vec::with_capacity(deleted.serialized_size());
    deleted.serialize_into(&mut bytes)?;
    write_atomic(path, &bytes)
}

/// Persist a built index artifact; returns its size on disk.
pub fn write_index(path: &Path, artifact: &IndexArtifact) -> Result<u64> {
    let bytes = bincode::serialize(artifact)?;
    write_atomic(path, &bytes)?;
    Ok(bytes.len() as u64)
}
