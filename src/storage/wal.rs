use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::core::error::{Error, Result};
use crate::core::types::VectorId;
use crate::storage::layout::{remove_if_exists, StorageLayout};
use crate::storage::wal_manifest::WalManifest;

/// Frame header: payload length + payload crc32.
const FRAME_HEADER: usize = 8;
const BATCH_SYNC_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    Immediate,  // fsync after every write
    Batch,      // fsync every BATCH_SYNC_BYTES
    None,       // Let OS handle it
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    Insert {
        table: String,
        partition_tag: String,
        ids: Vec<VectorId>,
        vectors: Vec<f32>,
    },
    Delete {
        table: String,
        ids: Vec<VectorId>,
    },
    /// Explicit flush request; `None` means every table.
    Flush {
        table: Option<String>,
    },
}

impl WalOp {
    pub fn table(&self) -> Option<&str> {
        match self {
            WalOp::Insert { table, .. } | WalOp::Delete { table, .. } => Some(table),
            WalOp::Flush { table } => table.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: u64,
    pub op: WalOp,
}

/// Write-ahead log split over size-capped files.
pub struct Wal {
    storage: StorageLayout,
    manifest: WalManifest,
    file: File,
    file_start: u64,
    position: u64,
    next_lsn: u64,
    unsynced: u64,
    pub capacity: u64,
    pub sync_mode: SyncMode,
}

impl Wal {
    /// Open the log, validating the manifest and cutting a torn tail off the
    /// newest file. `fresh_start_lsn` is only used when no log exists yet.
    pub fn open(storage: &StorageLayout, capacity: u64, sync_mode: SyncMode, fresh_start_lsn: u64) -> Result<Self> {
        let manifest = match WalManifest::load(storage)? {
            Some(manifest) if !manifest.files.is_empty() => manifest,
            _ => return Self::create_fresh(storage, capacity, sync_mode, fresh_start_lsn.max(1)),
        };

        for &start in &manifest.files {
            let path = storage.wal_path(start);
            if !path.exists() {
                return Err(Error::recovery(format!("wal file {} listed in manifest is missing", path.display())));
            }
        }

        let file_start = manifest.newest().unwrap_or(1);
        let path = storage.wal_path(file_start);
        let bytes = fs::read(&path)?;
        let (valid_len, last_lsn) = scan_valid_prefix(&bytes, file_start)?;
        if valid_len < bytes.len() {
            warn!(file = %path.display(), dropped = bytes.len() - valid_len, "truncating torn wal tail");
        }

        if valid_len < bytes.len() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(&path)?;

        let next_lsn = last_lsn.map_or(file_start, |lsn| lsn + 1);
        if next_lsn <= manifest.last_lsn {
            return Err(Error::recovery(format!(
                "wal ends at lsn {} but manifest recorded lsn {}",
                next_lsn - 1,
                manifest.last_lsn
            )));
        }
        debug!(files = manifest.files.len(), next_lsn, "opened wal");

        Ok(Wal {
            storage: storage.clone(),
            manifest,
            file,
            file_start,
            position: valid_len as u64,
            next_lsn,
            unsynced: 0,
            capacity,
            sync_mode,
        })
    }

    fn create_fresh(storage: &StorageLayout, capacity: u64, sync_mode: SyncMode, start: u64) -> Result<Self> {
        let file = Self::create_file(storage, start)?;
        let manifest = WalManifest { files: vec![start], last_lsn: start - 1 };
        manifest.save(storage)?;
        info!(start_lsn = start, "created new wal");

        Ok(Wal {
            storage: storage.clone(),
            manifest,
            file,
            file_start: start,
            position: 0,
            next_lsn: start,
            unsynced: 0,
            capacity,
            sync_mode,
        })
    }

    fn create_file(storage: &StorageLayout, start: u64) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(storage.wal_path(start))?;
        file.sync_all()?;
        Ok(file)
    }

    /// Append one operation; durable on return under `SyncMode::Immediate`.
    pub fn append(&mut self, op: WalOp) -> Result<u64> {
        let lsn = self.next_lsn;
        let record = WalRecord { lsn, op };
        let payload = bincode::serialize(&record)?;
        let frame_len = (FRAME_HEADER + payload.len()) as u64;

        if self.position > 0 && self.position + frame_len > self.capacity {
            self.rotate()?;
        }

        let mut frame = Vec::with_capacity(frame_len as usize);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;

        self.next_lsn += 1;
        self.position += frame_len;
        self.unsynced += frame_len;

        match self.sync_mode {
            SyncMode::Immediate => self.sync()?,
            SyncMode::Batch if self.unsynced >= BATCH_SYNC_BYTES => self.sync()?,
            _ => {}
        }

        Ok(lsn)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.sync()?;

        let start = self.next_lsn;
        self.file = Self::create_file(&self.storage, start)?;
        self.file_start = start;
        self.position = 0;

        self.manifest.files.push(start);
        self.manifest.last_lsn = start - 1;
        self.manifest.save(&self.storage)?;
        debug!(start_lsn = start, "rotated wal file");
        Ok(())
    }

    /// Last lsn handed out (0 if none).
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    pub fn file_count(&self) -> usize {
        self.manifest.files.len()
    }

    /// Delete every non-active file whose records all have `lsn <= low_water_mark`.
    pub fn reclaim(&mut self, low_water_mark: u64) -> Result<usize> {
        let mut reclaimed = Vec::new();
        for &start in &self.manifest.files {
            if start == self.file_start {
                break;
            }
            match self.manifest.next_start(start) {
                Some(next) if next - 1 <= low_water_mark => reclaimed.push(start),
                _ => break,
            }
        }
        if reclaimed.is_empty() {
            return Ok(0);
        }

        self.manifest.files.retain(|s| !reclaimed.contains(s));
        self.manifest.save(&self.storage)?;
        for start in &reclaimed {
            remove_if_exists(&self.storage.wal_path(*start))?;
        }
        debug!(count = reclaimed.len(), low_water_mark, "reclaimed wal files");
        Ok(reclaimed.len())
    }

    /// Lazy reader over every retained record with `lsn >= from_lsn`.
    pub fn replay(&self, from_lsn: u64) -> WalReader {
        let files: VecDeque<(u64, PathBuf)> = self
            .manifest
            .files
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                // Skip files that end before from_lsn
                self.manifest.files.get(i + 1).is_none_or(|&next| next > from_lsn)
            })
            .map(|(_, &start)| (start, self.storage.wal_path(start)))
            .collect();

        WalReader {
            newest: self.manifest.newest().unwrap_or(0),
            files,
            buffer: Vec::new(),
            offset: 0,
            current: None,
            expected: None,
            from_lsn,
            done: false,
        }
    }
}

enum Frame {
    Record(WalRecord, usize),
    End,
    Torn,
}

/// Decode the frame at `offset`. A frame cut short, or whose checksum fails
/// while it is the very last bytes of the file, is a torn write.
///
/// A torn payload is a strict prefix of an encoded record and can never
/// decode. If the bytes after an overrunning header still hold a whole
/// record, the length field is damaged and later records would be lost.
fn decode_frame(buf: &[u8], offset: usize) -> Result<Frame> {
    let remaining = buf.len() - offset;
    if remaining == 0 {
        return Ok(Frame::End);
    }
    if remaining < FRAME_HEADER {
        return Ok(Frame::Torn);
    }

    let len = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]) as usize;
    let crc = u32::from_le_bytes([buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7]]);
    if remaining - FRAME_HEADER < len {
        if bincode::deserialize::<WalRecord>(&buf[offset + FRAME_HEADER..]).is_ok() {
            return Err(Error::recovery(format!(
                "wal frame at offset {} claims {} bytes but only {} remain",
                offset,
                len,
                remaining - FRAME_HEADER
            )));
        }
        return Ok(Frame::Torn);
    }

    let end = offset + FRAME_HEADER + len;
    let payload = &buf[offset + FRAME_HEADER..end];
    if crc32fast::hash(payload) != crc {
        if end == buf.len() {
            return Ok(Frame::Torn);
        }
        return Err(Error::recovery(format!("wal checksum mismatch at offset {}", offset)));
    }

    let record: WalRecord = bincode::deserialize(payload)
        .map_err(|e| Error::recovery(format!("undecodable wal record at offset {}: {}", offset, e)))?;
    Ok(Frame::Record(record, end))
}

/// Length of the valid prefix of a file and the last lsn in it.
fn scan_valid_prefix(buf: &[u8], start: u64) -> Result<(usize, Option<u64>)> {
    let mut offset = 0;
    let mut expected = start;
    loop {
        match decode_frame(buf, offset)? {
            Frame::Record(record, next) => {
                if record.lsn != expected {
                    return Err(Error::recovery(format!("wal lsn gap: expected {}, found {}", expected, record.lsn)));
                }
                expected += 1;
                offset = next;
            }
            Frame::End | Frame::Torn => break,
        }
    }
    Ok((offset, (expected > start).then(|| expected - 1)))
}

/// Yields records in lsn order, loading one file at a time.
pub struct WalReader {
    files: VecDeque<(u64, PathBuf)>,
    newest: u64,
    buffer: Vec<u8>,
    offset: usize,
    current: Option<u64>,
    expected: Option<u64>,
    from_lsn: u64,
    done: bool,
}

impl WalReader {
    fn open_next(&mut self) -> Result<bool> {
        let Some((start, path)) = self.files.pop_front() else {
            return Ok(false);
        };
        if let Some(expected) = self.expected {
            if start != expected {
                return Err(Error::recovery(format!("wal lsn gap between files: expected {}, file starts at {}", expected, start)));
            }
        }
        self.buffer = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::recovery(format!("wal file {} is missing", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        self.offset = 0;
        self.current = Some(start);
        self.expected = Some(start);
        Ok(true)
    }

    fn next_record(&mut self) -> Result<Option<WalRecord>> {
        loop {
            let Some(current) = self.current else {
                if !self.open_next()? {
                    return Ok(None);
                }
                continue;
            };

            match decode_frame(&self.buffer, self.offset)? {
                Frame::Record(record, next) => {
                    let expected = self.expected.unwrap_or(record.lsn);
                    if record.lsn != expected {
                        return Err(Error::recovery(format!("wal lsn gap: expected {}, found {}", expected, record.lsn)));
                    }
                    self.expected = Some(expected + 1);
                    self.offset = next;
                    if record.lsn >= self.from_lsn {
                        return Ok(Some(record));
                    }
                }
                Frame::End => {
                    self.current = None;
                }
                Frame::Torn if current == self.newest => return Ok(None),
                Frame::Torn => {
                    return Err(Error::recovery(format!("wal file starting at lsn {} ends in a partial record", current)));
                }
            }
        }
    }
}

impl Iterator for WalReader {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::error::ErrorKind;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> StorageLayout {
        StorageLayout::new(&Config::with_storage_path(dir.path())).unwrap()
    }

    fn insert(table: &str, id: u64) -> WalOp {
        WalOp::Insert {
            table: table.to_string(),
            partition_tag: String::new(),
            ids: vec![id],
            vectors: vec![id as f32; 4],
        }
    }

    #[test]
    fn lsns_are_sequential_across_reopen() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        {
            let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
            assert_eq!(wal.append(insert("t", 1)).unwrap(), 1);
            assert_eq!(wal.append(insert("t", 2)).unwrap(), 2);
        }
        let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
        assert_eq!(wal.current_lsn(), 2);
        assert_eq!(wal.append(WalOp::Flush { table: None }).unwrap(), 3);

        let lsns: Vec<u64> = wal.replay(2).map(|r| r.unwrap().lsn).collect();
        assert_eq!(lsns, vec![2, 3]);
    }

    #[test]
    fn rotation_and_reclaim() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        let mut wal = Wal::open(&storage, 256, SyncMode::None, 1).unwrap();
        for id in 0..20 {
            wal.append(insert("t", id)).unwrap();
        }
        assert!(wal.file_count() > 2);

        let all: Vec<u64> = wal.replay(0).map(|r| r.unwrap().lsn).collect();
        assert_eq!(all, (1..=20).collect::<Vec<_>>());

        let before = wal.file_count();
        assert!(wal.reclaim(10).unwrap() > 0);
        assert!(wal.file_count() < before);
        let rest: Vec<u64> = wal.replay(11).map(|r| r.unwrap().lsn).collect();
        assert_eq!(rest, (11..=20).collect::<Vec<_>>());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        {
            let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
            wal.append(insert("t", 1)).unwrap();
            wal.append(insert("t", 2)).unwrap();
        }
        let path = storage.wal_path(1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
        assert_eq!(wal.current_lsn(), 1);
        assert_eq!(wal.append(insert("t", 3)).unwrap(), 2);
        let ids: Vec<u64> = wal.replay(0).map(|r| r.unwrap().lsn).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn corrupt_middle_record_fails_recovery() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        {
            let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
            for id in 0..3 {
                wal.append(insert("t", id)).unwrap();
            }
        }
        let path = storage.wal_path(1);
        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER + 2] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).err().unwrap();
        assert!(err.is(ErrorKind::Recovery));
    }

    #[test]
    fn corrupt_length_of_first_record_fails_recovery() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        {
            let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
            for id in 0..3 {
                wal.append(insert("t", id)).unwrap();
            }
        }
        let path = storage.wal_path(1);
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[0] = 0xff;
        bytes[1] = 0xff;
        fs::write(&path, bytes).unwrap();

        let err = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).err().unwrap();
        assert!(err.is(ErrorKind::Recovery));
        // Nothing was cut off
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, len);
    }

    #[test]
    fn overlong_length_on_last_record_is_not_a_torn_write() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        {
            let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
            wal.append(insert("t", 1)).unwrap();
        }
        let path = storage.wal_path(1);
        let mut bytes = fs::read(&path).unwrap();
        let claimed = (bytes.len() - FRAME_HEADER + 100) as u32;
        bytes[0..4].copy_from_slice(&claimed.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let err = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).err().unwrap();
        assert!(err.is(ErrorKind::Recovery));
    }

    #[test]
    fn missing_file_fails_recovery() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        {
            let mut wal = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).unwrap();
            wal.append(insert("t", 1)).unwrap();
        }
        fs::remove_file(storage.wal_path(1)).unwrap();
        let err = Wal::open(&storage, 1 << 20, SyncMode::Immediate, 1).err().unwrap();
        assert!(err.is(ErrorKind::Recovery));
    }

    #[test]
    fn fresh_log_starts_after_given_lsn() {
        let dir = TempDir::new().unwrap();
        let storage = layout(&dir);
        let mut wal = Wal::open(&storage, 1 << 20, SyncMode::None, 42).unwrap();
        assert_eq!(wal.append(WalOp::Flush { table: Some("t".into()) }).unwrap(), 42);
    }
}
