//! Byte-bounded LRU over loaded segment data, deleted sets and index
//! artifacts, shared by queries, preload and background workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use lru::LruCache;
use parking_lot::Mutex;
use roaring::RoaringTreemap;
use serde::Serialize;
use tracing::trace;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::SegmentId;
use crate::engine::IndexArtifact;
use crate::meta::state::SegmentSchema;
use crate::storage::layout::StorageLayout;
use crate::storage::segment::SegmentData;
use crate::storage::segment_reader::{read_deleted, read_index, SegmentReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Raw,
    Deleted,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub segment: SegmentId,
    pub kind: CacheKind,
}

#[derive(Debug, Clone)]
pub enum CachedItem {
    Raw(Arc<SegmentData>),
    Deleted(Arc<RoaringTreemap>),
    Index(Arc<IndexArtifact>),
}

impl CachedItem {
    pub fn byte_size(&self) -> usize {
        match self {
            CachedItem::Raw(data) => data.byte_size(),
            CachedItem::Deleted(set) => set.serialized_size(),
            CachedItem::Index(artifact) => artifact.byte_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub entries: usize,
    pub usage_bytes: usize,
    pub capacity_bytes: usize,
}

struct Inner {
    entries: LruCache<CacheKey, CachedItem>,
    usage: usize,
}

pub struct CacheManager {
    storage: StorageLayout,
    inner: Mutex<Inner>,
    capacity: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl CacheManager {
    pub fn new(storage: StorageLayout, capacity: usize) -> Self {
        CacheManager {
            storage,
            inner: Mutex::new(Inner { entries: LruCache::unbounded(), usage: 0 }),
            capacity,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedItem> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(item) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(item.clone())
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, item: CachedItem) {
        let size = item.byte_size();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.put(key, item) {
            inner.usage -= old.byte_size();
        }
        inner.usage += size;

        while inner.usage > self.capacity {
            let Some((evicted, item)) = inner.entries.pop_lru() else {
                break;
            };
            inner.usage -= item.byte_size();
            trace!(segment = evicted.segment.value(), kind = ?evicted.kind, "evicted cache entry");
        }
    }

    /// Cached item, or `load` it (outside the lock) and cache the result.
    pub fn get_or_load(&self, key: CacheKey, load: impl FnOnce() -> Result<CachedItem>) -> Result<CachedItem> {
        if let Some(item) = self.get(&key) {
            return Ok(item);
        }
        let item = load()?;
        self.insert(key, item.clone());
        Ok(item)
    }

    pub fn invalidate(&self, segment: SegmentId) {
        for kind in [CacheKind::Raw, CacheKind::Deleted, CacheKind::Index] {
            self.invalidate_kind(segment, kind);
        }
    }

    pub fn invalidate_kind(&self, segment: SegmentId, kind: CacheKind) {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.entries.pop(&CacheKey { segment, kind }) {
            inner.usage -= item.byte_size();
        }
    }

    /// Bytes currently held.
    pub fn usage(&self) -> usize {
        self.inner.lock().usage
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            usage_bytes: inner.usage,
            capacity_bytes: self.capacity,
        }
    }

    // Typed loaders

    pub fn segment_data(&self, segment: &SegmentSchema) -> Result<Arc<SegmentData>> {
        let key = CacheKey { segment: segment.id, kind: CacheKind::Raw };
        let path = self.storage.segment_path(segment.medium, segment.id);
        match self.get_or_load(key, || Ok(CachedItem::Raw(Arc::new(SegmentReader::open(&path)?.read_data()?))))? {
            CachedItem::Raw(data) => Ok(data),
            _ => Err(mismatched(key)),
        }
    }

    pub fn deleted_set(&self, segment: &SegmentSchema) -> Result<Arc<RoaringTreemap>> {
        let key = CacheKey { segment: segment.id, kind: CacheKind::Deleted };
        let path = self.storage.deleted_path(segment.medium, segment.id);
        match self.get_or_load(key, || Ok(CachedItem::Deleted(Arc::new(read_deleted(&path)?))))? {
            CachedItem::Deleted(set) => Ok(set),
            _ => Err(mismatched(key)),
        }
    }

    pub fn index(&self, segment: &SegmentSchema) -> Result<Arc<IndexArtifact>> {
        let key = CacheKey { segment: segment.id, kind: CacheKind::Index };
        let path = self.storage.index_path(segment.medium, segment.id);
        match self.get_or_load(key, || Ok(CachedItem::Index(Arc::new(read_index(&path)?))))? {
            CachedItem::Index(artifact) => Ok(artifact),
            _ => Err(mismatched(key)),
        }
    }
}

fn mismatched(key: CacheKey) -> Error {
    Error::new(ErrorKind::Internal, format!("cache entry {:?} holds the wrong kind", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use tempfile::TempDir;

    fn raw(rows: usize) -> CachedItem {
        let mut data = SegmentData::new(4);
        for i in 0..rows {
            data.push(i as u64, &[0.0; 4]);
        }
        CachedItem::Raw(Arc::new(data))
    }

    fn key(id: u64) -> CacheKey {
        CacheKey { segment: SegmentId(id), kind: CacheKind::Raw }
    }

    fn manager(dir: &TempDir, capacity: usize) -> CacheManager {
        let storage = StorageLayout::new(&Config::with_storage_path(dir.path())).unwrap();
        CacheManager::new(storage, capacity)
    }

    #[test]
    fn evicts_least_recently_used_by_bytes() {
        let dir = TempDir::new().unwrap();
        // Each entry: 10 rows * (8 + 16) bytes = 240
        let cache = manager(&dir, 500);
        cache.insert(key(1), raw(10));
        cache.insert(key(2), raw(10));
        assert_eq!(cache.usage(), 480);

        assert!(cache.get(&key(1)).is_some());
        cache.insert(key(3), raw(10));
        assert_eq!(cache.usage(), 480);
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn invalidate_releases_usage() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 10_000);
        cache.insert(key(1), raw(10));
        cache.invalidate(SegmentId(1));
        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.stats().entries, 0);
    }
}
