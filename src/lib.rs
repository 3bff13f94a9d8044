pub mod core;
pub mod storage;
pub mod meta;
pub mod memtable;
pub mod engine;
pub mod query;
pub mod cache;
pub mod archive;
pub mod scheduler;

pub use crate::core::config::Config;
pub use crate::core::database::Database;
pub use crate::core::error::{Error, ErrorKind, Result};

/*
┌──────────────────────────────────────────────────────────────────────────────┐
│                          VEXIS STRUCT ARCHITECTURE                           │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── CORE LAYER ──────────────────────────────────┐
│  struct Database                                                             │
│  │ ctx: Arc<EngineContext>          // shared with background workers        │
│  │ scheduler: Option<Arc<Scheduler>>// worker pool + ticker                  │
│  │ running: AtomicBool              // false after stop(): NotReady          │
│  │ _lock: FileLock                  // one Database per directory            │
│                                                                              │
│  struct EngineContext                                                        │
│  │ meta: MetaManager      wal: Mutex<Wal>      memtables: MemTableManager    │
│  │ cache: CacheManager    ids: IdGenerator     archive: ArchiveConf          │
│  │ merge_policy: Box<dyn MergePolicy>          faults: Arc<dyn FaultInjector>│
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── WRITE PATH ──────────────────────────────────┐
│  insert_vectors ─► Wal::append (lsn) ─► TableBuffers::apply_insert           │
│                         (both under the WAL lock)                            │
│  threshold / tick / flush() ─► scheduler::flush                              │
│     swap_for_flush ─► write .seg per partition ─► union deletes into .del    │
│     ─► finish_flush { MetaManager::mutate(register_flush + flush_lsn) }      │
│     ─► Wal::reclaim(low water mark)                                          │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── READ PATH ───────────────────────────────────┐
│  query ─► snapshot_with(meta snapshot) ─► resolver::resolve (tags, dates)    │
│        ─► QueryExecutor: rayon over candidates                               │
│              Segment + ready index ─► IndexBackend::search, filter deleted   │
│              Segment / Buffer      ─► flat::search_segment                   │
│        ─► merge_sorted per query vector (ties: smaller id)                   │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── BACKGROUND ──────────────────────────────────┐
│  Task::{Flush, FlushAll, Merge, BuildIndex, Archive, Cleanup}                │
│  per-table gate serializes flush / merge / compact / archive / drop-by-date  │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── ON DISK ─────────────────────────────────────┐
│  <root>/segments/<id>.seg  <id>.del     <root>/idx/<id>.idx                  │
│  <root>/wal/wal_<start>.log  MANIFEST   <root>/meta/meta.bin   <root>/.lock  │
│  <secondary>/segments, <secondary>/idx  (swap archive target)                │
└──────────────────────────────────────────────────────────────────────────────┘
*/
