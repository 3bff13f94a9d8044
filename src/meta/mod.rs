pub mod backend;
pub mod manager;
pub mod state;

pub use backend::{FileMetaBackend, MemoryMetaBackend, MetaBackend};
pub use manager::MetaManager;
pub use state::{
    IndexState, Lifecycle, MetaState, NewSegment, PartitionSchema, RecordState, SegmentSchema, TableSchema,
};
