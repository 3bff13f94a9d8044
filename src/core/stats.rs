use serde::{Deserialize, Serialize};
use crate::cache::CacheStats;
use crate::core::date::DateBucket;
use crate::core::types::SegmentId;
use crate::storage::layout::Medium;

/// Per-segment figures reported by `get_table_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStat {
    pub id: SegmentId,
    pub date: DateBucket,
    /// Live rows (deleted rows excluded).
    pub row_count: u64,
    pub byte_size: u64,
    /// Engine name of the index serving the segment; raw files report "IDMAP".
    pub index_name: String,
    pub medium: Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStat {
    /// Empty for the root partition.
    pub tag: String,
    pub row_count: u64,
    pub segments: Vec<SegmentStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table: String,
    pub row_count: u64,
    /// Root partition first, then named partitions in creation order.
    pub partitions: Vec<PartitionStat>,
}

/// Database statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    // Storage metrics
    pub table_count: usize,
    pub segment_count: usize,
    pub total_rows: u64,
    pub deleted_rows: u64,
    pub data_size_bytes: u64,
    pub index_size_bytes: u64,
    pub wal_file_count: usize,

    // Write metrics
    pub buffered_rows: usize,
    pub buffered_bytes: usize,

    // Query metrics
    pub cache_stats: CacheStats,
}
