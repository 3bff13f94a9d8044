use std::collections::BTreeMap;
use crate::core::date::DateBucket;
use crate::meta::state::SegmentSchema;

/// Policy for deciding when and how to merge segments of one
/// (table, partition, date) group.
pub trait MergePolicy: Send + Sync {
    /// Check if segments should be merged
    fn should_merge(&self, segments: &[SegmentSchema]) -> bool;

    /// Select segments to merge
    fn select_segments_to_merge(&self, segments: &[SegmentSchema]) -> Vec<SegmentSchema>;
}

/// Merge the smallest small segments until the result would reach the target.
pub struct TieredMergePolicy {
    pub target_rows: u64,
    pub min_segments_to_merge: usize,
    pub max_segments_to_merge: usize,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            target_rows: 262_144,
            min_segments_to_merge: 2,
            max_segments_to_merge: 16,
        }
    }
}

impl TieredMergePolicy {
    /// Segments with an index already built are left alone; so are full ones.
    fn is_candidate(&self, segment: &SegmentSchema) -> bool {
        segment.is_active() && !segment.has_ready_index() && segment.row_count < self.target_rows
    }
}

impl MergePolicy for TieredMergePolicy {
    fn should_merge(&self, segments: &[SegmentSchema]) -> bool {
        segments.iter().filter(|s| self.is_candidate(s)).count() >= self.min_segments_to_merge
    }

    fn select_segments_to_merge(&self, segments: &[SegmentSchema]) -> Vec<SegmentSchema> {
        let mut sorted: Vec<&SegmentSchema> = segments.iter().filter(|s| self.is_candidate(s)).collect();
        sorted.sort_by_key(|s| (s.live_rows(), s.id));

        let mut selected = Vec::new();
        let mut rows = 0;
        for segment in sorted {
            if !selected.is_empty() && rows + segment.live_rows() > self.target_rows {
                break;
            }
            rows += segment.live_rows();
            selected.push(segment.clone());

            // Don't merge too many segments at once
            if selected.len() >= self.max_segments_to_merge {
                break;
            }
        }

        if selected.len() < self.min_segments_to_merge {
            Vec::new()
        } else {
            selected
        }
    }
}

/// Group active segments by (partition, date); merges never cross groups.
pub fn group_segments<'a>(
    segments: impl IntoIterator<Item = &'a SegmentSchema>,
) -> BTreeMap<(Option<String>, DateBucket), Vec<SegmentSchema>> {
    let mut groups: BTreeMap<(Option<String>, DateBucket), Vec<SegmentSchema>> = BTreeMap::new();
    for segment in segments.into_iter().filter(|s| s.is_active()) {
        groups
            .entry((segment.partition.clone(), segment.date))
            .or_default()
            .push(segment.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::core::types::SegmentId;
    use crate::meta::state::{IndexState, Lifecycle};
    use crate::storage::layout::Medium;

    fn seg(id: u64, date: i32, rows: u64) -> SegmentSchema {
        SegmentSchema {
            id: SegmentId(id),
            table: "t".into(),
            partition: None,
            date: DateBucket(date),
            row_count: rows,
            deleted_count: 0,
            byte_size: rows * 10,
            medium: Medium::Primary,
            primary_left_at: None,
            index_state: IndexState::Absent,
            index_engine: None,
            index_byte_size: 0,
            lifecycle: Lifecycle::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn policy() -> TieredMergePolicy {
        TieredMergePolicy { target_rows: 100, min_segments_to_merge: 2, max_segments_to_merge: 3 }
    }

    #[test]
    fn selects_smallest_under_target() {
        let segments = vec![seg(1, 1, 60), seg(2, 1, 10), seg(3, 1, 20), seg(4, 1, 500)];
        assert!(policy().should_merge(&segments));
        let ids: Vec<u64> = policy().select_segments_to_merge(&segments).iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn indexed_segments_are_skipped() {
        let mut indexed = seg(2, 1, 10);
        indexed.index_state = IndexState::Ready;
        let segments = vec![seg(1, 1, 10), indexed];
        assert!(!policy().should_merge(&segments));
        assert!(policy().select_segments_to_merge(&segments).is_empty());
    }

    #[test]
    fn groups_split_by_date() {
        let segments = vec![seg(1, 20240101, 10), seg(2, 20240102, 10), seg(3, 20240101, 10)];
        let groups = group_segments(&segments);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&(None, DateBucket(20240101))].len(), 2);
    }
}
