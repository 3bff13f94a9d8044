use std::collections::{BTreeMap, BTreeSet};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::core::date::DateBucket;
use crate::core::error::{Error, Result};
use crate::core::types::SegmentId;
use crate::engine::{EngineType, TableIndex};
use crate::storage::layout::Medium;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Normal,
    ToDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub dimension: usize,
    pub index: TableIndex,
    pub created_at: DateTime<Utc>,
    pub state: RecordState,
    /// Highest WAL lsn whose effects on this table live in segments.
    pub flush_lsn: u64,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        TableSchema {
            name: name.into(),
            dimension,
            index: TableIndex::default(),
            created_at: Utc::now(),
            state: RecordState::Normal,
            flush_lsn: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == RecordState::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSchema {
    pub table: String,
    pub name: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
    /// WAL position at creation; inserts logged at or before it belong to
    /// an earlier partition with the same tag.
    pub created_lsn: u64,
    pub state: RecordState,
}

impl PartitionSchema {
    pub fn is_live(&self) -> bool {
        self.state == RecordState::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Absent,
    Building,
    Ready,
    /// Built for an index descriptor that has since changed.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    ToDelete { retired_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSchema {
    pub id: SegmentId,
    pub table: String,
    /// Partition name, `None` for the table's root partition.
    pub partition: Option<String>,
    pub date: DateBucket,
    pub row_count: u64,
    pub deleted_count: u64,
    pub byte_size: u64,
    pub medium: Medium,
    /// Set when the segment moved to the secondary medium; the primary
    /// copies stay readable for older snapshots until cleanup removes them.
    pub primary_left_at: Option<DateTime<Utc>>,
    pub index_state: IndexState,
    pub index_engine: Option<EngineType>,
    pub index_byte_size: u64,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SegmentSchema {
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn live_rows(&self) -> u64 {
        self.row_count.saturating_sub(self.deleted_count)
    }

    pub fn has_ready_index(&self) -> bool {
        self.index_state == IndexState::Ready
    }

    pub fn retire(&mut self, now: DateTime<Utc>) {
        if self.is_active() {
            self.lifecycle = Lifecycle::ToDelete { retired_at: now };
            self.updated_at = now;
        }
    }
}

/// A new segment produced by flush or merge, before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub id: SegmentId,
    pub partition: Option<String>,
    pub date: DateBucket,
    pub row_count: u64,
    pub byte_size: u64,
}

/// Full record set. Cloned, mutated and committed as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaState {
    pub tables: BTreeMap<String, TableSchema>,
    /// Keyed by partition name.
    pub partitions: BTreeMap<String, PartitionSchema>,
    pub segments: BTreeMap<SegmentId, SegmentSchema>,
    pub next_segment_id: u64,
}

impl MetaState {
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .filter(|t| t.is_live())
            .ok_or_else(|| Error::not_found("table", name))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema> {
        self.tables
            .get_mut(name)
            .filter(|t| t.is_live())
            .ok_or_else(|| Error::not_found("table", name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_ok()
    }

    pub fn allocate_segment_id(&mut self) -> SegmentId {
        self.next_segment_id += 1;
        SegmentId(self.next_segment_id)
    }

    /// Tables and partitions share one namespace; dropped records free their name.
    fn name_taken(&self, name: &str) -> bool {
        self.tables.get(name).is_some_and(|t| t.is_live())
            || self.partitions.get(name).is_some_and(|p| p.is_live())
    }

    pub fn create_table(&mut self, schema: TableSchema) -> Result<()> {
        if schema.name.is_empty() {
            return Err(Error::invalid_argument("table name must not be empty"));
        }
        if schema.dimension == 0 {
            return Err(Error::invalid_argument("table dimension must be positive"));
        }
        if self.name_taken(&schema.name) {
            return Err(Error::already_exists("table", &schema.name));
        }
        self.tables.insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Live partitions of a table, in creation order.
    pub fn partitions_of(&self, table: &str) -> Vec<&PartitionSchema> {
        let mut partitions: Vec<&PartitionSchema> = self
            .partitions
            .values()
            .filter(|p| p.table == table && p.is_live())
            .collect();
        partitions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        partitions
    }

    pub fn partition_by_tag(&self, table: &str, tag: &str) -> Option<&PartitionSchema> {
        self.partitions_of(table).into_iter().find(|p| p.tag == tag)
    }

    pub fn create_partition(&mut self, table: &str, name: Option<&str>, tag: &str) -> Result<String> {
        if self.partitions.get(table).is_some_and(|p| p.is_live()) {
            return Err(Error::invalid_argument(format!(
                "'{}' is a partition and cannot own partitions",
                table
            )));
        }
        self.table(table)?;

        let tag = tag.trim();
        if tag.is_empty() {
            return Err(Error::invalid_argument("partition tag must not be empty"));
        }
        if self.partition_by_tag(table, tag).is_some() {
            return Err(Error::already_exists("partition tag", tag));
        }

        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}_{}", table, tag),
        };
        if self.name_taken(&name) {
            return Err(Error::already_exists("partition", &name));
        }

        self.partitions.insert(
            name.clone(),
            PartitionSchema {
                table: table.to_string(),
                name: name.clone(),
                tag: tag.to_string(),
                created_at: Utc::now(),
                created_lsn: 0,
                state: RecordState::Normal,
            },
        );
        Ok(name)
    }

    /// Mark a partition and its segments for deletion.
    pub fn drop_partition(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let partition = self
            .partitions
            .get_mut(name)
            .filter(|p| p.is_live())
            .ok_or_else(|| Error::not_found("partition", name))?;
        partition.state = RecordState::ToDelete;

        for segment in self.segments.values_mut() {
            if segment.partition.as_deref() == Some(name) {
                segment.retire(now);
            }
        }
        Ok(())
    }

    /// Mark a table, its partitions and every segment for deletion.
    pub fn drop_table(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.table_mut(name)?.state = RecordState::ToDelete;
        for partition in self.partitions.values_mut() {
            if partition.table == name {
                partition.state = RecordState::ToDelete;
            }
        }
        for segment in self.segments.values_mut() {
            if segment.table == name {
                segment.retire(now);
            }
        }
        Ok(())
    }

    /// Retire the table's active segments whose date is in `dates`.
    pub fn drop_segments_by_date(&mut self, table: &str, dates: &BTreeSet<DateBucket>, now: DateTime<Utc>) -> Result<Vec<SegmentId>> {
        self.table(table)?;
        let mut dropped = Vec::new();
        for segment in self.segments.values_mut() {
            if segment.table == table && segment.is_active() && dates.contains(&segment.date) {
                segment.retire(now);
                dropped.push(segment.id);
            }
        }
        Ok(dropped)
    }

    /// Set the index descriptor; segments built for another engine or metric go stale.
    pub fn set_index(&mut self, table: &str, index: TableIndex) -> Result<bool> {
        let schema = self.table_mut(table)?;
        let previous = schema.index;
        schema.index = index;
        let changed = previous != index;

        if previous.engine_type != index.engine_type || previous.metric_type != index.metric_type {
            for segment in self.segments.values_mut() {
                if segment.table == table && segment.index_state == IndexState::Ready {
                    segment.index_state = IndexState::Stale;
                }
            }
        }
        Ok(changed)
    }

    /// Reset to the flat engine, keeping the metric; every segment loses its index.
    pub fn drop_index(&mut self, table: &str) -> Result<Vec<SegmentId>> {
        let schema = self.table_mut(table)?;
        schema.index = TableIndex {
            metric_type: schema.index.metric_type,
            ..TableIndex::default()
        };

        let mut cleared = Vec::new();
        for segment in self.segments.values_mut() {
            if segment.table == table && segment.index_state != IndexState::Absent {
                segment.index_state = IndexState::Absent;
                segment.index_engine = None;
                segment.index_byte_size = 0;
                cleared.push(segment.id);
            }
        }
        Ok(cleared)
    }

    pub fn active_segments(&self, table: &str) -> impl Iterator<Item = &SegmentSchema> {
        self.segments
            .values()
            .filter(move |s| s.table == table && s.is_active())
    }

    /// Partitions selected by `tags`; `None` stands for the root partition.
    ///
    /// An empty list selects everything. Each tag is first looked up
    /// literally; a tag with no literal match is used as a fully-anchored
    /// regex over all partition tags. Results are unioned.
    pub fn resolve_tags(&self, table: &str, tags: &[String]) -> Result<BTreeSet<Option<String>>> {
        self.table(table)?;
        let partitions = self.partitions_of(table);

        let mut selected = BTreeSet::new();
        if tags.is_empty() {
            selected.insert(None);
            selected.extend(partitions.iter().map(|p| Some(p.name.clone())));
            return Ok(selected);
        }

        for tag in tags {
            let tag = tag.trim();
            if let Some(p) = partitions.iter().find(|p| p.tag == tag) {
                selected.insert(Some(p.name.clone()));
                continue;
            }
            let pattern = Regex::new(&format!("^(?:{})$", tag))?;
            selected.extend(
                partitions
                    .iter()
                    .filter(|p| pattern.is_match(&p.tag))
                    .map(|p| Some(p.name.clone())),
            );
        }
        Ok(selected)
    }

    /// Active segments of the table in the given partitions, optionally
    /// restricted to a set of dates.
    pub fn segments_matching(
        &self,
        table: &str,
        partitions: &BTreeSet<Option<String>>,
        dates: Option<&BTreeSet<DateBucket>>,
    ) -> Vec<SegmentSchema> {
        self.active_segments(table)
            .filter(|s| partitions.contains(&s.partition))
            .filter(|s| dates.is_none_or(|d| d.contains(&s.date)))
            .cloned()
            .collect()
    }

    /// Active segments of the table among `ids`.
    pub fn segments_by_ids(&self, table: &str, ids: &[SegmentId]) -> Vec<SegmentSchema> {
        ids.iter()
            .filter_map(|id| self.segments.get(id))
            .filter(|s| s.table == table && s.is_active())
            .cloned()
            .collect()
    }

    /// Register flushed segments and advance the table's flush lsn.
    pub fn register_flush(&mut self, table: &str, segments: Vec<NewSegment>, flush_lsn: u64, now: DateTime<Utc>) -> Result<()> {
        let schema = self.table_mut(table)?;
        schema.flush_lsn = schema.flush_lsn.max(flush_lsn);

        for segment in segments {
            self.insert_segment(table, segment, now);
        }
        Ok(())
    }

    fn insert_segment(&mut self, table: &str, segment: NewSegment, now: DateTime<Utc>) {
        self.segments.insert(
            segment.id,
            SegmentSchema {
                id: segment.id,
                table: table.to_string(),
                partition: segment.partition,
                date: segment.date,
                row_count: segment.row_count,
                deleted_count: 0,
                byte_size: segment.byte_size,
                medium: Medium::Primary,
                primary_left_at: None,
                index_state: IndexState::Absent,
                index_engine: None,
                index_byte_size: 0,
                lifecycle: Lifecycle::Active,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Swap a merged group for its replacement. Every source must still be active.
    pub fn replace_segments(&mut self, table: &str, sources: &[SegmentId], merged: Option<NewSegment>, now: DateTime<Utc>) -> Result<()> {
        for id in sources {
            let active = self.segments.get(id).is_some_and(|s| s.is_active());
            if !active {
                return Err(Error::not_found("segment", &id.to_string()));
            }
        }
        for id in sources {
            if let Some(segment) = self.segments.get_mut(id) {
                segment.retire(now);
            }
        }
        if let Some(merged) = merged {
            self.insert_segment(table, merged, now);
        }
        Ok(())
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Result<&mut SegmentSchema> {
        self.segments
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("segment", &id.to_string()))
    }

    /// Remove segment records and tables / partitions that are marked for
    /// deletion and own no remaining segment.
    pub fn purge(&mut self, segments: &[SegmentId]) {
        for id in segments {
            self.segments.remove(id);
        }

        let owners: BTreeSet<(String, Option<String>)> = self
            .segments
            .values()
            .map(|s| (s.table.clone(), s.partition.clone()))
            .collect();
        self.partitions.retain(|name, p| {
            p.is_live() || owners.contains(&(p.table.clone(), Some(name.clone())))
        });
        let tables_with_segments: BTreeSet<&String> = owners.iter().map(|(t, _)| t).collect();
        let partition_owners: BTreeSet<String> = self.partitions.values().map(|p| p.table.clone()).collect();
        self.tables.retain(|name, t| {
            t.is_live() || tables_with_segments.contains(name) || partition_owners.contains(name)
        });
    }

    /// Segments left mid-build by a crash go back to needing a build.
    pub fn repair_after_crash(&mut self) -> usize {
        let mut repaired = 0;
        for segment in self.segments.values_mut() {
            if segment.index_state == IndexState::Building {
                segment.index_state = IndexState::Absent;
                segment.index_engine = None;
                repaired += 1;
            }
        }
        repaired
    }

    /// Bytes of every active segment, data plus index.
    pub fn size(&self) -> u64 {
        self.segments
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.byte_size + s.index_byte_size)
            .sum()
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        self.table(table)?;
        Ok(self.active_segments(table).map(|s| s.live_rows()).sum())
    }
}
