use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use crate::memtable::table::TableBuffers;

/// Insert buffers of every table.
#[derive(Default)]
pub struct MemTableManager {
    tables: RwLock<HashMap<String, Arc<TableBuffers>>>,
}

impl MemTableManager {
    pub fn new() -> Self {
        MemTableManager::default()
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableBuffers>> {
        self.tables.read().get(table).cloned()
    }

    pub fn get_or_create(&self, table: &str, dimension: usize) -> Arc<TableBuffers> {
        if let Some(buffers) = self.get(table) {
            return buffers;
        }
        let mut tables = self.tables.write();
        Arc::clone(
            tables
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(TableBuffers::new(dimension))),
        )
    }

    pub fn remove(&self, table: &str) -> Option<Arc<TableBuffers>> {
        self.tables.write().remove(table)
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Tables with anything not yet persisted in segments.
    pub fn pending_tables(&self) -> Vec<String> {
        self.tables
            .read()
            .iter()
            .filter(|(_, b)| b.has_pending())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every lsn at or below this is persisted in segments (or belongs to no
    /// live buffer), so WAL files ending there can be reclaimed.
    pub fn low_water_mark(&self, current_lsn: u64) -> u64 {
        self.tables
            .read()
            .values()
            .filter_map(|b| b.min_lsn())
            .min()
            .map_or(current_lsn, |lsn| lsn.saturating_sub(1))
    }
}
