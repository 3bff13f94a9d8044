pub mod manager;
pub mod table;

pub use manager::MemTableManager;
pub use table::{BufferSnapshot, FlushBatch, MemTable, TableBuffers};
