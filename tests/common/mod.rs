#![allow(dead_code)]

use rand::Rng;
use tempfile::TempDir;
use vexis::core::config::Config;
use vexis::core::database::Database;
use vexis::engine::TableIndex;

pub const TABLE: &str = "test_group";
pub const DIM: usize = 16;

/// Config with every periodic pass disabled so tests control timing.
pub fn test_config(dir: &TempDir) -> Config {
    Config {
        auto_flush_interval_ms: 0,
        merge_interval_ms: 0,
        archive_interval_secs: 0,
        worker_threads: 2,
        flush_retries: 1,
        ..Config::with_storage_path(dir.path())
    }
}

pub fn open(dir: &TempDir) -> Database {
    Database::open(test_config(dir)).unwrap()
}

pub fn open_with_table(dir: &TempDir) -> Database {
    let db = open(dir);
    db.create_table(TABLE, DIM, TableIndex::default()).unwrap();
    db
}

pub fn random_vectors(count: usize, dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..count * dim).map(|_| rng.gen_range(0.0..1.0)).collect()
}

pub fn row(vectors: &[f32], dim: usize, index: usize) -> &[f32] {
    &vectors[index * dim..(index + 1) * dim]
}
