mod common;

use tempfile::TempDir;
use vexis::core::error::ErrorKind;
use vexis::core::types::VectorBatch;
use vexis::engine::{EngineType, IndexParams, SearchParams, TableIndex};
use common::*;

const PARTITIONS: u64 = 5;
const ROWS: u64 = 50;

/// Five partitions tagged "0".."4", each with ids `p * 1000 + i`.
fn five_partitions(dir: &TempDir) -> (vexis::Database, Vec<Vec<f32>>) {
    let db = open_with_table(dir);
    let data = fill_partitions(&db);
    (db, data)
}

fn fill_partitions(db: &vexis::Database) -> Vec<Vec<f32>> {
    let mut data = Vec::new();
    for p in 0..PARTITIONS {
        let tag = p.to_string();
        let name = db.create_partition(TABLE, None, &tag).unwrap();
        assert_eq!(name, format!("{}_{}", TABLE, tag));

        let vectors = random_vectors(ROWS as usize, DIM);
        let ids: Vec<u64> = (0..ROWS).map(|i| p * 1000 + i).collect();
        let mut batch = VectorBatch::new(vectors.clone(), ids);
        db.insert_vectors(TABLE, &tag, &mut batch).unwrap();
        data.push(vectors);
    }
    db.flush(Some(TABLE)).unwrap();
    data
}

#[test]
fn five_partition_scenario() {
    let dir = TempDir::new().unwrap();
    let (db, data) = five_partitions(&dir);

    assert_eq!(db.show_partitions(TABLE).unwrap().len(), PARTITIONS as usize);
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), PARTITIONS * ROWS);

    let params = SearchParams::default();
    let query = row(&data[3], DIM, 7);

    // Literal tag
    let result = db.query(TABLE, &["3".to_string()], 5, &params, query, None).unwrap();
    assert_eq!(result.ids[0][0], 3007);
    assert!(result.ids[0].iter().all(|id| (3000..3000 + ROWS).contains(id)));

    // Another partition never sees it
    let result = db.query(TABLE, &["1".to_string()], 5, &params, query, None).unwrap();
    assert!(result.ids[0].iter().all(|id| (1000..1000 + ROWS).contains(id)));

    // Regex over every tag
    let result = db.query(TABLE, &["\\d".to_string()], 5, &params, query, None).unwrap();
    assert_eq!(result.ids[0][0], 3007);

    // Union of a literal and a regex
    let tags = vec!["0".to_string(), "[34]".to_string()];
    let result = db.query(TABLE, &tags, 200, &params, query, None).unwrap();
    assert_eq!(result.ids[0].len(), 3 * ROWS as usize);
    assert!(result.ids[0].iter().all(|id| *id < 1000 || *id >= 3000));

    // No tags: every partition plus the root
    let result = db.query(TABLE, &[], 1000, &params, query, None).unwrap();
    assert_eq!(result.ids[0].len(), (PARTITIONS * ROWS) as usize);

    // A tag matching nothing yields nothing
    let result = db.query(TABLE, &["x\\d".to_string()], 5, &params, query, None).unwrap();
    assert!(result.ids[0].is_empty());
}

#[test]
fn duplicate_and_nested_partitions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let name = db.create_partition(TABLE, Some("p_one"), " one ").unwrap();
    assert_eq!(name, "p_one");
    assert!(db.create_partition(TABLE, None, "one").unwrap_err().is(ErrorKind::AlreadyExists));
    assert!(db.create_partition(TABLE, Some("p_one"), "two").unwrap_err().is(ErrorKind::AlreadyExists));
    assert!(db.create_partition(&name, None, "inner").unwrap_err().is(ErrorKind::InvalidArgument));
    assert!(db.create_partition(TABLE, None, "  ").unwrap_err().is(ErrorKind::InvalidArgument));
    assert!(db.create_partition("missing", None, "a").unwrap_err().is(ErrorKind::NotFound));
}

#[test]
fn dropping_partitions_removes_their_rows() {
    let dir = TempDir::new().unwrap();
    let (db, data) = five_partitions(&dir);

    db.drop_partition_by_tag(TABLE, "4").unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), (PARTITIONS - 1) * ROWS);
    assert!(db.drop_partition_by_tag(TABLE, "4").unwrap_err().is(ErrorKind::NotFound));

    db.drop_partition(&format!("{}_0", TABLE)).unwrap();
    assert_eq!(db.show_partitions(TABLE).unwrap().len(), 3);

    let result = db
        .query(TABLE, &[], 1000, &SearchParams::default(), row(&data[4], DIM, 0), None)
        .unwrap();
    assert_eq!(result.ids[0].len(), (3 * ROWS) as usize);
    assert!(result.ids[0].iter().all(|id| (1000..4000).contains(id)));

    // The tag is free again
    db.create_partition(TABLE, None, "4").unwrap();
}

#[test]
fn indexed_query_over_two_tags_fills_every_slot() {
    let dir = TempDir::new().unwrap();
    let config = vexis::Config { index_build_min_rows: 10, ..test_config(&dir) };
    let db = vexis::Database::open(config).unwrap();
    db.create_table(TABLE, DIM, TableIndex::default()).unwrap();
    let data = fill_partitions(&db);

    let ivf = TableIndex {
        engine_type: EngineType::IvfFlat,
        params: IndexParams { nlist: 4 },
        ..TableIndex::default()
    };
    db.create_index(TABLE, ivf).unwrap();

    const NQ: usize = 10;
    const K: usize = 10;
    let queries: Vec<f32> = (0..NQ)
        .flat_map(|i| {
            let partition = if i % 2 == 0 { 0 } else { 4 };
            row(&data[partition], DIM, i).to_vec()
        })
        .collect();
    let tags = vec!["0".to_string(), "4".to_string()];
    let result = db.query(TABLE, &tags, K, &SearchParams { nprobe: 4 }, &queries, None).unwrap();

    assert_eq!(result.nq(), NQ);
    assert_eq!(result.ids.iter().map(|ids| ids.len()).sum::<usize>(), NQ * K);
    for ids in &result.ids {
        assert!(ids.iter().all(|id| (0..ROWS).contains(id) || (4000..4000 + ROWS).contains(id)));
    }
    assert_eq!(result.ids[0][0], 0);
    assert_eq!(result.ids[1][0], 4001);
}

#[test]
fn recreated_partition_does_not_inherit_buffered_rows() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    db.create_partition(TABLE, None, "a").unwrap();

    let vectors = random_vectors(3, DIM);
    let mut batch = VectorBatch::new(vectors.clone(), vec![1, 2, 3]);
    db.insert_vectors(TABLE, "a", &mut batch).unwrap();
    db.drop_partition_by_tag(TABLE, "a").unwrap();
    db.create_partition(TABLE, None, "a").unwrap();

    let tags = vec!["a".to_string()];
    let result = db.query(TABLE, &tags, 10, &SearchParams::default(), row(&vectors, DIM, 0), None).unwrap();
    assert!(result.ids[0].is_empty());
    assert!(db.get_vector_by_id(TABLE, 2).unwrap_err().is(ErrorKind::NotFound));

    db.flush(Some(TABLE)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 0);

    // The new partition takes inserts of its own
    let mut batch = VectorBatch::new(random_vectors(2, DIM), vec![7, 8]);
    db.insert_vectors(TABLE, "a", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 2);
}
