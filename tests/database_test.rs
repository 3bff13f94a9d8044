mod common;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use vexis::core::date::DateRange;
use vexis::core::error::ErrorKind;
use vexis::core::types::VectorBatch;
use vexis::engine::{EngineType, IndexParams, MetricType, SearchParams, TableIndex};
use common::*;

#[test]
fn insert_flush_query_returns_exact_ids() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let vectors = random_vectors(100, DIM);
    let mut batch = VectorBatch::from_vectors(vectors.clone());
    let ids = db.insert_vectors(TABLE, "", &mut batch).unwrap();
    assert_eq!(ids.len(), 100);
    assert_eq!(batch.ids, ids);
    db.flush(Some(TABLE)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 100);

    let queries: Vec<f32> = (0..5).flat_map(|i| row(&vectors, DIM, i).to_vec()).collect();
    let result = db.query(TABLE, &[], 3, &SearchParams::default(), &queries, None).unwrap();
    assert_eq!(result.nq(), 5);
    for q in 0..5 {
        assert_eq!(result.ids[q].len(), 3);
        assert_eq!(result.ids[q][0], ids[q]);
        assert!(result.distances[q][0].abs() < 1e-5);
        assert!(result.distances[q].windows(2).all(|w| w[0] <= w[1]));
    }

    // Row count only grows
    let mut more = VectorBatch::from_vectors(random_vectors(50, DIM));
    db.insert_vectors(TABLE, "", &mut more).unwrap();
    db.flush(Some(TABLE)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 150);
}

#[test]
fn unflushed_rows_are_searchable() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let vectors = random_vectors(20, DIM);
    let mut batch = VectorBatch::new(vectors.clone(), (1..=20).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();

    let result = db.query(TABLE, &[], 1, &SearchParams::default(), row(&vectors, DIM, 7), None).unwrap();
    assert_eq!(result.ids[0], vec![8]);
    assert_eq!(db.get_vector_by_id(TABLE, 8).unwrap(), row(&vectors, DIM, 7));
}

#[test]
fn k_larger_than_rows_returns_every_row_once() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let mut batch = VectorBatch::new(random_vectors(10, DIM), (100..110).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();
    let mut batch = VectorBatch::new(random_vectors(5, DIM), (200..205).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();

    let result = db.query(TABLE, &[], 100, &SearchParams::default(), &random_vectors(1, DIM), None).unwrap();
    let mut ids = result.ids[0].clone();
    assert_eq!(ids.len(), 15);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 15);

    let empty = db.query(TABLE, &[], 0, &SearchParams::default(), &random_vectors(2, DIM), None).unwrap();
    assert_eq!(empty.ids, vec![Vec::<u64>::new(), Vec::new()]);
}

#[test]
fn deleted_vectors_disappear_before_and_after_flush() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let vectors = random_vectors(100, DIM);
    let mut batch = VectorBatch::new(vectors.clone(), (0..100).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();

    db.delete_vector(TABLE, 42).unwrap();
    let query = row(&vectors, DIM, 42);
    let result = db.query(TABLE, &[], 10, &SearchParams::default(), query, None).unwrap();
    assert!(!result.ids[0].contains(&42));
    assert!(db.get_vector_by_id(TABLE, 42).unwrap_err().is(ErrorKind::NotFound));

    db.flush(Some(TABLE)).unwrap();
    let result = db.query(TABLE, &[], 10, &SearchParams::default(), query, None).unwrap();
    assert!(!result.ids[0].contains(&42));
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 99);
}

#[test]
fn compaction_drops_deleted_rows_and_keeps_row_count() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let mut batch = VectorBatch::new(random_vectors(100, DIM), (0..100).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();
    let size_before = db.size().unwrap();

    let doomed: Vec<u64> = (0..10).collect();
    db.delete_vectors(TABLE, &doomed).unwrap();
    db.compact(TABLE).unwrap();

    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 90);
    let stats = db.stats().unwrap();
    assert_eq!(stats.deleted_rows, 0);
    assert_eq!(stats.total_rows, 90);
    assert!(db.size().unwrap() < size_before);

    let result = db.query(TABLE, &[], 100, &SearchParams::default(), &random_vectors(1, DIM), None).unwrap();
    assert_eq!(result.ids[0].len(), 90);
    assert!(result.ids[0].iter().all(|id| *id >= 10));
}

#[test]
fn table_info_reports_idmap_for_raw_segments() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    db.create_partition(TABLE, None, "tag0").unwrap();

    let mut root = VectorBatch::from_vectors(random_vectors(30, DIM));
    db.insert_vectors(TABLE, "", &mut root).unwrap();
    let mut tagged = VectorBatch::from_vectors(random_vectors(20, DIM));
    db.insert_vectors(TABLE, "tag0", &mut tagged).unwrap();
    db.flush(Some(TABLE)).unwrap();

    let info = db.get_table_info(TABLE).unwrap();
    assert_eq!(info.row_count, 50);
    assert_eq!(info.partitions.len(), 2);
    assert_eq!(info.partitions[0].tag, "");
    assert_eq!(info.partitions[0].row_count, 30);
    assert_eq!(info.partitions[1].tag, "tag0");
    assert_eq!(info.partitions[1].row_count, 20);
    assert_eq!(info.partitions[0].segments[0].index_name, "IDMAP");
}

#[test]
fn drop_by_date_range_around_today_empties_table() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let mut batch = VectorBatch::from_vectors(random_vectors(40, DIM));
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();

    // Zero-length range drops nothing
    let today = Utc::now().date_naive();
    db.drop_table(TABLE, Some(&DateRange::new(today, today))).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 40);

    let range = DateRange::new(today - Duration::days(5), today + Duration::days(5));
    db.drop_table(TABLE, Some(&range)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 0);
    assert!(db.has_table(TABLE).unwrap());
}

#[test]
fn dropped_table_name_can_be_reused() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let mut batch = VectorBatch::from_vectors(random_vectors(10, DIM));
    db.insert_vectors(TABLE, "", &mut batch).unwrap();

    assert!(db.create_table(TABLE, DIM, TableIndex::default()).unwrap_err().is(ErrorKind::AlreadyExists));
    db.drop_table(TABLE, None).unwrap();
    assert!(!db.has_table(TABLE).unwrap());
    assert!(db.describe_table(TABLE).unwrap_err().is(ErrorKind::NotFound));

    db.create_table(TABLE, 8, TableIndex::default()).unwrap();
    assert_eq!(db.describe_table(TABLE).unwrap().dimension, 8);
    db.flush(Some(TABLE)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 0);
}

#[test]
fn invalid_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    assert!(db.create_table("", DIM, TableIndex::default()).unwrap_err().is(ErrorKind::InvalidArgument));
    assert!(db.create_table("zero", 0, TableIndex::default()).unwrap_err().is(ErrorKind::InvalidArgument));

    let mut ragged = VectorBatch::from_vectors(vec![0.5; DIM + 1]);
    assert!(db.insert_vectors(TABLE, "", &mut ragged).unwrap_err().is(ErrorKind::InvalidArgument));

    let mut batch = VectorBatch::from_vectors(random_vectors(2, DIM));
    assert!(db.insert_vectors(TABLE, "nope", &mut batch).unwrap_err().is(ErrorKind::NotFound));
    assert!(db.insert_vectors("missing", "", &mut batch).unwrap_err().is(ErrorKind::NotFound));

    let bad_query = vec![0.0; DIM - 1];
    assert!(
        db.query(TABLE, &[], 1, &SearchParams::default(), &bad_query, None)
            .unwrap_err()
            .is(ErrorKind::InvalidArgument)
    );
}

#[test]
fn flush_of_unknown_table_is_not_found() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    assert!(db.flush(Some("no_such_table")).unwrap_err().is(ErrorKind::NotFound));
    db.flush(None).unwrap();
}

#[test]
fn index_descriptor_lifecycle() {
    let dir = TempDir::new().unwrap();
    let config = vexis::Config { index_build_min_rows: 100, ..test_config(&dir) };
    let db = vexis::Database::open(config).unwrap();
    db.create_table(TABLE, DIM, TableIndex::default()).unwrap();

    let vectors = random_vectors(500, DIM);
    let mut batch = VectorBatch::new(vectors.clone(), (0..500).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();

    let ivf = TableIndex {
        engine_type: EngineType::IvfFlat,
        metric_type: MetricType::L2,
        params: IndexParams { nlist: 8 },
    };
    db.create_index(TABLE, ivf).unwrap();
    db.create_index(TABLE, ivf).unwrap();
    assert_eq!(db.describe_index(TABLE).unwrap(), ivf);

    let info = db.get_table_info(TABLE).unwrap();
    assert_eq!(info.partitions[0].segments[0].index_name, "IVFFLAT");

    let params = SearchParams { nprobe: 8 };
    let result = db.query(TABLE, &[], 1, &params, row(&vectors, DIM, 123), None).unwrap();
    assert_eq!(result.ids[0], vec![123]);

    db.drop_index(TABLE).unwrap();
    let dropped = db.describe_index(TABLE).unwrap();
    assert_eq!(dropped.engine_type, EngineType::Flat);
    assert_eq!(dropped.metric_type, MetricType::L2);

    let result = db.query(TABLE, &[], 1, &params, row(&vectors, DIM, 321), None).unwrap();
    assert_eq!(result.ids[0], vec![321]);
    assert_eq!(db.get_table_info(TABLE).unwrap().partitions[0].segments[0].index_name, "IDMAP");
}

#[test]
fn inner_product_ranks_by_descending_similarity() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let index = TableIndex { metric_type: MetricType::InnerProduct, ..TableIndex::default() };
    db.create_table("ip", 2, index).unwrap();

    let mut batch = VectorBatch::new(vec![1.0, 0.0, 0.5, 0.0, 2.0, 0.0], vec![1, 2, 3]);
    db.insert_vectors("ip", "", &mut batch).unwrap();
    db.flush(None).unwrap();

    let result = db.query("ip", &[], 3, &SearchParams::default(), &[1.0, 0.0], None).unwrap();
    assert_eq!(result.ids[0], vec![3, 1, 2]);
}

#[test]
fn preload_raises_cache_usage() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let mut batch = VectorBatch::from_vectors(random_vectors(200, DIM));
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();

    // Reopen so nothing is cached from the flush
    drop(db);
    let db = open(&dir);
    let before = db.cache_usage().unwrap();
    db.preload_table(TABLE).unwrap();
    assert!(db.cache_usage().unwrap() > before);
    assert!(db.preload_table("missing").unwrap_err().is(ErrorKind::NotFound));
}

#[test]
fn query_by_file_id_restricts_to_segments() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let first = random_vectors(10, DIM);
    let mut batch = VectorBatch::new(first.clone(), (0..10).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();
    let segment = db.get_table_info(TABLE).unwrap().partitions[0].segments[0].id;

    let mut batch = VectorBatch::new(random_vectors(10, DIM), (10..20).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();

    let result = db
        .query_by_file_id(TABLE, &[segment], 20, &SearchParams::default(), row(&first, DIM, 0))
        .unwrap();
    assert_eq!(result.ids[0].len(), 10);
    assert!(result.ids[0].iter().all(|id| *id < 10));

    let missing = vexis::core::types::SegmentId(9_999);
    assert!(
        db.query_by_file_id(TABLE, &[missing], 1, &SearchParams::default(), row(&first, DIM, 0))
            .unwrap_err()
            .is(ErrorKind::NotFound)
    );
}

#[test]
fn stopped_database_is_not_ready_until_started() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    db.create_partition(TABLE, None, "p").unwrap();

    let mut batch = VectorBatch::new(random_vectors(25, DIM), (0..25).collect());
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();
    let segment = db.get_table_info(TABLE).unwrap().partitions[0].segments[0].id;
    db.stop().unwrap();
    assert!(!db.is_running());

    let not_ready = |result: vexis::core::error::Result<()>| assert!(result.unwrap_err().is(ErrorKind::NotReady));
    let query = random_vectors(1, DIM);
    let params = SearchParams::default();

    not_ready(db.create_table("other", DIM, TableIndex::default()));
    not_ready(db.describe_table(TABLE).map(|_| ()));
    not_ready(db.has_table(TABLE).map(|_| ()));
    not_ready(db.all_tables().map(|_| ()));
    not_ready(db.drop_table(TABLE, None));
    not_ready(db.create_partition(TABLE, None, "q").map(|_| ()));
    not_ready(db.show_partitions(TABLE).map(|_| ()));
    not_ready(db.drop_partition_by_tag(TABLE, "p"));
    not_ready(db.drop_partition(&format!("{}_p", TABLE)));
    let mut more = VectorBatch::from_vectors(random_vectors(1, DIM));
    not_ready(db.insert_vectors(TABLE, "", &mut more).map(|_| ()));
    not_ready(db.delete_vector(TABLE, 3));
    not_ready(db.delete_vectors(TABLE, &[4, 5]));
    not_ready(db.flush(None));
    not_ready(db.flush(Some(TABLE)));
    not_ready(db.compact(TABLE));
    not_ready(db.create_index(TABLE, TableIndex::default()));
    not_ready(db.describe_index(TABLE).map(|_| ()));
    not_ready(db.drop_index(TABLE));
    not_ready(db.preload_table(TABLE));
    not_ready(db.query(TABLE, &[], 1, &params, &query, None).map(|_| ()));
    not_ready(db.query_by_file_id(TABLE, &[segment], 1, &params, &query).map(|_| ()));
    not_ready(db.get_vector_by_id(TABLE, 1).map(|_| ()));
    not_ready(db.get_table_row_count(TABLE).map(|_| ()));
    not_ready(db.get_table_info(TABLE).map(|_| ()));
    not_ready(db.size().map(|_| ()));
    not_ready(db.cache_usage().map(|_| ()));
    not_ready(db.stats().map(|_| ()));

    // Nothing above took effect
    db.start().unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 25);
    assert_eq!(db.show_partitions(TABLE).unwrap().len(), 1);
    assert!(!db.has_table("other").unwrap());
}

#[test]
fn id_reinserted_after_delete_is_kept() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let old = random_vectors(1, DIM);
    let new = random_vectors(1, DIM);
    let mut batch = VectorBatch::new(old.clone(), vec![5]);
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.delete_vector(TABLE, 5).unwrap();
    let mut batch = VectorBatch::new(new.clone(), vec![5]);
    db.insert_vectors(TABLE, "", &mut batch).unwrap();

    let result = db.query(TABLE, &[], 10, &SearchParams::default(), &new, None).unwrap();
    assert_eq!(result.ids[0], vec![5]);
    assert_eq!(db.get_vector_by_id(TABLE, 5).unwrap(), new);

    db.flush(Some(TABLE)).unwrap();
    assert_eq!(db.get_table_row_count(TABLE).unwrap(), 1);
    let result = db.query(TABLE, &[], 10, &SearchParams::default(), &new, None).unwrap();
    assert_eq!(result.ids[0], vec![5]);
    assert!(result.distances[0][0].abs() < 1e-5);
}

#[test]
fn id_reinserted_after_deleting_its_flushed_copy_is_kept() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);

    let old = random_vectors(1, DIM);
    let new = random_vectors(1, DIM);
    let mut batch = VectorBatch::new(old, vec![5]);
    db.insert_vectors(TABLE, "", &mut batch).unwrap();
    db.flush(Some(TABLE)).unwrap();

    db.delete_vector(TABLE, 5).unwrap();
    let mut batch = VectorBatch::new(new.clone(), vec![5]);
    db.insert_vectors(TABLE, "", &mut batch).unwrap();

    // Only the new copy is visible, before and after the flush
    for flushed in [false, true] {
        if flushed {
            db.flush(Some(TABLE)).unwrap();
            assert_eq!(db.get_table_row_count(TABLE).unwrap(), 1);
        }
        let result = db.query(TABLE, &[], 10, &SearchParams::default(), &new, None).unwrap();
        assert_eq!(result.ids[0], vec![5]);
        assert!(result.distances[0][0].abs() < 1e-5);
        assert_eq!(db.get_vector_by_id(TABLE, 5).unwrap(), new);
    }
}
