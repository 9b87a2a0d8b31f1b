use std::sync::Arc;

use tempfile::TempDir;

use crate::accessgroup::AccessGroup;
use crate::cell::{Cell, CellKey, END_ROW, ScanSpec, TableIdentifier};
use crate::context::{NoopMaster, ServerConfig, ServerContext};
use crate::merge::{ColumnPolicies, MergeScanner};
use crate::metadata::metadata_row_key;
use crate::schema::{Schema, SchemaBuilder};

fn test_schema() -> Arc<Schema> {
    SchemaBuilder::new(1)
        .access_group("default")
        .column_family("cf1", 1, "default")
        .build()
        .unwrap()
}

fn test_group(tmp: &TempDir) -> (Arc<ServerContext>, AccessGroup, Arc<Schema>) {
    let config = ServerConfig {
        access_group_max_mem: 1024,
        block_size: 512,
        ..ServerConfig::default()
    };
    let ctx = ServerContext::open(tmp.path(), "rs-test", config, Arc::new(NoopMaster)).unwrap();
    let schema = test_schema();
    let ag = AccessGroup::new(
        Arc::clone(&ctx),
        TableIdentifier::new(1, 1, "t"),
        Arc::clone(&schema),
        &schema.access_groups[0],
        b"",
        END_ROW,
        false,
    );
    (ctx, ag, schema)
}

fn insert(row: &[u8], ts: i64, revision: u64) -> CellKey {
    CellKey::insert(row, 1, b"".to_vec(), ts, revision)
}

fn scan_all(ag: &AccessGroup, schema: &Schema) -> Vec<Cell> {
    let mut children = Vec::new();
    ag.create_scanners(&ScanSpec::full(), &mut children).unwrap();
    MergeScanner::new(
        children,
        ColumnPolicies::from_schema(schema),
        false,
        i64::MAX / 2,
    )
    .collect()
}

#[test]
fn flush_moves_the_cache_to_disk() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    for i in 0..100u32 {
        let row = format!("row-{i:03}").into_bytes();
        ag.add(insert(&row, 100, u64::from(i) + 1), b"value".to_vec())
            .unwrap();
    }
    assert!(ag.needs_compaction());

    ag.initiate_compaction().unwrap();
    assert!(ag.compaction_initiated());
    assert!(ag.run_compaction(false).unwrap());

    let (mem, disk) = ag.space_usage();
    assert_eq!(mem, 0, "cache should be empty after a flush");
    assert!(disk > 0);
    assert!(!ag.compaction_initiated());

    let cells = scan_all(&ag, &schema);
    assert_eq!(cells.len(), 100);
}

#[test]
fn flush_publishes_the_files_column() {
    let tmp = TempDir::new().unwrap();
    let (ctx, ag, _schema) = test_group(&tmp);

    ag.add(insert(b"a", 100, 1), b"v".to_vec()).unwrap();
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    let row = metadata_row_key(1, END_ROW);
    let descriptor = ctx.metadata.get(&row).unwrap().unwrap();
    let files = descriptor.files.get("default").unwrap();
    assert!(files.contains("cs1"), "files column was {files:?}");
    assert_eq!(files, &ag.get_file_list().unwrap());
}

#[test]
fn minor_compactions_accumulate_stores() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    for round in 0..3u32 {
        for i in 0..10u32 {
            let row = format!("round-{round}-row-{i}").into_bytes();
            ag.add(
                insert(&row, 100, u64::from(round * 10 + i) + 1),
                b"v".to_vec(),
            )
            .unwrap();
        }
        ag.initiate_compaction().unwrap();
        ag.run_compaction(false).unwrap();
    }

    assert_eq!(ag.get_file_list().unwrap().matches(';').count(), 3);
    assert_eq!(scan_all(&ag, &schema).len(), 30);
}

#[test]
fn major_compaction_merges_everything_into_one_store() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    // Two flushes, then a row tombstone in the cache.
    for i in 0..10u32 {
        ag.add(
            insert(format!("row-{i}").as_bytes(), 100, u64::from(i) + 1),
            b"v".to_vec(),
        )
        .unwrap();
    }
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    for i in 10..20u32 {
        ag.add(
            insert(format!("row-{i}").as_bytes(), 100, u64::from(i) + 1),
            b"v".to_vec(),
        )
        .unwrap();
    }
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    ag.add(CellKey::delete_row(b"row-0", 200, 100), Vec::new())
        .unwrap();
    ag.initiate_compaction().unwrap();
    assert!(ag.run_compaction(true).unwrap());

    // One store; the masked row and its spent tombstone are gone.
    assert_eq!(ag.get_file_list().unwrap().matches(';').count(), 1);
    let cells = scan_all(&ag, &schema);
    assert_eq!(cells.len(), 19);
    assert!(cells.iter().all(|c| c.key.row != b"row-0"));
}

#[test]
fn minor_compaction_carries_tombstones_forward() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    // A value lands in an older store.
    ag.add(insert(b"victim", 100, 1), b"v".to_vec()).unwrap();
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    // The tombstone alone is flushed in a second, newer store; it must
    // survive the minor compaction to keep masking the old store.
    ag.add(CellKey::delete_row(b"victim", 200, 2), Vec::new())
        .unwrap();
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    assert!(scan_all(&ag, &schema).is_empty());
}

#[test]
fn run_without_initiate_is_a_noop() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, _schema) = test_group(&tmp);

    ag.add(insert(b"a", 100, 1), b"v".to_vec()).unwrap();
    assert!(!ag.run_compaction(false).unwrap());
    assert_eq!(ag.cached_count(), 1);
}

#[test]
fn empty_frozen_cache_produces_no_store() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, _schema) = test_group(&tmp);

    ag.initiate_compaction().unwrap();
    assert!(!ag.run_compaction(false).unwrap());
    assert_eq!(ag.disk_usage(), 0);
}

#[test]
fn scanners_survive_a_concurrent_flush() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    for i in 0..10u32 {
        ag.add(
            insert(format!("row-{i}").as_bytes(), 100, u64::from(i) + 1),
            b"v".to_vec(),
        )
        .unwrap();
    }

    // Build the scanner, then flush underneath it.
    let mut children = Vec::new();
    ag.create_scanners(&ScanSpec::full(), &mut children).unwrap();
    let scanner = MergeScanner::new(
        children,
        ColumnPolicies::from_schema(&schema),
        false,
        i64::MAX / 2,
    );

    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    assert_eq!(scanner.count(), 10);
}
