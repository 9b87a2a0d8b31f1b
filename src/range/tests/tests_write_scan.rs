use std::sync::Arc;

use tempfile::TempDir;

use crate::cell::{Cell, CellKey, ScanSpec};
use crate::context::{NoopMaster, ServerContext};
use crate::error::ErrorCode;
use crate::range::RangeError;
use crate::schema::SchemaBuilder;

use super::helpers::{
    delete_row, insert, load_range, scan_cells, scan_rows, test_config, two_group_schema,
};

fn open_ctx(tmp: &TempDir) -> Arc<ServerContext> {
    ServerContext::open(tmp.path(), "rs-test", test_config(), Arc::new(NoopMaster)).unwrap()
}

#[test]
fn two_rows_scan_back_in_row_order() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"m");

    range
        .add_cells(&[
            insert(b"a", 1, 1000, 1, b"x"),
            insert(b"b", 1, 1000, 2, b"y"),
        ])
        .unwrap();

    let cells = scan_cells(&range);
    assert_eq!(cells.len(), 2);
    assert_eq!(cells[0].key.row, b"a");
    assert_eq!(cells[0].value, b"x");
    assert_eq!(cells[1].key.row, b"b");
    assert_eq!(cells[1].value, b"y");
}

#[test]
fn row_delete_masks_cells_across_access_groups() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range
        .add_cells(&[
            insert(b"r", 1, 1000, 1, b"v1"),
            insert(b"r", 2, 1000, 1, b"v2"),
            delete_row(b"r", 1001, 2),
        ])
        .unwrap();

    assert!(scan_cells(&range).is_empty());

    // Compaction-style scans surface the tombstone itself, once.
    let with_deletes: Vec<Cell> = range
        .create_scanner(&ScanSpec::full().with_deletes())
        .unwrap()
        .collect();
    assert_eq!(with_deletes.len(), 1);
    assert_eq!(with_deletes[0].key.column_family, 0);
}

#[test]
fn unknown_column_family_is_rejected_without_side_effects() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    let err = range
        .add_cells(&[insert(b"r", 9, 1000, 1, b"v")])
        .unwrap_err();
    assert!(matches!(err, RangeError::InvalidArgument(_)));
    assert_eq!(crate::error::Error::from(err).code(), ErrorCode::InvalidArgument);
    assert!(scan_cells(&range).is_empty());
}

#[test]
fn rows_outside_the_interval_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"f", b"m");

    // start_row itself is exclusive.
    assert!(range.add_cells(&[insert(b"f", 1, 1000, 1, b"v")]).is_err());
    // past end_row.
    assert!(range.add_cells(&[insert(b"n", 1, 1000, 2, b"v")]).is_err());
    // end_row itself is inclusive.
    assert!(range.add_cells(&[insert(b"m", 1, 1000, 3, b"v")]).is_ok());
}

#[test]
fn version_cap_keeps_the_newest_two() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let schema = SchemaBuilder::new(1)
        .access_group("default")
        .column_family_with("cf", 1, "default", 2, None)
        .build()
        .unwrap();
    let range = load_range(&ctx, schema, b"", b"z");

    range
        .add_cells(&[
            insert(b"r", 1, 3, 1, b"v3"),
            insert(b"r", 1, 2, 2, b"v2"),
            insert(b"r", 1, 1, 3, b"v1"),
        ])
        .unwrap();

    let values: Vec<Vec<u8>> = scan_cells(&range).into_iter().map(|c| c.value).collect();
    assert_eq!(values, vec![b"v3".to_vec(), b"v2".to_vec()]);
}

#[test]
fn writes_are_visible_immediately_and_survive_a_flush() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    let cells: Vec<Cell> = (0..50u32)
        .map(|i| {
            insert(
                format!("row-{i:02}").as_bytes(),
                1,
                1000,
                u64::from(i) + 1,
                b"payload",
            )
        })
        .collect();
    range.add_cells(&cells).unwrap();
    assert_eq!(scan_rows(&range).len(), 50);
    assert_eq!(range.latest_revision(), 50);

    range.compact(false).unwrap();
    assert!(range.disk_usage() > 0);
    assert_eq!(range.memory_usage(), 0);
    assert_eq!(scan_rows(&range).len(), 50);
}

#[test]
fn column_restriction_scans_only_matching_groups() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range
        .add_cells(&[
            insert(b"r", 1, 1000, 1, b"one"),
            insert(b"r", 2, 1000, 2, b"two"),
        ])
        .unwrap();

    let cells: Vec<Cell> = range
        .create_scanner(&ScanSpec::full().with_columns(vec![2]))
        .unwrap()
        .collect();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].value, b"two");
}

#[test]
fn statistics_track_inserts_and_deletes_by_kind() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range
        .add_cells(&[
            insert(b"a", 1, 1000, 1, b"v"),
            insert(b"b", 2, 1000, 2, b"v"),
            delete_row(b"c", 1000, 3),
            Cell::new(CellKey::delete_column_family(b"d", 1, 1000, 4), Vec::new()),
            Cell::new(
                CellKey::delete_cell(b"e", 1, b"q".to_vec(), 1000, 5),
                Vec::new(),
            ),
        ])
        .unwrap();

    let stats = range.statistics();
    assert_eq!(stats.added_inserts, 2);
    assert_eq!(stats.added_deletes, [1, 1, 1]);
    assert!(stats.cached_cells >= 5);
}

#[test]
fn point_scans_return_one_row() {
    let tmp = TempDir::new().unwrap();
    let ctx = open_ctx(&tmp);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range
        .add_cells(&[
            insert(b"a", 1, 1000, 1, b"va"),
            insert(b"b", 1, 1000, 2, b"vb"),
        ])
        .unwrap();
    range.compact(false).unwrap();

    let cells: Vec<Cell> = range
        .create_scanner(&ScanSpec::point(b"b".to_vec()))
        .unwrap()
        .collect();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].value, b"vb");
}
