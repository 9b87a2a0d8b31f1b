use std::time::Duration;

use crate::cell::{Cell, CellKey};
use crate::merge::{ColumnPolicies, MergeScanner};
use crate::schema::SchemaBuilder;

fn insert(row: &[u8], family: u8, ts: i64, revision: u64, value: &[u8]) -> Cell {
    Cell::new(
        CellKey::insert(row, family, b"".to_vec(), ts, revision),
        value.to_vec(),
    )
}

fn merge_with(
    policies: ColumnPolicies,
    now_micros: i64,
    mut cells: Vec<Cell>,
) -> Vec<Cell> {
    cells.sort_by(|a, b| a.key.cmp(&b.key));
    let children: Vec<Box<dyn Iterator<Item = Cell>>> = vec![Box::new(cells.into_iter())];
    MergeScanner::new(children, policies, false, now_micros).collect()
}

#[test]
fn max_versions_keeps_the_newest_n() {
    let schema = SchemaBuilder::new(1)
        .access_group("default")
        .column_family_with("cf", 1, "default", 2, None)
        .build()
        .unwrap();

    let out = merge_with(
        ColumnPolicies::from_schema(&schema),
        1_000_000,
        vec![
            insert(b"r", 1, 3, 3, b"v3"),
            insert(b"r", 1, 2, 2, b"v2"),
            insert(b"r", 1, 1, 1, b"v1"),
        ],
    );

    let values: Vec<&[u8]> = out.iter().map(|c| c.value.as_slice()).collect();
    assert_eq!(values, vec![b"v3" as &[u8], b"v2"]);
}

#[test]
fn version_caps_are_per_column() {
    let schema = SchemaBuilder::new(1)
        .access_group("default")
        .column_family_with("cf", 1, "default", 1, None)
        .build()
        .unwrap();

    let out = merge_with(
        ColumnPolicies::from_schema(&schema),
        1_000_000,
        vec![
            insert(b"a", 1, 2, 2, b"a-new"),
            insert(b"a", 1, 1, 1, b"a-old"),
            insert(b"b", 1, 2, 4, b"b-new"),
            insert(b"b", 1, 1, 3, b"b-old"),
        ],
    );

    let values: Vec<&[u8]> = out.iter().map(|c| c.value.as_slice()).collect();
    assert_eq!(values, vec![b"a-new" as &[u8], b"b-new"]);
}

#[test]
fn expired_cells_are_dropped() {
    let schema = SchemaBuilder::new(1)
        .access_group("default")
        .column_family_with("cf", 1, "default", 0, Some(Duration::from_secs(1)))
        .build()
        .unwrap();

    let now = 10_000_000i64; // 10 s
    let out = merge_with(
        ColumnPolicies::from_schema(&schema),
        now,
        vec![
            insert(b"r", 1, now - 500_000, 2, b"fresh"),
            insert(b"r", 1, now - 5_000_000, 1, b"stale"),
        ],
    );

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value, b"fresh");
}

#[test]
fn unknown_families_keep_everything() {
    let out = merge_with(
        ColumnPolicies::unlimited(),
        1_000_000,
        vec![
            insert(b"r", 9, 3, 3, b"v3"),
            insert(b"r", 9, 2, 2, b"v2"),
            insert(b"r", 9, 1, 1, b"v1"),
        ],
    );
    assert_eq!(out.len(), 3);
}
