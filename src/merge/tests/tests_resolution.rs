use crate::cell::{Cell, CellKey, KeyFlag};
use crate::merge::{ColumnPolicies, MergeScanner};

fn insert(row: &[u8], family: u8, ts: i64, revision: u64, value: &[u8]) -> Cell {
    Cell::new(
        CellKey::insert(row, family, b"".to_vec(), ts, revision),
        value.to_vec(),
    )
}

fn sorted(mut cells: Vec<Cell>) -> Vec<Cell> {
    cells.sort_by(|a, b| a.key.cmp(&b.key));
    cells
}

fn merge(children: Vec<Vec<Cell>>, return_deletes: bool) -> Vec<Cell> {
    let boxed: Vec<Box<dyn Iterator<Item = Cell>>> = children
        .into_iter()
        .map(|cells| Box::new(sorted(cells).into_iter()) as Box<dyn Iterator<Item = Cell>>)
        .collect();
    MergeScanner::new(boxed, ColumnPolicies::unlimited(), return_deletes, i64::MAX / 2).collect()
}

#[test]
fn children_merge_into_global_key_order() {
    let out = merge(
        vec![
            vec![insert(b"a", 1, 100, 1, b"1"), insert(b"c", 1, 100, 3, b"3")],
            vec![insert(b"b", 1, 100, 2, b"2"), insert(b"d", 1, 100, 4, b"4")],
        ],
        false,
    );
    let rows: Vec<&[u8]> = out.iter().map(|c| c.key.row.as_slice()).collect();
    assert_eq!(rows, vec![b"a" as &[u8], b"b", b"c", b"d"]);
}

#[test]
fn row_tombstone_masks_older_cells_across_families() {
    let out = merge(
        vec![vec![
            insert(b"r", 1, 1000, 1, b"v1"),
            insert(b"r", 2, 1000, 1, b"v2"),
            Cell::new(CellKey::delete_row(b"r", 1001, 2), Vec::new()),
        ]],
        false,
    );
    assert!(out.is_empty());
}

#[test]
fn row_tombstone_spares_newer_cells() {
    let out = merge(
        vec![vec![
            insert(b"r", 1, 1000, 1, b"old"),
            insert(b"r", 1, 2000, 3, b"new"),
            Cell::new(CellKey::delete_row(b"r", 1500, 2), Vec::new()),
        ]],
        false,
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value, b"new");
}

#[test]
fn family_tombstone_masks_only_its_family() {
    let out = merge(
        vec![vec![
            insert(b"r", 1, 1000, 1, b"gone"),
            insert(b"r", 2, 1000, 1, b"kept"),
            Cell::new(CellKey::delete_column_family(b"r", 1, 1500, 2), Vec::new()),
        ]],
        false,
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key.column_family, 2);
}

#[test]
fn cell_tombstone_masks_only_its_column() {
    let out = merge(
        vec![vec![
            Cell::new(
                CellKey::insert(b"r", 1, b"q1".to_vec(), 1000, 1),
                b"gone".to_vec(),
            ),
            Cell::new(
                CellKey::insert(b"r", 1, b"q2".to_vec(), 1000, 1),
                b"kept".to_vec(),
            ),
            Cell::new(
                CellKey::delete_cell(b"r", 1, b"q1".to_vec(), 1500, 2),
                Vec::new(),
            ),
        ]],
        false,
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key.qualifier, b"q2");
}

#[test]
fn return_deletes_emits_tombstones_once() {
    // The same row tombstone present in two children (fanned out to two
    // access groups) must surface exactly once.
    let tombstone = Cell::new(CellKey::delete_row(b"r", 1001, 2), Vec::new());
    let out = merge(
        vec![
            vec![insert(b"r", 1, 1000, 1, b"v1"), tombstone.clone()],
            vec![insert(b"r", 2, 1000, 1, b"v2"), tombstone.clone()],
        ],
        true,
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key.flag, KeyFlag::DeleteRow);
}

#[test]
fn masking_respects_the_timestamp_boundary() {
    // A cell at exactly the tombstone timestamp is masked.
    let out = merge(
        vec![vec![
            insert(b"r", 1, 1000, 1, b"at-boundary"),
            Cell::new(CellKey::delete_row(b"r", 1000, 2), Vec::new()),
        ]],
        false,
    );
    assert!(out.is_empty());
}

#[test]
fn identical_replayed_cells_collapse() {
    // Transfer-log replay re-writes cells with identical revisions.
    let cell = insert(b"r", 1, 1000, 7, b"v");
    let out = merge(vec![vec![cell.clone()], vec![cell.clone()]], false);
    assert_eq!(out.len(), 1);
}
