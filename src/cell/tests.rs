use crate::cell::{Cell, CellKey, END_ROOT_ROW, KeyFlag, RangeSpec, ScanSpec};
use crate::encoding::{Decode, encode_to_vec};

fn insert(row: &[u8], family: u8, ts: i64, revision: u64) -> CellKey {
    CellKey::insert(row, family, b"".to_vec(), ts, revision)
}

#[test]
fn keys_sort_rows_then_families_then_qualifiers() {
    let a = insert(b"a", 1, 100, 1);
    let b = insert(b"b", 1, 100, 1);
    assert!(a < b);

    let cf1 = insert(b"a", 1, 100, 1);
    let cf2 = insert(b"a", 2, 100, 1);
    assert!(cf1 < cf2);

    let q_empty = CellKey::insert(b"a", 1, b"".to_vec(), 100, 1);
    let q_x = CellKey::insert(b"a", 1, b"x".to_vec(), 100, 1);
    assert!(q_empty < q_x);
}

#[test]
fn newer_versions_sort_first() {
    let newer = insert(b"a", 1, 200, 1);
    let older = insert(b"a", 1, 100, 1);
    assert!(newer < older);

    // Same timestamp: higher revision first.
    let high_rev = insert(b"a", 1, 100, 9);
    let low_rev = insert(b"a", 1, 100, 2);
    assert!(high_rev < low_rev);
}

#[test]
fn row_tombstone_sorts_before_every_cell_of_its_row() {
    let tombstone = CellKey::delete_row(b"row", 50, 1);
    let cell = insert(b"row", 1, i64::MAX, u64::MAX);
    assert!(tombstone < cell);
}

#[test]
fn family_and_cell_tombstones_sort_before_inserts() {
    let cf_del = CellKey::delete_column_family(b"row", 3, 100, 1);
    let cell_del = CellKey::delete_cell(b"row", 3, b"".to_vec(), 100, 1);
    let cell = CellKey::insert(b"row", 3, b"".to_vec(), 100, 1);
    assert!(cf_del < cell_del);
    assert!(cell_del < cell);
}

#[test]
fn delete_flag_indices_are_fixed() {
    assert_eq!(KeyFlag::DeleteRow.delete_index(), Some(0));
    assert_eq!(KeyFlag::DeleteColumnFamily.delete_index(), Some(1));
    assert_eq!(KeyFlag::DeleteCell.delete_index(), Some(2));
    assert_eq!(KeyFlag::Insert.delete_index(), None);
}

#[test]
fn cell_roundtrips_through_the_wire_format() {
    let cell = Cell::new(
        CellKey::insert(b"row-1", 4, b"qual".to_vec(), -5, 77),
        b"value bytes".to_vec(),
    );
    let bytes = encode_to_vec(&cell).unwrap();
    let (decoded, consumed) = Cell::decode_from(&bytes).unwrap();
    assert_eq!(decoded, cell);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn decoding_an_unknown_flag_fails() {
    let cell = Cell::new(insert(b"r", 1, 1, 1), b"v".to_vec());
    let mut bytes = encode_to_vec(&cell).unwrap();
    // The flag byte follows row(4+1) + family(1) + qualifier(4).
    let flag_offset = 4 + 1 + 1 + 4;
    bytes[flag_offset] = 42;
    assert!(Cell::decode_from(&bytes).is_err());
}

#[test]
fn range_spec_bounds_are_exclusive_inclusive() {
    let spec = RangeSpec::new(b"a".to_vec(), b"m".to_vec());
    assert!(!spec.contains(b"a"));
    assert!(spec.contains(b"b"));
    assert!(spec.contains(b"m"));
    assert!(!spec.contains(b"n"));

    let root = RangeSpec::new(Vec::new(), END_ROOT_ROW.to_vec());
    assert!(root.is_root());
    assert!(root.contains(b"anything"));
}

#[test]
fn scan_spec_family_filter_always_passes_row_tombstones() {
    let spec = ScanSpec::full().with_columns(vec![2]);
    assert!(spec.wants_family(0));
    assert!(spec.wants_family(2));
    assert!(!spec.wants_family(3));
}
