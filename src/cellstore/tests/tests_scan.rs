use std::sync::Arc;

use tempfile::TempDir;

use crate::cell::{CellKey, END_ROW, ScanSpec, TableIdentifier};
use crate::cellstore::{self, BloomMode, CellStore, CellStoreWriter, WriterOptions};

fn build_store(dir: &std::path::Path, rows: &[&[u8]]) -> Arc<CellStore> {
    let path = dir.join("cs1");
    let mut writer = CellStoreWriter::create(
        &path,
        rows.len(),
        WriterOptions {
            blocksize: 128,
            bloom_mode: BloomMode::Rows,
            ..WriterOptions::default()
        },
    )
    .unwrap();
    for (i, row) in rows.iter().enumerate() {
        let key = CellKey::insert(*row, 1, b"".to_vec(), 100, i as u64 + 1);
        writer.add(&key, &[0x11; 48]).unwrap();
    }
    writer
        .finalize(&TableIdentifier::new(1, 1, "t"))
        .unwrap();
    Arc::new(cellstore::open_and_load(&path, b"", END_ROW).unwrap())
}

#[test]
fn interval_scan_is_exclusive_inclusive() {
    let tmp = TempDir::new().unwrap();
    let store = build_store(tmp.path(), &[b"a", b"b", b"c", b"d", b"e"]);

    let rows: Vec<Vec<u8>> = store
        .create_scanner(&ScanSpec::rows(b"b".to_vec(), b"d".to_vec()))
        .map(|cell| cell.key.row)
        .collect();
    assert_eq!(rows, vec![b"c".to_vec(), b"d".to_vec()]);
}

#[test]
fn exact_row_scan_returns_only_that_row() {
    let tmp = TempDir::new().unwrap();
    let store = build_store(tmp.path(), &[b"a", b"b", b"c"]);

    let rows: Vec<Vec<u8>> = store
        .create_scanner(&ScanSpec::point(b"b".to_vec()))
        .map(|cell| cell.key.row)
        .collect();
    assert_eq!(rows, vec![b"b".to_vec()]);
}

#[test]
fn column_filter_drops_unwanted_families() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("cs1");

    let mut writer = CellStoreWriter::create(&path, 4, WriterOptions::default()).unwrap();
    writer
        .add(&CellKey::insert(b"r", 1, b"".to_vec(), 100, 1), b"one")
        .unwrap();
    writer
        .add(&CellKey::insert(b"r", 2, b"".to_vec(), 100, 2), b"two")
        .unwrap();
    writer
        .add(&CellKey::delete_row(b"s", 100, 3), b"")
        .unwrap();
    writer.finalize(&TableIdentifier::new(1, 1, "t")).unwrap();

    let store = Arc::new(cellstore::open_and_load(&path, b"", END_ROW).unwrap());
    let cells: Vec<_> = store
        .create_scanner(&ScanSpec::full().with_columns(vec![2]))
        .collect();

    // Family 2 plus the row tombstone (family 0 always passes).
    assert_eq!(cells.len(), 2);
    assert!(cells.iter().any(|c| c.key.column_family == 2));
    assert!(cells.iter().any(|c| c.key.column_family == 0));
}

#[test]
fn clipping_bounds_hide_cells_outside_the_range() {
    let tmp = TempDir::new().unwrap();
    let path = {
        let store = build_store(tmp.path(), &[b"a", b"b", b"c", b"d", b"e"]);
        store.path().to_path_buf()
    };

    // Reopen as a shrunk range would: only (b, d] visible.
    let store = Arc::new(cellstore::open_and_load(&path, b"b", b"d").unwrap());
    let rows: Vec<Vec<u8>> = store
        .create_scanner(&ScanSpec::full())
        .map(|cell| cell.key.row)
        .collect();
    assert_eq!(rows, vec![b"c".to_vec(), b"d".to_vec()]);
}
