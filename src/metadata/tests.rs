use std::sync::Arc;

use tempfile::TempDir;

use crate::metadata::{
    Metadata, MetadataMutation, MetadataStore, metadata_row_key,
};

fn row_key() -> Vec<u8> {
    metadata_row_key(7, b"endrow")
}

#[test]
fn row_keys_embed_table_id_and_end_row() {
    assert_eq!(metadata_row_key(3, b"zz"), b"3:zz".to_vec());
}

#[test]
fn mutations_fold_into_rows() {
    let tmp = TempDir::new().unwrap();
    let store = MetadataStore::open(tmp.path()).unwrap();

    store
        .apply(vec![
            MetadataMutation::SetStartRow {
                row: row_key(),
                start_row: b"start".to_vec(),
            },
            MetadataMutation::SetFiles {
                row: row_key(),
                access_group: "default".into(),
                files: "/x/cs1;\n".into(),
            },
            MetadataMutation::SetLocation {
                row: row_key(),
                location: "rs1".into(),
            },
        ])
        .unwrap();

    let descriptor = store.get(&row_key()).unwrap().unwrap();
    assert_eq!(descriptor.start_row, b"start");
    assert_eq!(descriptor.files.get("default").unwrap(), "/x/cs1;\n");
    assert_eq!(descriptor.location.as_deref(), Some("rs1"));
}

#[test]
fn state_survives_reopen_via_journal() {
    let tmp = TempDir::new().unwrap();

    {
        let store = MetadataStore::open(tmp.path()).unwrap();
        store
            .apply(vec![MetadataMutation::SetStartRow {
                row: row_key(),
                start_row: b"s".to_vec(),
            }])
            .unwrap();
    }

    let store = MetadataStore::open(tmp.path()).unwrap();
    assert!(store.get(&row_key()).unwrap().is_some());
}

#[test]
fn checkpoint_snapshots_and_truncates_the_journal() {
    let tmp = TempDir::new().unwrap();

    {
        let store = MetadataStore::open(tmp.path()).unwrap();
        store
            .apply(vec![MetadataMutation::SetStartRow {
                row: row_key(),
                start_row: b"s".to_vec(),
            }])
            .unwrap();
        store.checkpoint().unwrap();
        store
            .apply(vec![MetadataMutation::SetLocation {
                row: row_key(),
                location: "rs2".into(),
            }])
            .unwrap();
    }

    // Snapshot plus post-checkpoint journal records both replay.
    let store = MetadataStore::open(tmp.path()).unwrap();
    let descriptor = store.get(&row_key()).unwrap().unwrap();
    assert_eq!(descriptor.start_row, b"s");
    assert_eq!(descriptor.location.as_deref(), Some("rs2"));
}

#[test]
fn remove_row_deletes_the_descriptor() {
    let tmp = TempDir::new().unwrap();
    let store = MetadataStore::open(tmp.path()).unwrap();

    store
        .apply(vec![MetadataMutation::SetStartRow {
            row: row_key(),
            start_row: b"s".to_vec(),
        }])
        .unwrap();
    store
        .apply(vec![MetadataMutation::RemoveRow { row: row_key() }])
        .unwrap();
    assert!(store.get(&row_key()).unwrap().is_none());
}

#[test]
fn a_batch_is_atomic_across_rows() {
    let tmp = TempDir::new().unwrap();

    {
        let store = MetadataStore::open(tmp.path()).unwrap();
        // A split's two-row mutation travels as one batch.
        store
            .apply(vec![
                MetadataMutation::SetStartRow {
                    row: metadata_row_key(7, b"m"),
                    start_row: b"".to_vec(),
                },
                MetadataMutation::SetStartRow {
                    row: metadata_row_key(7, b"z"),
                    start_row: b"m".to_vec(),
                },
            ])
            .unwrap();
    }

    let store = MetadataStore::open(tmp.path()).unwrap();
    assert!(store.get(&metadata_row_key(7, b"m")).unwrap().is_some());
    assert!(store.get(&metadata_row_key(7, b"z")).unwrap().is_some());
}

#[test]
fn normal_metadata_scans_and_writes_file_lists() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MetadataStore::open(tmp.path()).unwrap());

    let mut metadata = Metadata::normal(Arc::clone(&store), 7, b"endrow");
    metadata.reset_files_scan().unwrap();
    assert!(metadata.get_next_files().is_none());

    metadata.write_files("default", "/x/cs1;\n").unwrap();
    metadata.reset_files_scan().unwrap();
    let (group, files) = metadata.get_next_files().unwrap();
    assert_eq!(group, "default");
    assert_eq!(files, "/x/cs1;\n");
    assert!(metadata.get_next_files().is_none());
}

#[test]
fn root_metadata_lives_in_a_flat_file() {
    let tmp = TempDir::new().unwrap();

    {
        let mut metadata = Metadata::root(tmp.path());
        metadata.reset_files_scan().unwrap();
        assert!(metadata.get_next_files().is_none());
        metadata.write_files("meta", "/root/cs1;\n").unwrap();
    }

    // A fresh handle reads what the previous one wrote.
    let mut metadata = Metadata::root(tmp.path());
    metadata.reset_files_scan().unwrap();
    let (group, files) = metadata.get_next_files().unwrap();
    assert_eq!(group, "meta");
    assert_eq!(files, "/root/cs1;\n");
}
