use std::sync::Arc;

use tempfile::TempDir;

use crate::accessgroup::AccessGroup;
use crate::cell::{Cell, CellKey, END_ROW, ScanSpec, TableIdentifier};
use crate::context::{NoopMaster, ServerConfig, ServerContext};
use crate::merge::{ColumnPolicies, MergeScanner};
use crate::schema::{Schema, SchemaBuilder};

fn test_group(tmp: &TempDir) -> (Arc<ServerContext>, AccessGroup, Arc<Schema>) {
    let config = ServerConfig {
        access_group_max_mem: 1024,
        block_size: 512,
        ..ServerConfig::default()
    };
    let ctx = ServerContext::open(tmp.path(), "rs-test", config, Arc::new(NoopMaster)).unwrap();
    let schema = SchemaBuilder::new(1)
        .access_group("default")
        .column_family("cf1", 1, "default")
        .build()
        .unwrap();
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

fn insert(row: &[u8], revision: u64) -> CellKey {
    CellKey::insert(row, 1, b"".to_vec(), 100, revision)
}

fn rows(ag: &AccessGroup, schema: &Schema) -> Vec<Vec<u8>> {
    let mut children = Vec::new();
    ag.create_scanners(&ScanSpec::full(), &mut children).unwrap();
    MergeScanner::new(
        children,
        ColumnPolicies::from_schema(schema),
        false,
        i64::MAX / 2,
    )
    .map(|cell: Cell| cell.key.row)
    .collect()
}

fn fill(ag: &AccessGroup) {
    for (i, row) in [b"a" as &[u8], b"b", b"c", b"d"].iter().enumerate() {
        ag.add(insert(row, i as u64 + 1), b"v".to_vec()).unwrap();
    }
}

#[test]
fn shrink_keeping_low_hides_the_high_side() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    fill(&ag);
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    ag.shrink(b"b", false).unwrap();
    assert_eq!(rows(&ag, &schema), vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn shrink_keeping_high_hides_the_low_side() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    fill(&ag);
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    ag.shrink(b"b", true).unwrap();
    assert_eq!(rows(&ag, &schema), vec![b"c".to_vec(), b"d".to_vec()]);
}

#[test]
fn shrink_drops_cache_entries_on_the_departing_side() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, schema) = test_group(&tmp);

    // Cached only — nothing flushed yet.
    fill(&ag);
    ag.shrink(b"b", true).unwrap();
    assert_eq!(rows(&ag, &schema), vec![b"c".to_vec(), b"d".to_vec()]);
}

#[test]
fn easy_split_rows_come_from_the_largest_store() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, _schema) = test_group(&tmp);

    for i in 0..64u32 {
        let row = format!("row-{i:02}").into_bytes();
        ag.add(insert(&row, u64::from(i) + 1), vec![0x22; 32]).unwrap();
    }
    ag.initiate_compaction().unwrap();
    ag.run_compaction(false).unwrap();

    let mut candidates = Vec::new();
    ag.get_split_rows(&mut candidates, false).unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].starts_with(b"row-"));
}

#[test]
fn hard_split_rows_come_from_the_cache_median() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, _schema) = test_group(&tmp);

    fill(&ag);

    let mut easy = Vec::new();
    ag.get_split_rows(&mut easy, false).unwrap();
    assert!(easy.is_empty(), "no stores, easy path has nothing");

    let mut hard = Vec::new();
    ag.get_split_rows(&mut hard, true).unwrap();
    assert_eq!(hard, vec![b"c".to_vec()]);
}

#[test]
fn cached_rows_cover_live_and_frozen_caches() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, ag, _schema) = test_group(&tmp);

    ag.add(insert(b"frozen-row", 1), b"v".to_vec()).unwrap();
    ag.initiate_compaction().unwrap();
    ag.add(insert(b"live-row", 2), b"v".to_vec()).unwrap();

    let mut cached = Vec::new();
    ag.get_cached_rows(&mut cached).unwrap();
    cached.sort();
    assert_eq!(cached, vec![b"frozen-row".to_vec(), b"live-row".to_vec()]);
}
