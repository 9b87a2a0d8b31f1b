use std::sync::Arc;

use tempfile::TempDir;

use crate::cell::Cell;
use crate::context::{ServerConfig, ServerContext};
use crate::error::ErrorCode;
use crate::metalog::RangeStateKind;
use crate::range::{Range, RangeError};
use crate::schema::Schema;

use super::helpers::{
    RecordingMaster, insert, load_range, scan_rows, test_config, two_group_schema,
};

fn open_ctx_with(
    tmp: &TempDir,
    config: ServerConfig,
) -> (Arc<ServerContext>, Arc<RecordingMaster>) {
    let master = Arc::new(RecordingMaster::default());
    let ctx = ServerContext::open(
        tmp.path(),
        "rs-test",
        config,
        Arc::<RecordingMaster>::clone(&master),
    )
    .unwrap();
    (ctx, master)
}

/// Rows `a` through `y`, one cell each.
fn alphabet_cells() -> Vec<Cell> {
    (b'a'..=b'y')
        .enumerate()
        .map(|(i, letter)| insert(&[letter], 1, 1000, i as u64 + 1, b"payload"))
        .collect()
}

fn load_sibling(
    ctx: &Arc<ServerContext>,
    schema: Arc<Schema>,
    master: &RecordingMaster,
) -> (Arc<Range>, super::helpers::SplitReport) {
    let reports = master.take_reports();
    assert_eq!(reports.len(), 1, "expected exactly one split report");
    let report = reports[0].clone();

    let sibling = load_range(
        ctx,
        schema,
        &report.sibling.start_row,
        &report.sibling.end_row,
    );
    sibling.replay_transfer_log(&report.transfer_log).unwrap();
    (sibling, report)
}

#[test]
fn low_split_keeps_the_high_side_and_loses_no_rows() {
    let tmp = TempDir::new().unwrap();
    let (ctx, master) = open_ctx_with(&tmp, test_config());
    let schema = two_group_schema();
    let range = load_range(&ctx, Arc::clone(&schema), b"", b"z");

    range.add_cells(&alphabet_cells()).unwrap();
    range.split().unwrap();

    // Median of a..y is m; the retained side is (m, z].
    assert_eq!(range.spec().start_row, b"m".to_vec());
    assert_eq!(range.spec().end_row, b"z".to_vec());
    assert_eq!(range.state().state, RangeStateKind::Steady);

    let (sibling, report) = load_sibling(&ctx, schema, &master);
    assert_eq!(report.sibling.start_row, b"".to_vec());
    assert_eq!(report.sibling.end_row, b"m".to_vec());

    let retained = scan_rows(&range);
    let departed = scan_rows(&sibling);
    assert_eq!(retained.first(), Some(&b"n".to_vec()));
    assert_eq!(departed.last(), Some(&b"m".to_vec()));

    let mut union = departed;
    union.extend(retained);
    let expected: Vec<Vec<u8>> = (b'a'..=b'y').map(|letter| vec![letter]).collect();
    assert_eq!(union, expected, "split lost or duplicated rows");
}

#[test]
fn high_split_gives_away_the_high_side() {
    let tmp = TempDir::new().unwrap();
    let config = ServerConfig {
        split_off_high: true,
        ..test_config()
    };
    let (ctx, master) = open_ctx_with(&tmp, config);
    let schema = two_group_schema();
    let range = load_range(&ctx, Arc::clone(&schema), b"", b"z");

    range.add_cells(&alphabet_cells()).unwrap();
    range.split().unwrap();

    // The retained side is [, m]; the sibling serves (m, z].
    assert_eq!(range.spec().start_row, b"".to_vec());
    assert_eq!(range.spec().end_row, b"m".to_vec());

    let (sibling, report) = load_sibling(&ctx, schema, &master);
    assert_eq!(report.sibling.start_row, b"m".to_vec());
    assert_eq!(report.sibling.end_row, b"z".to_vec());

    // The sibling's METADATA row carries this server as its location.
    let row = crate::metadata::metadata_row_key(1, b"z");
    let descriptor = ctx.metadata.get(&row).unwrap().unwrap();
    assert_eq!(descriptor.location.as_deref(), Some("rs-test"));
    assert_eq!(descriptor.start_row, b"m".to_vec());

    let retained = scan_rows(&range);
    let departed = scan_rows(&sibling);
    assert_eq!(retained.len() + departed.len(), 25);
    assert_eq!(retained.last(), Some(&b"m".to_vec()));
    assert_eq!(departed.first(), Some(&b"n".to_vec()));
}

#[test]
fn split_doubles_the_soft_limit_up_to_the_cap() {
    let tmp = TempDir::new().unwrap();
    let config = ServerConfig {
        range_max_bytes: 8 * 1024,
        ..test_config()
    };
    let (ctx, master) = open_ctx_with(&tmp, config);
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range.add_cells(&alphabet_cells()).unwrap();
    range.split().unwrap();

    let report = &master.take_reports()[0];
    assert_eq!(report.soft_limit, 8 * 1024); // doubled, capped at max
    assert_eq!(range.state().soft_limit, 8 * 1024);
}

#[test]
fn writes_during_a_split_are_routed_by_side() {
    let tmp = TempDir::new().unwrap();
    let (ctx, master) = open_ctx_with(&tmp, test_config());
    let schema = two_group_schema();
    let range = load_range(&ctx, Arc::clone(&schema), b"", b"z");

    range.add_cells(&alphabet_cells()).unwrap();

    // Pause the split right after phase 1 via the failure inducer.
    ctx.failure.arm("split-1");
    let err = range.split().unwrap_err();
    assert!(matches!(err, RangeError::Induced(_)));
    assert_eq!(range.state().state, RangeStateKind::SplitLogInstalled);

    // The transfer log is installed: a departing-side write (low side,
    // row b) must reach the sibling; a retained-side write (row q)
    // must stay here.
    range
        .add_cells(&[
            insert(b"b2", 1, 2000, 100, b"departing"),
            insert(b"q2", 1, 2000, 101, b"retained"),
        ])
        .unwrap();

    // Resume: phases 2 and 3 complete.
    range.split().unwrap();
    assert_eq!(range.state().state, RangeStateKind::Steady);

    let (sibling, _) = load_sibling(&ctx, schema, &master);

    let retained = scan_rows(&range);
    let departed = scan_rows(&sibling);
    assert!(retained.contains(&b"q2".to_vec()));
    assert!(!retained.contains(&b"b2".to_vec()));
    assert!(departed.contains(&b"b2".to_vec()));
    assert!(!departed.contains(&b"q2".to_vec()));
    assert_eq!(retained.len() + departed.len(), 27);
}

#[test]
fn a_range_with_one_distinct_row_reports_row_overflow() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _master) = open_ctx_with(&tmp, test_config());
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range
        .add_cells(&[
            insert(b"only", 1, 1000, 1, b"v1"),
            insert(b"only", 2, 1000, 2, b"v2"),
        ])
        .unwrap();

    let err = range.split().unwrap_err();
    assert!(matches!(err, RangeError::RowOverflow(_)));
    assert_eq!(range.last_error(), Some(ErrorCode::RowOverflow));

    // The range keeps serving.
    assert_eq!(scan_rows(&range), vec![b"only".to_vec()]);
    assert_eq!(range.state().state, RangeStateKind::Steady);
}

#[test]
fn metadata_rows_describe_both_sides_after_a_split() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _master) = open_ctx_with(&tmp, test_config());
    let range = load_range(&ctx, two_group_schema(), b"", b"z");

    range.add_cells(&alphabet_cells()).unwrap();
    range.split().unwrap();

    // Low split: retained (m, z] stays keyed by z; sibling (, m] keyed
    // by the split point.
    let retained = ctx
        .metadata
        .get(&crate::metadata::metadata_row_key(1, b"z"))
        .unwrap()
        .unwrap();
    assert_eq!(retained.start_row, b"m".to_vec());

    let sibling = ctx
        .metadata
        .get(&crate::metadata::metadata_row_key(1, b"m"))
        .unwrap()
        .unwrap();
    assert_eq!(sibling.start_row, b"".to_vec());
    assert!(!sibling.files.is_empty(), "sibling must inherit file lists");
}
