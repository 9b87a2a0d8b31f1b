use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::cell::{Cell, CellKey, END_ROW, RangeSpec, TableIdentifier};
use crate::context::{NoopMaster, ServerConfig, ServerContext};
use crate::maintenance::MaintenanceScheduler;
use crate::range::Range;
use crate::schema::SchemaBuilder;

fn test_config() -> ServerConfig {
    ServerConfig {
        range_max_bytes: 1024 * 1024,
        access_group_max_mem: 2 * 1024,
        block_size: 512,
        maintenance_interval: Duration::from_millis(1),
        maintenance_workers: 1,
        maintenance_queue_depth: 4,
        ..ServerConfig::default()
    }
}

fn test_range(tmp: &TempDir, config: ServerConfig) -> (Arc<ServerContext>, Arc<Range>) {
    let ctx = ServerContext::open(tmp.path(), "rs-test", config, Arc::new(NoopMaster)).unwrap();
    let schema = SchemaBuilder::new(1)
        .access_group("default")
        .column_family("cf1", 1, "default")
        .build()
        .unwrap();
    let range = Range::load(
        Arc::clone(&ctx),
        TableIdentifier::new(1, 1, "t"),
        schema,
        &RangeSpec::new(Vec::new(), END_ROW.to_vec()),
    )
    .unwrap();
    (ctx, range)
}

fn fill(range: &Range, count: u32) {
    let cells: Vec<Cell> = (0..count)
        .map(|i| {
            Cell::new(
                CellKey::insert(
                    format!("row-{i:04}").as_bytes(),
                    1,
                    b"".to_vec(),
                    100,
                    u64::from(i) + 1,
                ),
                vec![0x33; 64],
            )
        })
        .collect();
    range.add_cells(&cells).unwrap();
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn over_limit_caches_get_flushed() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, range) = test_range(&tmp, test_config());

    fill(&range, 100);
    assert!(range.need_maintenance());

    let scheduler = MaintenanceScheduler::new(test_config());
    let enqueued = scheduler.schedule(std::slice::from_ref(&range));
    assert!(enqueued >= 1);

    assert!(
        wait_until(Duration::from_secs(5), || range.disk_usage() > 0),
        "flush never ran"
    );
    assert!(
        wait_until(Duration::from_secs(5), || range.memory_usage() == 0),
        "cache never drained"
    );
    scheduler.shutdown();
}

#[test]
fn idle_ranges_schedule_nothing() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, range) = test_range(&tmp, test_config());

    fill(&range, 2);

    let scheduler = MaintenanceScheduler::new(test_config());
    assert_eq!(scheduler.schedule(std::slice::from_ref(&range)), 0);
    scheduler.shutdown();
}

#[test]
fn interval_gates_consecutive_ticks() {
    let tmp = TempDir::new().unwrap();
    let config = ServerConfig {
        maintenance_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let (_ctx, range) = test_range(&tmp, config.clone());

    fill(&range, 100);

    let scheduler = MaintenanceScheduler::new(config);
    assert!(scheduler.schedule(std::slice::from_ref(&range)) >= 1);

    // Second tick inside the interval is suppressed...
    assert_eq!(scheduler.schedule(std::slice::from_ref(&range)), 0);

    // ...unless explicitly requested.
    scheduler.need_scheduling();
    let _ = scheduler.schedule(std::slice::from_ref(&range));
    scheduler.shutdown();
}

#[test]
fn oversized_ranges_are_scheduled_for_split() {
    let tmp = TempDir::new().unwrap();
    // A soft limit tiny enough that one flush crosses it.
    let config = ServerConfig {
        range_max_bytes: 2 * 1024,
        ..test_config()
    };
    let (_ctx, range) = test_range(&tmp, config.clone());

    fill(&range, 200);
    range.compact(false).unwrap();
    assert!(range.disk_usage() > 2 * 1024);

    let scheduler = MaintenanceScheduler::new(config);
    assert!(scheduler.schedule(std::slice::from_ref(&range)) >= 1);

    assert!(
        wait_until(Duration::from_secs(5), || {
            range.state().state == crate::metalog::RangeStateKind::Steady
                && range.spec().start_row != Vec::<u8>::new()
                || range.spec().end_row != END_ROW
        }),
        "split never ran"
    );
    scheduler.shutdown();
}

#[test]
fn bytes_loaded_stats_accumulate_and_drain() {
    let scheduler = MaintenanceScheduler::new(test_config());
    scheduler.update_stats_bytes_loaded(512);
    scheduler.update_stats_bytes_loaded(512);
    // Drained by the next tick; only observable indirectly, so just
    // exercise the path with no ranges.
    assert_eq!(scheduler.schedule(&[]), 0);
    scheduler.shutdown();
}
