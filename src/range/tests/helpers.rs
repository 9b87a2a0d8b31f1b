use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cell::{Cell, CellKey, RangeSpec, ScanSpec, TableIdentifier};
use crate::context::{MasterClient, MasterError, ServerConfig, ServerContext};
use crate::range::Range;
use crate::schema::{Schema, SchemaBuilder};

/// Small, fast tunables for on-disk range tests.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        range_max_bytes: 1024 * 1024,
        range_metadata_max_bytes: 0,
        access_group_max_mem: 2 * 1024,
        block_size: 512,
        maintenance_interval: Duration::from_millis(1),
        metalog_retry_delay: Duration::from_millis(5),
        ..ServerConfig::default()
    }
}

/// Captures every `report_split` for assertions.
#[derive(Debug, Default)]
pub struct RecordingMaster {
    pub reports: Mutex<Vec<SplitReport>>,
}

#[derive(Debug, Clone)]
pub struct SplitReport {
    pub table: TableIdentifier,
    pub sibling: RangeSpec,
    pub transfer_log: PathBuf,
    pub soft_limit: u64,
}

impl MasterClient for RecordingMaster {
    fn report_split(
        &self,
        table: &TableIdentifier,
        sibling: &RangeSpec,
        transfer_log: &Path,
        soft_limit: u64,
    ) -> Result<(), MasterError> {
        self.reports
            .lock()
            .map_err(|_| MasterError::Unavailable("mutex poisoned".into()))?
            .push(SplitReport {
                table: table.clone(),
                sibling: sibling.clone(),
                transfer_log: transfer_log.to_path_buf(),
                soft_limit,
            });
        Ok(())
    }
}

impl RecordingMaster {
    pub fn take_reports(&self) -> Vec<SplitReport> {
        self.reports.lock().unwrap().drain(..).collect()
    }
}

pub fn two_group_schema() -> Arc<Schema> {
    SchemaBuilder::new(1)
        .access_group("ag1")
        .access_group("ag2")
        .column_family("cf1", 1, "ag1")
        .column_family("cf2", 2, "ag2")
        .build()
        .unwrap()
}

pub fn table() -> TableIdentifier {
    TableIdentifier::new(1, 1, "users")
}

pub fn load_range(
    ctx: &Arc<ServerContext>,
    schema: Arc<Schema>,
    start: &[u8],
    end: &[u8],
) -> Arc<Range> {
    Range::load(
        Arc::clone(ctx),
        table(),
        schema,
        &RangeSpec::new(start.to_vec(), end.to_vec()),
    )
    .unwrap()
}

pub fn insert(row: &[u8], family: u8, ts: i64, revision: u64, value: &[u8]) -> Cell {
    Cell::new(
        CellKey::insert(row, family, b"".to_vec(), ts, revision),
        value.to_vec(),
    )
}

pub fn delete_row(row: &[u8], ts: i64, revision: u64) -> Cell {
    Cell::new(CellKey::delete_row(row, ts, revision), Vec::new())
}

/// Distinct rows visible in a full scan, in order.
pub fn scan_rows(range: &Range) -> Vec<Vec<u8>> {
    let mut rows: Vec<Vec<u8>> = range
        .create_scanner(&ScanSpec::full())
        .unwrap()
        .map(|cell| cell.key.row)
        .collect();
    rows.dedup();
    rows
}

/// All cells visible in a full scan.
pub fn scan_cells(range: &Range) -> Vec<Cell> {
    range.create_scanner(&ScanSpec::full()).unwrap().collect()
}
