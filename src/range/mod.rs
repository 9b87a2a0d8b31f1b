//! # Range
//!
//! The per-range lifecycle engine: routes writes to access groups,
//! serves merged scans, and executes the three-phase crash-safe split.
//!
//! ## Locking
//!
//! - `schema` mutex — guards the access-group vector, the family
//!   routing map, and the schema pointer. Writes copy the routing state
//!   out under it; scanners snapshot the vector so splits never
//!   invalidate a running scan.
//! - `inner` mutex — guards the row boundaries, split row, name, and
//!   revision watermark.
//! - `update_barrier` / `scan_barrier` — writer-preferring gates.
//!   Writes and scanner construction pass in shared mode; a split
//!   activates them only across the cache swap (phase 1) and the shrink
//!   (phase 2), both O(ms).
//!
//! ## Split state machine
//!
//! ```text
//!           STEADY
//!              | split_install_log
//!              v
//!  SPLIT_LOG_INSTALLED --crash--> recovery replays the transfer log
//!              | split_compact_and_shrink
//!              v
//!       SPLIT_SHRUNK    --crash--> recovery retries notify
//!              | split_notify_master
//!              v
//!           STEADY      (journal record cleared, soft limit doubled)
//! ```
//!
//! Every transition is journaled to the [range
//! journal](crate::metalog) *before* its effects become externally
//! visible, so any crash lands on a valid point of the machine. Journal
//! writes retry a configured number of times and then abort the
//! process; a fresh instance recovers from the journal.
//!
//! While the transfer log is installed, every write still goes to the
//! shared commit log, and writes whose row lies on the departing side
//! are additionally appended to the transfer log *instead of* the local
//! caches — the sibling replays them after reassignment.

pub mod barrier;

#[cfg(test)]
mod tests;

pub use barrier::{Barrier, MaintenanceGuard};

use std::{
    collections::HashMap,
    fs, io,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::accessgroup::{AccessGroup, AccessGroupError};
use crate::cell::{Cell, HexRow, KeyFlag, RangeSpec, ScanSpec, TableIdentifier};
use crate::cellstore::{self, CellStoreError};
use crate::commitlog::{CommitLog, CommitLogError, CommitLogReader};
use crate::context::{InducedFailure, MasterError, ServerContext, now_micros};
use crate::error::ErrorCode;
use crate::merge::{ColumnPolicies, MergeScanner};
use crate::metadata::{Metadata, MetadataError, MetadataMutation, metadata_row_key};
use crate::metalog::{MetaLogError, RangeState, RangeStateKind, RecoveredRange};
use crate::schema::Schema;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by range operations.
#[derive(Debug, Error)]
pub enum RangeError {
    /// Request malformed: unknown column family, row outside the range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No valid split row could be determined.
    #[error("row overflow: {0}")]
    RowOverflow(String),

    /// Maintenance interrupted because the range was dropped.
    #[error("cancelled")]
    Cancelled,

    /// Injected crash point (tests only).
    #[error(transparent)]
    Induced(#[from] InducedFailure),

    /// Access group failure.
    #[error("Access group error: {0}")]
    AccessGroup(#[from] AccessGroupError),

    /// Cell store failure while loading.
    #[error("Cell store error: {0}")]
    CellStore(#[from] CellStoreError),

    /// Commit / transfer log failure.
    #[error("Commit log error: {0}")]
    CommitLog(#[from] CommitLogError),

    /// A replayed transfer-log block failed validation.
    #[error("corrupt commit log: {0}")]
    CorruptCommitLog(String),

    /// Metadata failure.
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Range journal failure.
    #[error("Range journal error: {0}")]
    MetaLog(#[from] MetaLogError),

    /// Master RPC failure.
    #[error(transparent)]
    Master(#[from] MasterError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Reporting structs
// ------------------------------------------------------------------------------------------------

/// Point-in-time statistics of one range.
#[derive(Debug, Clone)]
pub struct RangeStats {
    /// Table identifier at the time of the call.
    pub table: TableIdentifier,

    /// Current boundaries.
    pub spec: RangeSpec,

    /// Inserts accepted since load (or last transfer-log replay).
    pub added_inserts: u64,

    /// Deletes accepted, indexed `DELETE_ROW, DELETE_COLUMN_FAMILY,
    /// DELETE_CELL`.
    pub added_deletes: [u64; 3],

    /// Exact-key collisions across access groups.
    pub collisions: u64,

    /// Cells currently cached across access groups.
    pub cached_cells: u64,

    /// Total cell store bytes.
    pub disk_usage: u64,

    /// Total cache bytes.
    pub memory_usage: u64,
}

/// Per-access-group slice of [`MaintenanceData`].
#[derive(Debug, Clone)]
pub struct AgMaintenanceData {
    /// Group name.
    pub name: String,

    /// Cache bytes.
    pub memory: usize,

    /// Store bytes.
    pub disk: u64,

    /// Whether the cache exceeded its limit.
    pub needs_compaction: bool,
}

/// Snapshot handed to the maintenance prioritizer.
#[derive(Debug, Clone)]
pub struct MaintenanceData {
    /// Owning table id.
    pub table_id: u32,

    /// Whether this is the root metadata range.
    pub is_root: bool,

    /// Whether a maintenance task is already running here.
    pub busy: bool,

    /// Total store bytes.
    pub disk_usage: u64,

    /// Total cache bytes.
    pub memory_usage: u64,

    /// Current split trigger.
    pub soft_limit: u64,

    /// Disk usage crossed the soft limit.
    pub needs_split: bool,

    /// At least one access group wants a flush.
    pub compaction_needed: bool,

    /// Last maintenance error recorded on the range.
    pub last_error: Option<ErrorCode>,

    /// Per-group breakdown.
    pub access_groups: Vec<AgMaintenanceData>,
}

// ------------------------------------------------------------------------------------------------
// Range
// ------------------------------------------------------------------------------------------------

struct SchemaInner {
    table: TableIdentifier,
    schema: Arc<Schema>,
    access_groups: Vec<Arc<AccessGroup>>,
    by_family: HashMap<u8, Arc<AccessGroup>>,
}

struct RangeInner {
    start_row: Vec<u8>,
    end_row: Vec<u8>,
    split_row: Vec<u8>,
    name: String,
    latest_revision: u64,
}

/// One served range: the lifecycle engine.
pub struct Range {
    ctx: Arc<ServerContext>,
    is_root: bool,

    /// Which side a split gives away. Fixed at construction (from config
    /// when steady, derived from the journal when resuming).
    split_off_high: AtomicBool,

    schema: Mutex<SchemaInner>,
    inner: Mutex<RangeInner>,
    state: Mutex<RangeState>,
    split_log: Mutex<Option<CommitLog>>,

    update_barrier: Barrier,
    scan_barrier: Barrier,
    maintenance_guard: MaintenanceGuard,

    dropped: AtomicBool,
    last_error: Mutex<Option<ErrorCode>>,

    added_inserts: AtomicU64,
    added_deletes: [AtomicU64; 3],

    /// Set when range load filtered `#`-disabled entries out of a
    /// `Files` column; the rewrite is deferred to the first maintenance
    /// pass (doing it during load deadlocks startup).
    files_update_needed: AtomicBool,
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Range")
            .field("name", &self.name())
            .field("is_root", &self.is_root)
            .finish_non_exhaustive()
    }
}

impl Range {
    /// Loads a brand-new range: journals `LOAD`, then constructs it.
    pub fn load(
        ctx: Arc<ServerContext>,
        table: TableIdentifier,
        schema: Arc<Schema>,
        spec: &RangeSpec,
    ) -> Result<Arc<Self>, RangeError> {
        let state = RangeState::steady(ctx.config.range_max_bytes);
        ctx.metalog.log_range_loaded(&table, spec, &state)?;
        let range = Self::construct(ctx, table, schema, spec, state)?;
        Ok(Arc::new(range))
    }

    /// Reconstructs a range from its folded journal state. The caller
    /// must invoke [`Range::recovery_finalize`] before serving traffic.
    pub fn recover(
        ctx: Arc<ServerContext>,
        schema: Arc<Schema>,
        recovered: &RecoveredRange,
    ) -> Result<Arc<Self>, RangeError> {
        let range = Self::construct(
            ctx,
            recovered.table.clone(),
            schema,
            &recovered.spec,
            recovered.state.clone(),
        )?;
        Ok(Arc::new(range))
    }

    fn construct(
        ctx: Arc<ServerContext>,
        table: TableIdentifier,
        schema: Arc<Schema>,
        spec: &RangeSpec,
        mut state: RangeState,
    ) -> Result<Self, RangeError> {
        if state.soft_limit == 0 || state.soft_limit > ctx.config.range_max_bytes {
            state.soft_limit = ctx.config.range_max_bytes;
        }

        let split_off_high = match state.state {
            RangeStateKind::SplitLogInstalled | RangeStateKind::SplitShrunk => {
                state.split_off_high()
            }
            RangeStateKind::Steady => ctx.config.split_off_high,
        };

        let is_root = table.is_metadata() && spec.is_root();
        let name = range_name(&table.name, &spec.start_row, &spec.end_row);

        let mut access_groups = Vec::new();
        let mut by_family = HashMap::new();
        for ag_spec in &schema.access_groups {
            let ag = Arc::new(AccessGroup::new(
                Arc::clone(&ctx),
                table.clone(),
                Arc::clone(&schema),
                ag_spec,
                &spec.start_row,
                &spec.end_row,
                is_root,
            ));
            for cf in &ag_spec.column_families {
                if !cf.deleted {
                    by_family.insert(cf.id, Arc::clone(&ag));
                }
            }
            access_groups.push(ag);
        }

        let range = Self {
            ctx,
            is_root,
            split_off_high: AtomicBool::new(split_off_high),
            schema: Mutex::new(SchemaInner {
                table,
                schema,
                access_groups,
                by_family,
            }),
            inner: Mutex::new(RangeInner {
                start_row: spec.start_row.clone(),
                end_row: spec.end_row.clone(),
                split_row: state.split_point.clone(),
                name,
                latest_revision: 0,
            }),
            state: Mutex::new(state),
            split_log: Mutex::new(None),
            update_barrier: Barrier::new(),
            scan_barrier: Barrier::new(),
            maintenance_guard: MaintenanceGuard::default(),
            dropped: AtomicBool::new(false),
            last_error: Mutex::new(None),
            added_inserts: AtomicU64::new(0),
            added_deletes: Default::default(),
            files_update_needed: AtomicBool::new(false),
        };

        range.load_cell_stores()?;

        debug!(name = %range.name(), "range constructed");
        Ok(range)
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// Display name, `<table>[start..end]`.
    pub fn name(&self) -> String {
        self.lock_inner()
            .map(|inner| inner.name.clone())
            .unwrap_or_default()
    }

    /// Current boundaries.
    pub fn spec(&self) -> RangeSpec {
        self.lock_inner()
            .map(|inner| RangeSpec::new(inner.start_row.clone(), inner.end_row.clone()))
            .unwrap_or_else(|_| RangeSpec::new(Vec::new(), Vec::new()))
    }

    /// Table identifier (generation tracks the schema at split time).
    pub fn table(&self) -> TableIdentifier {
        self.lock_schema()
            .map(|schema| schema.table.clone())
            .unwrap_or_else(|_| TableIdentifier::new(0, 0, ""))
    }

    /// Persisted lifecycle state.
    pub fn state(&self) -> RangeState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Highest revision ever accepted by this range.
    pub fn latest_revision(&self) -> u64 {
        self.lock_inner()
            .map(|inner| inner.latest_revision)
            .unwrap_or(0)
    }

    /// Whether this is the root metadata range.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Last maintenance error recorded on the range (e.g. row overflow).
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error.lock().ok().and_then(|error| *error)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Appends a batch of cells.
    ///
    /// The batch is validated, made durable in the shared commit log,
    /// and dispatched to access-group caches — except that rows on the
    /// departing side of an in-flight split go to the transfer log
    /// instead. Publishes the revision watermark before returning.
    pub fn add_cells(&self, cells: &[Cell]) -> Result<(), RangeError> {
        if cells.is_empty() {
            return Ok(());
        }

        let _pass = self.update_barrier.enter();

        let (table, by_family, access_groups) = {
            let schema = self.lock_schema()?;
            (
                schema.table.clone(),
                schema.by_family.clone(),
                schema.access_groups.clone(),
            )
        };
        let (start_row, end_row) = {
            let inner = self.lock_inner()?;
            (inner.start_row.clone(), inner.end_row.clone())
        };

        // Validate before any effect.
        for cell in cells {
            let row = cell.key.row.as_slice();
            if row <= start_row.as_slice() || row > end_row.as_slice() {
                return Err(RangeError::InvalidArgument(format!(
                    "row {} outside range {}",
                    HexRow(row),
                    self.name()
                )));
            }
            if cell.key.flag != KeyFlag::DeleteRow
                && !by_family.contains_key(&cell.key.column_family)
            {
                return Err(RangeError::InvalidArgument(format!(
                    "unknown column family code {}",
                    cell.key.column_family
                )));
            }
        }

        // Durability first.
        self.ctx.commit_log.append(&table, cells.to_vec())?;

        // Split duplication window: derive the departing predicate once.
        let split_guard = self
            .split_log
            .lock()
            .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
        let departing: Option<(Vec<u8>, bool)> = if split_guard.is_some() {
            let state = self
                .state
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            Some((
                state.split_point.clone(),
                self.split_off_high.load(Ordering::Acquire),
            ))
        } else {
            None
        };

        let mut transfer: Vec<Cell> = Vec::new();
        let mut batch_revision = 0u64;

        for cell in cells {
            if cell.key.revision > batch_revision {
                batch_revision = cell.key.revision;
            }

            if let Some((split_row, off_high)) = &departing {
                let is_departing = if *off_high {
                    cell.key.row.as_slice() > split_row.as_slice()
                } else {
                    cell.key.row.as_slice() <= split_row.as_slice()
                };
                if is_departing {
                    transfer.push(cell.clone());
                    self.count_cell(&cell.key.flag);
                    continue;
                }
            }

            self.dispatch_to_caches(cell, &by_family, &access_groups)?;
            self.count_cell(&cell.key.flag);
        }

        if !transfer.is_empty() {
            let log = split_guard
                .as_ref()
                .ok_or_else(|| RangeError::Internal("transfer log vanished mid-batch".into()))?;
            log.append(&table, transfer)?;
        }
        drop(split_guard);

        let mut inner = self.lock_inner()?;
        if batch_revision > inner.latest_revision {
            inner.latest_revision = batch_revision;
        }
        Ok(())
    }

    fn dispatch_to_caches(
        &self,
        cell: &Cell,
        by_family: &HashMap<u8, Arc<AccessGroup>>,
        access_groups: &[Arc<AccessGroup>],
    ) -> Result<(), RangeError> {
        if cell.key.flag == KeyFlag::DeleteRow {
            for ag in access_groups {
                ag.add(cell.key.clone(), cell.value.clone())?;
            }
            return Ok(());
        }

        let ag = by_family.get(&cell.key.column_family).ok_or_else(|| {
            RangeError::InvalidArgument(format!(
                "unknown column family code {}",
                cell.key.column_family
            ))
        })?;
        ag.add(cell.key.clone(), cell.value.clone())?;
        Ok(())
    }

    fn count_cell(&self, flag: &KeyFlag) {
        match flag.delete_index() {
            None => {
                self.added_inserts.fetch_add(1, Ordering::Relaxed);
            }
            Some(index) => {
                self.added_deletes[index].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Builds a merged scanner over every access group the scan touches.
    ///
    /// Construction passes the scan barrier in shared mode and snapshots
    /// the access-group vector; cell retrieval afterwards is unaffected
    /// by concurrent splits or compactions.
    pub fn create_scanner(&self, spec: &ScanSpec) -> Result<MergeScanner, RangeError> {
        let _pass = self.scan_barrier.enter();

        let (schema, access_groups) = {
            let schema = self.lock_schema()?;
            (Arc::clone(&schema.schema), schema.access_groups.clone())
        };

        let mut children: Vec<Box<dyn Iterator<Item = Cell>>> = Vec::new();
        for ag in &access_groups {
            if ag.include_in_scan(spec) {
                ag.create_scanners(spec, &mut children)?;
            }
        }

        Ok(MergeScanner::new(
            children,
            ColumnPolicies::from_schema(&schema),
            spec.return_deletes,
            now_micros(),
        ))
    }

    // --------------------------------------------------------------------------------------------
    // Reporting
    // --------------------------------------------------------------------------------------------

    /// Total cell store bytes across access groups.
    pub fn disk_usage(&self) -> u64 {
        self.access_group_snapshot()
            .iter()
            .map(|ag| ag.disk_usage())
            .sum()
    }

    /// Total cache bytes across access groups.
    pub fn memory_usage(&self) -> u64 {
        self.access_group_snapshot()
            .iter()
            .map(|ag| ag.memory_usage() as u64)
            .sum()
    }

    /// Whether this range wants maintenance attention.
    pub fn need_maintenance(&self) -> bool {
        let access_groups = self.access_group_snapshot();
        let mut disk_total = 0u64;
        let mut needed = false;

        for ag in &access_groups {
            let (mem, disk) = ag.space_usage();
            disk_total += disk;
            if mem >= self.ctx.config.access_group_max_mem {
                needed = true;
            }
        }

        if self.is_root || self.table().is_metadata() {
            if self.ctx.config.range_metadata_max_bytes != 0
                && disk_total >= self.ctx.config.range_metadata_max_bytes
            {
                needed = true;
            }
        } else if disk_total >= self.ctx.config.range_max_bytes {
            needed = true;
        }
        needed
    }

    /// True once the range has been dropped; polled by maintenance.
    pub fn cancel_maintenance(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Marks the range dropped and journals the unload.
    pub fn unload(&self) -> Result<(), RangeError> {
        self.dropped.store(true, Ordering::Release);
        let table = self.table();
        let spec = self.spec();
        self.ctx.metalog.log_range_removed(&table, &spec)?;
        info!(name = %self.name(), "range unloaded");
        Ok(())
    }

    /// Gathers the maintenance snapshot. Also performs the deferred
    /// `Files` rewrite recorded at load time — maintenance is the first
    /// safe point after startup.
    pub fn get_maintenance_data(&self) -> MaintenanceData {
        if self.files_update_needed.swap(false, Ordering::AcqRel) {
            for ag in self.access_group_snapshot() {
                if let Err(e) = ag.publish_file_list() {
                    warn!(name = %self.name(), error = %e, "deferred Files rewrite failed");
                    self.files_update_needed.store(true, Ordering::Release);
                    break;
                }
            }
        }

        let access_groups: Vec<AgMaintenanceData> = self
            .access_group_snapshot()
            .iter()
            .map(|ag| {
                let (memory, disk) = ag.space_usage();
                AgMaintenanceData {
                    name: ag.name().to_string(),
                    memory,
                    disk,
                    needs_compaction: memory >= self.ctx.config.access_group_max_mem,
                }
            })
            .collect();

        let disk_usage: u64 = access_groups.iter().map(|ag| ag.disk).sum();
        let memory_usage: u64 = access_groups.iter().map(|ag| ag.memory as u64).sum();
        let soft_limit = self.state().soft_limit;

        MaintenanceData {
            table_id: self.table().id,
            is_root: self.is_root,
            busy: self.maintenance_guard.in_progress(),
            disk_usage,
            memory_usage,
            soft_limit,
            needs_split: !self.is_root && disk_usage >= soft_limit,
            compaction_needed: access_groups.iter().any(|ag| ag.needs_compaction),
            last_error: self.last_error(),
            access_groups,
        }
    }

    /// Point-in-time statistics.
    pub fn statistics(&self) -> RangeStats {
        let access_groups = self.access_group_snapshot();
        let mut collisions = 0u64;
        let mut cached = 0u64;
        let mut disk = 0u64;
        let mut memory = 0u64;
        for ag in &access_groups {
            collisions += ag.collision_count();
            cached += ag.cached_count() as u64;
            let (mem, d) = ag.space_usage();
            memory += mem as u64;
            disk += d;
        }

        RangeStats {
            table: self.table(),
            spec: self.spec(),
            added_inserts: self.added_inserts.load(Ordering::Relaxed),
            added_deletes: [
                self.added_deletes[0].load(Ordering::Relaxed),
                self.added_deletes[1].load(Ordering::Relaxed),
                self.added_deletes[2].load(Ordering::Relaxed),
            ],
            collisions,
            cached_cells: cached,
            disk_usage: disk,
            memory_usage: memory,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Runs one compaction round; `major` merges every store of every
    /// group, otherwise only groups over their cache limit are flushed.
    pub fn compact(&self, major: bool) -> Result<(), RangeError> {
        let _activator = self.maintenance_guard.activate();
        match self.run_compaction(major) {
            Err(RangeError::Cancelled) => Ok(()),
            other => other,
        }
    }

    fn run_compaction(&self, major: bool) -> Result<(), RangeError> {
        if self.cancel_maintenance() {
            return Err(RangeError::Cancelled);
        }

        let access_groups = self.access_group_snapshot();

        {
            let _hold = self.update_barrier.activate();
            for ag in &access_groups {
                if major || ag.needs_compaction() {
                    ag.initiate_compaction()?;
                }
            }
        }

        for ag in &access_groups {
            if self.cancel_maintenance() {
                return Err(RangeError::Cancelled);
            }
            if ag.compaction_initiated() {
                ag.run_compaction(major)?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Split
    // --------------------------------------------------------------------------------------------

    /// Drives the split machine from its current state to completion.
    pub fn split(&self) -> Result<(), RangeError> {
        let _activator = self.maintenance_guard.activate();

        if self.is_root {
            return Err(RangeError::Internal("root range cannot split".into()));
        }

        let result = (|| {
            let kind = self.state().state;
            match kind {
                RangeStateKind::Steady => {
                    self.split_install_log()?;
                    self.split_compact_and_shrink()?;
                    self.split_notify_master()
                }
                RangeStateKind::SplitLogInstalled => {
                    self.split_compact_and_shrink()?;
                    self.split_notify_master()
                }
                RangeStateKind::SplitShrunk => self.split_notify_master(),
            }
        })();

        match result {
            Ok(()) => {
                info!(name = %self.name(), "split complete");
                Ok(())
            }
            Err(RangeError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Phase 1: choose the split row, create and install the transfer
    /// log, freeze every cache, and journal `SPLIT_LOG_INSTALLED`.
    fn split_install_log(&self) -> Result<(), RangeError> {
        if self.cancel_maintenance() {
            return Err(RangeError::Cancelled);
        }

        let access_groups = self.access_group_snapshot();
        let has_stores = access_groups.iter().any(|ag| ag.disk_usage() > 0);

        // With nothing on disk, the caches are the complete row set; a
        // range holding fewer than two distinct rows cannot split.
        let mut cached: Vec<Vec<u8>> = Vec::new();
        if !has_stores {
            for ag in &access_groups {
                ag.get_cached_rows(&mut cached)?;
            }
            cached.sort();
            cached.dedup();
            if cached.len() < 2 {
                return Err(self.row_overflow());
            }
        }

        let mut candidates: Vec<Vec<u8>> = Vec::new();
        for ag in &access_groups {
            ag.get_split_rows(&mut candidates, false)?;
        }
        // Any group without a suggestion: retry the hard way.
        if candidates.len() < access_groups.len() {
            for ag in &access_groups {
                ag.get_split_rows(&mut candidates, true)?;
            }
        }
        candidates.sort();

        let (start_row, end_row) = {
            let inner = self.lock_inner()?;
            (inner.start_row.clone(), inner.end_row.clone())
        };

        let valid = |row: &[u8]| row > start_row.as_slice() && row < end_row.as_slice();

        // A cache-derived median equal to the greatest known row would
        // leave the high side empty; step down one distinct row.
        let step_down = |median: Vec<u8>, rows: &[Vec<u8>]| -> Vec<u8> {
            if !has_stores
                && rows.last().map(Vec::as_slice) == Some(median.as_slice())
                && rows.len() >= 2
            {
                rows[rows.len() - 2].clone()
            } else {
                median
            }
        };

        let mut split_row: Option<Vec<u8>> = None;
        if !candidates.is_empty() {
            let median = step_down(candidates[candidates.len() / 2].clone(), &cached);
            if valid(&median) {
                split_row = Some(median);
            } else {
                // Fall back to the median over every cached row.
                if cached.is_empty() {
                    for ag in &access_groups {
                        ag.get_cached_rows(&mut cached)?;
                    }
                    cached.sort();
                    cached.dedup();
                }
                if cached.len() >= 2 {
                    let median = step_down(cached[cached.len() / 2].clone(), &cached);
                    if valid(&median) {
                        split_row = Some(median);
                    }
                }
            }
        }

        let Some(split_row) = split_row else {
            return Err(self.row_overflow());
        };

        {
            let mut inner = self.lock_inner()?;
            inner.split_row = split_row.clone();
        }

        let transfer_dir = self.ctx.transfer_log_dir(&split_row);

        // The departing predicate in add_cells reads split_point the
        // moment it observes an installed transfer log, so the state
        // fields must be in place before the log becomes visible.
        let off_high = self.split_off_high.load(Ordering::Acquire);
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            state.split_point = split_row.clone();
            state.old_boundary_row = if off_high {
                end_row.clone()
            } else {
                start_row.clone()
            };
            state.transfer_log = Some(transfer_dir.display().to_string());
        }

        if transfer_dir.exists()
            && let Err(e) = fs::remove_dir_all(&transfer_dir)
        {
            error!(dir = %transfer_dir.display(), error = %e, "cannot remove stale transfer log directory");
            std::process::abort();
        }
        if let Err(e) = fs::create_dir_all(&transfer_dir) {
            error!(dir = %transfer_dir.display(), error = %e, "cannot create transfer log directory");
            std::process::abort();
        }

        // Freeze caches and install the transfer log under the update
        // barrier; from here on departing-side writes are duplicated.
        {
            let _hold = self.update_barrier.activate();
            for ag in &access_groups {
                ag.initiate_compaction()?;
            }
            let mut split_log = self
                .split_log
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            *split_log = Some(CommitLog::open(&transfer_dir)?);
        }

        let (table, spec, state) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            state.state = RangeStateKind::SplitLogInstalled;
            (self.table(), self.spec(), state.clone())
        };

        self.write_metalog_retrying("SPLIT_LOG_INSTALLED", || {
            self.ctx.metalog.log_split_start(&table, &spec, &state)
        });

        info!(
            name = %self.name(),
            split_row = %HexRow(&split_row),
            transfer_log = %transfer_dir.display(),
            "split log installed"
        );

        self.ctx.failure.maybe_fail("split-1")?;
        Ok(())
    }

    /// Phase 2: flush the frozen caches, publish both METADATA rows in
    /// one batch, narrow the range under both barriers, and journal
    /// `SPLIT_SHRUNK`.
    fn split_compact_and_shrink(&self) -> Result<(), RangeError> {
        if self.cancel_maintenance() {
            return Err(RangeError::Cancelled);
        }

        let access_groups = self.access_group_snapshot();

        // Stabilize the pre-split interval on disk.
        for ag in &access_groups {
            if ag.compaction_initiated() {
                ag.run_compaction(false)?;
            }
        }

        let off_high = self.split_off_high.load(Ordering::Acquire);
        let table = self.table();
        let (old_start, old_end) = {
            let inner = self.lock_inner()?;
            (inner.start_row.clone(), inner.end_row.clone())
        };
        let split_row = self.state().split_point;

        // Both METADATA rows in one durable batch.
        let mut mutations = Vec::new();
        let existing_row = metadata_row_key(table.id, &old_end);
        mutations.push(MetadataMutation::SetStartRow {
            row: existing_row.clone(),
            start_row: split_row.clone(),
        });
        if off_high {
            for ag in &access_groups {
                let files = ag.get_file_list()?;
                if !files.is_empty() {
                    mutations.push(MetadataMutation::SetFiles {
                        row: existing_row.clone(),
                        access_group: ag.name().to_string(),
                        files,
                    });
                }
            }
        }

        let new_row = metadata_row_key(table.id, &split_row);
        mutations.push(MetadataMutation::SetStartRow {
            row: new_row.clone(),
            start_row: old_start.clone(),
        });
        for ag in &access_groups {
            let files = ag.get_file_list()?;
            if !files.is_empty() {
                mutations.push(MetadataMutation::SetFiles {
                    row: new_row.clone(),
                    access_group: ag.name().to_string(),
                    files,
                });
            }
        }
        if off_high {
            mutations.push(MetadataMutation::SetLocation {
                row: new_row,
                location: self.ctx.location.clone(),
            });
        }

        if let Err(e) = self.ctx.metadata.apply(mutations) {
            error!(name = %self.name(), error = %e, "METADATA update after split failed");
            std::process::abort();
        }

        // Narrow the range. Both barriers held; O(ms).
        {
            let _updates = self.update_barrier.activate();
            let _scans = self.scan_barrier.activate();

            {
                let mut inner = self.lock_inner()?;
                if off_high {
                    inner.end_row = split_row.clone();
                } else {
                    inner.start_row = split_row.clone();
                }
                inner.name = range_name(&table.name, &inner.start_row, &inner.end_row);
                inner.split_row.clear();
            }

            let keep_high = !off_high;
            for ag in &access_groups {
                ag.shrink(&split_row, keep_high)?;
            }

            let mut split_log = self
                .split_log
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            if let Some(log) = split_log.take()
                && let Err(e) = log.close()
            {
                warn!(name = %self.name(), error = %e, "problem closing transfer log");
            }
        }

        // A high split changed this range's end row; its future cell
        // stores land in a fresh per-range directory.
        if off_high {
            let new_end = self.spec().end_row;
            for ag in &access_groups {
                fs::create_dir_all(self.ctx.access_group_dir(&table.name, ag.name(), &new_end))?;
            }
        }

        let (spec, state) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            state.state = RangeStateKind::SplitShrunk;
            (self.spec(), state.clone())
        };

        self.write_metalog_retrying("SPLIT_SHRUNK", || {
            self.ctx.metalog.log_split_shrunk(&table, &spec, &state)
        });

        info!(name = %self.name(), "range shrunk to retained side");

        self.ctx.failure.maybe_fail("split-2")?;
        Ok(())
    }

    /// Phase 3: report the sibling to the master, double the soft limit,
    /// and journal `SPLIT_DONE`.
    fn split_notify_master(&self) -> Result<(), RangeError> {
        if self.cancel_maintenance() {
            return Err(RangeError::Cancelled);
        }

        let state = self.state();
        let spec = self.spec();
        let off_high = self.split_off_high.load(Ordering::Acquire);

        let sibling = if off_high {
            RangeSpec::new(spec.end_row.clone(), state.old_boundary_row.clone())
        } else {
            RangeSpec::new(state.old_boundary_row.clone(), spec.start_row.clone())
        };

        // Pick up the latest schema generation for the report.
        let table = {
            let mut schema = self.lock_schema()?;
            schema.table.generation = schema.schema.generation;
            schema.table.clone()
        };

        let mut soft_limit = state.soft_limit;
        if soft_limit < self.ctx.config.range_max_bytes {
            soft_limit = (soft_limit * 2).min(self.ctx.config.range_max_bytes);
        }

        let transfer_log = state
            .transfer_log
            .clone()
            .ok_or_else(|| RangeError::Internal("split state missing transfer log".into()))?;

        info!(
            name = %self.name(),
            sibling_start = %HexRow(&sibling.start_row),
            sibling_end = %HexRow(&sibling.end_row),
            "reporting split to master"
        );

        self.ctx.master.report_split(
            &table,
            &sibling,
            Path::new(&transfer_log),
            soft_limit,
        )?;

        self.ctx.failure.maybe_fail("split-3")?;

        let (done_spec, done_state) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            state.soft_limit = soft_limit;
            (self.spec(), state.clone())
        };

        self.write_metalog_retrying("SPLIT_DONE", || {
            self.ctx
                .metalog
                .log_split_done(&table, &done_spec, &done_state)
        });

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            state.clear();
        }

        self.ctx.failure.maybe_fail("split-4")?;
        Ok(())
    }

    fn row_overflow(&self) -> RangeError {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(ErrorCode::RowOverflow);
        }
        RangeError::RowOverflow(format!(
            "unable to determine split row for range {}",
            self.name()
        ))
    }

    /// Journal write with bounded retries; exhaustion is fatal so a
    /// fresh instance can recover from the journal.
    fn write_metalog_retrying<F>(&self, what: &str, write: F)
    where
        F: Fn() -> Result<(), MetaLogError>,
    {
        let retries = self.ctx.config.metalog_write_retries.max(1);
        for attempt in 1..=retries {
            match write() {
                Ok(()) => return,
                Err(e) if attempt < retries => {
                    warn!(
                        name = %self.name(),
                        record = what,
                        attempt,
                        error = %e,
                        "range journal write failed, retrying"
                    );
                    std::thread::sleep(self.ctx.config.metalog_retry_delay);
                }
                Err(e) => {
                    error!(
                        name = %self.name(),
                        record = what,
                        error = %e,
                        "range journal write failed permanently"
                    );
                    std::process::abort();
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Reconstructs in-flight split state after a restart. Must run
    /// before the range serves traffic; the range is offline, so no
    /// locking subtleties apply.
    pub fn recovery_finalize(&self) -> Result<(), RangeError> {
        let state = self.state();

        if state.state == RangeStateKind::SplitLogInstalled {
            let transfer_log = state
                .transfer_log
                .clone()
                .ok_or_else(|| RangeError::Internal("split state missing transfer log".into()))?;
            let dir = Path::new(&transfer_log);

            self.replay_transfer_log(dir)?;

            let access_groups = self.access_group_snapshot();
            for ag in &access_groups {
                ag.initiate_compaction()?;
            }

            let mut split_log = self
                .split_log
                .lock()
                .map_err(|_| RangeError::Internal("Mutex poisoned".into()))?;
            *split_log = Some(CommitLog::open(dir)?);

            let mut inner = self.lock_inner()?;
            inner.split_row = state.split_point.clone();

            info!(
                name = %inner.name,
                split_row = %HexRow(&state.split_point),
                transfer_log = %dir.display(),
                "restored split state to SPLIT_LOG_INSTALLED"
            );
        }

        for ag in self.access_group_snapshot() {
            ag.recovery_finalize()?;
        }
        Ok(())
    }

    /// Replays the shared commit log into this range's caches,
    /// restoring writes that had not been flushed before a restart.
    ///
    /// Blocks of other tables and cells outside the current boundaries
    /// are skipped — the shared log carries every range's writes. Cells
    /// already persisted in stores collapse in the merge path, so the
    /// replay is idempotent.
    pub fn replay_commit_log(&self, dir: &Path) -> Result<(), RangeError> {
        let (table, by_family, access_groups) = {
            let schema = self.lock_schema()?;
            (
                schema.table.clone(),
                schema.by_family.clone(),
                schema.access_groups.clone(),
            )
        };
        let (start_row, end_row) = {
            let inner = self.lock_inner()?;
            (inner.start_row.clone(), inner.end_row.clone())
        };

        let mut reader = CommitLogReader::open(dir)?;
        let mut count = 0usize;
        let mut max_revision = 0u64;

        while let Some(block) = reader.next_block() {
            let block = block?;
            if block.table.name != table.name {
                continue;
            }
            for cell in block.cells {
                let row = cell.key.row.as_slice();
                if row <= start_row.as_slice() || row > end_row.as_slice() {
                    continue;
                }
                if cell.key.revision > max_revision {
                    max_revision = cell.key.revision;
                }
                self.dispatch_to_caches(&cell, &by_family, &access_groups)?;
                count += 1;
            }
        }

        let mut inner = self.lock_inner()?;
        if max_revision > inner.latest_revision {
            inner.latest_revision = max_revision;
        }
        info!(name = %inner.name, updates = count, "commit log replayed");
        Ok(())
    }

    /// Replays a transfer log into this range's caches.
    ///
    /// Used on recovery (undoing a half-done phase 1) and by a freshly
    /// assigned sibling absorbing its departed writes. Replay is
    /// idempotent: keys carry their revisions and the merge path
    /// collapses duplicates.
    pub fn replay_transfer_log(&self, dir: &Path) -> Result<(), RangeError> {
        let (table, by_family, access_groups) = {
            let schema = self.lock_schema()?;
            (
                schema.table.clone(),
                schema.by_family.clone(),
                schema.access_groups.clone(),
            )
        };

        let mut reader = CommitLogReader::open(dir)?;
        let mut blocks = 0usize;
        let mut count = 0usize;
        let mut max_revision = 0u64;

        while let Some(block) = reader.next_block() {
            let block = block?;

            if block.table.name != table.name {
                return Err(RangeError::CorruptCommitLog(format!(
                    "table name mismatch in transfer log replay: '{}' != '{}'",
                    table.name, block.table.name
                )));
            }

            for cell in block.cells {
                if cell.key.revision > max_revision {
                    max_revision = cell.key.revision;
                }
                self.dispatch_to_caches(&cell, &by_family, &access_groups)?;
                count += 1;
            }
            blocks += 1;
        }

        {
            let mut inner = self.lock_inner()?;
            if max_revision > inner.latest_revision {
                inner.latest_revision = max_revision;
            }
            info!(
                name = %inner.name,
                updates = count,
                blocks,
                dir = %dir.display(),
                "transfer log replayed"
            );
        }

        // Counters restart with the replayed state.
        self.added_inserts.store(0, Ordering::Relaxed);
        for counter in &self.added_deletes {
            counter.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Schema updates
    // --------------------------------------------------------------------------------------------

    /// Applies a newer schema generation.
    ///
    /// Existing access groups receive their new column lists; groups
    /// new to the schema are created empty. A group dropped from the
    /// schema keeps its data but loses its routing until the range is
    /// reloaded — removal is deferred, not performed here.
    pub fn update_schema(&self, new_schema: Arc<Schema>) -> Result<(), RangeError> {
        let mut schema = self.lock_schema()?;

        if new_schema.generation <= schema.schema.generation {
            return Ok(());
        }

        let (start_row, end_row) = {
            let inner = self.lock_inner()?;
            (inner.start_row.clone(), inner.end_row.clone())
        };

        for ag_spec in &new_schema.access_groups {
            match schema
                .access_groups
                .iter()
                .find(|ag| ag.name() == ag_spec.name)
            {
                Some(ag) => {
                    ag.update_schema(Arc::clone(&new_schema), ag_spec)?;
                }
                None => {
                    let ag = Arc::new(AccessGroup::new(
                        Arc::clone(&self.ctx),
                        schema.table.clone(),
                        Arc::clone(&new_schema),
                        ag_spec,
                        &start_row,
                        &end_row,
                        self.is_root,
                    ));
                    schema.access_groups.push(ag);
                }
            }
        }

        schema.by_family.clear();
        for ag_spec in &new_schema.access_groups {
            if let Some(ag) = schema
                .access_groups
                .iter()
                .find(|ag| ag.name() == ag_spec.name)
                .map(Arc::clone)
            {
                for cf in &ag_spec.column_families {
                    if !cf.deleted {
                        schema.by_family.insert(cf.id, Arc::clone(&ag));
                    }
                }
            }
        }

        info!(
            name = %self.name(),
            generation = new_schema.generation,
            "schema updated"
        );
        schema.schema = new_schema;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn load_cell_stores(&self) -> Result<(), RangeError> {
        let (table, access_groups) = {
            let schema = self.lock_schema()?;
            (schema.table.clone(), schema.access_groups.clone())
        };
        let (start_row, end_row) = {
            let inner = self.lock_inner()?;
            (inner.start_row.clone(), inner.end_row.clone())
        };

        let mut metadata = if self.is_root {
            Metadata::root(&self.ctx.root)
        } else {
            Metadata::normal(Arc::clone(&self.ctx.metadata), table.id, &end_row)
        };
        metadata.reset_files_scan()?;

        let mut max_revision = 0u64;

        while let Some((ag_name, files)) = metadata.get_next_files() {
            let ag = access_groups
                .iter()
                .find(|ag| ag.name() == ag_name)
                .ok_or_else(|| {
                    RangeError::Internal(format!(
                        "unrecognized access group '{ag_name}' in METADATA for table '{}'",
                        table.name
                    ))
                })?;

            for entry in files.split(';') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                // Disabled entries are skipped; rewriting the Files
                // column now would deadlock startup, so it is deferred
                // to the first maintenance pass.
                if let Some(stripped) = entry.strip_prefix('#') {
                    debug!(file = stripped, "skipping disabled cell store entry");
                    self.files_update_needed.store(true, Ordering::Release);
                    continue;
                }

                let store = cellstore::open_and_load(Path::new(entry), &start_row, &end_row)?;
                if store.revision() > max_revision {
                    max_revision = store.revision();
                }
                ag.add_cell_store(store)?;
            }
        }

        let mut inner = self.lock_inner()?;
        if max_revision > inner.latest_revision {
            inner.latest_revision = max_revision;
        }
        Ok(())
    }

    fn access_group_snapshot(&self) -> Vec<Arc<AccessGroup>> {
        self.lock_schema()
            .map(|schema| schema.access_groups.clone())
            .unwrap_or_default()
    }

    fn lock_schema(&self) -> Result<std::sync::MutexGuard<'_, SchemaInner>, RangeError> {
        self.schema
            .lock()
            .map_err(|_| RangeError::Internal("schema mutex poisoned".into()))
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, RangeInner>, RangeError> {
        self.inner
            .lock()
            .map_err(|_| RangeError::Internal("range mutex poisoned".into()))
    }
}

/// `<table>[start..end]` with lossy row rendering.
fn range_name(table: &str, start_row: &[u8], end_row: &[u8]) -> String {
    format!(
        "{}[{}..{}]",
        table,
        String::from_utf8_lossy(start_row),
        String::from_utf8_lossy(end_row)
    )
}
