//! # AccessGroup
//!
//! One column-family group inside a range: a mutable [`CellCache`], an
//! optional frozen cache awaiting flush, and an ordered list of
//! immutable [`CellStore`]s.
//!
//! ## Compaction protocol
//!
//! Compaction is split into two steps so the range can bound how long it
//! holds its write barrier:
//!
//! 1. [`AccessGroup::initiate_compaction`] — under the range's update
//!    barrier, the live cache is frozen and a fresh empty cache swapped
//!    in. O(pointer swap).
//! 2. [`AccessGroup::run_compaction`] — outside every barrier, the
//!    frozen cache (minor) or the frozen cache plus all stores (major)
//!    is merge-scanned into a new cell store, which atomically replaces
//!    the consumed inputs. The METADATA `Files` column is rewritten on
//!    success.
//!
//! Scanners hold `Arc` references to the caches and stores they were
//! built from, so neither the swap in step 1 nor the list replacement in
//! step 2 invalidates a running scan.

#[cfg(test)]
mod tests;

use std::{fs, io, sync::Arc, sync::Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cell::{Cell, CellKey, ScanSpec, TableIdentifier};
use crate::cellcache::{CellCache, CellCacheError};
use crate::cellstore::{
    self, CellStore, CellStoreError, CellStoreWriter, ScanErrorHandle, WriterOptions,
};
use crate::context::{ServerContext, now_micros};
use crate::merge::{ColumnPolicies, MergeScanner};
use crate::metadata::{Metadata, MetadataError};
use crate::schema::{AccessGroupSpec, Schema};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by access group operations.
#[derive(Debug, Error)]
pub enum AccessGroupError {
    /// Cell cache failure.
    #[error("Cell cache error: {0}")]
    Cache(#[from] CellCacheError),

    /// Cell store failure.
    #[error("Cell store error: {0}")]
    CellStore(#[from] CellStoreError),

    /// Metadata failure.
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// AccessGroup
// ------------------------------------------------------------------------------------------------

/// One access group of one range.
pub struct AccessGroup {
    name: String,
    table: TableIdentifier,
    is_root: bool,
    ctx: Arc<ServerContext>,
    inner: Mutex<AgInner>,
}

struct AgInner {
    schema: Arc<Schema>,

    /// Live column-family codes routed to this group.
    columns: Vec<u8>,

    cache: Arc<CellCache>,
    frozen: Option<Arc<CellCache>>,
    stores: Vec<Arc<CellStore>>,

    compaction_initiated: bool,
    next_file_id: u32,

    start_row: Vec<u8>,
    end_row: Vec<u8>,
}

impl std::fmt::Debug for AccessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGroup")
            .field("name", &self.name)
            .field("table", &self.table.name)
            .finish_non_exhaustive()
    }
}

impl AccessGroup {
    /// Creates an empty access group for a range with the given bounds.
    pub fn new(
        ctx: Arc<ServerContext>,
        table: TableIdentifier,
        schema: Arc<Schema>,
        spec: &AccessGroupSpec,
        start_row: &[u8],
        end_row: &[u8],
        is_root: bool,
    ) -> Self {
        let columns = spec
            .column_families
            .iter()
            .filter(|cf| !cf.deleted)
            .map(|cf| cf.id)
            .collect();

        Self {
            name: spec.name.clone(),
            table,
            is_root,
            ctx,
            inner: Mutex::new(AgInner {
                schema,
                columns,
                cache: Arc::new(CellCache::new()),
                frozen: None,
                stores: Vec::new(),
                compaction_initiated: false,
                next_file_id: 1,
                start_row: start_row.to_vec(),
                end_row: end_row.to_vec(),
            }),
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live column-family codes routed here.
    pub fn columns(&self) -> Vec<u8> {
        self.lock().map(|inner| inner.columns.clone()).unwrap_or_default()
    }

    /// Inserts one cell into the live cache. The caller holds the
    /// range's update barrier in shared mode.
    pub fn add(&self, key: CellKey, value: Vec<u8>) -> Result<(), AccessGroupError> {
        let cache = {
            let inner = self.lock()?;
            Arc::clone(&inner.cache)
        };
        cache.add(key, value)?;
        Ok(())
    }

    /// `(cache bytes, cell store disk bytes)`.
    pub fn space_usage(&self) -> (usize, u64) {
        match self.lock() {
            Ok(inner) => {
                let mut mem = inner.cache.memory_used();
                if let Some(frozen) = &inner.frozen {
                    mem += frozen.memory_used();
                }
                let disk = inner.stores.iter().map(|s| s.disk_usage()).sum();
                (mem, disk)
            }
            Err(_) => (0, 0),
        }
    }

    /// Whether the cache has grown past the per-group memory limit.
    pub fn needs_compaction(&self) -> bool {
        let (mem, _) = self.space_usage();
        mem >= self.ctx.config.access_group_max_mem
    }

    /// Total cell store bytes.
    pub fn disk_usage(&self) -> u64 {
        self.space_usage().1
    }

    /// Total cache bytes (live + frozen).
    pub fn memory_usage(&self) -> usize {
        self.space_usage().0
    }

    /// Exact-key collision count across the live cache.
    pub fn collision_count(&self) -> u64 {
        self.lock()
            .map(|inner| inner.cache.collision_count())
            .unwrap_or(0)
    }

    /// Cells currently cached (live + frozen).
    pub fn cached_count(&self) -> usize {
        self.lock()
            .map(|inner| {
                inner.cache.cell_count()
                    + inner.frozen.as_ref().map_or(0, |frozen| frozen.cell_count())
            })
            .unwrap_or(0)
    }

    /// Freezes the live cache and swaps in an empty one.
    ///
    /// Called under the range's update barrier (writer mode), so no
    /// `add` races the swap. Calling again before the pending frozen
    /// cache is consumed is a no-op; writes since the first freeze stay
    /// in the live cache for the next round.
    pub fn initiate_compaction(&self) -> Result<(), AccessGroupError> {
        let mut inner = self.lock()?;
        if inner.compaction_initiated && inner.frozen.is_some() {
            return Ok(());
        }
        let fresh = Arc::new(CellCache::new());
        let frozen = std::mem::replace(&mut inner.cache, fresh);
        inner.frozen = Some(frozen);
        inner.compaction_initiated = true;
        Ok(())
    }

    /// Whether a frozen cache is awaiting [`AccessGroup::run_compaction`].
    pub fn compaction_initiated(&self) -> bool {
        self.lock()
            .map(|inner| inner.compaction_initiated)
            .unwrap_or(false)
    }

    /// Merges the frozen cache (minor) or the frozen cache plus every
    /// store (major) into a new cell store. Runs outside all barriers.
    ///
    /// Returns `true` when a new store was produced.
    pub fn run_compaction(&self, major: bool) -> Result<bool, AccessGroupError> {
        // Snapshot inputs and claim a file id.
        let (frozen, consumed, schema, start_row, end_row, file_id) = {
            let mut inner = self.lock()?;
            if !inner.compaction_initiated {
                return Ok(false);
            }
            let file_id = inner.next_file_id;
            inner.next_file_id += 1;
            (
                inner.frozen.clone(),
                if major { inner.stores.clone() } else { Vec::new() },
                Arc::clone(&inner.schema),
                inner.start_row.clone(),
                inner.end_row.clone(),
                file_id,
            )
        };

        let frozen_cells = match &frozen {
            Some(frozen) => frozen.cells_for_flush()?,
            None => Vec::new(),
        };

        // Nothing to write and nothing to merge away.
        if frozen_cells.is_empty() && consumed.len() <= 1 {
            let mut inner = self.lock()?;
            inner.frozen = None;
            inner.compaction_initiated = false;
            return Ok(false);
        }

        let scan = ScanSpec::rows(start_row.clone(), end_row.clone());
        let mut children: Vec<Box<dyn Iterator<Item = Cell>>> = Vec::new();
        let mut error_handles: Vec<ScanErrorHandle> = Vec::new();

        children.push(Box::new(frozen_cells.into_iter()));
        for store in &consumed {
            let scanner = store.create_scanner(&scan);
            error_handles.push(scanner.error_handle());
            children.push(Box::new(scanner));
        }

        // Minor compactions must carry tombstones forward; a major
        // compaction consumes every store of the group, so nothing a
        // tombstone masks can survive elsewhere.
        let mut merged = MergeScanner::new(
            children,
            ColumnPolicies::from_schema(&schema),
            !major,
            now_micros(),
        );

        let dir = self
            .ctx
            .access_group_dir(&self.table.name, &self.name, &end_row);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("cs{file_id}"));

        let max_entries = frozen.as_ref().map_or(0, |f| f.cell_count())
            + consumed.iter().map(|s| s.total_entries() as usize).sum::<usize>();

        let mut writer = CellStoreWriter::create(
            &path,
            max_entries.max(1),
            WriterOptions {
                blocksize: self.ctx.config.block_size,
                bloom_mode: self.ctx.config.bloom_mode,
                ..WriterOptions::default()
            },
        )?;

        let mut written = 0u64;
        for cell in merged.by_ref() {
            writer.add(&cell.key, &cell.value)?;
            written += 1;
        }

        // A short stream from a corrupt store must abandon the action.
        for handle in &error_handles {
            if let Ok(mut slot) = handle.lock()
                && let Some(error) = slot.take()
            {
                return Err(error.into());
            }
        }

        let new_store = if written > 0 {
            let table = TableIdentifier {
                id: self.table.id,
                generation: schema.generation,
                name: self.table.name.clone(),
            };
            writer.finalize(&table)?;
            Some(Arc::new(cellstore::open_and_load(&path, &start_row, &end_row)?))
        } else {
            // Everything resolved away; the writer's Drop removes the tmp.
            drop(writer);
            None
        };

        // Install the result.
        let files = {
            let mut inner = self.lock()?;
            if major {
                let consumed_ids: Vec<u32> = consumed.iter().map(|s| s.file_id()).collect();
                inner.stores.retain(|s| !consumed_ids.contains(&s.file_id()));
            }
            if let Some(store) = &new_store {
                inner.stores.push(Arc::clone(store));
            }
            inner.frozen = None;
            inner.compaction_initiated = false;
            file_list(&inner.stores)
        };

        self.write_files_column(&files)?;

        // Superseded files are deleted unless a sibling range still
        // references them (store files are shared across a split until
        // each side rewrites its own). Readers holding the old stores
        // keep valid mmaps either way.
        if major {
            for store in &consumed {
                let path_str = store.path().display().to_string();
                if self.file_referenced_in_metadata(&path_str)? {
                    debug!(path = %path_str, "superseded cell store still referenced, keeping");
                    continue;
                }
                if let Err(e) = fs::remove_file(store.path()) {
                    warn!(path = %store.path().display(), error = %e, "failed to remove superseded cell store");
                }
            }
        }

        info!(
            access_group = %self.name,
            table = %self.table.name,
            major,
            cells = written,
            path = %path.display(),
            "compaction complete"
        );

        Ok(new_store.is_some())
    }

    /// Narrows this group to one side of a split: reopens every store
    /// with the new bounds and drops cache entries on the departing side.
    ///
    /// Called with both range barriers held.
    pub fn shrink(&self, split_row: &[u8], keep_high: bool) -> Result<(), AccessGroupError> {
        let mut inner = self.lock()?;

        if keep_high {
            inner.start_row = split_row.to_vec();
        } else {
            inner.end_row = split_row.to_vec();
        }

        let (start_row, end_row) = (inner.start_row.clone(), inner.end_row.clone());
        let mut reopened = Vec::with_capacity(inner.stores.len());
        for store in &inner.stores {
            let store = cellstore::open_and_load(store.path(), &start_row, &end_row)?;
            reopened.push(Arc::new(store));
        }
        inner.stores = reopened;

        inner.cache.drop_side(split_row, keep_high)?;
        if let Some(frozen) = &inner.frozen {
            frozen.drop_side(split_row, keep_high)?;
        }

        debug!(
            access_group = %self.name,
            keep_high,
            "access group shrunk"
        );
        Ok(())
    }

    /// Appends candidate split rows.
    ///
    /// The easy path suggests the mid-block row of the largest store;
    /// the hard path scans the cache for its median row.
    pub fn get_split_rows(&self, rows: &mut Vec<Vec<u8>>, hard: bool) -> Result<(), AccessGroupError> {
        let inner = self.lock()?;

        if !hard {
            if let Some(store) = inner.stores.iter().max_by_key(|s| s.disk_usage())
                && let Some(row) = store.split_row()
            {
                rows.push(row);
            }
            return Ok(());
        }

        if let Some(row) = inner.cache.median_row()? {
            rows.push(row);
        } else if let Some(frozen) = &inner.frozen
            && let Some(row) = frozen.median_row()?
        {
            rows.push(row);
        }
        Ok(())
    }

    /// Appends every distinct cached row (live and frozen caches).
    pub fn get_cached_rows(&self, rows: &mut Vec<Vec<u8>>) -> Result<(), AccessGroupError> {
        let inner = self.lock()?;
        rows.extend(inner.cache.cached_rows()?);
        if let Some(frozen) = &inner.frozen {
            rows.extend(frozen.cached_rows()?);
        }
        Ok(())
    }

    /// Registers an existing store loaded from METADATA at range open.
    pub fn add_cell_store(&self, store: CellStore) -> Result<(), AccessGroupError> {
        let mut inner = self.lock()?;
        if store.file_id() >= inner.next_file_id {
            inner.next_file_id = store.file_id() + 1;
        }
        inner.stores.push(Arc::new(store));
        Ok(())
    }

    /// `;`-separated cell store path list, as written to METADATA.
    pub fn get_file_list(&self) -> Result<String, AccessGroupError> {
        let inner = self.lock()?;
        Ok(file_list(&inner.stores))
    }

    /// Rewrites this group's `Files` column from the current store list.
    /// Used for the deferred rewrite of entries filtered at load time.
    pub fn publish_file_list(&self) -> Result<(), AccessGroupError> {
        let files = self.get_file_list()?;
        self.write_files_column(&files)
    }

    /// Whether any of this group's families intersect the scan.
    pub fn include_in_scan(&self, spec: &ScanSpec) -> bool {
        match &spec.columns {
            None => true,
            Some(wanted) => self
                .lock()
                .map(|inner| inner.columns.iter().any(|code| wanted.contains(code)))
                .unwrap_or(false),
        }
    }

    /// Builds this group's child scanners for a merged scan: the live
    /// cache snapshot, the frozen cache snapshot, and one lazy scanner
    /// per store the Bloom filter cannot exclude.
    pub fn create_scanners(
        &self,
        spec: &ScanSpec,
        children: &mut Vec<Box<dyn Iterator<Item = Cell>>>,
    ) -> Result<(), AccessGroupError> {
        let (cache, frozen, stores, start_row, end_row) = {
            let inner = self.lock()?;
            (
                Arc::clone(&inner.cache),
                inner.frozen.clone(),
                inner.stores.clone(),
                inner.start_row.clone(),
                inner.end_row.clone(),
            )
        };

        let lower = if spec.start_row.as_slice() > start_row.as_slice() {
            spec.start_row.clone()
        } else {
            start_row
        };
        let upper = if spec.end_row.as_slice() < end_row.as_slice() {
            spec.end_row.clone()
        } else {
            end_row
        };

        let filter_spec = spec.clone();
        let cache_cells = cache.snapshot_range(&lower, &upper)?;
        children.push(Box::new(
            cache_cells
                .into_iter()
                .filter(move |cell| cell_wanted(&filter_spec, cell)),
        ));

        if let Some(frozen) = frozen {
            let filter_spec = spec.clone();
            let frozen_cells = frozen.snapshot_range(&lower, &upper)?;
            children.push(Box::new(
                frozen_cells
                    .into_iter()
                    .filter(move |cell| cell_wanted(&filter_spec, cell)),
            ));
        }

        for store in stores {
            if !store.may_contain(spec) {
                continue;
            }
            children.push(Box::new(store.create_scanner(spec)));
        }

        Ok(())
    }

    /// Applies a newer schema generation: refreshes the live column set.
    pub fn update_schema(
        &self,
        schema: Arc<Schema>,
        spec: &AccessGroupSpec,
    ) -> Result<(), AccessGroupError> {
        let mut inner = self.lock()?;
        inner.columns = spec
            .column_families
            .iter()
            .filter(|cf| !cf.deleted)
            .map(|cf| cf.id)
            .collect();
        inner.schema = schema;
        Ok(())
    }

    /// Post-recovery cleanup: a compaction flag with no frozen cache
    /// behind it (replay produced nothing) is dropped.
    pub fn recovery_finalize(&self) -> Result<(), AccessGroupError> {
        let mut inner = self.lock()?;
        if inner.compaction_initiated
            && inner.frozen.as_ref().is_none_or(|frozen| frozen.is_empty())
        {
            inner.frozen = None;
            inner.compaction_initiated = false;
        }
        Ok(())
    }

    /// Whether any METADATA row still lists `path` in a `Files` column.
    fn file_referenced_in_metadata(&self, path: &str) -> Result<bool, AccessGroupError> {
        if self.is_root {
            return Ok(false);
        }
        for (_, descriptor) in self.ctx.metadata.rows()? {
            if descriptor.files.values().any(|files| files.contains(path)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn write_files_column(&self, files: &str) -> Result<(), AccessGroupError> {
        let mut metadata = if self.is_root {
            Metadata::root(&self.ctx.root)
        } else {
            Metadata::normal(Arc::clone(&self.ctx.metadata), self.table.id, &{
                let inner = self.lock()?;
                inner.end_row.clone()
            })
        };
        metadata.write_files(&self.name, files)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AgInner>, AccessGroupError> {
        self.inner
            .lock()
            .map_err(|_| AccessGroupError::Internal("Mutex poisoned".into()))
    }
}

/// `;`-joined store path list, one path per line.
fn file_list(stores: &[Arc<CellStore>]) -> String {
    let mut files = String::new();
    for store in stores {
        files.push_str(&store.path().display().to_string());
        files.push_str(";\n");
    }
    files
}

/// Scan-spec filter applied to cache snapshots (store scanners filter
/// internally).
fn cell_wanted(spec: &ScanSpec, cell: &Cell) -> bool {
    if let Some(exact) = &spec.exact_row
        && cell.key.row != *exact
    {
        return false;
    }
    spec.wants_family(cell.key.column_family)
}
