//! # CellCache
//!
//! The mutable, in-memory sorted buffer of one access group. Absorbs
//! writes until a flush turns its contents into a cell store.
//!
//! ## Design Invariants
//!
//! - Durability is *not* this type's job: the range appends to the commit
//!   log before any cell lands here.
//! - Cells are stored under full [`CellKey`] order, so multiple versions
//!   of one column coexist; resolution is deferred to the merge scanner.
//! - Scans copy the requested interval out under the read lock, giving
//!   callers a snapshot isolated from subsequent writes.
//!
//! ## Freezing
//!
//! When a compaction is initiated, the access group swaps the live cache
//! for a fresh one and parks the old cache as an immutable `Arc` shared
//! with in-flight scanners. Nothing mutates a frozen cache; the freeze is
//! the swap itself.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::RwLock,
};

use thiserror::Error;
use tracing::trace;

use crate::cell::{Cell, CellKey, HexRow, KeyFlag};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`CellCache`] operations.
#[derive(Debug, Error)]
pub enum CellCacheError {
    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// CellCache
// ------------------------------------------------------------------------------------------------

/// Sorted in-memory map of recent cells awaiting flush.
#[derive(Debug, Default)]
pub struct CellCache {
    inner: RwLock<CellCacheInner>,
}

#[derive(Debug, Default)]
struct CellCacheInner {
    /// Cells in full key order.
    tree: BTreeMap<CellKey, Vec<u8>>,

    /// Approximate heap footprint of keys and values.
    memory_used: usize,

    /// Number of inserts that replaced an identical key (same row,
    /// column, flag, timestamp, and revision).
    collisions: u64,
}

impl CellCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one cell. The caller holds the access group's write lock;
    /// the internal lock only protects against concurrent readers.
    pub fn add(&self, key: CellKey, value: Vec<u8>) -> Result<(), CellCacheError> {
        let mut inner = self.write_inner()?;

        let footprint = key_footprint(&key) + value.len();

        trace!(
            row = %HexRow(&key.row),
            family = key.column_family,
            flag = ?key.flag,
            revision = key.revision,
            "cell cached"
        );

        if inner.tree.insert(key, value).is_some() {
            inner.collisions += 1;
        } else {
            inner.memory_used += footprint;
        }
        Ok(())
    }

    /// Approximate memory consumed by cached cells.
    pub fn memory_used(&self) -> usize {
        self.inner.read().map(|inner| inner.memory_used).unwrap_or(0)
    }

    /// Number of cells currently cached.
    pub fn cell_count(&self) -> usize {
        self.inner.read().map(|inner| inner.tree.len()).unwrap_or(0)
    }

    /// Number of exact-key collisions observed.
    pub fn collision_count(&self) -> u64 {
        self.inner.read().map(|inner| inner.collisions).unwrap_or(0)
    }

    /// Whether the cache holds no cells.
    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }

    /// Copies out every cell whose row lies in `(start_row, end_row]`,
    /// in key order. The copy is a snapshot: later writes are invisible.
    pub fn snapshot_range(
        &self,
        start_row: &[u8],
        end_row: &[u8],
    ) -> Result<Vec<Cell>, CellCacheError> {
        let inner = self.read_inner()?;

        let lower = first_key_after_row(start_row);
        let cells = inner
            .tree
            .range((Bound::Included(&lower), Bound::Unbounded))
            .take_while(|(key, _)| key.row.as_slice() <= end_row)
            .map(|(key, value)| Cell {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(cells)
    }

    /// Copies out every cached cell in key order, for flushing into a
    /// cell store.
    pub fn cells_for_flush(&self) -> Result<Vec<Cell>, CellCacheError> {
        let inner = self.read_inner()?;
        Ok(inner
            .tree
            .iter()
            .map(|(key, value)| Cell {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    /// Distinct rows currently cached, in order. Feeds the "hard" split
    /// row search.
    pub fn cached_rows(&self) -> Result<Vec<Vec<u8>>, CellCacheError> {
        let inner = self.read_inner()?;
        let mut rows: Vec<Vec<u8>> = Vec::new();
        for key in inner.tree.keys() {
            if rows.last().map(Vec::as_slice) != Some(key.row.as_slice()) {
                rows.push(key.row.clone());
            }
        }
        Ok(rows)
    }

    /// Median distinct row, if any.
    pub fn median_row(&self) -> Result<Option<Vec<u8>>, CellCacheError> {
        let rows = self.cached_rows()?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows[rows.len() / 2].clone()))
    }

    /// Drops every cell on the discarded side of a split.
    ///
    /// With `keep_high` the cache retains rows strictly above
    /// `split_row`; otherwise it retains rows at or below it.
    pub fn drop_side(&self, split_row: &[u8], keep_high: bool) -> Result<(), CellCacheError> {
        let mut inner = self.write_inner()?;

        let mut dropped_bytes = 0usize;
        inner.tree.retain(|key, value| {
            let keep = if keep_high {
                key.row.as_slice() > split_row
            } else {
                key.row.as_slice() <= split_row
            };
            if !keep {
                dropped_bytes += key_footprint(key) + value.len();
            }
            keep
        });
        inner.memory_used = inner.memory_used.saturating_sub(dropped_bytes);
        Ok(())
    }

    fn read_inner(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, CellCacheInner>, CellCacheError> {
        self.inner
            .read()
            .map_err(|_| CellCacheError::Internal("RwLock poisoned".into()))
    }

    fn write_inner(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, CellCacheInner>, CellCacheError> {
        self.inner
            .write()
            .map_err(|_| CellCacheError::Internal("RwLock poisoned".into()))
    }
}

/// Heap footprint of a key's variable parts plus the entry overhead.
fn key_footprint(key: &CellKey) -> usize {
    std::mem::size_of::<CellKey>() + key.row.len() + key.qualifier.len()
}

/// The smallest possible key of the smallest row strictly greater than
/// `row`: the successor row (`row ++ 0x00`) at the earliest sort
/// position (row tombstone, maximum timestamp and revision).
fn first_key_after_row(row: &[u8]) -> CellKey {
    let mut successor = row.to_vec();
    successor.push(0x00);
    CellKey {
        row: successor,
        column_family: 0,
        qualifier: Vec::new(),
        flag: KeyFlag::DeleteRow,
        timestamp: i64::MAX,
        revision: u64::MAX,
    }
}
