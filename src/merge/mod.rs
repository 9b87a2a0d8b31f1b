//! # MergeScanner
//!
//! K-way merge over any number of child cell streams (one cell cache
//! snapshot plus `k` cell store scanners), producing cells in global key
//! order with deletion, version, and TTL resolution applied.
//!
//! ## Resolution rules
//!
//! Within one row, tombstones arrive before the cells they mask (row
//! tombstones sort at family 0; family and cell tombstones sort before
//! inserts at the same column). Streaming resolution therefore needs
//! only the current row/column state:
//!
//! 1. A `DELETE_ROW` masks every cell of the row with
//!    `timestamp <= tombstone.timestamp`.
//! 2. A `DELETE_COLUMN_FAMILY` masks its family the same way, then
//!    `DELETE_CELL` masks its column.
//! 3. Among surviving versions of a column, the newest `MAX_VERSIONS`
//!    are emitted (0 = unlimited).
//! 4. Cells older than the column's TTL are dropped.
//!
//! Cells carrying a timestamp already emitted for the same column are
//! duplicates (transfer-log replay re-writes with identical revisions)
//! and collapse to the first, highest-revision occurrence.
//!
//! With `return_deletes` set (the minor-compaction path), tombstones are
//! emitted so they keep masking older cells in stores outside the merge.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::cell::{Cell, KeyFlag};
use crate::schema::Schema;

// ------------------------------------------------------------------------------------------------
// Column policies
// ------------------------------------------------------------------------------------------------

/// Retention policy of one column family, as seen by the merge path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnPolicy {
    /// Versions to keep per column; `0` keeps all.
    pub max_versions: u32,

    /// Maximum cell age in microseconds; `None` keeps forever.
    pub ttl_micros: Option<i64>,
}

/// Per-family retention policies for one scan.
#[derive(Debug, Clone, Default)]
pub struct ColumnPolicies {
    by_family: HashMap<u8, ColumnPolicy>,
}

impl ColumnPolicies {
    /// No policies: every family keeps everything.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Extracts the policies of every live family in `schema`.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut by_family = HashMap::new();
        for ag in &schema.access_groups {
            for cf in &ag.column_families {
                if cf.deleted {
                    continue;
                }
                by_family.insert(
                    cf.id,
                    ColumnPolicy {
                        max_versions: cf.max_versions,
                        ttl_micros: cf.ttl.map(|ttl| ttl.as_micros() as i64),
                    },
                );
            }
        }
        Self { by_family }
    }

    /// Policy for a family; unknown families keep everything.
    pub fn for_family(&self, family: u8) -> ColumnPolicy {
        self.by_family.get(&family).copied().unwrap_or_default()
    }
}

// ------------------------------------------------------------------------------------------------
// Heap plumbing
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    cell: Cell,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap over keys; ties broken by source index for stability.
        self.cell
            .key
            .cmp(&other.cell.key)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cell.key == other.cell.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

// ------------------------------------------------------------------------------------------------
// Resolution state
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct ResolveState {
    /// Row the masks below apply to.
    row: Vec<u8>,

    /// Newest row-tombstone timestamp seen for `row`.
    row_delete_ts: Option<i64>,

    /// Family the family mask applies to.
    family: Option<u8>,
    family_delete_ts: Option<i64>,

    /// Column the per-column state applies to.
    column: Option<(u8, Vec<u8>)>,
    cell_delete_ts: Option<i64>,
    emitted_versions: u32,
    last_version_ts: Option<i64>,
}

impl ResolveState {
    fn enter(&mut self, cell: &Cell) {
        if cell.key.row != self.row {
            self.row = cell.key.row.clone();
            self.row_delete_ts = None;
            self.family = None;
            self.family_delete_ts = None;
            self.column = None;
        }

        if self.family != Some(cell.key.column_family) {
            self.family = Some(cell.key.column_family);
            self.family_delete_ts = None;
            self.column = None;
        }

        let column = (cell.key.column_family, cell.key.qualifier.clone());
        if self.column.as_ref() != Some(&column) {
            self.column = Some(column);
            self.cell_delete_ts = None;
            self.emitted_versions = 0;
            self.last_version_ts = None;
        }
    }

    fn masked(&self, ts: i64) -> bool {
        self.row_delete_ts.is_some_and(|t| ts <= t)
            || self.family_delete_ts.is_some_and(|t| ts <= t)
            || self.cell_delete_ts.is_some_and(|t| ts <= t)
    }
}

// ------------------------------------------------------------------------------------------------
// MergeScanner
// ------------------------------------------------------------------------------------------------

/// Merges child scanners into one resolved, globally sorted cell stream.
pub struct MergeScanner {
    children: Vec<Box<dyn Iterator<Item = Cell>>>,
    heap: BinaryHeap<HeapEntry>,

    policies: ColumnPolicies,
    return_deletes: bool,

    /// TTL reference point, fixed at scanner creation.
    now_micros: i64,

    state: ResolveState,
    last_emitted_key: Option<crate::cell::CellKey>,
}

impl MergeScanner {
    /// Builds a merge over `children`, each of which must yield cells in
    /// key order.
    pub fn new(
        children: Vec<Box<dyn Iterator<Item = Cell>>>,
        policies: ColumnPolicies,
        return_deletes: bool,
        now_micros: i64,
    ) -> Self {
        let mut children = children;
        let mut heap = BinaryHeap::new();

        for (source, child) in children.iter_mut().enumerate() {
            if let Some(cell) = child.next() {
                heap.push(HeapEntry { cell, source });
            }
        }

        Self {
            children,
            heap,
            policies,
            return_deletes,
            now_micros,
            state: ResolveState::default(),
            last_emitted_key: None,
        }
    }

    fn pull(&mut self) -> Option<Cell> {
        let entry = self.heap.pop()?;
        if let Some(next) = self.children[entry.source].next() {
            self.heap.push(HeapEntry {
                cell: next,
                source: entry.source,
            });
        }
        Some(entry.cell)
    }

    fn emit_tombstone(&mut self, cell: Cell) -> Option<Cell> {
        // Exact duplicates (same key from replayed logs) collapse.
        if self.last_emitted_key.as_ref() == Some(&cell.key) {
            return None;
        }
        self.last_emitted_key = Some(cell.key.clone());
        Some(cell)
    }
}

impl Iterator for MergeScanner {
    type Item = Cell;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cell = self.pull()?;
            self.state.enter(&cell);
            let ts = cell.key.timestamp;

            match cell.key.flag {
                KeyFlag::DeleteRow => {
                    if self.state.row_delete_ts.is_none_or(|t| ts > t) {
                        self.state.row_delete_ts = Some(ts);
                    }
                    if self.return_deletes
                        && let Some(out) = self.emit_tombstone(cell)
                    {
                        return Some(out);
                    }
                }

                KeyFlag::DeleteColumnFamily => {
                    if self.state.family_delete_ts.is_none_or(|t| ts > t) {
                        self.state.family_delete_ts = Some(ts);
                    }
                    if self.return_deletes
                        && let Some(out) = self.emit_tombstone(cell)
                    {
                        return Some(out);
                    }
                }

                KeyFlag::DeleteCell => {
                    if self.state.cell_delete_ts.is_none_or(|t| ts > t) {
                        self.state.cell_delete_ts = Some(ts);
                    }
                    if self.return_deletes
                        && let Some(out) = self.emit_tombstone(cell)
                    {
                        return Some(out);
                    }
                }

                KeyFlag::Insert => {
                    if self.state.masked(ts) {
                        continue;
                    }

                    // Same-timestamp duplicate: the first (highest
                    // revision) occurrence already represents it.
                    if self.state.last_version_ts == Some(ts) {
                        continue;
                    }

                    let policy = self.policies.for_family(cell.key.column_family);

                    if let Some(ttl) = policy.ttl_micros
                        && self.now_micros.saturating_sub(ts) > ttl
                    {
                        continue;
                    }

                    if policy.max_versions != 0 && self.state.emitted_versions >= policy.max_versions
                    {
                        continue;
                    }

                    self.state.emitted_versions += 1;
                    self.state.last_version_ts = Some(ts);
                    self.last_emitted_key = Some(cell.key.clone());
                    return Some(cell);
                }
            }
        }
    }
}

impl std::fmt::Debug for MergeScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeScanner")
            .field("children", &self.children.len())
            .field("return_deletes", &self.return_deletes)
            .finish_non_exhaustive()
    }
}
