//! Lazy block scanner over one cell store.
//!
//! Decompresses one data block at a time, decoding cells sequentially
//! and filtering them against the store's clipping bounds and the scan
//! spec. Emits cells in key order.
//!
//! Corruption mid-scan ends iteration; the error is parked and retrieved
//! with [`CellStoreScanner::take_error`] so compaction can abandon the
//! store instead of silently producing a short output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::cell::{Cell, ScanSpec};
use crate::encoding::Decode;

use super::{CellStore, CellStoreError, DATA_BLOCK_MAGIC, IndexEntry, read_block};

/// Shared slot a scanner parks its abort error in.
///
/// Consumers that box scanners into a merge (compaction) keep a clone of
/// the handle and check it after draining the stream.
pub type ScanErrorHandle = Arc<Mutex<Option<CellStoreError>>>;

/// Streaming scanner over the data blocks of one [`CellStore`].
pub struct CellStoreScanner {
    store: Arc<CellStore>,

    /// Index entries for blocks that can intersect the scan, in order.
    blocks: Vec<IndexEntry>,
    next_block: usize,

    /// Cells decoded from the current block, already filtered.
    current: VecDeque<Cell>,

    /// Effective row bounds: scan spec intersected with store clipping.
    start_row: Vec<u8>,
    end_row: Vec<u8>,

    columns: Option<Vec<u8>>,
    exact_row: Option<Vec<u8>>,

    error: ScanErrorHandle,
}

impl CellStoreScanner {
    pub(crate) fn new(store: Arc<CellStore>, spec: &ScanSpec) -> Self {
        let (store_start, store_end) = store.bounds();
        let start_row = if spec.start_row.as_slice() > store_start {
            spec.start_row.clone()
        } else {
            store_start.to_vec()
        };
        let end_row = if spec.end_row.as_slice() < store_end {
            spec.end_row.clone()
        } else {
            store_end.to_vec()
        };

        // Keep blocks whose row span can intersect (start_row, end_row].
        let index = store.index();
        let mut blocks = Vec::new();
        for (i, entry) in index.iter().enumerate() {
            let below = match index.get(i + 1) {
                Some(next) => next.first_key.row.as_slice() <= start_row.as_slice(),
                None => false,
            };
            let above = entry.first_key.row.as_slice() > end_row.as_slice();
            if !below && !above {
                blocks.push(entry.clone());
            }
        }

        Self {
            store,
            blocks,
            next_block: 0,
            current: VecDeque::new(),
            start_row,
            end_row,
            columns: spec.columns.clone(),
            exact_row: spec.exact_row.clone(),
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle to the error slot. Callers that must see a complete stream
    /// (compaction) clone this before boxing the scanner and check it
    /// after draining.
    pub fn error_handle(&self) -> ScanErrorHandle {
        Arc::clone(&self.error)
    }

    fn park_error(&mut self, error: CellStoreError) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(error);
        }
    }

    fn wants(&self, cell: &Cell) -> bool {
        let row = cell.key.row.as_slice();
        if row <= self.start_row.as_slice() || row > self.end_row.as_slice() {
            return false;
        }
        if let Some(exact) = &self.exact_row
            && row != exact.as_slice()
        {
            return false;
        }
        if let Some(columns) = &self.columns {
            // Row tombstones (family 0) are relevant to every family.
            if cell.key.column_family != 0 && !columns.contains(&cell.key.column_family) {
                return false;
            }
        }
        true
    }

    fn load_next_block(&mut self) -> bool {
        while self.next_block < self.blocks.len() {
            let entry = self.blocks[self.next_block].clone();
            self.next_block += 1;

            let payload = match read_block(self.store.mmap(), entry.offset, &DATA_BLOCK_MAGIC) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(
                        path = %self.store.path().display(),
                        offset = entry.offset,
                        error = %e,
                        "cell store scan aborted on corrupt block"
                    );
                    self.park_error(e);
                    self.next_block = self.blocks.len();
                    return false;
                }
            };

            let mut offset = 0usize;
            while offset < payload.len() {
                match Cell::decode_from(&payload[offset..]) {
                    Ok((cell, n)) => {
                        offset += n;
                        if self.wants(&cell) {
                            self.current.push_back(cell);
                        }
                    }
                    Err(e) => {
                        warn!(
                            path = %self.store.path().display(),
                            block_offset = entry.offset,
                            error = %e,
                            "cell store scan aborted on undecodable cell"
                        );
                        self.park_error(CellStoreError::BadCellStore(e.to_string()));
                        self.next_block = self.blocks.len();
                        return !self.current.is_empty();
                    }
                }
            }

            if !self.current.is_empty() {
                return true;
            }
        }
        false
    }
}

impl Iterator for CellStoreScanner {
    type Item = Cell;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.current.pop_front() {
                return Some(cell);
            }
            if !self.load_next_block() && self.current.is_empty() {
                return None;
            }
        }
    }
}

impl std::fmt::Debug for CellStoreScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStoreScanner")
            .field("path", &self.store.path())
            .field("blocks", &self.blocks.len())
            .field("next_block", &self.next_block)
            .finish_non_exhaustive()
    }
}
