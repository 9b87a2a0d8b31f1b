//! # RangeMetaLog
//!
//! Per-server journal of range lifecycle transitions, and the sole
//! authority for crash recovery of in-flight splits.
//!
//! Every externally visible state change of a range is preceded by one
//! of these records:
//!
//! | record        | meaning                                            |
//! |---------------|----------------------------------------------------|
//! | `LOAD`        | range is now served here                           |
//! | `REMOVE`      | range unloaded (master confirmed)                  |
//! | `SPLIT_START` | transfer log installed, writes being duplicated    |
//! | `SPLIT_SHRUNK`| range narrowed to its retained half                |
//! | `SPLIT_DONE`  | master notified; back to steady                    |
//!
//! On startup [`RangeMetaLog::recover`] folds the journal into one
//! [`RangeState`] per live range; `STEADY` is implicit (no outstanding
//! split record). The fold tracks ranges by `(table_id, end_row)` and
//! follows the key across a `SPLIT_SHRUNK` boundary change.
//!
//! On clean shutdown [`RangeMetaLog::compact`] rewrites the journal to
//! one `LOAD` record per live range, bounding replay cost.


use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;
use tracing::{info, warn};

use crate::cell::{RangeSpec, TableIdentifier};
use crate::encoding::{Decode, Encode, EncodingError};
use crate::journal::{Journal, JournalError};

/// Record magic of range lifecycle transitions.
pub(crate) const RANGE_JOURNAL_MAGIC: [u8; 4] = *b"TRML";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by range journal operations.
#[derive(Debug, Error)]
pub enum MetaLogError {
    /// Underlying journal failure.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// RangeState
// ------------------------------------------------------------------------------------------------

/// Persisted split-machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RangeStateKind {
    /// No split in flight.
    Steady = 0,

    /// Transfer log installed; writes to the departing side are being
    /// duplicated into it.
    SplitLogInstalled = 1,

    /// Range narrowed to its retained half; master not yet notified.
    SplitShrunk = 2,
}

impl RangeStateKind {
    fn from_byte(byte: u8) -> Result<Self, EncodingError> {
        match byte {
            0 => Ok(Self::Steady),
            1 => Ok(Self::SplitLogInstalled),
            2 => Ok(Self::SplitShrunk),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "RangeStateKind",
            }),
        }
    }
}

/// The full persisted state of one range's lifecycle engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeState {
    /// Split-machine position.
    pub state: RangeStateKind,

    /// Chosen split row (empty when steady).
    pub split_point: Vec<u8>,

    /// The boundary this range gives up in the split.
    pub old_boundary_row: Vec<u8>,

    /// Directory of the transfer log, once installed.
    pub transfer_log: Option<String>,

    /// Current split trigger in bytes.
    pub soft_limit: u64,
}

impl RangeState {
    /// Steady state with the given soft limit.
    pub fn steady(soft_limit: u64) -> Self {
        Self {
            state: RangeStateKind::Steady,
            split_point: Vec::new(),
            old_boundary_row: Vec::new(),
            transfer_log: None,
            soft_limit,
        }
    }

    /// Clears split progress, keeping the soft limit.
    pub fn clear(&mut self) {
        self.state = RangeStateKind::Steady;
        self.split_point.clear();
        self.old_boundary_row.clear();
        self.transfer_log = None;
    }

    /// Split direction derived from the persisted rows: the new range is
    /// the high side iff `split_point < old_boundary_row`.
    pub fn split_off_high(&self) -> bool {
        self.split_point < self.old_boundary_row
    }
}

impl Default for RangeState {
    fn default() -> Self {
        Self::steady(0)
    }
}

impl Encode for RangeState {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.state as u8).encode_to(buf)?;
        self.split_point.encode_to(buf)?;
        self.old_boundary_row.encode_to(buf)?;
        self.transfer_log.encode_to(buf)?;
        self.soft_limit.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RangeState {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (state_byte, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (split_point, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (old_boundary_row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (transfer_log, n) = <Option<String>>::decode_from(&buf[offset..])?;
        offset += n;
        let (soft_limit, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                state: RangeStateKind::from_byte(state_byte)?,
                split_point,
                old_boundary_row,
                transfer_log,
                soft_limit,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Journal entries
// ------------------------------------------------------------------------------------------------

/// Record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaLogEntryKind {
    /// Range loaded onto this server.
    Load = 0,

    /// Range unloaded.
    Remove = 1,

    /// Split phase 1 complete.
    SplitStart = 2,

    /// Split phase 2 complete.
    SplitShrunk = 3,

    /// Split phase 3 complete.
    SplitDone = 4,
}

impl MetaLogEntryKind {
    fn from_byte(byte: u8) -> Result<Self, EncodingError> {
        match byte {
            0 => Ok(Self::Load),
            1 => Ok(Self::Remove),
            2 => Ok(Self::SplitStart),
            3 => Ok(Self::SplitShrunk),
            4 => Ok(Self::SplitDone),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "MetaLogEntryKind",
            }),
        }
    }
}

/// One journal record.
#[derive(Debug, Clone)]
pub struct MetaLogEntry {
    /// Transition kind.
    pub kind: MetaLogEntryKind,

    /// Table of the range.
    pub table: TableIdentifier,

    /// Range boundaries at the time of the record.
    pub spec: RangeSpec,

    /// Full state after the transition.
    pub state: RangeState,
}

impl Encode for MetaLogEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.kind as u8).encode_to(buf)?;
        self.table.encode_to(buf)?;
        self.spec.encode_to(buf)?;
        self.state.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaLogEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (kind_byte, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (table, n) = TableIdentifier::decode_from(&buf[offset..])?;
        offset += n;
        let (spec, n) = RangeSpec::decode_from(&buf[offset..])?;
        offset += n;
        let (state, n) = RangeState::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                kind: MetaLogEntryKind::from_byte(kind_byte)?,
                table,
                spec,
                state,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery output
// ------------------------------------------------------------------------------------------------

/// The folded state of one live range after journal replay.
#[derive(Debug, Clone)]
pub struct RecoveredRange {
    /// Table of the range.
    pub table: TableIdentifier,

    /// Current boundaries.
    pub spec: RangeSpec,

    /// Current lifecycle state.
    pub state: RangeState,
}

// ------------------------------------------------------------------------------------------------
// RangeMetaLog
// ------------------------------------------------------------------------------------------------

/// The per-server range lifecycle journal.
#[derive(Debug)]
pub struct RangeMetaLog {
    path: PathBuf,
    journal: Mutex<Journal<MetaLogEntry>>,
}

impl RangeMetaLog {
    /// Opens (or creates) the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaLogError> {
        let path = path.as_ref().to_path_buf();
        let journal = Journal::open(&path, RANGE_JOURNAL_MAGIC)?;
        Ok(Self {
            path,
            journal: Mutex::new(journal),
        })
    }

    /// Journals a range load.
    pub fn log_range_loaded(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<(), MetaLogError> {
        self.append(MetaLogEntryKind::Load, table, spec, state)
    }

    /// Journals a range unload.
    pub fn log_range_removed(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
    ) -> Result<(), MetaLogError> {
        self.append(
            MetaLogEntryKind::Remove,
            table,
            spec,
            &RangeState::default(),
        )
    }

    /// Journals split phase 1 (`SPLIT_LOG_INSTALLED`).
    pub fn log_split_start(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<(), MetaLogError> {
        self.append(MetaLogEntryKind::SplitStart, table, spec, state)
    }

    /// Journals split phase 2 (`SPLIT_SHRUNK`). `spec` carries the new,
    /// narrowed boundaries.
    pub fn log_split_shrunk(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<(), MetaLogError> {
        self.append(MetaLogEntryKind::SplitShrunk, table, spec, state)
    }

    /// Journals split completion, returning the range to steady.
    pub fn log_split_done(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<(), MetaLogError> {
        self.append(MetaLogEntryKind::SplitDone, table, spec, state)
    }

    /// Replays the whole journal and folds it into per-range state.
    ///
    /// A torn tail record ends replay inside the journal layer — the
    /// corresponding transition never took effect. Corruption of a
    /// complete record stops the fold at the last good transition.
    pub fn recover(&self) -> Result<Vec<RecoveredRange>, MetaLogError> {
        let cursor = {
            let journal = self.lock_journal()?;
            journal.cursor()?
        };

        let mut ranges: BTreeMap<(u32, Vec<u8>), RecoveredRange> = BTreeMap::new();
        let mut count = 0u64;

        for item in cursor {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "range journal replay stopped");
                    break;
                }
            };
            count += 1;

            let key = (entry.table.id, entry.spec.end_row.clone());
            match entry.kind {
                MetaLogEntryKind::Load => {
                    ranges.insert(
                        key,
                        RecoveredRange {
                            table: entry.table,
                            spec: entry.spec,
                            state: entry.state,
                        },
                    );
                }

                MetaLogEntryKind::Remove => {
                    ranges.remove(&key);
                }

                MetaLogEntryKind::SplitStart => {
                    if let Some(range) = ranges.get_mut(&key) {
                        range.state = entry.state;
                    } else {
                        warn!(
                            table = entry.table.id,
                            "SPLIT_START for unknown range ignored"
                        );
                    }
                }

                MetaLogEntryKind::SplitShrunk => {
                    // A high split changed the end row; the record's
                    // state still carries the boundary that went away.
                    let old_key = if entry.state.split_off_high() {
                        (entry.table.id, entry.state.old_boundary_row.clone())
                    } else {
                        key.clone()
                    };
                    ranges.remove(&old_key);
                    ranges.insert(
                        key,
                        RecoveredRange {
                            table: entry.table,
                            spec: entry.spec,
                            state: entry.state,
                        },
                    );
                }

                MetaLogEntryKind::SplitDone => {
                    if let Some(range) = ranges.get_mut(&key) {
                        let mut state = entry.state;
                        state.clear();
                        range.state = state;
                        range.spec = entry.spec;
                    }
                }
            }
        }

        info!(
            path = %self.path.display(),
            records = count,
            live_ranges = ranges.len(),
            "range journal recovered"
        );

        Ok(ranges.into_values().collect())
    }

    /// Rewrites the journal to one `LOAD` record per live range.
    ///
    /// Valid only when every range is steady (clean shutdown).
    pub fn compact(&self, live: &[RecoveredRange]) -> Result<(), MetaLogError> {
        if live
            .iter()
            .any(|range| range.state.state != RangeStateKind::Steady)
        {
            return Err(MetaLogError::Internal(
                "journal compaction with a split in flight".into(),
            ));
        }

        let journal = self.lock_journal()?;
        journal.truncate()?;
        for range in live {
            journal.append(&MetaLogEntry {
                kind: MetaLogEntryKind::Load,
                table: range.table.clone(),
                spec: range.spec.clone(),
                state: range.state.clone(),
            })?;
        }

        info!(
            path = %self.path.display(),
            ranges = live.len(),
            "range journal compacted"
        );
        Ok(())
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(
        &self,
        kind: MetaLogEntryKind,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<(), MetaLogError> {
        let journal = self.lock_journal()?;
        journal.append(&MetaLogEntry {
            kind,
            table: table.clone(),
            spec: spec.clone(),
            state: state.clone(),
        })?;
        Ok(())
    }

    fn lock_journal(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Journal<MetaLogEntry>>, MetaLogError> {
        self.journal
            .lock()
            .map_err(|_| MetaLogError::Internal("Mutex poisoned".into()))
    }
}
