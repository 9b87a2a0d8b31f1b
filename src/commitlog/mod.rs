//! # Commit Log
//!
//! Durability log for cell writes. Each append persists one *block*:
//! the [`TableIdentifier`] of the owning table followed by a packed
//! sequence of cells, framed and CRC-protected by the
//! [journal](crate::journal) layer under the `TCLB` record magic.
//!
//! The same type serves two roles:
//!
//! - the range server's shared write-ahead log, and
//! - the per-range **transfer log** created during a split, which
//!   collects writes destined for the departing half until the sibling
//!   range replays it.
//!
//! Replay is idempotent: every key carries its revision, and the merge
//! path collapses revision-equal duplicates, so replaying a block twice
//! cannot duplicate data. A record torn by a crash ends replay cleanly
//! inside the journal layer — the write never became durable.
//!
//! A commit log lives in its own directory (`<dir>/block.log`), matching
//! the transfer-log layout the split state machine persists: the
//! directory path is what gets journaled and handed to the master.


use std::{fs, io, path::Path, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::cell::{Cell, TableIdentifier};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::journal::{Journal, JournalCursor, JournalError};

/// File name of the block journal inside a commit-log directory.
const LOG_FILE_NAME: &str = "block.log";

/// Record magic of commit-log blocks.
pub(crate) const COMMIT_BLOCK_MAGIC: [u8; 4] = *b"TCLB";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by commit-log operations.
#[derive(Debug, Error)]
pub enum CommitLogError {
    /// Underlying journal failure.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A replayed block failed structural validation.
    #[error("Corrupt commit log: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// CommitBlock
// ------------------------------------------------------------------------------------------------

/// One durable unit of the commit log: a table identifier plus the cells
/// written under it.
#[derive(Debug)]
pub struct CommitBlock {
    /// Table the cells belong to.
    pub table: TableIdentifier,

    /// Cells in write order.
    pub cells: Vec<Cell>,
}

impl Encode for CommitBlock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.table.encode_to(buf)?;
        encoding::encode_vec(&self.cells, buf)?;
        Ok(())
    }
}

impl Decode for CommitBlock {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (table, n) = TableIdentifier::decode_from(&buf[offset..])?;
        offset += n;
        let (cells, n) = encoding::decode_vec::<Cell>(&buf[offset..])?;
        offset += n;
        Ok((Self { table, cells }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// CommitLog
// ------------------------------------------------------------------------------------------------

/// Append side of the commit log.
#[derive(Debug)]
pub struct CommitLog {
    dir: PathBuf,
    journal: Journal<CommitBlock>,
}

impl CommitLog {
    /// Opens (or creates) the commit log rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CommitLogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let journal = Journal::open(dir.join(LOG_FILE_NAME), COMMIT_BLOCK_MAGIC)?;

        info!(dir = %dir.display(), "commit log opened");
        Ok(Self { dir, journal })
    }

    /// Appends one block of cells for `table`. Durable on return.
    pub fn append(&self, table: &TableIdentifier, cells: Vec<Cell>) -> Result<(), CommitLogError> {
        if cells.is_empty() {
            return Ok(());
        }

        let count = cells.len();
        let block = CommitBlock {
            table: table.clone(),
            cells,
        };
        self.journal.append(&block)?;

        debug!(dir = %self.dir.display(), cells = count, "commit block appended");
        Ok(())
    }

    /// Directory this log lives in (the path journaled by a split).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current size of the backing journal file.
    pub fn size(&self) -> Result<u64, CommitLogError> {
        Ok(self.journal.file_size()?)
    }

    /// Closes the log. Every append is already durable; this makes the
    /// hand-off explicit at split shrink time.
    pub fn close(self) -> Result<(), CommitLogError> {
        info!(dir = %self.dir.display(), "commit log closed");
        drop(self);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// CommitLogReader
// ------------------------------------------------------------------------------------------------

/// Replay side of the commit log.
#[derive(Debug)]
pub struct CommitLogReader {
    dir: PathBuf,
    cursor: JournalCursor<CommitBlock>,
}

impl CommitLogReader {
    /// Opens a reader over the commit log rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CommitLogError> {
        let dir = dir.as_ref().to_path_buf();
        let journal: Journal<CommitBlock> =
            Journal::open(dir.join(LOG_FILE_NAME), COMMIT_BLOCK_MAGIC)?;
        let cursor = journal.cursor()?;
        Ok(Self { dir, cursor })
    }

    /// Yields the next block, or `None` at end of log.
    ///
    /// A record torn mid-append ends the stream cleanly inside the
    /// journal layer; any corruption of a complete record surfaces as
    /// an error.
    pub fn next_block(&mut self) -> Option<Result<CommitBlock, CommitLogError>> {
        match self.cursor.next() {
            None => {
                if self.cursor.torn() {
                    debug!(dir = %self.dir.display(), "commit log replay stopped at torn tail record");
                }
                None
            }
            Some(Ok(block)) => Some(Ok(block)),
            Some(Err(e)) => Some(Err(e.into())),
        }
    }

    /// Directory this reader replays from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
