//! # Journal
//!
//! The append-only record log underneath every durable log in the
//! engine: commit-log blocks (including per-split transfer logs), range
//! lifecycle transitions, and metadata mutation batches.
//!
//! # On-disk layout
//!
//! A journal file is a bare sequence of self-describing records — there
//! is no file header:
//!
//! ```text
//! [REC_MAGIC(4)][REC_LEN_LE(4)][REC_BYTES][REC_CRC32_LE(4)]
//! [REC_MAGIC(4)][REC_LEN_LE(4)][REC_BYTES][REC_CRC32_LE(4)]
//! ...
//! ```
//!
//! Every record leads with the 4-byte magic of the log family that owns
//! the file (`TCLB` for commit blocks, `TRML` for range transitions,
//! `TMDS` for metadata batches), so a journal cross-wired to the wrong
//! path is rejected at open rather than misdecoded. The CRC32 covers
//! `magic || len || bytes`.
//!
//! # Torn-tail policy
//!
//! Appends are fsynced before they return, so the only possible damage
//! from a crash is one incomplete record at the end of the file — a
//! write that never committed and whose state transition never took
//! effect. That policy lives here, once, instead of in every consumer:
//!
//! - `open()` scans the file and **truncates a torn tail record** so
//!   later appends land after the last intact record.
//! - [`JournalCursor`] treats an incomplete record at end-of-file as a
//!   clean end of the stream (and reports it via
//!   [`JournalCursor::torn`], for cursors over a file that grew torn
//!   after open).
//! - A magic or checksum violation on a *complete* record is real
//!   corruption and surfaces as an error; nothing is healed silently.
//!
//! # Concurrency
//!
//! The append handle sits behind a mutex; each cursor opens its own
//! buffered read handle, so replay never contends with appenders.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

/// `magic(4) + len(4)` — the fixed prefix of every record.
const FRAME_PREFIX: usize = 8;

/// Hard ceiling on one record's payload. Large enough for a commit
/// block carrying tens of thousands of cells, small enough that a
/// corrupt length field cannot trigger an allocation bomb.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A record's magic does not match this journal's log family.
    #[error("record magic mismatch at offset {offset}")]
    BadRecordMagic {
        /// File offset of the offending record.
        offset: u64,
    },

    /// A complete record failed its checksum.
    #[error("record checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// File offset of the offending record.
        offset: u64,
    },

    /// A record's length field exceeds [`MAX_RECORD_LEN`].
    #[error("record length {len} exceeds limit at offset {offset}")]
    RecordTooLarge {
        /// Declared payload length.
        len: u64,
        /// File offset of the offending record.
        offset: u64,
    },

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Journal
// ------------------------------------------------------------------------------------------------

/// A durable, append-only record log for one log family.
///
/// `T` is the record type; it only needs the crate wire-format traits.
/// See the [module-level documentation](self) for format and crash
/// semantics.
#[derive(Debug)]
pub struct Journal<T> {
    /// Path of the backing file.
    path: PathBuf,

    /// Record magic of the owning log family.
    magic: [u8; 4],

    /// Append handle; every append is written and fsynced under this lock.
    appender: Mutex<File>,

    /// Associates the journal with its record type without requiring
    /// `T` itself to be thread-safe.
    _record: PhantomData<fn() -> T>,
}

impl<T: Encode + Decode> Journal<T> {
    /// Opens (or creates) the journal at `path` for the log family
    /// identified by `magic`.
    ///
    /// An existing file is scanned: a torn tail record left by a crash
    /// is truncated away so subsequent appends stay replayable, and a
    /// file that belongs to a different log family is rejected.
    pub fn open(path: impl AsRef<Path>, magic: [u8; 4]) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let appender = OpenOptions::new().create(true).append(true).open(&path)?;

        let file_len = appender.metadata()?.len();
        if file_len > 0 {
            let intact_len = intact_prefix_len(&path, magic)?;
            if intact_len < file_len {
                warn!(
                    path = %path.display(),
                    file_len,
                    intact_len,
                    "truncating torn journal tail"
                );
                appender.set_len(intact_len)?;
                appender.sync_all()?;
            }
        }

        debug!(path = %path.display(), magic = ?magic, "journal opened");

        Ok(Self {
            path,
            magic,
            appender: Mutex::new(appender),
            _record: PhantomData,
        })
    }

    /// Appends one record and fsyncs before returning.
    pub fn append(&self, record: &T) -> Result<(), JournalError> {
        let payload = encoding::encode_to_vec(record)?;
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if len > MAX_RECORD_LEN {
            return Err(JournalError::RecordTooLarge {
                len: payload.len() as u64,
                offset: self.file_size()?,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_PREFIX + payload.len() + 4);
        frame.extend_from_slice(&self.magic);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut hasher = Crc32::new();
        hasher.update(&frame);
        frame.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut appender = self
            .appender
            .lock()
            .map_err(|_| JournalError::Internal("Mutex poisoned".into()))?;
        appender.write_all(&frame)?;
        appender.sync_all()?;

        trace!(len, "journal record appended");
        Ok(())
    }

    /// Returns a cursor replaying every record from the start.
    ///
    /// The cursor owns its own read handle; appends continue unhindered.
    pub fn cursor(&self) -> Result<JournalCursor<T>, JournalError> {
        JournalCursor::open(&self.path, self.magic)
    }

    /// Discards every record, leaving an empty journal.
    pub fn truncate(&self) -> Result<(), JournalError> {
        let appender = self
            .appender
            .lock()
            .map_err(|_| JournalError::Internal("Mutex poisoned".into()))?;
        appender.set_len(0)?;
        appender.sync_all()?;

        debug!(path = %self.path.display(), "journal truncated");
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk size in bytes.
    pub fn file_size(&self) -> Result<u64, JournalError> {
        Ok(fs::metadata(&self.path)?.len())
    }
}

// ------------------------------------------------------------------------------------------------
// JournalCursor
// ------------------------------------------------------------------------------------------------

/// Streaming replay over one journal file.
///
/// Yields decoded records in append order. An incomplete record at
/// end-of-file ends the stream cleanly (see the torn-tail policy in the
/// [module documentation](self)); corruption of a complete record is an
/// error.
pub struct JournalCursor<T> {
    reader: BufReader<File>,
    magic: [u8; 4],

    /// Offset of the next unread frame.
    offset: u64,

    /// Set once the stream ended on an incomplete tail record.
    torn: bool,

    done: bool,

    _record: PhantomData<fn() -> T>,
}

impl<T> JournalCursor<T> {
    fn open(path: &Path, magic: [u8; 4]) -> Result<Self, JournalError> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            magic,
            offset: 0,
            torn: false,
            done: false,
            _record: PhantomData,
        })
    }

    /// Whether the stream ended on an incomplete tail record.
    pub fn torn(&self) -> bool {
        self.torn
    }

    /// Offset of the first unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn finish(&mut self, torn: bool) {
        self.done = true;
        self.torn = torn;
    }
}

impl<T: Decode> Iterator for JournalCursor<T> {
    type Item = Result<T, JournalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut prefix = [0u8; FRAME_PREFIX];
        match read_chunk(&mut self.reader, &mut prefix) {
            Err(e) => return Some(Err(e.into())),
            Ok(Chunk::Empty) => {
                self.finish(false);
                return None;
            }
            Ok(Chunk::Partial) => {
                trace!(offset = self.offset, "journal cursor stopped at torn record prefix");
                self.finish(true);
                return None;
            }
            Ok(Chunk::Full) => {}
        }

        if prefix[..4] != self.magic {
            self.finish(false);
            return Some(Err(JournalError::BadRecordMagic {
                offset: self.offset,
            }));
        }

        let len = u32::from_le_bytes(prefix[4..8].try_into().unwrap_or([0; 4]));
        if len > MAX_RECORD_LEN {
            self.finish(false);
            return Some(Err(JournalError::RecordTooLarge {
                len: u64::from(len),
                offset: self.offset,
            }));
        }

        // Payload plus trailing CRC in one read.
        let mut body = vec![0u8; len as usize + 4];
        match read_chunk(&mut self.reader, &mut body) {
            Err(e) => return Some(Err(e.into())),
            Ok(Chunk::Full) => {}
            Ok(Chunk::Empty) | Ok(Chunk::Partial) => {
                trace!(offset = self.offset, len, "journal cursor stopped at torn record body");
                self.finish(true);
                return None;
            }
        }

        let payload = &body[..len as usize];
        let stored_crc = u32::from_le_bytes(body[len as usize..].try_into().unwrap_or([0; 4]));

        let mut hasher = Crc32::new();
        hasher.update(&prefix);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            self.finish(false);
            return Some(Err(JournalError::ChecksumMismatch {
                offset: self.offset,
            }));
        }

        let record = match encoding::decode_from_slice::<T>(payload) {
            Ok((record, _)) => record,
            Err(e) => {
                self.finish(false);
                return Some(Err(JournalError::Encoding(e)));
            }
        };

        self.offset += (FRAME_PREFIX + body.len()) as u64;
        Some(Ok(record))
    }
}

impl<T> std::fmt::Debug for JournalCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalCursor")
            .field("offset", &self.offset)
            .field("torn", &self.torn)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Frame reading helpers
// ------------------------------------------------------------------------------------------------

enum Chunk {
    /// Buffer filled completely.
    Full,

    /// End of file before the first byte.
    Empty,

    /// End of file inside the buffer — a torn record.
    Partial,
}

/// Fills `buf`, distinguishing a clean end-of-file from a torn one.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Chunk> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 { Chunk::Empty } else { Chunk::Partial });
        }
        filled += n;
    }
    Ok(Chunk::Full)
}

/// Byte length of the longest intact record prefix of `path`.
///
/// Walks the frames without decoding payloads. A torn record at the
/// tail bounds the prefix; a magic or checksum violation on a complete
/// record is corruption and refuses the open.
fn intact_prefix_len(path: &Path, magic: [u8; 4]) -> Result<u64, JournalError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut intact: u64 = 0;

    loop {
        let mut prefix = [0u8; FRAME_PREFIX];
        match read_chunk(&mut reader, &mut prefix)? {
            Chunk::Empty => return Ok(intact),
            Chunk::Partial => return Ok(intact),
            Chunk::Full => {}
        }

        if prefix[..4] != magic {
            return Err(JournalError::BadRecordMagic { offset: intact });
        }

        let len = u32::from_le_bytes(prefix[4..8].try_into().unwrap_or([0; 4]));
        if len > MAX_RECORD_LEN {
            return Err(JournalError::RecordTooLarge {
                len: u64::from(len),
                offset: intact,
            });
        }

        let mut body = vec![0u8; len as usize + 4];
        match read_chunk(&mut reader, &mut body)? {
            Chunk::Empty | Chunk::Partial => return Ok(intact),
            Chunk::Full => {}
        }

        let stored_crc =
            u32::from_le_bytes(body[len as usize..].try_into().unwrap_or([0; 4]));
        let mut hasher = Crc32::new();
        hasher.update(&prefix);
        hasher.update(&body[..len as usize]);
        if hasher.finalize() != stored_crc {
            return Err(JournalError::ChecksumMismatch { offset: intact });
        }

        intact += (FRAME_PREFIX + body.len()) as u64;
    }
}
