//! Crate-wide error envelope.
//!
//! Each subsystem has its own `thiserror` enum; [`Error`] wraps them all
//! so the RPC boundary can hand back one numeric [`ErrorCode`] plus a
//! message, regardless of which layer failed.

use thiserror::Error;

use crate::accessgroup::AccessGroupError;
use crate::cellcache::CellCacheError;
use crate::cellstore::CellStoreError;
use crate::commitlog::CommitLogError;
use crate::context::{ContextError, MasterError};
use crate::encoding::EncodingError;
use crate::journal::JournalError;
use crate::metadata::MetadataError;
use crate::metalog::MetaLogError;
use crate::range::RangeError;
use crate::schema::SchemaError;

/// Numeric error taxonomy reported across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,

    /// Schema failed validation.
    BadSchema = 1,

    /// Named table is unknown to the coordination service.
    TableNotFound = 2,

    /// Malformed request (unknown column family, row out of range).
    InvalidArgument = 3,

    /// Cell store file name does not follow the `cs<N>` convention.
    BadCellStoreFilename = 4,

    /// Cell store is structurally corrupt.
    BadCellStore = 5,

    /// Commit log block failed validation during replay.
    CorruptCommitLog = 6,

    /// No valid split row exists for the range.
    RowOverflow = 7,

    /// Maintenance interrupted cooperatively.
    Cancelled = 8,

    /// Range journal failure.
    MetaLog = 9,

    /// Underlying I/O failure.
    Io = 10,

    /// Wire-format encode/decode failure.
    Encoding = 11,

    /// Internal invariant violation.
    Internal = 12,
}

/// Any failure of the engine, tagged with its origin subsystem.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema assembly or validation failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Wire-format failure.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Journal-layer failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Commit log failure.
    #[error(transparent)]
    CommitLog(#[from] CommitLogError),

    /// Cell cache failure.
    #[error(transparent)]
    CellCache(#[from] CellCacheError),

    /// Cell store failure.
    #[error(transparent)]
    CellStore(#[from] CellStoreError),

    /// Access group failure.
    #[error(transparent)]
    AccessGroup(#[from] AccessGroupError),

    /// Metadata failure.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Range journal failure.
    #[error(transparent)]
    MetaLog(#[from] MetaLogError),

    /// Range engine failure.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// Server context failure.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Master RPC failure.
    #[error(transparent)]
    Master(#[from] MasterError),
}

impl Error {
    /// The numeric code for the RPC boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Schema(_) => ErrorCode::BadSchema,
            Self::Encoding(_) => ErrorCode::Encoding,
            Self::Journal(e) => journal_code(e),
            Self::CommitLog(e) => commit_log_code(e),
            Self::CellCache(_) => ErrorCode::Internal,
            Self::CellStore(e) => cell_store_code(e),
            Self::AccessGroup(e) => access_group_code(e),
            Self::Metadata(_) => ErrorCode::MetaLog,
            Self::MetaLog(_) => ErrorCode::MetaLog,
            Self::Range(e) => range_code(e),
            Self::Context(_) => ErrorCode::Io,
            Self::Master(_) => ErrorCode::Internal,
        }
    }
}

fn journal_code(error: &JournalError) -> ErrorCode {
    match error {
        JournalError::Io(_) => ErrorCode::Io,
        JournalError::Encoding(_) => ErrorCode::Encoding,
        _ => ErrorCode::Internal,
    }
}

fn commit_log_code(error: &CommitLogError) -> ErrorCode {
    match error {
        CommitLogError::Corrupt(_) => ErrorCode::CorruptCommitLog,
        CommitLogError::Io(_) => ErrorCode::Io,
        CommitLogError::Encoding(_) => ErrorCode::Encoding,
        CommitLogError::Journal(e) => journal_code(e),
    }
}

fn cell_store_code(error: &CellStoreError) -> ErrorCode {
    match error {
        CellStoreError::BadCellStore(_) => ErrorCode::BadCellStore,
        CellStoreError::BadFilename(_) => ErrorCode::BadCellStoreFilename,
        CellStoreError::Io(_) => ErrorCode::Io,
        CellStoreError::Encoding(_) => ErrorCode::Encoding,
        CellStoreError::Internal(_) => ErrorCode::Internal,
    }
}

fn access_group_code(error: &AccessGroupError) -> ErrorCode {
    match error {
        AccessGroupError::CellStore(e) => cell_store_code(e),
        AccessGroupError::Cache(_) => ErrorCode::Internal,
        AccessGroupError::Metadata(_) => ErrorCode::MetaLog,
        AccessGroupError::Io(_) => ErrorCode::Io,
        AccessGroupError::Internal(_) => ErrorCode::Internal,
    }
}

fn range_code(error: &RangeError) -> ErrorCode {
    match error {
        RangeError::InvalidArgument(_) => ErrorCode::InvalidArgument,
        RangeError::RowOverflow(_) => ErrorCode::RowOverflow,
        RangeError::Cancelled => ErrorCode::Cancelled,
        RangeError::Induced(_) => ErrorCode::Internal,
        RangeError::AccessGroup(e) => access_group_code(e),
        RangeError::CellStore(e) => cell_store_code(e),
        RangeError::CommitLog(e) => commit_log_code(e),
        RangeError::CorruptCommitLog(_) => ErrorCode::CorruptCommitLog,
        RangeError::Metadata(_) => ErrorCode::MetaLog,
        RangeError::MetaLog(_) => ErrorCode::MetaLog,
        RangeError::Master(_) => ErrorCode::Internal,
        RangeError::Io(_) => ErrorCode::Io,
        RangeError::Internal(_) => ErrorCode::Internal,
    }
}
