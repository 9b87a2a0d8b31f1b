//! # ServerContext
//!
//! Explicit process-wide state, passed into every range, access group,
//! and maintenance component instead of living in globals: directories,
//! the shared commit log, the metadata store, the range journal, the
//! master client, tunables, and the test-only failure inducer.

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::info;

use crate::cell::{RangeSpec, TableIdentifier};
use crate::cellstore::BloomMode;
use crate::commitlog::CommitLog;
use crate::metadata::MetadataStore;
use crate::metalog::RangeMetaLog;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tunables read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hard upper bound on a range's disk footprint; the split soft
    /// limit doubles up to this cap.
    pub range_max_bytes: u64,

    /// Split threshold override for metadata-table ranges (`0` disables).
    pub range_metadata_max_bytes: u64,

    /// Cell cache memory that forces a flush of one access group.
    pub access_group_max_mem: usize,

    /// Target uncompressed data block size for cell stores.
    pub block_size: u32,

    /// What cell store Bloom filters index.
    pub bloom_mode: BloomMode,

    /// Minimum time between maintenance scheduler ticks.
    pub maintenance_interval: Duration,

    /// Worker threads draining the maintenance queue.
    pub maintenance_workers: usize,

    /// Bound of the maintenance queue; excess tasks wait for the next tick.
    pub maintenance_queue_depth: usize,

    /// Which side a split gives away when the range is steady: the high
    /// side (`true`) or the low side.
    pub split_off_high: bool,

    /// Attempts for each range-journal write before the failure is fatal.
    pub metalog_write_retries: u32,

    /// Sleep between range-journal write attempts.
    pub metalog_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            range_max_bytes: 256 * 1024 * 1024,
            range_metadata_max_bytes: 16 * 1024 * 1024,
            access_group_max_mem: 32 * 1024 * 1024,
            block_size: 64 * 1024,
            bloom_mode: BloomMode::Rows,
            maintenance_interval: Duration::from_millis(30_000),
            maintenance_workers: 2,
            maintenance_queue_depth: 32,
            split_off_high: false,
            metalog_write_retries: 3,
            metalog_retry_delay: Duration::from_secs(5),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Master client seam
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the master client.
#[derive(Debug, Error)]
pub enum MasterError {
    /// The master could not be reached or rejected the report.
    #[error("master error: {0}")]
    Unavailable(String),
}

/// The one master RPC the lifecycle engine needs.
///
/// The master assigns the reported sibling range to some range server,
/// which replays `transfer_log` and then serves the range.
pub trait MasterClient: Send + Sync {
    /// Reports a completed shrink: the sibling's boundaries, the
    /// transfer log it must replay, and the soft limit it inherits.
    fn report_split(
        &self,
        table: &TableIdentifier,
        sibling: &RangeSpec,
        transfer_log: &Path,
        soft_limit: u64,
    ) -> Result<(), MasterError>;
}

/// Master client that only logs. Useful for single-node embedding and
/// as the default in tests that do not exercise splits.
#[derive(Debug, Default)]
pub struct NoopMaster;

impl MasterClient for NoopMaster {
    fn report_split(
        &self,
        table: &TableIdentifier,
        sibling: &RangeSpec,
        transfer_log: &Path,
        soft_limit: u64,
    ) -> Result<(), MasterError> {
        info!(
            table = %table.name,
            start = ?String::from_utf8_lossy(&sibling.start_row),
            end = ?String::from_utf8_lossy(&sibling.end_row),
            transfer_log = %transfer_log.display(),
            soft_limit,
            "split reported (noop master)"
        );
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Failure inducer
// ------------------------------------------------------------------------------------------------

/// A failure injected at an armed point; callers treat it as a crash.
#[derive(Debug, Error)]
#[error("induced failure at '{0}'")]
pub struct InducedFailure(pub String);

/// Test hook: aborts execution at armed points (`split-1` .. `split-4`)
/// so crash recovery can be exercised deterministically.
#[derive(Debug, Default)]
pub struct FailureInducer {
    armed: Mutex<HashSet<String>>,
}

impl FailureInducer {
    /// Arms a failure point.
    pub fn arm(&self, point: &str) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(point.to_string());
        }
    }

    /// Fails once if `point` is armed, then disarms it.
    pub fn maybe_fail(&self, point: &str) -> Result<(), InducedFailure> {
        let mut armed = match self.armed.lock() {
            Ok(armed) => armed,
            Err(_) => return Ok(()),
        };
        if armed.remove(point) {
            return Err(InducedFailure(point.to_string()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// ServerContext
// ------------------------------------------------------------------------------------------------

/// Shared handles and tunables of one range server process.
pub struct ServerContext {
    /// Server root directory.
    pub root: PathBuf,

    /// Directory holding the shared commit log and transfer logs.
    pub log_dir: PathBuf,

    /// This server's location string, written to `Location` columns.
    pub location: String,

    /// Tunables.
    pub config: ServerConfig,

    /// Shared write-ahead log for all ranges.
    pub commit_log: Arc<CommitLog>,

    /// METADATA table rows.
    pub metadata: Arc<MetadataStore>,

    /// Range lifecycle journal.
    pub metalog: Arc<RangeMetaLog>,

    /// Master RPC seam.
    pub master: Arc<dyn MasterClient>,

    /// Test-only crash hooks.
    pub failure: FailureInducer,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("root", &self.root)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Opens (or creates) all process-wide state under `root`.
    pub fn open(
        root: impl AsRef<Path>,
        location: impl Into<String>,
        config: ServerConfig,
        master: Arc<dyn MasterClient>,
    ) -> Result<Arc<Self>, ContextError> {
        let root = root.as_ref().to_path_buf();
        let log_dir = root.join("logs");
        fs::create_dir_all(&log_dir)?;
        fs::create_dir_all(root.join("tables"))?;

        let commit_log = Arc::new(CommitLog::open(log_dir.join("commit"))?);
        let metadata = Arc::new(MetadataStore::open(root.join("metadata"))?);
        let metalog = Arc::new(RangeMetaLog::open(root.join("range.journal"))?);

        let location = location.into();
        info!(root = %root.display(), location = %location, "server context opened");

        Ok(Arc::new(Self {
            root,
            log_dir,
            location,
            config,
            commit_log,
            metadata,
            metalog,
            master,
            failure: FailureInducer::default(),
        }))
    }

    /// Directory holding one access group's cell stores for a range:
    /// `<root>/tables/<table>/<access_group>/<md5(end_row)[..24]>`.
    pub fn access_group_dir(&self, table_name: &str, access_group: &str, end_row: &[u8]) -> PathBuf {
        self.root
            .join("tables")
            .join(table_name)
            .join(access_group)
            .join(md5_prefix(end_row))
    }

    /// Transfer-log directory for a split at `split_point`:
    /// `<log_dir>/<md5(split_point)[..24]>`.
    pub fn transfer_log_dir(&self, split_point: &[u8]) -> PathBuf {
        self.log_dir.join(md5_prefix(split_point))
    }
}

/// Errors raised while opening the server context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Commit log failure.
    #[error("Commit log error: {0}")]
    CommitLog(#[from] crate::commitlog::CommitLogError),

    /// Metadata store failure.
    #[error("Metadata error: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    /// Range journal failure.
    #[error("Range journal error: {0}")]
    MetaLog(#[from] crate::metalog::MetaLogError),
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// First 24 hex characters (12 bytes) of the md5 digest of `bytes`,
/// used for collision-free directory names derived from row keys.
pub fn md5_prefix(bytes: &[u8]) -> String {
    let digest = md5::compute(bytes);
    let hex = format!("{digest:x}");
    hex[..24].to_string()
}

/// Current wall-clock time in microseconds since the UNIX epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}
