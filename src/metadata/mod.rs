//! # Metadata
//!
//! Access to the METADATA table from the range server's point of view.
//!
//! Every range of every table is described by a METADATA row keyed
//! `"<table_id>:<end_row>"` with three columns the engine reads and
//! writes: `StartRow`, `Files:<access_group>`, and `Location`. The row
//! for the root range itself cannot live in the table it describes, so
//! its file lists are kept in a flat file under the server root instead.
//! [`Metadata`] is the two-variant handle over both placements.
//!
//! ## Durability
//!
//! [`MetadataStore`] is the process-wide handle, persisted with a
//! journal + snapshot model:
//!
//! 1. Every mutation batch is one journal record — a split's two-row
//!    update is therefore atomic on disk.
//! 2. `checkpoint()` writes a CRC-protected snapshot (`METASTORE`) via
//!    temp-file + rename, fsyncs the directory, and truncates the
//!    journal.
//! 3. On open: load snapshot if valid, then replay the journal on top.
//!    A corrupt snapshot falls back to full journal replay.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::journal::{Journal, JournalError};

const SNAPSHOT_FILENAME: &str = "METASTORE";
const SNAPSHOT_TMP_SUFFIX: &str = "tmp";
const JOURNAL_FILENAME: &str = "metastore.log";
const ROOT_FILES_FILENAME: &str = "root.metadata";

/// Record magic of metadata mutation batches.
pub(crate) const METADATA_JOURNAL_MAGIC: [u8; 4] = *b"TMDS";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by metadata operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Underlying journal failure.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot file failed its checksum.
    #[error("Snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Row key
// ------------------------------------------------------------------------------------------------

/// METADATA row key for a range: `"<table_id>:" ++ end_row`.
pub fn metadata_row_key(table_id: u32, end_row: &[u8]) -> Vec<u8> {
    let mut key = format!("{table_id}:").into_bytes();
    key.extend_from_slice(end_row);
    key
}

// ------------------------------------------------------------------------------------------------
// Row contents
// ------------------------------------------------------------------------------------------------

/// The columns of one METADATA row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeDescriptor {
    /// `StartRow` column — exclusive lower bound of the range.
    pub start_row: Vec<u8>,

    /// `Files:<access_group>` columns — `;`-separated cell store lists.
    pub files: BTreeMap<String, String>,

    /// `Location` column — range server holding the range, if assigned.
    pub location: Option<String>,
}

impl Encode for RangeDescriptor {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.start_row.encode_to(buf)?;
        let files: Vec<FileListEntry> = self
            .files
            .iter()
            .map(|(access_group, files)| FileListEntry {
                access_group: access_group.clone(),
                files: files.clone(),
            })
            .collect();
        encoding::encode_vec(&files, buf)?;
        self.location.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RangeDescriptor {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (start_row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (files, n) = encoding::decode_vec::<FileListEntry>(&buf[offset..])?;
        offset += n;
        let (location, n) = <Option<String>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                start_row,
                files: files
                    .into_iter()
                    .map(|entry| (entry.access_group, entry.files))
                    .collect(),
                location,
            },
            offset,
        ))
    }
}

/// One `Files:<access_group>` column value.
#[derive(Debug, Clone, PartialEq)]
pub struct FileListEntry {
    /// Access group name (the column qualifier).
    pub access_group: String,

    /// `;`-separated cell store paths.
    pub files: String,
}

impl Encode for FileListEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.access_group.encode_to(buf)?;
        self.files.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FileListEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (access_group, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (files, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                access_group,
                files,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Mutations
// ------------------------------------------------------------------------------------------------

/// One column write against a METADATA row.
#[derive(Debug, Clone)]
pub enum MetadataMutation {
    /// Set the `StartRow` column.
    SetStartRow {
        /// Target row key.
        row: Vec<u8>,
        /// New exclusive lower bound.
        start_row: Vec<u8>,
    },

    /// Set one `Files:<access_group>` column.
    SetFiles {
        /// Target row key.
        row: Vec<u8>,
        /// Access group (column qualifier).
        access_group: String,
        /// `;`-separated file list.
        files: String,
    },

    /// Set the `Location` column.
    SetLocation {
        /// Target row key.
        row: Vec<u8>,
        /// Serving range server.
        location: String,
    },

    /// Delete an entire row (range unload).
    RemoveRow {
        /// Target row key.
        row: Vec<u8>,
    },
}

impl Encode for MetadataMutation {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Self::SetStartRow { row, start_row } => {
                0u8.encode_to(buf)?;
                row.encode_to(buf)?;
                start_row.encode_to(buf)?;
            }
            Self::SetFiles {
                row,
                access_group,
                files,
            } => {
                1u8.encode_to(buf)?;
                row.encode_to(buf)?;
                access_group.encode_to(buf)?;
                files.encode_to(buf)?;
            }
            Self::SetLocation { row, location } => {
                2u8.encode_to(buf)?;
                row.encode_to(buf)?;
                location.encode_to(buf)?;
            }
            Self::RemoveRow { row } => {
                3u8.encode_to(buf)?;
                row.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for MetadataMutation {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u8::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                let (start_row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Self::SetStartRow { row, start_row }, offset))
            }
            1 => {
                let (row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                let (access_group, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                let (files, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Ok((
                    Self::SetFiles {
                        row,
                        access_group,
                        files,
                    },
                    offset,
                ))
            }
            2 => {
                let (row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                let (location, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Self::SetLocation { row, location }, offset))
            }
            3 => {
                let (row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Self::RemoveRow { row }, offset))
            }
            _ => Err(EncodingError::InvalidTag {
                tag: u32::from(tag),
                type_name: "MetadataMutation",
            }),
        }
    }
}

/// One journal record: a batch of mutations applied atomically.
#[derive(Debug)]
struct MutationBatch(Vec<MetadataMutation>);

impl Encode for MutationBatch {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.0, buf)
    }
}

impl Decode for MutationBatch {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (mutations, n) = encoding::decode_vec::<MetadataMutation>(buf)?;
        Ok((Self(mutations), n))
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Snapshot {
    rows: Vec<(Vec<u8>, RangeDescriptor)>,
    checksum: u32,
}

impl Encode for Snapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.rows.len() as u32).encode_to(buf)?;
        for (row, descriptor) in &self.rows {
            row.encode_to(buf)?;
            descriptor.encode_to(buf)?;
        }
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Snapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (count, n) = u32::decode_from(buf)?;
        offset += n;
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
            offset += n;
            let (descriptor, n) = RangeDescriptor::decode_from(&buf[offset..])?;
            offset += n;
            rows.push((row, descriptor));
        }
        let (checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { rows, checksum }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// MetadataStore
// ------------------------------------------------------------------------------------------------

/// Process-wide METADATA row store: journal + snapshot.
#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
    journal: Mutex<Journal<MutationBatch>>,
    rows: Mutex<BTreeMap<Vec<u8>, RangeDescriptor>>,
}

impl MetadataStore {
    /// Opens the store under `dir`, loading the snapshot (if valid) and
    /// replaying the journal.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILENAME);
        let mut rows = BTreeMap::new();

        if snapshot_path.exists() {
            match Self::read_snapshot(&snapshot_path) {
                Ok(snapshot_rows) => {
                    rows = snapshot_rows;
                    info!(path = %snapshot_path.display(), "metadata snapshot loaded");
                }
                Err(e) => {
                    // The journal is ground truth; a snapshot is only a
                    // replay shortcut.
                    warn!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "metadata snapshot unreadable; replaying full journal"
                    );
                    rows = BTreeMap::new();
                }
            }
        }

        let journal = Journal::open(dir.join(JOURNAL_FILENAME), METADATA_JOURNAL_MAGIC)?;

        let mut replayed = 0u64;
        for item in journal.cursor()? {
            match item {
                Ok(MutationBatch(mutations)) => {
                    Self::fold(&mut rows, &mutations);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "metadata journal replay stopped");
                    break;
                }
            }
        }

        info!(
            dir = %dir.display(),
            rows = rows.len(),
            replayed,
            "metadata store opened"
        );

        Ok(Self {
            dir,
            journal: Mutex::new(journal),
            rows: Mutex::new(rows),
        })
    }

    /// Applies a batch of mutations atomically: one journal record,
    /// then the in-memory fold.
    pub fn apply(&self, mutations: Vec<MetadataMutation>) -> Result<(), MetadataError> {
        if mutations.is_empty() {
            return Ok(());
        }

        {
            let journal = self
                .journal
                .lock()
                .map_err(|_| MetadataError::Internal("Mutex poisoned".into()))?;
            journal.append(&MutationBatch(mutations.clone()))?;
        }

        let mut rows = self.lock_rows()?;
        Self::fold(&mut rows, &mutations);
        Ok(())
    }

    /// Returns one row, if present.
    pub fn get(&self, row: &[u8]) -> Result<Option<RangeDescriptor>, MetadataError> {
        Ok(self.lock_rows()?.get(row).cloned())
    }

    /// Returns every row, for inspection and tests.
    pub fn rows(&self) -> Result<Vec<(Vec<u8>, RangeDescriptor)>, MetadataError> {
        Ok(self
            .lock_rows()?
            .iter()
            .map(|(row, descriptor)| (row.clone(), descriptor.clone()))
            .collect())
    }

    /// Writes a snapshot, fsyncs it into place, and truncates the journal.
    pub fn checkpoint(&self) -> Result<(), MetadataError> {
        let rows: Vec<(Vec<u8>, RangeDescriptor)> = self
            .lock_rows()?
            .iter()
            .map(|(row, descriptor)| (row.clone(), descriptor.clone()))
            .collect();

        // Serialize with checksum 0, then patch the trailing 4 bytes.
        let snapshot = Snapshot { rows, checksum: 0 };
        let mut bytes = encoding::encode_to_vec(&snapshot)?;

        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        let checksum = hasher.finalize();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&checksum.to_le_bytes());

        let tmp_path = self
            .dir
            .join(format!("{SNAPSHOT_FILENAME}.{SNAPSHOT_TMP_SUFFIX}"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        let final_path = self.dir.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        info!(path = %final_path.display(), "metadata snapshot written");

        let journal = self
            .journal
            .lock()
            .map_err(|_| MetadataError::Internal("Mutex poisoned".into()))?;
        journal.truncate()?;
        Ok(())
    }

    fn fold(rows: &mut BTreeMap<Vec<u8>, RangeDescriptor>, mutations: &[MetadataMutation]) {
        for mutation in mutations {
            match mutation {
                MetadataMutation::SetStartRow { row, start_row } => {
                    rows.entry(row.clone()).or_default().start_row = start_row.clone();
                }
                MetadataMutation::SetFiles {
                    row,
                    access_group,
                    files,
                } => {
                    rows.entry(row.clone())
                        .or_default()
                        .files
                        .insert(access_group.clone(), files.clone());
                }
                MetadataMutation::SetLocation { row, location } => {
                    rows.entry(row.clone()).or_default().location = Some(location.clone());
                }
                MetadataMutation::RemoveRow { row } => {
                    rows.remove(row);
                }
            }
        }
    }

    fn read_snapshot(path: &Path) -> Result<BTreeMap<Vec<u8>, RangeDescriptor>, MetadataError> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (snapshot, _) = encoding::decode_from_slice::<Snapshot>(&bytes)?;

        let verify = Snapshot {
            rows: snapshot.rows.clone(),
            checksum: 0,
        };
        let verify_bytes = encoding::encode_to_vec(&verify)?;
        let mut hasher = Crc32::new();
        hasher.update(&verify_bytes);
        if hasher.finalize() != snapshot.checksum {
            return Err(MetadataError::SnapshotChecksumMismatch);
        }

        Ok(snapshot.rows.into_iter().collect())
    }

    fn lock_rows(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, RangeDescriptor>>, MetadataError> {
        self.rows
            .lock()
            .map_err(|_| MetadataError::Internal("Mutex poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Metadata — per-range view, Root vs Normal
// ------------------------------------------------------------------------------------------------

/// Per-range metadata handle.
///
/// Both variants expose the same file-list scan and write operations;
/// they differ only in where the lists live — a flat file under the
/// server root for the root range, or a [`MetadataStore`] row for every
/// other range.
#[derive(Debug)]
pub enum Metadata {
    /// File lists of the root range, stored beside the server root.
    Root {
        /// Path of the flat file.
        path: PathBuf,
        /// Loaded `(access_group, files)` entries.
        entries: Vec<FileListEntry>,
        /// Scan cursor.
        cursor: usize,
    },

    /// File lists of a regular range, stored in its METADATA row.
    Normal {
        /// Backing store.
        store: Arc<MetadataStore>,
        /// Row key of this range.
        row: Vec<u8>,
        /// Loaded `(access_group, files)` entries.
        entries: Vec<FileListEntry>,
        /// Scan cursor.
        cursor: usize,
    },
}

impl Metadata {
    /// Handle for the root range; `server_root` is the server root dir.
    pub fn root(server_root: impl AsRef<Path>) -> Self {
        Self::Root {
            path: server_root.as_ref().join(ROOT_FILES_FILENAME),
            entries: Vec::new(),
            cursor: 0,
        }
    }

    /// Handle for a regular range.
    pub fn normal(store: Arc<MetadataStore>, table_id: u32, end_row: &[u8]) -> Self {
        Self::Normal {
            store,
            row: metadata_row_key(table_id, end_row),
            entries: Vec::new(),
            cursor: 0,
        }
    }

    /// (Re)loads the file lists and resets the scan cursor.
    pub fn reset_files_scan(&mut self) -> Result<(), MetadataError> {
        match self {
            Self::Root {
                path,
                entries,
                cursor,
            } => {
                *entries = if path.exists() {
                    let mut bytes = Vec::new();
                    File::open(&*path)?.read_to_end(&mut bytes)?;
                    let (loaded, _) = encoding::decode_vec::<FileListEntry>(&bytes)?;
                    loaded
                } else {
                    Vec::new()
                };
                *cursor = 0;
            }
            Self::Normal {
                store,
                row,
                entries,
                cursor,
            } => {
                *entries = match store.get(row)? {
                    Some(descriptor) => descriptor
                        .files
                        .into_iter()
                        .map(|(access_group, files)| FileListEntry {
                            access_group,
                            files,
                        })
                        .collect(),
                    None => Vec::new(),
                };
                *cursor = 0;
            }
        }
        Ok(())
    }

    /// Next `(access_group, files)` pair, or `None` when exhausted.
    pub fn get_next_files(&mut self) -> Option<(String, String)> {
        let (entries, cursor) = match self {
            Self::Root {
                entries, cursor, ..
            }
            | Self::Normal {
                entries, cursor, ..
            } => (entries, cursor),
        };
        let entry = entries.get(*cursor)?;
        *cursor += 1;
        Some((entry.access_group.clone(), entry.files.clone()))
    }

    /// Writes one access group's file list.
    pub fn write_files(&mut self, access_group: &str, files: &str) -> Result<(), MetadataError> {
        match self {
            Self::Root { path, entries, .. } => {
                match entries
                    .iter_mut()
                    .find(|entry| entry.access_group == access_group)
                {
                    Some(entry) => entry.files = files.to_string(),
                    None => entries.push(FileListEntry {
                        access_group: access_group.to_string(),
                        files: files.to_string(),
                    }),
                }

                let mut bytes = Vec::new();
                encoding::encode_vec(entries, &mut bytes)?;

                let tmp = path.with_extension("tmp");
                {
                    let mut file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&tmp)?;
                    file.write_all(&bytes)?;
                    file.sync_all()?;
                }
                fs::rename(&tmp, &*path)?;
                Ok(())
            }
            Self::Normal { store, row, .. } => store.apply(vec![MetadataMutation::SetFiles {
                row: row.clone(),
                access_group: access_group.to_string(),
                files: files.to_string(),
            }]),
        }
    }
}
