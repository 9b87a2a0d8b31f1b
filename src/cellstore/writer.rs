//! Cell store writer — builds a finalized store from a sorted cell stream.
//!
//! # Input requirements
//!
//! Cells must arrive in non-decreasing [`CellKey`] order; out-of-order
//! input is rejected. Duplicate keys are allowed (multiple versions of
//! one column are distinct keys by timestamp/revision).
//!
//! # Write I/O model
//!
//! Framed blocks are handed to a dedicated append thread over a channel;
//! `add` never blocks on disk. The writer counts outstanding appends and
//! `finalize` drains a completion ack for every one of them before the
//! trailer is written, so a successful `finalize` means every block is
//! on disk.
//!
//! # Atomicity
//!
//! Everything is written to `<path>.tmp` and renamed over `<path>` after
//! the final sync. A crash mid-build leaves only a `.tmp` file that the
//! next load ignores.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread::JoinHandle,
};

use bloomfilter::Bloom;
use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::cell::{Cell, CellKey, TableIdentifier};
use crate::encoding::{self, Encode};

use super::{
    BLOOM_BLOCK_MAGIC, BLOOM_FALSE_POSITIVE_RATE, BlockCodec, BloomMode, CellStoreError,
    DATA_BLOCK_MAGIC, FILE_HEADER_MAGIC, FILE_HEADER_VERSION, INDEX_FIXED_BLOCK_MAGIC,
    INDEX_VARIABLE_BLOCK_MAGIC, IndexEntry, TRAILER_VERSION, Trailer, bloom_row_col_item,
    frame_block,
};

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Construction parameters for one store.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Target uncompressed size of a data block.
    pub blocksize: u32,

    /// What the Bloom filter should index.
    pub bloom_mode: BloomMode,

    /// Item cap for [`BloomMode::RowsColsApprox`].
    pub max_approx_items: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            blocksize: 64 * 1024,
            bloom_mode: BloomMode::Rows,
            max_approx_items: 1000,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Append worker
// ------------------------------------------------------------------------------------------------

enum AppendJob {
    /// Write these bytes at the current end of file.
    Write(Vec<u8>),

    /// Sync and hand the file back for trailer writing.
    Finish,
}

fn spawn_append_worker(
    mut file: File,
    jobs: Receiver<AppendJob>,
    acks: Sender<io::Result<()>>,
) -> JoinHandle<io::Result<File>> {
    std::thread::spawn(move || {
        for job in jobs {
            match job {
                AppendJob::Write(bytes) => {
                    let result = file.write_all(&bytes);
                    // A dropped ack receiver means the writer is being
                    // abandoned; stop quietly.
                    if acks.send(result).is_err() {
                        break;
                    }
                }
                AppendJob::Finish => {
                    file.sync_all()?;
                    return Ok(file);
                }
            }
        }
        Ok(file)
    })
}

// ------------------------------------------------------------------------------------------------
// CellStoreWriter
// ------------------------------------------------------------------------------------------------

/// Single-use builder: `create → add… → finalize`.
pub struct CellStoreWriter {
    path: PathBuf,
    tmp_path: PathBuf,

    jobs: Sender<AppendJob>,
    acks: Receiver<io::Result<()>>,
    worker: Option<JoinHandle<io::Result<File>>>,
    outstanding_appends: usize,

    options: WriterOptions,

    /// Next write offset; appends are strictly sequential so the writer
    /// tracks it without consulting the file.
    offset: u64,

    /// Current (unsealed) data block payload.
    buffer: Vec<u8>,
    block_first_key: Option<CellKey>,
    last_key: Option<CellKey>,

    index: Vec<IndexEntry>,

    bloom: Option<Bloom<Vec<u8>>>,
    bloom_items: u64,
    bloom_capacity: usize,
    last_bloom_row: Option<Vec<u8>>,

    total_entries: u64,
    max_revision: u64,
    uncompressed_bytes: u64,
    stored_bytes: u64,

    finalized: bool,
}

impl CellStoreWriter {
    /// Creates the `.tmp` file, writes the file header, sizes the Bloom
    /// filter for `max_entries`, and starts the append worker.
    pub fn create(
        path: impl AsRef<Path>,
        max_entries: usize,
        options: WriterOptions,
    ) -> Result<Self, CellStoreError> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let (jobs, jobs_rx) = unbounded();
        let (acks_tx, acks) = unbounded();
        let worker = spawn_append_worker(file, jobs_rx, acks_tx);

        let bloom_capacity = match options.bloom_mode {
            BloomMode::Disabled => 0,
            BloomMode::Rows => max_entries.max(1),
            BloomMode::RowsCols => max_entries.saturating_mul(2).max(1),
            BloomMode::RowsColsApprox => options.max_approx_items.max(1),
        };

        let bloom = if options.bloom_mode == BloomMode::Disabled {
            None
        } else {
            Some(
                Bloom::new_for_fp_rate(bloom_capacity, BLOOM_FALSE_POSITIVE_RATE)
                    .map_err(|e| CellStoreError::Internal(e.to_string()))?,
            )
        };

        // File header frame.
        let mut header = Vec::with_capacity(super::FILE_HEADER_SIZE);
        header.extend_from_slice(&FILE_HEADER_MAGIC);
        header.extend_from_slice(&FILE_HEADER_VERSION.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        header.extend_from_slice(&hasher.finalize().to_le_bytes());
        let header_len = header.len() as u64;

        let mut writer = Self {
            path,
            tmp_path,
            jobs,
            acks,
            worker: Some(worker),
            outstanding_appends: 0,
            options,
            offset: 0,
            buffer: Vec::new(),
            block_first_key: None,
            last_key: None,
            index: Vec::new(),
            bloom,
            bloom_items: 0,
            bloom_capacity,
            last_bloom_row: None,
            total_entries: 0,
            max_revision: 0,
            uncompressed_bytes: 0,
            stored_bytes: 0,
            finalized: false,
        };

        writer.enqueue(header)?;
        writer.offset = header_len;
        Ok(writer)
    }

    /// Appends one cell. Keys must be non-decreasing.
    pub fn add(&mut self, key: &CellKey, value: &[u8]) -> Result<(), CellStoreError> {
        if let Some(last) = &self.last_key
            && key < last
        {
            return Err(CellStoreError::Internal(
                "cells added out of key order".into(),
            ));
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.clone());
        }

        self.offer_to_bloom(key);

        let cell = Cell {
            key: key.clone(),
            value: value.to_vec(),
        };
        cell.encode_to(&mut self.buffer)?;

        self.total_entries += 1;
        if key.revision > self.max_revision {
            self.max_revision = key.revision;
        }
        self.last_key = Some(key.clone());

        if self.buffer.len() >= self.options.blocksize as usize {
            self.seal_block()?;
        }

        // Opportunistically drain completed appends.
        while let Ok(result) = self.acks.try_recv() {
            self.outstanding_appends = self.outstanding_appends.saturating_sub(1);
            result?;
        }

        Ok(())
    }

    /// Seals the last block, writes both indexes and the Bloom filter,
    /// joins every outstanding append, writes the trailer, and renames
    /// the file into place.
    pub fn finalize(mut self, table: &TableIdentifier) -> Result<(), CellStoreError> {
        if !self.buffer.is_empty() {
            self.seal_block()?;
        }

        // Variable index.
        let var_index_offset = self.offset;
        let mut var_payload = Vec::new();
        encoding::encode_vec(&self.index, &mut var_payload)?;
        let frame = frame_block(&INDEX_VARIABLE_BLOCK_MAGIC, BlockCodec::None, &var_payload);
        self.offset += frame.len() as u64;
        self.enqueue(frame)?;

        // Fixed index (offsets only).
        let fix_index_offset = self.offset;
        let offsets: Vec<u64> = self.index.iter().map(|entry| entry.offset).collect();
        let mut fix_payload = Vec::new();
        encoding::encode_vec(&offsets, &mut fix_payload)?;
        let frame = frame_block(&INDEX_FIXED_BLOCK_MAGIC, BlockCodec::None, &fix_payload);
        self.offset += frame.len() as u64;
        self.enqueue(frame)?;

        // Bloom filter.
        let mut filter_offset = 0u64;
        let mut filter_length = 0u64;
        if let Some(bloom) = &self.bloom {
            filter_offset = self.offset;
            let payload = bloom.as_slice().to_vec();
            filter_length = payload.len() as u64;
            let frame = frame_block(&BLOOM_BLOCK_MAGIC, BlockCodec::None, &payload);
            self.offset += frame.len() as u64;
            self.enqueue(frame)?;
        }

        // Join every outstanding append before the trailer goes down.
        while self.outstanding_appends > 0 {
            let result = self
                .acks
                .recv()
                .map_err(|_| CellStoreError::Internal("append worker vanished".into()))?;
            self.outstanding_appends -= 1;
            result?;
        }

        self.jobs
            .send(AppendJob::Finish)
            .map_err(|_| CellStoreError::Internal("append worker vanished".into()))?;
        let worker = self
            .worker
            .take()
            .ok_or_else(|| CellStoreError::Internal("append worker already joined".into()))?;
        let mut file = worker
            .join()
            .map_err(|_| CellStoreError::Internal("append worker panicked".into()))??;

        let compression_ratio = if self.stored_bytes == 0 {
            1.0
        } else {
            self.uncompressed_bytes as f32 / self.stored_bytes as f32
        };

        let trailer = Trailer {
            fix_index_offset,
            var_index_offset,
            filter_offset,
            filter_length,
            filter_mode: if self.bloom.is_some() {
                self.options.bloom_mode
            } else {
                BloomMode::Disabled
            },
            filter_items: self.bloom_items,
            filter_fp_rate: BLOOM_FALSE_POSITIVE_RATE as f32,
            blocksize: self.options.blocksize,
            total_entries: self.total_entries,
            codec: BlockCodec::None,
            compression_ratio,
            revision: self.max_revision,
            table_id: table.id,
            table_generation: table.generation,
            version: TRAILER_VERSION,
        };

        file.write_all(&trailer.to_disk_bytes()?)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        info!(
            path = %self.path.display(),
            entries = self.total_entries,
            blocks = self.index.len(),
            revision = self.max_revision,
            "cell store finalized"
        );

        self.finalized = true;
        Ok(())
    }

    /// Cells added so far.
    pub fn entries(&self) -> u64 {
        self.total_entries
    }

    fn seal_block(&mut self) -> Result<(), CellStoreError> {
        let payload = std::mem::take(&mut self.buffer);
        let first_key = self
            .block_first_key
            .take()
            .ok_or_else(|| CellStoreError::Internal("sealing block without first key".into()))?;

        self.uncompressed_bytes += payload.len() as u64;
        let frame = frame_block(&DATA_BLOCK_MAGIC, BlockCodec::None, &payload);
        self.stored_bytes += payload.len() as u64;

        self.index.push(IndexEntry {
            first_key,
            offset: self.offset,
            length: frame.len() as u32,
        });

        debug!(
            offset = self.offset,
            payload = payload.len(),
            "data block sealed"
        );

        self.offset += frame.len() as u64;
        self.enqueue(frame)
    }

    fn enqueue(&mut self, bytes: Vec<u8>) -> Result<(), CellStoreError> {
        self.jobs
            .send(AppendJob::Write(bytes))
            .map_err(|_| CellStoreError::Internal("append worker vanished".into()))?;
        self.outstanding_appends += 1;
        Ok(())
    }

    fn offer_to_bloom(&mut self, key: &CellKey) {
        let Some(bloom) = &mut self.bloom else {
            return;
        };

        // Past the approx cap the filter stops counting items; accuracy
        // degrades instead of memory growing, so keep inserting.
        let counting = self.options.bloom_mode != BloomMode::RowsColsApprox
            || (self.bloom_items as usize) < self.bloom_capacity;

        let new_row = self.last_bloom_row.as_deref() != Some(key.row.as_slice());
        if new_row {
            bloom.set(&key.row);
            if counting {
                self.bloom_items += 1;
            }
            self.last_bloom_row = Some(key.row.clone());
        }

        if self.options.bloom_mode.indexes_columns() && key.column_family != 0 {
            bloom.set(&bloom_row_col_item(&key.row, key.column_family));
            if counting {
                self.bloom_items += 1;
            }
        }
    }
}

impl std::fmt::Debug for CellStoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStoreWriter")
            .field("path", &self.path)
            .field("entries", &self.total_entries)
            .field("blocks", &self.index.len())
            .field("outstanding_appends", &self.outstanding_appends)
            .finish_non_exhaustive()
    }
}

impl Drop for CellStoreWriter {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        // Abandoned build: stop the worker and remove the partial file.
        let (noop_tx, _noop_rx) = unbounded();
        let jobs = std::mem::replace(&mut self.jobs, noop_tx);
        drop(jobs);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if self.tmp_path.exists()
            && let Err(e) = fs::remove_file(&self.tmp_path)
        {
            warn!(path = %self.tmp_path.display(), error = %e, "failed to remove abandoned cell store tmp file");
        }
    }
}
