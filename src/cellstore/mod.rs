//! # CellStore
//!
//! An immutable, disk-backed sorted file of cells for one access group,
//! covering a row interval within one range.
//!
//! ## Design Overview
//!
//! Cells are appended in key order into fixed-target-size **data
//! blocks**. Every block on disk — data, the two indexes, and the Bloom
//! filter — is framed the same way: a 10-byte magic, a
//! [`BlockHeader`] carrying the codec id, lengths, and a CRC32 of the
//! payload, then the payload itself. The codec id is an envelope for
//! future compression codecs; [`BlockCodec::None`] is the one
//! implemented codec and payloads are stored verbatim.
//!
//! The **variable index** maps the first key of every data block to its
//! `(offset, length)`; the **fixed index** repeats the offsets alone so
//! the block count and placement can be validated independently. The
//! optional **Bloom filter** answers "definitely absent" for point rows
//! (and row+family pairs in the `RowsCols` modes).
//!
//! # On-disk layout
//!
//! ```text
//! [FILE_HEADER (12 B)]
//! [data block | data block | ...]
//! [variable index block]
//! [fixed index block]
//! [bloom filter block (optional)]
//! [trailer (last 512 bytes)]
//! ```
//!
//! Each block: `{ magic[10], BlockHeader, payload }`.
//!
//! The trailer pins the offsets of both indexes and the filter, the
//! filter parameters, block size, entry count, codec, compression ratio,
//! the highest cell revision in the file, and the owning table — all in
//! the final 512 bytes so a reader can bootstrap from the file length
//! alone.
//!
//! # Concurrency model
//!
//! A `CellStore` is immutable once finalized. Readers share it through
//! `Arc`; scans are lock-free over the shared `mmap`. The write path is
//! a separate single-use [`CellStoreWriter`](writer::CellStoreWriter).
//!
//! # Failure
//!
//! A bad magic, a checksum mismatch, or a malformed trailer anywhere in
//! the open/scan pipeline surfaces [`CellStoreError::BadCellStore`]; the
//! caller abandons the store.

pub mod scanner;
pub mod writer;

#[cfg(test)]
mod tests;

pub use scanner::{CellStoreScanner, ScanErrorHandle};
pub use writer::{CellStoreWriter, WriterOptions};

use std::{fs::File, io, path::Path, path::PathBuf, sync::Arc};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cell::{CellKey, ScanSpec};
use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const FILE_HEADER_MAGIC: [u8; 4] = *b"TCS0";
pub(crate) const FILE_HEADER_VERSION: u32 = 1;
/// `magic(4) + version(4) + crc(4)`.
pub(crate) const FILE_HEADER_SIZE: usize = 12;

/// Magic prefixes, 10 bytes each.
pub(crate) const DATA_BLOCK_MAGIC: [u8; 10] = *b"TCSBlkData";
pub(crate) const INDEX_VARIABLE_BLOCK_MAGIC: [u8; 10] = *b"TCSBlkVIdx";
pub(crate) const INDEX_FIXED_BLOCK_MAGIC: [u8; 10] = *b"TCSBlkFIdx";
pub(crate) const BLOOM_BLOCK_MAGIC: [u8; 10] = *b"TCSBlkBlom";

/// `magic(10) + codec(1) + uncompressed_len(4) + stored_len(4) + crc(4)`.
pub(crate) const BLOCK_FRAME_SIZE: usize = 23;

/// The trailer occupies exactly the final 512 bytes of the file.
pub const TRAILER_SIZE: usize = 512;

pub(crate) const TRAILER_MAGIC: [u8; 4] = *b"TCST";
pub(crate) const TRAILER_VERSION: u8 = 1;

/// Bloom filter false-positive target.
pub(crate) const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by cell store operations (create, open, scan).
#[derive(Debug, Error)]
pub enum CellStoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structural corruption: bad magic, checksum mismatch, malformed
    /// trailer or index.
    #[error("Bad cell store: {0}")]
    BadCellStore(String),

    /// The file name does not follow the `cs<N>` convention.
    #[error("Bad cell store filename: {0}")]
    BadFilename(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Block codec envelope
// ------------------------------------------------------------------------------------------------

/// Compression codec id carried by every block header and the trailer.
///
/// Only [`BlockCodec::None`] is implemented; the id exists so the format
/// can grow codecs without a version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockCodec {
    /// Payload stored verbatim.
    None = 0,
}

impl BlockCodec {
    fn from_byte(byte: u8) -> Result<Self, CellStoreError> {
        match byte {
            0 => Ok(Self::None),
            other => Err(CellStoreError::BadCellStore(format!(
                "unknown block codec id {other}"
            ))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Bloom filter mode
// ------------------------------------------------------------------------------------------------

/// What the Bloom filter indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomMode {
    /// No filter is built.
    Disabled = 0,

    /// Row keys only.
    Rows = 1,

    /// Row keys plus `(row, column family)` composites.
    RowsCols = 2,

    /// Like `RowsCols`, but the item count fed to the filter is capped;
    /// beyond the cap new items are still inserted (the false-positive
    /// rate degrades instead of the memory growing).
    RowsColsApprox = 3,
}

impl BloomMode {
    fn from_byte(byte: u8) -> Result<Self, CellStoreError> {
        match byte {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Rows),
            2 => Ok(Self::RowsCols),
            3 => Ok(Self::RowsColsApprox),
            other => Err(CellStoreError::BadCellStore(format!(
                "unknown bloom mode {other}"
            ))),
        }
    }

    /// Whether `(row, family)` composites are indexed.
    pub(crate) fn indexes_columns(self) -> bool {
        matches!(self, Self::RowsCols | Self::RowsColsApprox)
    }
}

/// Bloom composite item for `(row, family)` lookups.
pub(crate) fn bloom_row_col_item(row: &[u8], family: u8) -> Vec<u8> {
    let mut item = Vec::with_capacity(row.len() + 2);
    item.extend_from_slice(row);
    item.push(0x00);
    item.push(family);
    item
}

// ------------------------------------------------------------------------------------------------
// Block header
// ------------------------------------------------------------------------------------------------

/// Per-block header following the 10-byte magic.
#[derive(Debug)]
pub(crate) struct BlockHeader {
    /// Codec applied to the payload.
    pub(crate) codec: BlockCodec,

    /// Payload length before compression.
    pub(crate) uncompressed_len: u32,

    /// Payload length as stored.
    pub(crate) stored_len: u32,

    /// CRC32 of the stored payload.
    pub(crate) checksum: u32,
}

/// Frames a payload into `magic + header + payload` bytes.
pub(crate) fn frame_block(magic: &[u8; 10], codec: BlockCodec, payload: &[u8]) -> Vec<u8> {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let checksum = hasher.finalize();

    let mut frame = Vec::with_capacity(BLOCK_FRAME_SIZE + payload.len());
    frame.extend_from_slice(magic);
    frame.push(codec as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reads and verifies one framed block at `offset`, returning its payload.
pub(crate) fn read_block(
    mmap: &Mmap,
    offset: u64,
    expected_magic: &[u8; 10],
) -> Result<Vec<u8>, CellStoreError> {
    let start = usize::try_from(offset)
        .map_err(|_| CellStoreError::BadCellStore("block offset exceeds address space".into()))?;

    if start + BLOCK_FRAME_SIZE > mmap.len() {
        return Err(CellStoreError::BadCellStore(
            "block frame extends past end of file".into(),
        ));
    }

    if mmap[start..start + 10] != expected_magic[..] {
        return Err(CellStoreError::BadCellStore(format!(
            "block magic mismatch at offset {offset}"
        )));
    }

    let codec = BlockCodec::from_byte(mmap[start + 10])?;
    let uncompressed_len =
        u32::from_le_bytes(mmap[start + 11..start + 15].try_into().unwrap_or([0; 4])) as usize;
    let stored_len =
        u32::from_le_bytes(mmap[start + 15..start + 19].try_into().unwrap_or([0; 4])) as usize;
    let stored_checksum =
        u32::from_le_bytes(mmap[start + 19..start + 23].try_into().unwrap_or([0; 4]));

    let payload_start = start + BLOCK_FRAME_SIZE;
    if payload_start + stored_len > mmap.len() {
        return Err(CellStoreError::BadCellStore(
            "block payload extends past end of file".into(),
        ));
    }

    let payload = &mmap[payload_start..payload_start + stored_len];

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored_checksum {
        return Err(CellStoreError::BadCellStore(format!(
            "block checksum mismatch at offset {offset}"
        )));
    }

    match codec {
        BlockCodec::None => {
            if stored_len != uncompressed_len {
                return Err(CellStoreError::BadCellStore(
                    "length mismatch for uncompressed block".into(),
                ));
            }
            Ok(payload.to_vec())
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Trailer
// ------------------------------------------------------------------------------------------------

/// Fixed-size trailer occupying the last [`TRAILER_SIZE`] bytes.
#[derive(Debug, Clone)]
pub struct Trailer {
    /// Offset of the fixed index block.
    pub fix_index_offset: u64,

    /// Offset of the variable index block.
    pub var_index_offset: u64,

    /// Offset of the Bloom filter block (0 when disabled).
    pub filter_offset: u64,

    /// Stored length of the Bloom filter payload.
    pub filter_length: u64,

    /// What the filter indexes.
    pub filter_mode: BloomMode,

    /// Item count the filter was sized for.
    pub filter_items: u64,

    /// Filter false-positive target (bits of an `f32`).
    pub filter_fp_rate: f32,

    /// Target uncompressed data block size.
    pub blocksize: u32,

    /// Total cells in the file.
    pub total_entries: u64,

    /// Codec used for every block.
    pub codec: BlockCodec,

    /// `uncompressed / stored` across all data blocks.
    pub compression_ratio: f32,

    /// Highest cell revision present in the file.
    pub revision: u64,

    /// Owning table id.
    pub table_id: u32,

    /// Owning table schema generation at write time.
    pub table_generation: u32,

    /// Trailer format version.
    pub version: u8,
}

impl Encode for Trailer {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        TRAILER_MAGIC.encode_to(buf)?;
        self.fix_index_offset.encode_to(buf)?;
        self.var_index_offset.encode_to(buf)?;
        self.filter_offset.encode_to(buf)?;
        self.filter_length.encode_to(buf)?;
        (self.filter_mode as u8).encode_to(buf)?;
        self.filter_items.encode_to(buf)?;
        self.filter_fp_rate.encode_to(buf)?;
        self.blocksize.encode_to(buf)?;
        self.total_entries.encode_to(buf)?;
        (self.codec as u8).encode_to(buf)?;
        self.compression_ratio.encode_to(buf)?;
        self.revision.encode_to(buf)?;
        self.table_id.encode_to(buf)?;
        self.table_generation.encode_to(buf)?;
        self.version.encode_to(buf)?;
        Ok(())
    }
}

impl Trailer {
    /// Serializes the trailer into its fixed 512-byte on-disk form:
    /// encoded fields, zero padding, and a CRC32 of the first 508 bytes
    /// in the final 4.
    pub(crate) fn to_disk_bytes(&self) -> Result<Vec<u8>, CellStoreError> {
        let mut bytes = encoding::encode_to_vec(self)?;
        if bytes.len() > TRAILER_SIZE - 4 {
            return Err(CellStoreError::Internal("trailer overflows 512 bytes".into()));
        }
        bytes.resize(TRAILER_SIZE - 4, 0);

        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(bytes)
    }

    /// Parses and verifies a trailer from the last 512 bytes of a file.
    pub(crate) fn from_disk_bytes(bytes: &[u8]) -> Result<Self, CellStoreError> {
        if bytes.len() != TRAILER_SIZE {
            return Err(CellStoreError::BadCellStore("short trailer".into()));
        }

        let body = &bytes[..TRAILER_SIZE - 4];
        let stored_crc = u32::from_le_bytes(bytes[TRAILER_SIZE - 4..].try_into().unwrap_or([0; 4]));

        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(CellStoreError::BadCellStore("trailer checksum mismatch".into()));
        }

        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&body[offset..])?;
        offset += n;
        if magic != TRAILER_MAGIC {
            return Err(CellStoreError::BadCellStore("trailer magic mismatch".into()));
        }

        let (fix_index_offset, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (var_index_offset, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (filter_offset, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (filter_length, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (filter_mode_byte, n) = u8::decode_from(&body[offset..])?;
        offset += n;
        let (filter_items, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (filter_fp_rate, n) = f32::decode_from(&body[offset..])?;
        offset += n;
        let (blocksize, n) = u32::decode_from(&body[offset..])?;
        offset += n;
        let (total_entries, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (codec_byte, n) = u8::decode_from(&body[offset..])?;
        offset += n;
        let (compression_ratio, n) = f32::decode_from(&body[offset..])?;
        offset += n;
        let (revision, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (table_id, n) = u32::decode_from(&body[offset..])?;
        offset += n;
        let (table_generation, n) = u32::decode_from(&body[offset..])?;
        offset += n;
        let (version, _) = u8::decode_from(&body[offset..])?;

        if version != TRAILER_VERSION {
            return Err(CellStoreError::BadCellStore(format!(
                "unsupported trailer version {version}"
            )));
        }

        Ok(Self {
            fix_index_offset,
            var_index_offset,
            filter_offset,
            filter_length,
            filter_mode: BloomMode::from_byte(filter_mode_byte)?,
            filter_items,
            filter_fp_rate,
            blocksize,
            total_entries,
            codec: BlockCodec::from_byte(codec_byte)?,
            compression_ratio,
            revision,
            table_id,
            table_generation,
            version,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Index entries
// ------------------------------------------------------------------------------------------------

/// One variable-index entry: the first key of a data block and the
/// block's frame location.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: CellKey,
    pub(crate) offset: u64,
    pub(crate) length: u32,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.length.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = CellKey::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (length, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                first_key,
                offset,
                length,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Extracts the numeric store id from a `cs<N>` file name.
pub fn file_id_from_path(path: &Path) -> Result<u32, CellStoreError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CellStoreError::BadFilename(path.display().to_string()))?;

    name.strip_prefix("cs")
        .and_then(|rest| rest.parse::<u32>().ok())
        .ok_or_else(|| CellStoreError::BadFilename(path.display().to_string()))
}

// ------------------------------------------------------------------------------------------------
// CellStore — immutable reader
// ------------------------------------------------------------------------------------------------

/// A finalized, memory-mapped cell store.
///
/// Shared between an access group and any number of in-flight scanners
/// via `Arc`. `open` bootstraps from the trailer; `load_index` must be
/// called before scanning.
pub struct CellStore {
    path: PathBuf,
    file_id: u32,
    mmap: Mmap,
    trailer: Trailer,

    /// Clipping bounds: cells outside `(start_row, end_row]` are invisible.
    start_row: Vec<u8>,
    end_row: Vec<u8>,

    /// Loaded + clipped variable index; empty until `load_index`.
    index: Vec<IndexEntry>,

    /// Where data blocks end (the variable index offset).
    data_end: u64,

    /// Decoded Bloom filter, if the store carries one.
    bloom: Option<Bloom<Vec<u8>>>,

    disk_usage: u64,
}

impl std::fmt::Debug for CellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStore")
            .field("path", &self.path)
            .field("file_id", &self.file_id)
            .field("total_entries", &self.trailer.total_entries)
            .field("blocks", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl CellStore {
    /// Opens a finalized store and verifies header and trailer.
    ///
    /// `start_row`/`end_row` become the clipping bounds: a store opened
    /// by a shrunk range hides cells outside `(start_row, end_row]`
    /// without rewriting the file.
    pub fn open(
        path: impl AsRef<Path>,
        start_row: &[u8],
        end_row: &[u8],
    ) -> Result<Self, CellStoreError> {
        let path = path.as_ref().to_path_buf();
        let file_id = file_id_from_path(&path)?;

        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FILE_HEADER_SIZE + TRAILER_SIZE {
            return Err(CellStoreError::BadCellStore("file too small".into()));
        }

        // File header: magic + version + crc.
        if mmap[0..4] != FILE_HEADER_MAGIC[..] {
            return Err(CellStoreError::BadCellStore("file header magic mismatch".into()));
        }
        let header_version = u32::from_le_bytes(mmap[4..8].try_into().unwrap_or([0; 4]));
        if header_version != FILE_HEADER_VERSION {
            return Err(CellStoreError::BadCellStore(format!(
                "unsupported file version {header_version}"
            )));
        }
        let header_crc = u32::from_le_bytes(mmap[8..12].try_into().unwrap_or([0; 4]));
        let mut hasher = Crc32::new();
        hasher.update(&mmap[0..8]);
        if hasher.finalize() != header_crc {
            return Err(CellStoreError::BadCellStore("file header checksum mismatch".into()));
        }

        let trailer = Trailer::from_disk_bytes(&mmap[mmap.len() - TRAILER_SIZE..])?;
        let disk_usage = mmap.len() as u64;
        let data_end = trailer.var_index_offset;

        debug!(
            path = %path.display(),
            entries = trailer.total_entries,
            revision = trailer.revision,
            "cell store opened"
        );

        Ok(Self {
            path,
            file_id,
            mmap,
            trailer,
            start_row: start_row.to_vec(),
            end_row: end_row.to_vec(),
            index: Vec::new(),
            data_end,
            bloom: None,
            disk_usage,
        })
    }

    /// Reads and decodes both indexes (validating one against the other)
    /// and the Bloom filter, then drops blocks entirely outside the
    /// clipping bounds.
    pub fn load_index(&mut self) -> Result<(), CellStoreError> {
        let var_payload = read_block(
            &self.mmap,
            self.trailer.var_index_offset,
            &INDEX_VARIABLE_BLOCK_MAGIC,
        )?;
        let (entries, _) = encoding::decode_vec::<IndexEntry>(&var_payload)?;

        let fix_payload = read_block(
            &self.mmap,
            self.trailer.fix_index_offset,
            &INDEX_FIXED_BLOCK_MAGIC,
        )?;
        let (offsets, _) = encoding::decode_vec::<u64>(&fix_payload)?;

        if offsets.len() != entries.len()
            || entries
                .iter()
                .zip(offsets.iter())
                .any(|(entry, offset)| entry.offset != *offset)
        {
            return Err(CellStoreError::BadCellStore(
                "fixed and variable indexes disagree".into(),
            ));
        }

        // Drop blocks whose row interval cannot intersect (start, end].
        // Block i spans rows [first_key(i).row, first_key(i+1).row).
        let mut kept = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let below = match entries.get(i + 1) {
                Some(next) => next.first_key.row.as_slice() <= self.start_row.as_slice(),
                None => false,
            };
            let above = entry.first_key.row.as_slice() > self.end_row.as_slice();
            if !below && !above {
                kept.push(entry.clone());
            }
        }

        debug!(
            path = %self.path.display(),
            total_blocks = entries.len(),
            kept_blocks = kept.len(),
            "cell store index loaded"
        );
        self.index = kept;

        if self.trailer.filter_mode != BloomMode::Disabled && self.trailer.filter_length > 0 {
            let payload = read_block(&self.mmap, self.trailer.filter_offset, &BLOOM_BLOCK_MAGIC)?;
            match Bloom::from_slice(&payload) {
                Ok(bloom) => self.bloom = Some(bloom),
                Err(e) => {
                    // A broken filter only costs extra reads.
                    warn!(path = %self.path.display(), error = %e, "bloom filter undecodable, disabling");
                    self.bloom = None;
                }
            }
        }

        Ok(())
    }

    /// Bloom check for a row. `false` means the row is definitely absent.
    /// Safe to call concurrently — the filter is immutable once loaded.
    pub fn may_contain_row(&self, row: &[u8]) -> bool {
        match &self.bloom {
            None => true,
            Some(bloom) => bloom.check(&row.to_vec()),
        }
    }

    /// Bloom check for the scan as a whole. Only point scans can be
    /// excluded; interval scans always pass.
    pub fn may_contain(&self, spec: &ScanSpec) -> bool {
        let Some(row) = &spec.exact_row else {
            return true;
        };

        if !self.may_contain_row(row) {
            return false;
        }

        // With column composites indexed and a column restriction given,
        // require at least one (row, family) hit.
        if self.trailer.filter_mode.indexes_columns()
            && let (Some(bloom), Some(columns)) = (&self.bloom, &spec.columns)
        {
            return columns
                .iter()
                .any(|family| bloom.check(&bloom_row_col_item(row, *family)));
        }

        true
    }

    /// Returns a lazy scanner over blocks intersecting `spec`.
    ///
    /// The caller passes the `Arc` so the scanner can outlive access
    /// group store-list swaps.
    pub fn create_scanner(self: &Arc<Self>, spec: &ScanSpec) -> CellStoreScanner {
        CellStoreScanner::new(Arc::clone(self), spec)
    }

    /// First key of the block closest to the midpoint of the data
    /// section — the store's split row suggestion.
    pub fn split_row(&self) -> Option<Vec<u8>> {
        if self.index.is_empty() {
            return None;
        }
        let mid = self.data_end / 2;
        let entry = self
            .index
            .iter()
            .min_by_key(|entry| entry.offset.abs_diff(mid))?;
        Some(entry.first_key.row.clone())
    }

    /// On-disk size in bytes.
    pub fn disk_usage(&self) -> u64 {
        self.disk_usage
    }

    /// Total cells written into this store.
    pub fn total_entries(&self) -> u64 {
        self.trailer.total_entries
    }

    /// Highest cell revision present in the store.
    pub fn revision(&self) -> u64 {
        self.trailer.revision
    }

    /// Numeric id parsed from the `cs<N>` file name.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The trailer as parsed from disk.
    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    /// Clipping bounds this store was opened with.
    pub fn bounds(&self) -> (&[u8], &[u8]) {
        (&self.start_row, &self.end_row)
    }

    pub(crate) fn mmap(&self) -> &Mmap {
        &self.mmap
    }

    pub(crate) fn index(&self) -> &[IndexEntry] {
        &self.index
    }
}

/// Logs and wraps a store open+index load, the common load pipeline.
pub fn open_and_load(
    path: impl AsRef<Path>,
    start_row: &[u8],
    end_row: &[u8],
) -> Result<CellStore, CellStoreError> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading cell store");
    let mut store = CellStore::open(path, start_row, end_row)?;
    store.load_index()?;
    Ok(store)
}
