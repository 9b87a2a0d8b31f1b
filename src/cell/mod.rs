//! # Cell Model
//!
//! Core data types shared by every layer of the engine: the wide-column
//! [`CellKey`], the [`Cell`] it addresses, table and range identifiers,
//! and the [`ScanSpec`] driving scanner construction.
//!
//! ## Key ordering
//!
//! Keys sort by `(row ASC, column_family ASC, qualifier ASC, flag ASC,
//! timestamp DESC, revision DESC)`. Two consequences the rest of the
//! engine relies on:
//!
//! - A row tombstone carries `column_family = 0` and an empty qualifier,
//!   so it sorts before every cell of its row and is seen first by any
//!   merged scan.
//! - For the same column, the newest version (highest timestamp, then
//!   highest revision) comes first, so version capping is a streaming
//!   prefix take.
//!
//! ## Flags
//!
//! Flag bytes double as sort keys and as indices into delete counters:
//! `DELETE_ROW = 0`, `DELETE_COLUMN_FAMILY = 1`, `DELETE_CELL = 2`,
//! `INSERT = 255`. Deletes therefore sort before inserts at the same
//! `(row, family, qualifier)`.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use crate::encoding::{Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Sentinels
// ------------------------------------------------------------------------------------------------

/// End-row sentinel for the last range of a regular table.
///
/// Sorts after any application row (rows must not begin with `0xff 0xff`).
pub const END_ROW: &[u8] = &[0xff, 0xff];

/// End-row sentinel identifying the root metadata range.
pub const END_ROOT_ROW: &[u8] = b"\xff\xff..ROOT";

/// Null timestamp, smaller than any real timestamp.
pub const TIMESTAMP_NULL: i64 = i64::MIN;

// ------------------------------------------------------------------------------------------------
// KeyFlag
// ------------------------------------------------------------------------------------------------

/// Mutation kind carried by a [`CellKey`].
///
/// The discriminant is both the on-disk byte and the flag's position in
/// the key sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyFlag {
    /// Tombstone masking an entire row.
    DeleteRow = 0,

    /// Tombstone masking one column family within a row.
    DeleteColumnFamily = 1,

    /// Tombstone masking versions of one column.
    DeleteCell = 2,

    /// A live cell value.
    Insert = 255,
}

impl KeyFlag {
    /// Whether this flag is any kind of tombstone.
    pub fn is_delete(self) -> bool {
        self != Self::Insert
    }

    /// Index into the per-range delete counters, `None` for inserts.
    pub fn delete_index(self) -> Option<usize> {
        match self {
            Self::DeleteRow => Some(0),
            Self::DeleteColumnFamily => Some(1),
            Self::DeleteCell => Some(2),
            Self::Insert => None,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, EncodingError> {
        match byte {
            0 => Ok(Self::DeleteRow),
            1 => Ok(Self::DeleteColumnFamily),
            2 => Ok(Self::DeleteCell),
            255 => Ok(Self::Insert),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "KeyFlag",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CellKey
// ------------------------------------------------------------------------------------------------

/// Fully-qualified address of one cell version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    /// Row key bytes.
    pub row: Vec<u8>,

    /// Column family code; `0` for row-level tombstones.
    pub column_family: u8,

    /// Column qualifier bytes (may be empty).
    pub qualifier: Vec<u8>,

    /// Mutation kind.
    pub flag: KeyFlag,

    /// Microseconds since the UNIX epoch. Higher timestamps sort earlier.
    pub timestamp: i64,

    /// Server-assigned monotonic tiebreaker. Higher revisions sort earlier.
    pub revision: u64,
}

impl CellKey {
    /// A live cell key.
    pub fn insert(
        row: impl Into<Vec<u8>>,
        column_family: u8,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        revision: u64,
    ) -> Self {
        Self {
            row: row.into(),
            column_family,
            qualifier: qualifier.into(),
            flag: KeyFlag::Insert,
            timestamp,
            revision,
        }
    }

    /// A row tombstone, masking every cell of `row` at or below `timestamp`.
    pub fn delete_row(row: impl Into<Vec<u8>>, timestamp: i64, revision: u64) -> Self {
        Self {
            row: row.into(),
            column_family: 0,
            qualifier: Vec::new(),
            flag: KeyFlag::DeleteRow,
            timestamp,
            revision,
        }
    }

    /// A column-family tombstone.
    pub fn delete_column_family(
        row: impl Into<Vec<u8>>,
        column_family: u8,
        timestamp: i64,
        revision: u64,
    ) -> Self {
        Self {
            row: row.into(),
            column_family,
            qualifier: Vec::new(),
            flag: KeyFlag::DeleteColumnFamily,
            timestamp,
            revision,
        }
    }

    /// A cell tombstone, masking versions of one column at or below `timestamp`.
    pub fn delete_cell(
        row: impl Into<Vec<u8>>,
        column_family: u8,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        revision: u64,
    ) -> Self {
        Self {
            row: row.into(),
            column_family,
            qualifier: qualifier.into(),
            flag: KeyFlag::DeleteCell,
            timestamp,
            revision,
        }
    }

    /// `(row, column_family, qualifier)` — the column identity, ignoring
    /// flag and version fields.
    pub fn column(&self) -> (&[u8], u8, &[u8]) {
        (&self.row, self.column_family, &self.qualifier)
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column_family.cmp(&other.column_family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.flag.cmp(&other.flag))
            // Newest first within a column.
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.revision.cmp(&self.revision))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Encode for CellKey {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.row.encode_to(buf)?;
        self.column_family.encode_to(buf)?;
        self.qualifier.encode_to(buf)?;
        (self.flag as u8).encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.revision.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for CellKey {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (column_family, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (qualifier, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (flag_byte, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let flag = KeyFlag::from_byte(flag_byte)?;
        let (timestamp, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (revision, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                row,
                column_family,
                qualifier,
                flag,
                timestamp,
                revision,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Cell
// ------------------------------------------------------------------------------------------------

/// A key plus its opaque value bytes. Tombstones carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// The fully-qualified key.
    pub key: CellKey,

    /// Opaque value bytes.
    pub value: Vec<u8>,
}

impl Cell {
    /// Creates a cell from its parts.
    pub fn new(key: CellKey, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl Encode for Cell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Cell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = CellKey::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { key, value }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// TableIdentifier
// ------------------------------------------------------------------------------------------------

/// Identifies a table: numeric id, schema generation, and display name.
///
/// `id == 0` denotes the METADATA table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIdentifier {
    /// Coordination-service-assigned table id.
    pub id: u32,

    /// Schema generation at the time this identifier was captured.
    pub generation: u32,

    /// Human-readable table name.
    pub name: String,
}

impl TableIdentifier {
    /// Creates an identifier from its parts.
    pub fn new(id: u32, generation: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            generation,
            name: name.into(),
        }
    }

    /// Whether this is the METADATA table.
    pub fn is_metadata(&self) -> bool {
        self.id == 0
    }
}

impl Encode for TableIdentifier {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.generation.encode_to(buf)?;
        self.name.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableIdentifier {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (generation, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                generation,
                name,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// RangeSpec
// ------------------------------------------------------------------------------------------------

/// A contiguous row interval `(start_row, end_row]`.
///
/// `start_row` is exclusive; an empty start means "before every row".
/// `end_row` is inclusive; the sentinels [`END_ROW`] and [`END_ROOT_ROW`]
/// mark the last range of a table and the root range respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    /// Exclusive lower bound.
    pub start_row: Vec<u8>,

    /// Inclusive upper bound.
    pub end_row: Vec<u8>,
}

impl RangeSpec {
    /// Creates a range spec from its bounds.
    pub fn new(start_row: impl Into<Vec<u8>>, end_row: impl Into<Vec<u8>>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
        }
    }

    /// Whether `row` falls inside `(start_row, end_row]`.
    pub fn contains(&self, row: &[u8]) -> bool {
        row > self.start_row.as_slice() && row <= self.end_row.as_slice()
    }

    /// Whether this spec names the root metadata range.
    pub fn is_root(&self) -> bool {
        self.start_row.is_empty() && self.end_row == END_ROOT_ROW
    }
}

impl Encode for RangeSpec {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.start_row.encode_to(buf)?;
        self.end_row.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RangeSpec {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (start_row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (end_row, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { start_row, end_row }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// ScanSpec
// ------------------------------------------------------------------------------------------------

/// Parameters of one scan: row interval, optional column-family
/// restriction, and whether tombstones should be surfaced.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    /// Exclusive lower row bound (empty = before every row).
    pub start_row: Vec<u8>,

    /// Inclusive upper row bound.
    pub end_row: Vec<u8>,

    /// Column-family codes to include; `None` scans every family.
    pub columns: Option<Vec<u8>>,

    /// Restrict the scan to exactly one row. Point lookups set this so
    /// cell stores can consult their Bloom filters.
    pub exact_row: Option<Vec<u8>>,

    /// When set, tombstones are emitted instead of being resolved away.
    /// Used by compaction to carry deletes forward.
    pub return_deletes: bool,
}

impl ScanSpec {
    /// Scan the whole row space of a range.
    pub fn full() -> Self {
        Self {
            start_row: Vec::new(),
            end_row: END_ROW.to_vec(),
            columns: None,
            exact_row: None,
            return_deletes: false,
        }
    }

    /// Scan the interval `(start_row, end_row]`.
    pub fn rows(start_row: impl Into<Vec<u8>>, end_row: impl Into<Vec<u8>>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
            columns: None,
            exact_row: None,
            return_deletes: false,
        }
    }

    /// Point lookup of a single row.
    pub fn point(row: impl Into<Vec<u8>>) -> Self {
        let row = row.into();
        Self {
            start_row: Vec::new(),
            end_row: END_ROW.to_vec(),
            columns: None,
            exact_row: Some(row),
            return_deletes: false,
        }
    }

    /// Restrict the scan to the given column families.
    pub fn with_columns(mut self, columns: Vec<u8>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Surface tombstones instead of applying them.
    pub fn with_deletes(mut self) -> Self {
        self.return_deletes = true;
        self
    }

    /// Whether a cell with `family` is requested by this scan. Row
    /// tombstones (family 0) always pass.
    pub fn wants_family(&self, family: u8) -> bool {
        match &self.columns {
            None => true,
            Some(set) => family == 0 || set.contains(&family),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing helper
// ------------------------------------------------------------------------------------------------

/// Hex rendering of a row key for log lines, truncated past 32 bytes.
pub struct HexRow<'a>(pub &'a [u8]);

impl std::fmt::Display for HexRow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = if self.0.len() <= 32 {
            self.0
        } else {
            &self.0[..16]
        };
        for byte in shown {
            write!(f, "{byte:02x}")?;
        }
        if shown.len() < self.0.len() {
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
