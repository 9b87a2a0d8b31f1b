//! # Schema
//!
//! Table schema: column families, their version/TTL policies, and their
//! assignment to access groups. Schema parsing lives outside the engine;
//! schemas arrive here already materialized (via [`SchemaBuilder`] in
//! tests and embedding code) and are compared by `generation`.


use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while assembling or validating a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Structural problem: duplicate codes, reserved code 0, unknown group.
    #[error("bad schema: {0}")]
    BadSchema(String),
}

// ------------------------------------------------------------------------------------------------
// Column family
// ------------------------------------------------------------------------------------------------

/// One column family and its retention policy.
#[derive(Debug, Clone)]
pub struct ColumnFamilySpec {
    /// Wire code of this family. Code `0` is reserved for row tombstones.
    pub id: u8,

    /// Family name.
    pub name: String,

    /// Name of the access group storing this family.
    pub access_group: String,

    /// Number of versions retained per column; `0` means unlimited.
    pub max_versions: u32,

    /// Time-to-live; cells older than this are dropped at read time.
    pub ttl: Option<Duration>,

    /// Set when a newer schema generation removed this family. The code
    /// stays unroutable until the range reloads.
    pub deleted: bool,
}

// ------------------------------------------------------------------------------------------------
// Access group
// ------------------------------------------------------------------------------------------------

/// A named set of column families stored together on disk.
#[derive(Debug, Clone)]
pub struct AccessGroupSpec {
    /// Group name, unique within the schema.
    pub name: String,

    /// Families assigned to this group.
    pub column_families: Vec<ColumnFamilySpec>,
}

// ------------------------------------------------------------------------------------------------
// Schema
// ------------------------------------------------------------------------------------------------

/// A full table schema at one generation.
///
/// Shared immutably (`Arc<Schema>`); a schema change produces a new
/// `Schema` value with a higher generation.
#[derive(Debug, Clone)]
pub struct Schema {
    /// Monotonic generation assigned by the coordination service.
    pub generation: u32,

    /// Access groups in declaration order.
    pub access_groups: Vec<AccessGroupSpec>,
}

impl Schema {
    /// Highest column-family code present in this schema.
    pub fn max_column_family_id(&self) -> u8 {
        self.access_groups
            .iter()
            .flat_map(|ag| ag.column_families.iter())
            .map(|cf| cf.id)
            .max()
            .unwrap_or(0)
    }

    /// Looks up a column family by code, skipping deleted entries.
    pub fn column_family(&self, code: u8) -> Option<&ColumnFamilySpec> {
        self.access_groups
            .iter()
            .flat_map(|ag| ag.column_families.iter())
            .find(|cf| cf.id == code && !cf.deleted)
    }

    /// Name of the access group owning the given family code, if live.
    pub fn access_group_of(&self, code: u8) -> Option<&str> {
        self.column_family(code).map(|cf| cf.access_group.as_str())
    }

    /// Access group spec by name.
    pub fn access_group(&self, name: &str) -> Option<&AccessGroupSpec> {
        self.access_groups.iter().find(|ag| ag.name == name)
    }
}

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

/// Assembles a validated [`Schema`].
///
/// ```rust
/// use tabletdb::schema::SchemaBuilder;
///
/// let schema = SchemaBuilder::new(1)
///     .access_group("default")
///     .column_family("cf1", 1, "default")
///     .column_family("cf2", 2, "default")
///     .build()
///     .unwrap();
/// assert_eq!(schema.max_column_family_id(), 2);
/// ```
#[derive(Debug)]
pub struct SchemaBuilder {
    generation: u32,
    groups: Vec<AccessGroupSpec>,
    pending: Vec<ColumnFamilySpec>,
}

impl SchemaBuilder {
    /// Starts a schema at the given generation.
    pub fn new(generation: u32) -> Self {
        Self {
            generation,
            groups: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Declares an access group.
    pub fn access_group(mut self, name: impl Into<String>) -> Self {
        self.groups.push(AccessGroupSpec {
            name: name.into(),
            column_families: Vec::new(),
        });
        self
    }

    /// Declares a column family with default retention (unlimited
    /// versions, no TTL), assigned to `access_group`.
    pub fn column_family(
        self,
        name: impl Into<String>,
        id: u8,
        access_group: impl Into<String>,
    ) -> Self {
        self.column_family_with(name, id, access_group, 0, None)
    }

    /// Declares a column family with an explicit retention policy.
    pub fn column_family_with(
        mut self,
        name: impl Into<String>,
        id: u8,
        access_group: impl Into<String>,
        max_versions: u32,
        ttl: Option<Duration>,
    ) -> Self {
        self.pending.push(ColumnFamilySpec {
            id,
            name: name.into(),
            access_group: access_group.into(),
            max_versions,
            ttl,
            deleted: false,
        });
        self
    }

    /// Validates and produces the schema.
    pub fn build(mut self) -> Result<Arc<Schema>, SchemaError> {
        let mut seen_codes = Vec::new();

        for cf in self.pending.drain(..) {
            if cf.id == 0 {
                return Err(SchemaError::BadSchema(format!(
                    "column family '{}' uses reserved code 0",
                    cf.name
                )));
            }
            if seen_codes.contains(&cf.id) {
                return Err(SchemaError::BadSchema(format!(
                    "duplicate column family code {}",
                    cf.id
                )));
            }
            seen_codes.push(cf.id);

            let group = self
                .groups
                .iter_mut()
                .find(|g| g.name == cf.access_group)
                .ok_or_else(|| {
                    SchemaError::BadSchema(format!(
                        "column family '{}' names unknown access group '{}'",
                        cf.name, cf.access_group
                    ))
                })?;
            group.column_families.push(cf);
        }

        Ok(Arc::new(Schema {
            generation: self.generation,
            access_groups: self.groups,
        }))
    }
}
