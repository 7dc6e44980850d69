//! Mapper and column declarations.

use crate::relationship::RelationshipInfo;

/// A column on a mapped table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name, also used as the instance attribute name.
    pub name: &'static str,
    /// Whether this column accepts NULL
    pub nullable: bool,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the database generates this column's value on insert
    pub auto_increment: bool,
    /// Whether the database supplies a default when the column is omitted
    pub server_default: bool,
}

impl ColumnInfo {
    /// Create a nullable, non-key column.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            server_default: false,
        }
    }

    /// An auto-incrementing integer primary key.
    pub const fn id(name: &'static str) -> Self {
        Self::new(name).primary_key(true).auto_increment(true)
    }

    #[must_use]
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark as primary key (implies NOT NULL).
    #[must_use]
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        if value {
            self.nullable = false;
        }
        self
    }

    #[must_use]
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    #[must_use]
    pub const fn server_default(mut self, value: bool) -> Self {
        self.server_default = value;
        self
    }
}

/// Declaration of one mapped class.
///
/// For joined-table inheritance, `columns` lists only the columns of this
/// mapper's own table; the primary key columns are repeated there and carry
/// the same names as the base table's. A mapper whose `table` equals its
/// parent's is single-table inheritance and declares no columns of its own
/// table (any listed are added to the shared table).
#[derive(Debug, Clone, Default)]
pub struct MapperInfo {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: Vec<ColumnInfo>,
    pub inherits: Option<&'static str>,
    pub polymorphic_on: Option<&'static str>,
    pub polymorphic_identity: Option<&'static str>,
    pub version_column: Option<&'static str>,
    pub relationships: Vec<RelationshipInfo>,
}

impl MapperInfo {
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            ..Self::default()
        }
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: &[ColumnInfo]) -> Self {
        self.columns.extend_from_slice(columns);
        self
    }

    /// Inherit from another mapper.
    pub fn inherits(mut self, parent: &'static str) -> Self {
        self.inherits = Some(parent);
        self
    }

    /// Discriminator column (declared on the base mapper).
    pub fn polymorphic_on(mut self, column: &'static str) -> Self {
        self.polymorphic_on = Some(column);
        self
    }

    /// Value written to the discriminator column for this mapper.
    pub fn polymorphic_identity(mut self, identity: &'static str) -> Self {
        self.polymorphic_identity = Some(identity);
        self
    }

    /// Integer column used for optimistic concurrency checks.
    pub fn version_column(mut self, column: &'static str) -> Self {
        self.version_column = Some(column);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Primary key columns declared on this mapper's own table.
    pub fn primary_key(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name)
            .collect()
    }
}
