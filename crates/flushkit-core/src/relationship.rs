//! Relationship metadata.
//!
//! Relationships are declared as static metadata on each mapper and compiled
//! once by [`MapperRegistry`](crate::MapperRegistry). The flush engine never
//! reads `RelationshipInfo` directly; it works off the compiled
//! [`Relationship`](crate::Relationship) which carries resolved mapper ids and
//! column pairs.

use std::fmt;

use crate::error::{Error, Result};

/// The type of relationship between two mappers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One-to-one: resolved to one-to-many or many-to-one by which side holds
    /// the foreign key, with a scalar attribute.
    OneToOne,
    /// Many-to-one: many `Ball`s belong to one `Person`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Person` has many `Ball`s.
    OneToMany,
    /// Many-to-many: rows are linked through a secondary table.
    ManyToMany,
}

/// Passive delete behavior for relationships.
///
/// Controls whether the flush loads an unloaded collection in order to visit
/// children of a deleted parent, or relies on the database's ON DELETE rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PassiveDeletes {
    /// Load unloaded collections so children can be updated or deleted.
    #[default]
    Active,
    /// Rely on database ON DELETE CASCADE / SET NULL for unloaded children.
    Passive,
    /// Never touch children of a deleted or detaching parent: no loads and
    /// no foreign key nulling. Cannot be combined with a delete or
    /// delete-orphan cascade.
    All,
}

/// Information about a link/join table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"person_keywords"`).
    pub table_name: &'static str,

    /// Column in link table pointing to the parent mapper (e.g., `"person_id"`).
    pub local_column: &'static str,

    /// Column in link table pointing to the target mapper (e.g., `"keyword_id"`).
    pub remote_column: &'static str,

    /// Composite local key columns (for composite PK parents).
    ///
    /// If set, this takes precedence over `local_column`.
    pub local_columns: Option<&'static [&'static str]>,

    /// Composite remote key columns (for composite PK targets).
    ///
    /// If set, this takes precedence over `remote_column`.
    pub remote_columns: Option<&'static [&'static str]>,
}

impl LinkTableInfo {
    /// Create a new link-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
            local_columns: None,
            remote_columns: None,
        }
    }

    /// Create a new composite link-table definition.
    ///
    /// Column order matters:
    /// - `local_columns` must match the parent PK value ordering
    /// - `remote_columns` must match the target PK value ordering
    #[must_use]
    pub const fn composite(
        table_name: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table_name,
            local_column: "",
            remote_column: "",
            local_columns: Some(local_columns),
            remote_columns: Some(remote_columns),
        }
    }

    /// Return the local key columns (single or composite).
    #[must_use]
    pub fn local_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.local_columns {
            return cols;
        }
        if self.local_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.local_column)
    }

    /// Return the remote key columns (single or composite).
    #[must_use]
    pub fn remote_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.remote_columns {
            return cols;
        }
        if self.remote_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.remote_column)
    }
}

/// Parsed cascade rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cascade {
    pub save_update: bool,
    pub delete: bool,
    pub delete_orphan: bool,
}

impl Cascade {
    /// Parse a comma separated cascade string such as `"all, delete-orphan"`.
    ///
    /// `all` expands to `save-update, delete`. `merge`, `expunge` and
    /// `refresh-expire` are accepted but have no flush behavior. An empty
    /// string yields no cascades at all.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut cascade = Cascade::default();
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => {
                    cascade.save_update = true;
                    cascade.delete = true;
                }
                "save-update" => cascade.save_update = true,
                "delete" => cascade.delete = true,
                "delete-orphan" => cascade.delete_orphan = true,
                "merge" | "expunge" | "refresh-expire" => {}
                other => {
                    return Err(Error::config(format!(
                        "unknown cascade option '{other}' in \"{spec}\""
                    )));
                }
            }
        }
        Ok(cascade)
    }
}

impl fmt::Display for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.save_update {
            parts.push("save-update");
        }
        if self.delete {
            parts.push("delete");
        }
        if self.delete_orphan {
            parts.push("delete-orphan");
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Metadata about a relationship between mappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship attribute.
    pub name: &'static str,

    /// Name of the related mapper.
    pub target: &'static str,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Local foreign key column (for ManyToOne).
    /// e.g., `"favorite_ball_id"` on `Person`.
    pub local_key: Option<&'static str>,

    /// Composite local foreign key columns (for ManyToOne).
    ///
    /// If set, this takes precedence over `local_key`.
    pub local_keys: Option<&'static [&'static str]>,

    /// Remote foreign key column (for OneToMany).
    /// e.g., `"person_id"` on `Ball` when accessed from `Person`.
    pub remote_key: Option<&'static str>,

    /// Composite remote foreign key columns (for OneToMany / OneToOne).
    ///
    /// If set, this takes precedence over `remote_key`.
    pub remote_keys: Option<&'static [&'static str]>,

    /// Columns the foreign key references on the "one" side.
    ///
    /// Defaults to that mapper's primary key.
    pub referenced_keys: Option<&'static [&'static str]>,

    /// Link table for ManyToMany relationships.
    pub link_table: Option<LinkTableInfo>,

    /// The relationship on the related mapper that points back.
    pub back_populates: Option<&'static str>,

    /// This side is the generated half of a bidirectional pair.
    ///
    /// A post_update backref does not register its own flush work; the
    /// forward side does it.
    pub is_backref: bool,

    /// Full cascade options string (e.g., "all, delete-orphan").
    pub cascade: Option<&'static str>,

    /// Passive delete behavior.
    pub passive_deletes: PassiveDeletes,

    /// Write this relationship's foreign key in a second UPDATE pass.
    pub post_update: bool,

    /// The target is an association object keyed by both sides.
    pub association: bool,

    /// Force list or single (override kind inference).
    pub uselist: Option<bool>,

    /// Reject related instances whose mapper is not the target (or a subclass).
    pub enable_typechecks: bool,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: RelationshipKind) -> Self {
        Self {
            name,
            target,
            kind,
            local_key: None,
            local_keys: None,
            remote_key: None,
            remote_keys: None,
            referenced_keys: None,
            link_table: None,
            back_populates: None,
            is_backref: false,
            cascade: None,
            passive_deletes: PassiveDeletes::Active,
            post_update: false,
            association: false,
            uselist: None,
            enable_typechecks: true,
        }
    }

    /// Return the local key columns for this relationship (empty slice if unset).
    ///
    /// For single-column relationships, this returns a 1-element slice backed by `self.local_key`.
    #[must_use]
    pub fn local_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.local_keys {
            return keys;
        }
        match &self.local_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Return the remote key columns for this relationship (empty slice if unset).
    ///
    /// For single-column relationships, this returns a 1-element slice backed by `self.remote_key`.
    #[must_use]
    pub fn remote_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.remote_keys {
            return keys;
        }
        match &self.remote_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Set the local foreign key column (ManyToOne).
    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self.local_keys = None;
        self
    }

    /// Set composite local foreign key columns (ManyToOne).
    ///
    /// The column order must match the referenced primary key value ordering.
    #[must_use]
    pub const fn local_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.local_keys = Some(keys);
        self.local_key = None;
        self
    }

    /// Set the remote foreign key column (OneToMany).
    #[must_use]
    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self.remote_keys = None;
        self
    }

    /// Set composite remote foreign key columns (OneToMany / OneToOne).
    ///
    /// The column order must match the parent primary key value ordering.
    #[must_use]
    pub const fn remote_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.remote_keys = Some(keys);
        self.remote_key = None;
        self
    }

    /// Reference columns other than the primary key.
    #[must_use]
    pub const fn references(mut self, keys: &'static [&'static str]) -> Self {
        self.referenced_keys = Some(keys);
        self
    }

    /// Set the link table metadata (ManyToMany).
    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    /// Set the back-populates relationship name (bidirectional relationships).
    #[must_use]
    pub const fn back_populates(mut self, field: &'static str) -> Self {
        self.back_populates = Some(field);
        self
    }

    /// Mark this side as the generated backref of a bidirectional pair.
    #[must_use]
    pub const fn backref(mut self, value: bool) -> Self {
        self.is_backref = value;
        self
    }

    /// Set full cascade options string.
    #[must_use]
    pub const fn cascade(mut self, opts: &'static str) -> Self {
        self.cascade = Some(opts);
        self
    }

    /// Set passive delete behavior.
    #[must_use]
    pub const fn passive_deletes(mut self, value: PassiveDeletes) -> Self {
        self.passive_deletes = value;
        self
    }

    /// Defer the foreign key write to a second UPDATE pass.
    #[must_use]
    pub const fn post_update(mut self, value: bool) -> Self {
        self.post_update = value;
        self
    }

    /// Treat the target as an association object.
    #[must_use]
    pub const fn association(mut self, value: bool) -> Self {
        self.association = value;
        self
    }

    /// Force list or single.
    #[must_use]
    pub const fn uselist(mut self, value: bool) -> Self {
        self.uselist = Some(value);
        self
    }

    /// Enable/disable the related-mapper type check.
    #[must_use]
    pub const fn enable_typechecks(mut self, value: bool) -> Self {
        self.enable_typechecks = value;
        self
    }

    /// Cascade string in effect, defaulting to `save-update, merge`.
    #[must_use]
    pub fn cascade_spec(&self) -> &'static str {
        self.cascade.unwrap_or("save-update, merge")
    }
}

impl Default for RelationshipInfo {
    fn default() -> Self {
        Self::new("", "", RelationshipKind::default())
    }
}
