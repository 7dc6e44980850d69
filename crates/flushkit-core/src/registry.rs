//! Mapper compilation.
//!
//! [`MapperRegistry`] collects [`MapperInfo`] declarations and compiles them
//! into an immutable [`Mappers`] set. Compilation resolves names to ids,
//! derives table layouts for inheritance, pairs bidirectional relationships
//! and rejects configurations the flush engine could never order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::mapper::{ColumnInfo, MapperInfo};
use crate::relationship::{Cascade, PassiveDeletes, RelationshipInfo, RelationshipKind};

/// Index of a compiled mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MapperId(usize);

impl MapperId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Index of a compiled relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RelationshipId(usize);

impl RelationshipId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Resolved direction of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// The target's table holds the foreign key.
    OneToMany,
    /// The parent's table holds the foreign key.
    ManyToOne,
    /// A secondary table holds both foreign keys.
    ManyToMany,
}

/// A physical table and its columns.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: &'static str,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<&'static str>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// The single auto-increment primary key column, if the key is one.
    pub fn autoincrement_column(&self) -> Option<&'static str> {
        match self.primary_key.as_slice() {
            [pk] => self
                .column(pk)
                .filter(|c| c.auto_increment)
                .map(|c| c.name),
            _ => None,
        }
    }
}

/// Secondary (association) table of a many-to-many relationship.
#[derive(Debug, Clone)]
pub struct Secondary {
    pub table: &'static str,
    /// (parent column, secondary column) pairs.
    pub parent_pairs: Vec<(&'static str, &'static str)>,
    /// (target column, secondary column) pairs.
    pub target_pairs: Vec<(&'static str, &'static str)>,
}

/// A compiled mapper.
#[derive(Debug, Clone)]
pub struct Mapper {
    pub id: MapperId,
    pub name: &'static str,
    pub table: &'static str,
    pub parent: Option<MapperId>,
    pub base: MapperId,
    pub primary_key: Vec<&'static str>,
    pub polymorphic_on: Option<&'static str>,
    pub polymorphic_identity: Option<&'static str>,
    pub version_column: Option<&'static str>,
    /// Relationships declared on this mapper (not inherited ones).
    pub relationships: Vec<RelationshipId>,
    /// Tables of the inheritance chain, base first.
    tables: Vec<usize>,
    attributes: Vec<&'static str>,
}

impl Mapper {
    /// Attribute (column) names available on instances of this mapper.
    pub fn attributes(&self) -> &[&'static str] {
        &self.attributes
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains(&name)
    }
}

/// A compiled relationship.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub id: RelationshipId,
    pub name: &'static str,
    pub parent: MapperId,
    pub target: MapperId,
    pub direction: Direction,
    pub uselist: bool,
    /// Join condition as (parent column, child column) pairs.
    ///
    /// For one-to-many the parent column is the referenced key and the child
    /// column the foreign key; for many-to-one it is the other way round.
    pub pairs: Vec<(&'static str, &'static str)>,
    pub secondary: Option<Secondary>,
    pub cascade: Cascade,
    pub post_update: bool,
    pub passive_deletes: PassiveDeletes,
    pub association: bool,
    pub is_backref: bool,
    pub enable_typechecks: bool,
    pub reverse: Option<RelationshipId>,
}

impl Relationship {
    /// Foreign key columns written by this relationship.
    pub fn foreign_key_columns(&self) -> Vec<&'static str> {
        match self.direction {
            Direction::OneToMany => self.pairs.iter().map(|(_, c)| *c).collect(),
            Direction::ManyToOne => self.pairs.iter().map(|(p, _)| *p).collect(),
            Direction::ManyToMany => self
                .secondary
                .iter()
                .flat_map(|s| s.parent_pairs.iter().chain(&s.target_pairs))
                .map(|(_, col)| *col)
                .collect(),
        }
    }
}

/// Immutable, compiled mapping configuration.
#[derive(Debug)]
pub struct Mappers {
    mappers: Vec<Mapper>,
    relationships: Vec<Relationship>,
    tables: Vec<Table>,
    by_name: HashMap<&'static str, MapperId>,
}

impl Mappers {
    pub fn mapper(&self, id: MapperId) -> &Mapper {
        &self.mappers[id.0]
    }

    pub fn relationship(&self, id: RelationshipId) -> &Relationship {
        &self.relationships[id.0]
    }

    pub fn find(&self, name: &str) -> Option<MapperId> {
        self.by_name.get(name).copied()
    }

    /// Look up a mapper by name, failing with a configuration error.
    pub fn get(&self, name: &str) -> Result<MapperId> {
        self.find(name)
            .ok_or_else(|| Error::config(format!("no mapper named '{name}'")))
    }

    pub fn mappers(&self) -> impl Iterator<Item = &Mapper> {
        self.mappers.iter()
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.iter()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Tables of one mapper's inheritance chain, base table first.
    pub fn tables(&self, id: MapperId) -> impl Iterator<Item = &Table> {
        self.mapper(id).tables.iter().map(|&t| &self.tables[t])
    }

    /// Every table used anywhere in a hierarchy, base table first.
    pub fn hierarchy_tables(&self, base: MapperId) -> Vec<&Table> {
        let mut seen = Vec::new();
        for m in self.polymorphic_iterator(base) {
            for &t in &self.mapper(m).tables {
                if !seen.contains(&t) {
                    seen.push(t);
                }
            }
        }
        seen.into_iter().map(|t| &self.tables[t]).collect()
    }

    /// Whether `mapper` is `ancestor` or inherits from it.
    pub fn is_a(&self, mapper: MapperId, ancestor: MapperId) -> bool {
        let mut current = Some(mapper);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.mapper(id).parent;
        }
        false
    }

    /// `id` followed by every mapper inheriting from it, depth first.
    pub fn polymorphic_iterator(&self, id: MapperId) -> Vec<MapperId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            let children: Vec<MapperId> = self
                .mappers
                .iter()
                .filter(|m| m.parent == Some(current))
                .map(|m| m.id)
                .collect();
            for (offset, child) in children.into_iter().enumerate() {
                out.insert(i + 1 + offset, child);
            }
            i += 1;
        }
        out
    }

    /// Find a relationship by name on a mapper or any of its ancestors.
    pub fn relationship_by_name(&self, mapper: MapperId, name: &str) -> Option<RelationshipId> {
        let mut current = Some(mapper);
        while let Some(id) = current {
            let m = self.mapper(id);
            if let Some(rel) = m
                .relationships
                .iter()
                .copied()
                .find(|r| self.relationship(*r).name == name)
            {
                return Some(rel);
            }
            current = m.parent;
        }
        None
    }

    /// Relationships available on instances of a mapper, inherited ones first.
    pub fn relationships_of(&self, mapper: MapperId) -> Vec<RelationshipId> {
        let mut chain = Vec::new();
        let mut current = Some(mapper);
        while let Some(id) = current {
            chain.push(id);
            current = self.mapper(id).parent;
        }
        chain
            .into_iter()
            .rev()
            .flat_map(|id| self.mapper(id).relationships.iter().copied())
            .collect()
    }

    /// delete-orphan relationships whose target is this mapper or an ancestor.
    pub fn delete_orphans(&self, mapper: MapperId) -> Vec<RelationshipId> {
        self.relationships
            .iter()
            .filter(|r| r.cascade.delete_orphan && self.is_a(mapper, r.target))
            .map(|r| r.id)
            .collect()
    }
}

impl fmt::Display for MapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapper#{}", self.0)
    }
}

/// Collects mapper declarations and compiles them.
#[derive(Debug, Default)]
pub struct MapperRegistry {
    infos: Vec<MapperInfo>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, info: MapperInfo) -> Self {
        self.infos.push(info);
        self
    }

    pub fn add(&mut self, info: MapperInfo) -> &mut Self {
        self.infos.push(info);
        self
    }

    /// Compile all registered mappers.
    #[tracing::instrument(level = "debug", skip(self), fields(mappers = self.infos.len()))]
    pub fn compile(&self) -> Result<Arc<Mappers>> {
        let mut by_name = HashMap::new();
        for (i, info) in self.infos.iter().enumerate() {
            if by_name.insert(info.name, MapperId(i)).is_some() {
                return Err(Error::config(format!(
                    "mapper '{}' is registered twice",
                    info.name
                )));
            }
        }

        let parents = self.resolve_parents(&by_name)?;
        let order = inheritance_order(&parents);

        let mut tables: Vec<Table> = Vec::new();
        let mut table_owner: HashMap<&'static str, (usize, MapperId)> = HashMap::new();
        let mut mappers: Vec<Option<Mapper>> = vec![None; self.infos.len()];

        for &idx in &order {
            let info = &self.infos[idx];
            let id = MapperId(idx);
            let parent = parents[idx];
            let parent_mapper = parent.and_then(|p| mappers[p.0].clone());
            let base = parent_mapper.as_ref().map_or(id, |p| p.base);

            let mut chain_tables = parent_mapper
                .as_ref()
                .map(|p| p.tables.clone())
                .unwrap_or_default();

            let single_table = parent_mapper.as_ref().is_some_and(|p| p.table == info.table);
            if single_table {
                let shared = *chain_tables.last().ok_or_else(|| {
                    Error::config(format!("mapper '{}' has no table", info.name))
                })?;
                if info.columns.iter().any(|c| c.primary_key) {
                    let declared = info.primary_key();
                    if declared != tables[shared].primary_key {
                        return Err(Error::config(format!(
                            "single-table mapper '{}' declares primary key {:?}, inconsistent with inherited {:?}",
                            info.name, declared, tables[shared].primary_key
                        )));
                    }
                }
                for col in &info.columns {
                    if !tables[shared].has_column(col.name) {
                        tables[shared].columns.push(*col);
                    }
                }
            } else {
                if let Some((_, owner)) = table_owner.get(info.table) {
                    let owner_base = mappers[owner.0].as_ref().map(|m| m.base);
                    if owner_base != Some(base) {
                        return Err(Error::config(format!(
                            "table '{}' is mapped by both '{}' and '{}'",
                            info.table, self.infos[owner.0].name, info.name
                        )));
                    }
                }
                let table = Table {
                    name: info.table,
                    columns: info.columns.clone(),
                    primary_key: info.primary_key(),
                };
                if table.primary_key.is_empty() {
                    return Err(Error::config(format!(
                        "mapper '{}' could not assemble any primary key columns for table '{}'",
                        info.name, info.table
                    )));
                }
                if let Some(p) = &parent_mapper {
                    if table.primary_key != p.primary_key {
                        return Err(Error::config(format!(
                            "mapper '{}' has primary key {:?} on '{}', inconsistent with inherited primary key {:?}",
                            info.name, table.primary_key, info.table, p.primary_key
                        )));
                    }
                }
                table_owner.insert(info.table, (tables.len(), id));
                chain_tables.push(tables.len());
                tables.push(table);
            }

            let primary_key = parent_mapper
                .as_ref()
                .map_or_else(|| info.primary_key(), |p| p.primary_key.clone());

            let polymorphic_on = parent_mapper
                .as_ref()
                .and_then(|p| p.polymorphic_on)
                .or(info.polymorphic_on);
            let version_column = parent_mapper
                .as_ref()
                .and_then(|p| p.version_column)
                .or(info.version_column);

            mappers[idx] = Some(Mapper {
                id,
                name: info.name,
                table: info.table,
                parent,
                base,
                primary_key,
                polymorphic_on,
                polymorphic_identity: info.polymorphic_identity,
                version_column,
                relationships: Vec::new(),
                tables: chain_tables,
                attributes: Vec::new(),
            });
        }

        let mut mappers: Vec<Mapper> = mappers.into_iter().flatten().collect();

        // Single-table subclasses may add columns after a sibling compiled,
        // so attributes are derived once every table is complete.
        for m in &mut mappers {
            let mut attrs = Vec::new();
            for &t in &m.tables {
                for col in &tables[t].columns {
                    if !attrs.contains(&col.name) {
                        attrs.push(col.name);
                    }
                }
            }
            m.attributes = attrs;
        }

        for m in &mappers {
            if let Some(col) = m.polymorphic_on {
                if !m.has_attribute(col) {
                    return Err(Error::config(format!(
                        "polymorphic_on column '{col}' not found on mapper '{}'",
                        m.name
                    )));
                }
            }
            if let Some(col) = m.version_column {
                if !m.has_attribute(col) {
                    return Err(Error::config(format!(
                        "version column '{col}' not found on mapper '{}'",
                        m.name
                    )));
                }
            }
        }

        let mut relationships = Vec::new();
        for (idx, info) in self.infos.iter().enumerate() {
            let mut seen = HashSet::new();
            for rel in &info.relationships {
                if !seen.insert(rel.name) {
                    return Err(Error::config(format!(
                        "relationship '{}.{}' is declared twice",
                        info.name, rel.name
                    )));
                }
                let id = RelationshipId(relationships.len());
                let compiled = compile_relationship(id, MapperId(idx), rel, &mappers, &tables, &by_name)?;
                mappers[idx].relationships.push(id);
                relationships.push(compiled);
            }
        }

        let mut compiled = Mappers {
            mappers,
            relationships,
            tables,
            by_name,
        };

        self.pair_backrefs(&mut compiled)?;
        check_unbreakable_cycles(&compiled)?;

        tracing::debug!(
            mappers = compiled.mappers.len(),
            relationships = compiled.relationships.len(),
            tables = compiled.tables.len(),
            "Compiled mappers"
        );
        Ok(Arc::new(compiled))
    }

    fn resolve_parents(
        &self,
        by_name: &HashMap<&'static str, MapperId>,
    ) -> Result<Vec<Option<MapperId>>> {
        let mut parents = Vec::with_capacity(self.infos.len());
        for info in &self.infos {
            let parent = match info.inherits {
                Some(name) => Some(*by_name.get(name).ok_or_else(|| {
                    Error::config(format!(
                        "mapper '{}' inherits from unknown mapper '{name}'",
                        info.name
                    ))
                })?),
                None => None,
            };
            parents.push(parent);
        }

        for start in 0..parents.len() {
            let mut steps = 0;
            let mut current = parents[start];
            while let Some(p) = current {
                steps += 1;
                if p.0 == start || steps > parents.len() {
                    return Err(Error::config(format!(
                        "inheritance cycle involving mapper '{}'",
                        self.infos[start].name
                    )));
                }
                current = parents[p.0];
            }
        }
        Ok(parents)
    }

    fn pair_backrefs(&self, compiled: &mut Mappers) -> Result<()> {
        let mut links = Vec::new();
        for (idx, info) in self.infos.iter().enumerate() {
            for rel_info in &info.relationships {
                let Some(back) = rel_info.back_populates else {
                    continue;
                };
                let Some(rel) = compiled.relationship_by_name(MapperId(idx), rel_info.name) else {
                    continue;
                };
                let target = compiled.relationship(rel).target;
                let reverse = compiled.relationship_by_name(target, back).ok_or_else(|| {
                    Error::config(format!(
                        "relationship '{}.{}' back_populates '{}', which is not a relationship on '{}'",
                        info.name,
                        rel_info.name,
                        back,
                        compiled.mapper(target).name
                    ))
                })?;
                let reverse_target = compiled.relationship(reverse).target;
                if !compiled.is_a(MapperId(idx), reverse_target)
                    && !compiled.is_a(reverse_target, MapperId(idx))
                {
                    return Err(Error::config(format!(
                        "relationship '{}.{}' back_populates '{}.{}', which targets an unrelated mapper",
                        info.name,
                        rel_info.name,
                        compiled.mapper(target).name,
                        back
                    )));
                }
                links.push((rel, reverse));
            }
        }
        for (rel, reverse) in links {
            compiled.relationships[rel.0].reverse = Some(reverse);
            compiled.relationships[reverse.0].reverse = Some(rel);
        }
        Ok(())
    }
}

/// Order mapper indexes so that every parent precedes its subclasses.
fn inheritance_order(parents: &[Option<MapperId>]) -> Vec<usize> {
    let mut order = Vec::with_capacity(parents.len());
    let mut placed = vec![false; parents.len()];
    while order.len() < parents.len() {
        for (i, parent) in parents.iter().enumerate() {
            if !placed[i] && parent.is_none_or(|p| placed[p.0]) {
                placed[i] = true;
                order.push(i);
            }
        }
    }
    order
}

fn compile_relationship(
    id: RelationshipId,
    parent: MapperId,
    info: &RelationshipInfo,
    mappers: &[Mapper],
    tables: &[Table],
    by_name: &HashMap<&'static str, MapperId>,
) -> Result<Relationship> {
    let parent_mapper = &mappers[parent.0];
    let qualified = format!("{}.{}", parent_mapper.name, info.name);
    let target = *by_name.get(info.target).ok_or_else(|| {
        Error::config(format!(
            "relationship '{qualified}' targets unknown mapper '{}'",
            info.target
        ))
    })?;
    let target_mapper = &mappers[target.0];
    let cascade = Cascade::parse(info.cascade_spec())?;

    let direction = match info.kind {
        RelationshipKind::OneToMany => Direction::OneToMany,
        RelationshipKind::ManyToOne => Direction::ManyToOne,
        RelationshipKind::ManyToMany => Direction::ManyToMany,
        RelationshipKind::OneToOne => {
            if !info.local_key_cols().is_empty() {
                Direction::ManyToOne
            } else if !info.remote_key_cols().is_empty() {
                Direction::OneToMany
            } else {
                return Err(Error::config(format!(
                    "one-to-one relationship '{qualified}' needs a local or remote key"
                )));
            }
        }
    };

    let check_columns = |mapper: &Mapper, cols: &[&'static str], what: &str| -> Result<()> {
        for col in cols {
            if !mapper.has_attribute(col) {
                return Err(Error::config(format!(
                    "relationship '{qualified}': {what} column '{col}' not found on mapper '{}'",
                    mapper.name
                )));
            }
        }
        Ok(())
    };
    let referenced = |mapper: &Mapper| -> Vec<&'static str> {
        info.referenced_keys
            .map_or_else(|| mapper.primary_key.clone(), |keys| keys.to_vec())
    };
    let zip_checked = |left: Vec<&'static str>, right: Vec<&'static str>| -> Result<Vec<(&'static str, &'static str)>> {
        if left.is_empty() || left.len() != right.len() {
            return Err(Error::config(format!(
                "relationship '{qualified}' joins {} column(s) to {} column(s)",
                left.len(),
                right.len()
            )));
        }
        Ok(left.into_iter().zip(right).collect())
    };

    let mut secondary = None;
    let pairs = match direction {
        Direction::OneToMany => {
            let fks = info.remote_key_cols().to_vec();
            if fks.is_empty() {
                return Err(Error::config(format!(
                    "one-to-many relationship '{qualified}' needs a remote key"
                )));
            }
            let refs = referenced(parent_mapper);
            check_columns(target_mapper, &fks, "foreign key")?;
            check_columns(parent_mapper, &refs, "referenced")?;
            zip_checked(refs, fks)?
        }
        Direction::ManyToOne => {
            let fks = info.local_key_cols().to_vec();
            if fks.is_empty() {
                return Err(Error::config(format!(
                    "many-to-one relationship '{qualified}' needs a local key"
                )));
            }
            let refs = referenced(target_mapper);
            check_columns(parent_mapper, &fks, "foreign key")?;
            check_columns(target_mapper, &refs, "referenced")?;
            zip_checked(fks, refs)?
        }
        Direction::ManyToMany => {
            let link = info.link_table.ok_or_else(|| {
                Error::config(format!(
                    "many-to-many relationship '{qualified}' needs a link table"
                ))
            })?;
            let parent_pairs =
                zip_checked(parent_mapper.primary_key.clone(), link.local_cols().to_vec())?;
            let target_pairs =
                zip_checked(target_mapper.primary_key.clone(), link.remote_cols().to_vec())?;
            secondary = Some(Secondary {
                table: link.table_name,
                parent_pairs,
                target_pairs,
            });
            Vec::new()
        }
    };

    if info.post_update && direction == Direction::ManyToMany {
        return Err(Error::config(format!(
            "relationship '{qualified}': post_update is not supported on many-to-many relationships"
        )));
    }
    if info.association && direction != Direction::OneToMany {
        return Err(Error::config(format!(
            "relationship '{qualified}': association objects require a one-to-many relationship"
        )));
    }
    if info.passive_deletes == PassiveDeletes::All
        && (cascade.delete || cascade.delete_orphan || info.association)
    {
        return Err(Error::config(format!(
            "relationship '{qualified}': can't set passive_deletes All in conjunction with a delete or delete-orphan cascade"
        )));
    }

    let compiled = Relationship {
        id,
        name: info.name,
        parent,
        target,
        direction,
        uselist: info.uselist.unwrap_or(match info.kind {
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => true,
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne => false,
        }),
        pairs,
        secondary,
        cascade,
        post_update: info.post_update,
        passive_deletes: info.passive_deletes,
        association: info.association,
        is_backref: info.is_backref,
        enable_typechecks: info.enable_typechecks,
        reverse: None,
    };

    if compiled.post_update {
        let holder = match direction {
            Direction::OneToMany => target_mapper,
            _ => parent_mapper,
        };
        for col in compiled.foreign_key_columns() {
            let nullable = holder
                .tables
                .iter()
                .filter_map(|&t| tables[t].column(col))
                .all(|c| c.nullable);
            if !nullable {
                return Err(Error::config(format!(
                    "relationship '{qualified}' is post_update but foreign key column '{col}' is NOT NULL"
                )));
            }
        }
    }

    Ok(compiled)
}

/// Reject mapper-level cycles that neither row ordering nor post_update can break.
///
/// An edge is "hard" when every foreign key column it writes is NOT NULL: such
/// a row can never be inserted before its referent. A cycle made only of
/// hard edges has no valid statement order for new rows.
fn check_unbreakable_cycles(mappers: &Mappers) -> Result<()> {
    let n = mappers.mappers.len();
    let mut edges: Vec<Vec<(usize, RelationshipId)>> = vec![Vec::new(); n];
    for rel in &mappers.relationships {
        if rel.post_update || rel.direction == Direction::ManyToMany {
            continue;
        }
        let (from, to, holder) = match rel.direction {
            Direction::OneToMany => (rel.parent, rel.target, rel.target),
            _ => (rel.target, rel.parent, rel.parent),
        };
        let hard = rel.foreign_key_columns().iter().all(|col| {
            mappers
                .tables(holder)
                .filter_map(|t| t.column(col))
                .any(|c| !c.nullable)
        });
        if hard {
            let from = mappers.mapper(from).base.0;
            let to = mappers.mapper(to).base.0;
            if !edges[from].iter().any(|(t, _)| *t == to) {
                edges[from].push((to, rel.id));
            }
        }
    }

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut color = vec![0u8; n];
    for start in 0..n {
        if color[start] == 0 {
            if let Some(cycle) = find_cycle(start, &edges, &mut color) {
                let names: Vec<String> = cycle
                    .iter()
                    .map(|r| {
                        let rel = mappers.relationship(*r);
                        format!("{}.{}", mappers.mapper(rel.parent).name, rel.name)
                    })
                    .collect();
                return Err(Error::config(format!(
                    "unresolvable dependency cycle through NOT NULL foreign keys: {}; \
                     make a foreign key nullable and set post_update on one of these relationships",
                    names.join(" -> ")
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first search from `start` for a cycle, returned as the relationships
/// along it.
fn find_cycle(
    start: usize,
    edges: &[Vec<(usize, RelationshipId)>],
    color: &mut [u8],
) -> Option<Vec<RelationshipId>> {
    // Frames are (node, next edge to try, relationship that reached the node).
    let mut stack: Vec<(usize, usize, Option<RelationshipId>)> = vec![(start, 0, None)];
    color[start] = 1;
    while let Some(frame) = stack.last_mut() {
        let (node, edge) = (frame.0, frame.1);
        let Some(&(next, rel)) = edges[node].get(edge) else {
            color[node] = 2;
            stack.pop();
            continue;
        };
        frame.1 += 1;
        match color[next] {
            0 => {
                color[next] = 1;
                stack.push((next, 0, Some(rel)));
            }
            1 => {
                let from = stack.iter().position(|f| f.0 == next).map_or(0, |i| i + 1);
                let mut cycle: Vec<RelationshipId> = stack[from..].iter().filter_map(|f| f.2).collect();
                cycle.push(rel);
                return Some(cycle);
            }
            _ => {}
        }
    }
    None
}
