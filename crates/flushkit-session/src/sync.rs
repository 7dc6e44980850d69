//! Foreign key synchronization between related rows.
//!
//! A [`ClauseSynchronizer`] holds one [`SyncRule`] per column pair of a
//! relationship's join condition. Executing it copies referenced key values
//! from the source side onto the foreign key columns of the destination (an
//! instance or an association row), or clears those columns when a child is
//! being detached from its parent.

use std::cmp::Ordering;

use flushkit_core::{
    Direction, Error, FlushError, FlushErrorKind, Relationship, Result, Value,
};

use crate::store::{InstanceId, InstanceStore};

/// Which side of a relationship supplies a rule's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    Parent,
    Child,
}

/// Copy one column of the source onto one column of the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRule {
    pub source_column: &'static str,
    pub dest_column: &'static str,
    pub source_side: SyncSide,
}

/// A row of a many-to-many secondary table, in column declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssociationRow {
    columns: Vec<(&'static str, Value)>,
}

impl AssociationRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }

    pub fn set(&mut self, column: &'static str, value: Value) {
        match self.columns.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn remove(&mut self, column: &str) {
        self.columns.retain(|(c, _)| *c != column);
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|(c, _)| *c)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Total order used to emit association statements deterministically.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        for ((ca, va), (cb, vb)) in self.columns.iter().zip(&other.columns) {
            let ord = ca.cmp(cb).then_with(|| va.sort_cmp(vb));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.columns.len().cmp(&other.columns.len())
    }
}

/// Where synchronized values are written.
#[derive(Debug)]
pub enum SyncDest<'a> {
    Instance(InstanceId),
    Row(&'a mut AssociationRow),
}

/// The synchronization rules of one relationship.
#[derive(Debug, Clone, Default)]
pub struct ClauseSynchronizer {
    rules: Vec<SyncRule>,
}

impl ClauseSynchronizer {
    pub fn new(rules: Vec<SyncRule>) -> Self {
        Self { rules }
    }

    /// Derive the rules from a relationship's join condition.
    pub fn for_relationship(rel: &Relationship) -> Self {
        let rules = match rel.direction {
            Direction::OneToMany => rel
                .pairs
                .iter()
                .map(|&(referenced, fk)| SyncRule {
                    source_column: referenced,
                    dest_column: fk,
                    source_side: SyncSide::Parent,
                })
                .collect(),
            Direction::ManyToOne => rel
                .pairs
                .iter()
                .map(|&(fk, referenced)| SyncRule {
                    source_column: referenced,
                    dest_column: fk,
                    source_side: SyncSide::Child,
                })
                .collect(),
            Direction::ManyToMany => rel
                .secondary
                .iter()
                .flat_map(|secondary| {
                    let parent = secondary.parent_pairs.iter().map(|&(pk, col)| SyncRule {
                        source_column: pk,
                        dest_column: col,
                        source_side: SyncSide::Parent,
                    });
                    let child = secondary.target_pairs.iter().map(|&(pk, col)| SyncRule {
                        source_column: pk,
                        dest_column: col,
                        source_side: SyncSide::Child,
                    });
                    parent.chain(child)
                })
                .collect(),
        };
        Self { rules }
    }

    pub fn rules(&self) -> &[SyncRule] {
        &self.rules
    }

    /// Destination columns written by these rules.
    pub fn dest_columns(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.dest_column).collect()
    }

    /// Copy (or clear) key values into `dest`.
    ///
    /// With `source` set every rule reads from it; otherwise each rule reads
    /// from `parent` or `child` according to its side. Unset source columns
    /// read as NULL. Clearing a column that belongs to the destination's
    /// primary key fails with `BlankOutPrimaryKey`.
    pub fn execute(
        &self,
        store: &mut InstanceStore,
        source: Option<InstanceId>,
        mut dest: SyncDest<'_>,
        parent: InstanceId,
        child: InstanceId,
        clear_keys: bool,
    ) -> Result<()> {
        for rule in &self.rules {
            if clear_keys {
                match &mut dest {
                    SyncDest::Instance(id) => {
                        let mapper = store.mappers().mapper(store.mapper_of(*id));
                        if mapper.primary_key.contains(&rule.dest_column) {
                            return Err(Error::Flush(
                                FlushError::new(
                                    FlushErrorKind::BlankOutPrimaryKey,
                                    format!(
                                        "dependency rule tried to blank out primary key column '{}' on {}",
                                        rule.dest_column,
                                        store.describe(*id)
                                    ),
                                )
                                .with_instances(vec![store.describe(*id)]),
                            ));
                        }
                        store.write(*id, rule.dest_column, Value::Null);
                    }
                    SyncDest::Row(row) => row.remove(rule.dest_column),
                }
                continue;
            }

            let from = source.unwrap_or(match rule.source_side {
                SyncSide::Parent => parent,
                SyncSide::Child => child,
            });
            let value = store.get(from, rule.source_column).clone();
            tracing::trace!(
                source = %from,
                source_column = rule.source_column,
                dest_column = rule.dest_column,
                value = %value,
                "Synchronizing key"
            );
            match &mut dest {
                SyncDest::Instance(id) => store.write(*id, rule.dest_column, value),
                SyncDest::Row(row) => row.set(rule.dest_column, value),
            }
        }
        Ok(())
    }
}
