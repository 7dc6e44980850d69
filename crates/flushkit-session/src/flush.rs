//! Flush execution.
//!
//! Runs a sorted [`FlushPlan`] against a [`Connection`]:
//!
//! 1. Walk the steps in order. Each task INSERTs or UPDATEs its rows, then
//!    runs its dependency processors (save mode first, then delete mode in
//!    reverse). Cycle groups do the same row by row.
//! 2. Walk the steps in reverse and DELETE the rows marked for deletion,
//!    so children go before the parents they reference.
//!
//! Statements requested by processors (post updates, association rows) run
//! right after the processor that asked for them. Statements are awaited one
//! at a time; the first failure aborts the flush.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use flushkit_core::value::cmp_keys;
use flushkit_core::{
    ConcurrentModificationError, Connection, Dialect, Error, FlushError, FlushErrorKind, Mappers,
    RelationshipId, Table, Value,
};

use crate::graph::GraphNode;
use crate::store::{InstanceId, ObjectState};
use crate::sync::AssociationRow;
use crate::unit_of_work::{FlushPlan, PendingAction, PlanStep, TaskProcessor, UowTransaction};

macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return Outcome::Err(e),
        }
    };
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Number of post-update statements.
    pub post_updates: usize,
    /// Number of association rows inserted.
    pub link_inserts: usize,
    /// Number of association rows deleted.
    pub link_deletes: usize,
}

impl FlushResult {
    /// Total number of row operations.
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.deleted
            + self.post_updates
            + self.link_inserts
            + self.link_deletes
    }
}

/// Execute a plan built by [`UowTransaction::build_plan`].
#[tracing::instrument(level = "debug", skip(cx, conn, uow, plan), fields(steps = plan.len()))]
pub async fn execute_plan<C: Connection>(
    cx: &Cx,
    conn: &C,
    uow: &mut UowTransaction<'_>,
    plan: &FlushPlan,
) -> Outcome<FlushResult, Error> {
    let start = std::time::Instant::now();
    let mut executor = Executor {
        cx,
        conn,
        dialect: conn.dialect(),
        mappers: Arc::clone(uow.mappers()),
        check_rowcount: uow.config().check_rowcount,
        uow,
        result: FlushResult::default(),
    };
    try_outcome!(executor.run(plan).await);
    let result = executor.result;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis(),
        inserted = result.inserted,
        updated = result.updated,
        deleted = result.deleted,
        post_updates = result.post_updates,
        "Flush plan executed"
    );
    Outcome::Ok(result)
}

struct Executor<'a, 's, C> {
    cx: &'a Cx,
    conn: &'a C,
    dialect: Dialect,
    mappers: Arc<Mappers>,
    uow: &'a mut UowTransaction<'s>,
    check_rowcount: bool,
    result: FlushResult,
}

impl<C: Connection> Executor<'_, '_, C> {
    async fn run(&mut self, plan: &FlushPlan) -> Outcome<(), Error> {
        for step in &plan.steps {
            match step {
                PlanStep::Task(node) => try_outcome!(self.save_task(*node).await),
                PlanStep::Cycle(group) => {
                    for row in &group.rows {
                        if row.save {
                            try_outcome!(self.save_objects(vec![row.instance]).await);
                        }
                        for dep in &row.dependencies {
                            try_outcome!(self.run_processor(dep.processor, dep.saves.clone(), false).await);
                        }
                        for dep in row.dependencies.iter().rev() {
                            try_outcome!(self.run_processor(dep.processor, dep.deletes.clone(), true).await);
                        }
                    }
                    try_outcome!(self.run_processors(&group.processors).await);
                }
            }
        }

        for step in plan.steps.iter().rev() {
            match step {
                PlanStep::Task(node) => {
                    let deletes = self.uow.task(*node).map(|t| t.to_delete()).unwrap_or_default();
                    try_outcome!(self.delete_objects(deletes).await);
                }
                PlanStep::Cycle(group) => {
                    for row in group.rows.iter().rev() {
                        if row.delete && self.uow.is_deleted(row.instance) {
                            try_outcome!(self.delete_objects(vec![row.instance]).await);
                        }
                    }
                }
            }
        }
        Outcome::Ok(())
    }

    async fn save_task(&mut self, node: GraphNode) -> Outcome<(), Error> {
        let Some(task) = self.uow.task(node) else {
            return Outcome::Ok(());
        };
        let saves = task.to_save();
        let processors: Vec<TaskProcessor> = task.processors().collect();
        try_outcome!(self.save_objects(saves).await);
        self.run_processors(&processors).await
    }

    /// Run processors in save mode, then in delete mode in reverse.
    async fn run_processors(&mut self, processors: &[TaskProcessor]) -> Outcome<(), Error> {
        for &tp in processors {
            let deplist = self.uow.deplist(tp, false);
            try_outcome!(self.run_processor(tp, deplist, false).await);
        }
        for &tp in processors.iter().rev() {
            let deplist = self.uow.deplist(tp, true);
            try_outcome!(self.run_processor(tp, deplist, true).await);
        }
        Outcome::Ok(())
    }

    async fn run_processor(
        &mut self,
        tp: TaskProcessor,
        deplist: Vec<InstanceId>,
        delete: bool,
    ) -> Outcome<(), Error> {
        if deplist.is_empty() {
            return Outcome::Ok(());
        }
        let processors = self.uow.processor_set();
        let processor = &processors[tp.relationship.index()];
        try_result!(processor.process_dependencies(self.uow, &deplist, delete));
        self.run_pending().await
    }

    async fn run_pending(&mut self) -> Outcome<(), Error> {
        for action in self.uow.take_pending() {
            match action {
                PendingAction::PostUpdate { instance, columns } => {
                    try_outcome!(self.post_update(instance, &columns).await);
                }
                PendingAction::SecondaryDelete { relationship, rows } => {
                    try_outcome!(self.delete_association_rows(relationship, &rows).await);
                }
                PendingAction::SecondaryInsert { relationship, rows } => {
                    try_outcome!(self.insert_association_rows(relationship, &rows).await);
                }
            }
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Statement helpers
    // ========================================================================

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    /// `"a" = $n AND "b" = $n+1`, pushing the values onto `params`.
    fn equals_clause(&self, columns: &[&str], values: &[Value], params: &mut Vec<Value>, joiner: &str) -> String {
        columns
            .iter()
            .zip(values)
            .map(|(col, value)| {
                params.push(value.clone());
                format!("{} = {}", self.quote(col), self.dialect.placeholder(params.len()))
            })
            .collect::<Vec<_>>()
            .join(joiner)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        tracing::trace!(sql = %sql, params = params.len(), "Executing flush statement");
        self.conn.execute(self.cx, sql, params).await
    }

    fn check_rows(&self, table: &str, operation: &'static str, expected: u64, actual: u64) -> Result<(), Error> {
        if self.check_rowcount && expected != actual {
            return Err(Error::ConcurrentModification(ConcurrentModificationError {
                table: table.to_string(),
                operation,
                expected,
                actual,
            }));
        }
        Ok(())
    }

    fn chain_has_table(&self, id: InstanceId, table: &Table) -> bool {
        let mapper = self.uow.store().mapper_of(id);
        self.mappers.tables(mapper).any(|t| t.name == table.name)
    }

    // ========================================================================
    // Saves
    // ========================================================================

    async fn save_objects(&mut self, ids: Vec<InstanceId>) -> Outcome<(), Error> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for id in ids {
            if self.uow.was_saved(id) {
                continue;
            }
            if !self.uow.store().has_identity(id) {
                try_result!(self.detect_row_switch(id));
            }
            if self.uow.store().has_identity(id) {
                updates.push(id);
            } else {
                inserts.push(id);
            }
        }
        let store = self.uow.store();
        inserts.sort_by_key(|id| store.insert_order(*id));
        updates.sort_by(|a, b| {
            cmp_keys(
                store.identity(*a).unwrap_or_default(),
                store.identity(*b).unwrap_or_default(),
            )
        });

        try_outcome!(self.insert_rows(&inserts).await);
        try_outcome!(self.update_rows(&updates).await);
        Outcome::Ok(())
    }

    /// A pending instance whose key matches a row deleted in this flush
    /// takes over that row.
    fn detect_row_switch(&mut self, id: InstanceId) -> Result<(), Error> {
        let store = self.uow.store();
        let mapper = self.mappers.mapper(store.mapper_of(id));
        let pk = store.primary_key(id);
        if pk.iter().any(Value::is_null) {
            return Ok(());
        }
        let Some(existing) = store.lookup_identity(mapper.base, &pk) else {
            return Ok(());
        };
        if existing == id {
            return Ok(());
        }
        if self.uow.is_deleted(existing) {
            tracing::debug!(
                new = %store.describe(id),
                old = %store.describe(existing),
                "Row switch: pending instance replaces deleted row"
            );
            self.uow.unregister_object(existing);
            self.uow.record_row_switch(id, existing);
            self.uow.store_mut().adopt_row(id, existing);
            return Ok(());
        }
        let (new, old) = (store.describe(id), store.describe(existing));
        Err(Error::Flush(
            FlushError::new(
                FlushErrorKind::IdentityConflict,
                format!("new instance {new} conflicts with persistent instance {old}"),
            )
            .with_instances(vec![new, old]),
        ))
    }

    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    async fn insert_rows(&mut self, ids: &[InstanceId]) -> Outcome<(), Error> {
        let Some(&first) = ids.first() else {
            return Outcome::Ok(());
        };
        let mappers = Arc::clone(&self.mappers);
        for &id in ids {
            let mapper = mappers.mapper(self.uow.store().mapper_of(id));
            let store = self.uow.store_mut();
            if let (Some(col), Some(identity)) = (mapper.polymorphic_on, mapper.polymorphic_identity) {
                if store.get(id, col).is_null() {
                    store.write(id, col, Value::Text(identity.to_string()));
                }
            }
            if let Some(col) = mapper.version_column {
                if store.get(id, col).is_null() {
                    store.write(id, col, Value::BigInt(1));
                }
            }
        }

        let base = mappers.mapper(self.uow.store().mapper_of(first)).base;
        let base_table = mappers.tables(base).next().map(|t| t.name);
        for table in mappers.hierarchy_tables(base) {
            for &id in ids {
                if !self.chain_has_table(id, table) {
                    continue;
                }
                let store = self.uow.store();
                let generated = table
                    .autoincrement_column()
                    .filter(|col| Some(table.name) == base_table && store.get(id, col).is_null());

                let mut columns = Vec::new();
                let mut params = Vec::new();
                for col in &table.columns {
                    let value = store.get(id, col.name);
                    if value.is_null() && ((col.primary_key && col.auto_increment) || col.server_default) {
                        continue;
                    }
                    columns.push(col.name);
                    params.push(value.clone());
                }

                let column_list: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
                let placeholders: Vec<String> =
                    (1..=params.len()).map(|i| self.dialect.placeholder(i)).collect();
                let sql = if columns.is_empty() {
                    format!("INSERT INTO {} DEFAULT VALUES", self.quote(table.name))
                } else {
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        self.quote(table.name),
                        column_list.join(", "),
                        placeholders.join(", ")
                    )
                };

                if let Some(pk_col) = generated {
                    tracing::trace!(sql = %sql, "Executing INSERT with generated key");
                    let new_id = try_outcome!(self.conn.insert(self.cx, &sql, &params).await);
                    if new_id == 0 {
                        tracing::warn!(table = table.name, "Driver returned no generated key");
                    } else {
                        self.uow.store_mut().write(id, pk_col, Value::BigInt(new_id));
                        self.uow.store_mut().set_committed(id, pk_col, Value::BigInt(new_id));
                    }
                } else {
                    try_outcome!(self.execute(&sql, &params).await);
                }

                let store = self.uow.store_mut();
                for (col, value) in columns.into_iter().zip(params) {
                    store.set_committed(id, col, value);
                }
            }
        }

        for &id in ids {
            self.uow.mark_saved(id);
        }
        self.result.inserted += ids.len();
        tracing::debug!(count = ids.len(), "Inserted rows");
        Outcome::Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    async fn update_rows(&mut self, ids: &[InstanceId]) -> Outcome<(), Error> {
        let mappers = Arc::clone(&self.mappers);
        for &id in ids {
            self.uow.mark_saved(id);
            let switched = self.uow.row_switches().iter().any(|(new, _)| *new == id);
            let store = self.uow.store();
            let mapper = mappers.mapper(store.mapper_of(id));
            let version_col = mapper.version_column;
            let changed: Vec<&'static str> = store
                .changed_columns(id)
                .into_iter()
                .filter(|c| Some(*c) != version_col)
                .collect();
            if changed.is_empty() && !switched {
                continue;
            }
            let pk: Vec<Value> = mapper
                .primary_key
                .iter()
                .map(|col| store.committed_value(id, col).clone())
                .collect();
            if pk.iter().any(Value::is_null) {
                tracing::warn!(
                    instance = %store.describe(id),
                    "Skipping UPDATE for row without primary key - cannot identify row"
                );
                continue;
            }
            let old_version = version_col.map(|c| store.committed_value(id, c).clone());
            let new_version = old_version
                .as_ref()
                .map(|v| v.next_version().unwrap_or(Value::BigInt(1)));

            for table in mappers.tables(mapper.id) {
                let store = self.uow.store();
                let set_columns: Vec<&'static str> = table
                    .columns
                    .iter()
                    .map(|c| c.name)
                    .filter(|name| Some(*name) != version_col)
                    .filter(|name| {
                        if switched {
                            !table.primary_key.contains(name)
                        } else {
                            changed.contains(name)
                        }
                    })
                    .collect();
                let holds_version = version_col.is_some_and(|c| table.has_column(c));
                if set_columns.is_empty() && !holds_version {
                    continue;
                }

                let mut params = Vec::new();
                let mut assignments: Vec<String> = set_columns
                    .iter()
                    .map(|col| {
                        params.push(store.get(id, col).clone());
                        format!("{} = {}", self.quote(col), self.dialect.placeholder(params.len()))
                    })
                    .collect();
                if let (true, Some(col), Some(next)) = (holds_version, version_col, &new_version) {
                    params.push(next.clone());
                    assignments.push(format!("{} = {}", self.quote(col), self.dialect.placeholder(params.len())));
                }
                let mut where_clause = self.equals_clause(&mapper.primary_key, &pk, &mut params, " AND ");
                if let (true, Some(col), Some(old)) = (holds_version, version_col, &old_version) {
                    if !old.is_null() {
                        params.push(old.clone());
                        where_clause.push_str(&format!(
                            " AND {} = {}",
                            self.quote(col),
                            self.dialect.placeholder(params.len())
                        ));
                    }
                }
                let sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    self.quote(table.name),
                    assignments.join(", "),
                    where_clause
                );
                let rows = try_outcome!(self.execute(&sql, &params).await);
                try_result!(self.check_rows(table.name, "UPDATE", 1, rows));

                let store = self.uow.store_mut();
                for col in set_columns {
                    let value = store.get(id, col).clone();
                    store.set_committed(id, col, value);
                }
                if let (true, Some(col), Some(next)) = (holds_version, version_col, &new_version) {
                    store.write(id, col, next.clone());
                    store.set_committed(id, col, next.clone());
                }
            }
            self.result.updated += 1;
        }
        Outcome::Ok(())
    }

    /// UPDATE only the given columns of a row already written in this flush
    /// (or loaded before it).
    async fn post_update(&mut self, id: InstanceId, columns: &[&'static str]) -> Outcome<(), Error> {
        let store = self.uow.store();
        if store.state(id) == ObjectState::New && !self.uow.was_saved(id) {
            return Outcome::Err(Error::Flush(
                FlushError::new(
                    FlushErrorKind::UnknownInstance,
                    format!(
                        "post update requested for {} before its row was inserted",
                        store.describe(id)
                    ),
                )
                .with_instances(vec![store.describe(id)]),
            ));
        }
        let changed: Vec<&'static str> = columns
            .iter()
            .copied()
            .filter(|c| store.get(id, c) != store.committed_value(id, c))
            .collect();
        if changed.is_empty() {
            return Outcome::Ok(());
        }

        let mappers = Arc::clone(&self.mappers);
        let mapper = mappers.mapper(store.mapper_of(id));
        let pk: Vec<Value> = mapper
            .primary_key
            .iter()
            .map(|col| store.committed_value(id, col).clone())
            .collect();
        for table in mappers.tables(mapper.id) {
            let set_columns: Vec<&'static str> =
                changed.iter().copied().filter(|c| table.has_column(c)).collect();
            if set_columns.is_empty() {
                continue;
            }
            let store = self.uow.store();
            let mut params = Vec::new();
            let values: Vec<Value> = set_columns.iter().map(|c| store.get(id, c).clone()).collect();
            let assignments = self.equals_clause(&set_columns, &values, &mut params, ", ");
            let where_clause = self.equals_clause(&mapper.primary_key, &pk, &mut params, " AND ");
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                self.quote(table.name),
                assignments,
                where_clause
            );
            tracing::debug!(instance = %store.describe(id), columns = ?set_columns, "Post update");
            let rows = try_outcome!(self.execute(&sql, &params).await);
            try_result!(self.check_rows(table.name, "UPDATE", 1, rows));

            let store = self.uow.store_mut();
            for (col, value) in set_columns.into_iter().zip(values) {
                store.set_committed(id, col, value);
            }
            self.result.post_updates += 1;
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    async fn delete_objects(&mut self, ids: Vec<InstanceId>) -> Outcome<(), Error> {
        let store = self.uow.store();
        let mut ids: Vec<InstanceId> = ids
            .into_iter()
            .filter(|id| {
                let known = store.has_identity(*id);
                if !known {
                    tracing::warn!(instance = %store.describe(*id), "Skipping DELETE for row that was never persisted");
                }
                known
            })
            .collect();
        let Some(&first) = ids.first() else {
            return Outcome::Ok(());
        };
        ids.sort_by(|a, b| {
            cmp_keys(
                store.identity(*a).unwrap_or_default(),
                store.identity(*b).unwrap_or_default(),
            )
        });

        let mappers = Arc::clone(&self.mappers);
        let base = mappers.mapper(store.mapper_of(first)).base;
        let tables = mappers.hierarchy_tables(base);
        for table in tables.iter().rev() {
            for &id in &ids {
                if !self.chain_has_table(id, table) {
                    continue;
                }
                let store = self.uow.store();
                let mapper = mappers.mapper(store.mapper_of(id));
                let pk: Vec<Value> = mapper
                    .primary_key
                    .iter()
                    .map(|col| store.committed_value(id, col).clone())
                    .collect();
                let mut params = Vec::new();
                let mut where_clause = self.equals_clause(&mapper.primary_key, &pk, &mut params, " AND ");
                if let Some(col) = mapper.version_column.filter(|c| table.has_column(c)) {
                    let version = store.committed_value(id, col);
                    if !version.is_null() {
                        params.push(version.clone());
                        where_clause.push_str(&format!(
                            " AND {} = {}",
                            self.quote(col),
                            self.dialect.placeholder(params.len())
                        ));
                    }
                }
                let sql = format!("DELETE FROM {} WHERE {}", self.quote(table.name), where_clause);
                let rows = try_outcome!(self.execute(&sql, &params).await);
                try_result!(self.check_rows(table.name, "DELETE", 1, rows));
            }
        }
        self.result.deleted += ids.len();
        tracing::debug!(count = ids.len(), "Deleted rows");
        Outcome::Ok(())
    }

    // ========================================================================
    // Association tables
    // ========================================================================

    fn secondary_table(&self, relationship: RelationshipId) -> Result<&'static str, Error> {
        let rel = self.mappers.relationship(relationship);
        rel.secondary
            .as_ref()
            .map(|s| s.table)
            .ok_or_else(|| Error::config(format!("relationship '{}' has no secondary table", rel.name)))
    }

    async fn insert_association_rows(
        &mut self,
        relationship: RelationshipId,
        rows: &[AssociationRow],
    ) -> Outcome<(), Error> {
        let Some(first) = rows.first() else {
            return Outcome::Ok(());
        };
        let table = try_result!(self.secondary_table(relationship));
        let columns: Vec<&'static str> = first.columns().collect();
        let column_list: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();

        let mut params = Vec::new();
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let placeholders: Vec<String> = columns
                .iter()
                .map(|col| {
                    params.push(row.get(col).cloned().unwrap_or(Value::Null));
                    self.dialect.placeholder(params.len())
                })
                .collect();
            tuples.push(format!("({})", placeholders.join(", ")));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote(table),
            column_list.join(", "),
            tuples.join(", ")
        );
        tracing::debug!(table = table, count = rows.len(), "Inserting association rows");
        try_outcome!(self.execute(&sql, &params).await);
        self.result.link_inserts += rows.len();
        Outcome::Ok(())
    }

    async fn delete_association_rows(
        &mut self,
        relationship: RelationshipId,
        rows: &[AssociationRow],
    ) -> Outcome<(), Error> {
        if rows.is_empty() {
            return Outcome::Ok(());
        }
        let table = try_result!(self.secondary_table(relationship));
        let mut params = Vec::new();
        let clauses: Vec<String> = rows
            .iter()
            .map(|row| {
                let columns: Vec<&'static str> = row.columns().collect();
                let values: Vec<Value> = row.values().cloned().collect();
                format!("({})", self.equals_clause(&columns, &values, &mut params, " AND "))
            })
            .collect();
        let sql = format!("DELETE FROM {} WHERE {}", self.quote(table), clauses.join(" OR "));
        tracing::debug!(table = table, count = rows.len(), "Deleting association rows");
        let affected = try_outcome!(self.execute(&sql, &params).await);
        try_result!(self.check_rows(table, "DELETE", rows.len() as u64, affected));
        self.result.link_deletes += rows.len();
        Outcome::Ok(())
    }
}
