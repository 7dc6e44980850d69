//! Unit of work and flush ordering for flushkit.
//!
//! `flushkit-session` is the **engine layer**. Given a set of new, dirty and
//! deleted instances it works out which INSERT, UPDATE and DELETE statements
//! to issue, in which order, so that foreign keys always point at rows that
//! exist.
//!
//! # Role In The Architecture
//!
//! - **Instance store**: instance state, column and relationship history,
//!   identity map ([`store`]).
//! - **Dependency processors**: one per relationship, copying keys between
//!   related rows and deciding what else must be saved or deleted
//!   ([`dependency`], [`sync`]).
//! - **Unit of work**: per-flush tasks, the mapper dependency graph and the
//!   sorted [`FlushPlan`] ([`unit_of_work`], [`graph`]).
//! - **Executor**: runs the plan against a [`Connection`] ([`flush`]).
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn, mappers);
//!
//! let user = session.store_mut().create("User")?;
//! let address = session.store_mut().create("Address")?;
//! session.store_mut().append(user, "addresses", address)?;
//! session.add(user)?;
//!
//! // INSERT users, then INSERT addresses with user_id filled in
//! let result = session.flush(&cx).await;
//! ```

pub mod dependency;
pub mod flush;
pub mod graph;
pub mod store;
pub mod sync;
pub mod unit_of_work;

pub use dependency::DependencyProcessor;
pub use flush::{FlushResult, execute_plan};
pub use graph::{DependencyGraph, GraphNode, SortedGroup};
pub use store::{CascadeKind, History, InstanceId, InstanceStore, ObjectState, RelationshipLoader};
pub use sync::{AssociationRow, ClauseSynchronizer, SyncRule};
pub use unit_of_work::{
    CycleGroup, FlushPlan, PendingAction, PlanStep, RowDependency, RowStep, Task, TaskElement,
    TaskProcessor, UowTransaction,
};

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use flushkit_core::{Connection, Error, Mappers, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Session Configuration
// ============================================================================

/// Runtime behavior of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Verify the row count of every UPDATE and DELETE.
    pub check_rowcount: bool,
    /// Reject related instances whose mapper the relationship cannot load.
    pub enable_typechecks: bool,
    /// Expire every instance touched by a flush that failed.
    pub expire_on_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            check_rowcount: true,
            enable_typechecks: true,
            expire_on_failure: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `check_rowcount` (builder pattern).
    #[must_use]
    pub fn check_rowcount(mut self, value: bool) -> Self {
        self.check_rowcount = value;
        self
    }

    /// Set `enable_typechecks` (builder pattern).
    #[must_use]
    pub fn enable_typechecks(mut self, value: bool) -> Self {
        self.enable_typechecks = value;
        self
    }

    /// Set `expire_on_failure` (builder pattern).
    #[must_use]
    pub fn expire_on_failure(mut self, value: bool) -> Self {
        self.expire_on_failure = value;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// Owns a connection and an instance store, and flushes pending changes.
pub struct Session<C: Connection> {
    connection: C,
    store: InstanceStore,
    config: SessionConfig,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dialect", &self.connection.dialect())
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

impl<C: Connection> Session<C> {
    /// Create a session with the default configuration.
    pub fn new(connection: C, mappers: Arc<Mappers>) -> Self {
        Self::with_config(connection, mappers, SessionConfig::default())
    }

    pub fn with_config(connection: C, mappers: Arc<Mappers>, config: SessionConfig) -> Self {
        Self {
            connection,
            store: InstanceStore::new(mappers),
            config,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut InstanceStore {
        &mut self.store
    }

    /// Mark an instance (and its save-update cascade) pending.
    pub fn add(&mut self, id: InstanceId) -> Result<()> {
        self.store.add(id)
    }

    /// Mark an instance (and its delete cascade) for deletion.
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        self.store.delete(id)
    }

    pub fn expunge(&mut self, id: InstanceId) -> Result<()> {
        self.store.check_instance(id)?;
        self.store.expunge(id);
        Ok(())
    }

    /// Build the plan the next flush would execute, without running SQL.
    pub fn plan(&mut self) -> Result<FlushPlan> {
        let mut uow = UowTransaction::new(&mut self.store, self.config);
        register_instances(&mut uow, None)?;
        uow.build_plan()
    }

    /// Flush every pending change.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        self.flush_inner(cx, None).await
    }

    /// Flush only the given instances (plus whatever cascades and
    /// dependency processing pull in).
    pub async fn flush_objects(&mut self, cx: &Cx, objects: &[InstanceId]) -> Outcome<FlushResult, Error> {
        self.flush_inner(cx, Some(objects)).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, objects))]
    async fn flush_inner(&mut self, cx: &Cx, objects: Option<&[InstanceId]>) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.store.begin_flush() {
            return Outcome::Err(e);
        }
        let start = std::time::Instant::now();
        tracing::info!(
            new = self.store.new_instances().len(),
            deleted = self.store.deleted_instances().len(),
            "Flushing session"
        );

        let config = self.config;
        let mut uow = UowTransaction::new(&mut self.store, config);
        let outcome = run_flush(cx, &self.connection, &mut uow, objects).await;
        match &outcome {
            Outcome::Ok(result) => {
                finalize(&mut uow);
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis(),
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    "Flush complete"
                );
            }
            _ => {
                if config.expire_on_failure {
                    let touched = uow.touched();
                    tracing::warn!(touched = touched.len(), "Flush failed, expiring touched instances");
                    for id in touched {
                        uow.store_mut().expire(id);
                    }
                }
            }
        }
        drop(uow);
        self.store.end_flush();
        outcome
    }
}

async fn run_flush<C: Connection>(
    cx: &Cx,
    conn: &C,
    uow: &mut UowTransaction<'_>,
    objects: Option<&[InstanceId]>,
) -> Outcome<FlushResult, Error> {
    let orphans = match register_instances(uow, objects) {
        Ok(orphans) => orphans,
        Err(e) => return Outcome::Err(e),
    };
    for id in orphans {
        tracing::debug!(instance = %uow.store().describe(id), "Expunging pending orphan");
        uow.store_mut().expunge(id);
    }
    let plan = match uow.build_plan() {
        Ok(plan) => plan,
        Err(e) => return Outcome::Err(e),
    };
    tracing::debug!(plan = %plan.describe(), "Flush plan");
    execute_plan(cx, conn, uow, &plan).await
}

/// Register the session's pending set with a new unit of work.
///
/// Returns the pending instances found to be orphans; they are left out of
/// the flush and should be expunged.
fn register_instances(uow: &mut UowTransaction<'_>, objects: Option<&[InstanceId]>) -> Result<Vec<InstanceId>> {
    let wanted = |id: &InstanceId| objects.is_none_or(|o| o.contains(id));
    let store = uow.store();
    let mut saves = store.new_instances();
    saves.extend(store.dirty_instances());
    saves.retain(|id| wanted(id) && !store.is_pending_delete(*id));
    let deletes: Vec<InstanceId> = store.deleted_instances().into_iter().filter(|id| wanted(id)).collect();

    let mut pending_orphans = Vec::new();
    for id in saves {
        let store = uow.store();
        if store.is_orphan(id) {
            if store.has_identity(id) {
                uow.register_delete_cascade(id)?;
            } else {
                pending_orphans.push(id);
            }
        } else {
            uow.register_object(id, false, false);
        }
    }
    for id in deletes {
        uow.register_delete_cascade(id)?;
    }
    Ok(pending_orphans)
}

/// Hand the flushed state back to the store.
fn finalize(uow: &mut UowTransaction<'_>) {
    let switches = uow.row_switches().to_vec();
    let elements: Vec<(InstanceId, bool, bool)> = uow
        .tasks()
        .flat_map(|task| task.elements().map(|(id, e)| (id, e.listonly(), e.isdelete())))
        .collect();

    for (_, old) in switches {
        release_deleted(uow, old);
    }
    for (id, listonly, isdelete) in elements {
        if isdelete {
            if !listonly {
                release_deleted(uow, id);
            }
        } else if uow.was_saved(id) {
            uow.store_mut().commit(id);
        }
    }
}

fn release_deleted(uow: &mut UowTransaction<'_>, id: InstanceId) {
    if uow.store().has_identity(id) {
        uow.store_mut().mark_deleted(id);
    } else {
        uow.store_mut().expunge(id);
    }
}
