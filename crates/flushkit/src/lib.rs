//! Flushkit - unit-of-work flush ordering for relational object graphs.
//!
//! Flushkit takes a set of new, modified and deleted objects linked by
//! relationships and turns it into a correctly ordered sequence of INSERT,
//! UPDATE and DELETE statements:
//!
//! - Parents are inserted before the children that reference them, and
//!   children are deleted before their parents
//! - Foreign keys are copied from the referenced row into the referencing row
//!   as soon as the referenced row has its key
//! - Many-to-many association rows are written once per pair, whichever side
//!   of the relationship changed
//! - Self-referential and mutually dependent mappers are ordered row by row;
//!   relationships marked `post_update` break true cycles with a trailing
//!   UPDATE
//!
//! # Quick Start
//!
//! ```ignore
//! use flushkit::prelude::*;
//!
//! let mappers = MapperRegistry::new()
//!     .register(
//!         MapperInfo::new("User", "users")
//!             .column(ColumnInfo::id("id"))
//!             .column(ColumnInfo::new("name"))
//!             .relationship(
//!                 RelationshipInfo::new("addresses", "Address", RelationshipKind::OneToMany)
//!                     .remote_key("user_id")
//!                     .cascade("all, delete-orphan"),
//!             ),
//!     )
//!     .register(
//!         MapperInfo::new("Address", "addresses")
//!             .column(ColumnInfo::id("id"))
//!             .column(ColumnInfo::new("user_id")),
//!     )
//!     .compile()?;
//!
//! let mut session = Session::new(conn, mappers);
//! let user = session.store_mut().create_with("User", &[("name", Value::from("ed"))])?;
//! let address = session.store_mut().create("Address")?;
//! session.store_mut().append(user, "addresses", address)?;
//! session.add(user)?;
//!
//! println!("{}", session.plan()?.describe());
//! let result = session.flush(&cx).await;
//! ```

pub use flushkit_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Connection
    Connection,
    Dialect,
    // Errors
    ConcurrentModificationError,
    ConfigError,
    Error,
    FlushError,
    FlushErrorKind,
    QueryError,
    QueryErrorKind,
    Result,
    // Mapping configuration
    Cascade,
    ColumnInfo,
    Direction,
    LinkTableInfo,
    Mapper,
    MapperId,
    MapperInfo,
    MapperRegistry,
    Mappers,
    PassiveDeletes,
    Relationship,
    RelationshipId,
    RelationshipInfo,
    RelationshipKind,
    Table,
    Value,
};

pub use flushkit_session::{
    CycleGroup, FlushPlan, FlushResult, GraphNode, History, InstanceId, InstanceStore,
    ObjectState, PlanStep, RelationshipLoader, Session, SessionConfig, UowTransaction,
};

/// Lower-level building blocks, for callers driving a flush by hand.
pub mod engine {
    pub use flushkit_session::{
        AssociationRow, CascadeKind, ClauseSynchronizer, DependencyGraph, DependencyProcessor,
        PendingAction, RowDependency, RowStep, SortedGroup, SyncRule, Task, TaskElement,
        TaskProcessor, execute_plan,
    };
}

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ColumnInfo, Connection, Cx, Error, FlushErrorKind, FlushResult, InstanceId, MapperInfo,
        MapperRegistry, Mappers, ObjectState, Outcome, RelationshipInfo, RelationshipKind, Result,
        Session, SessionConfig, Value,
    };
}
