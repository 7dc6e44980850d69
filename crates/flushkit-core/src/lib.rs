//! Core types and traits for flushkit.
//!
//! This crate provides the foundations the unit of work builds on:
//!
//! - `Value` for dynamically typed column values
//! - `MapperInfo` / `RelationshipInfo` declarations and the `MapperRegistry`
//!   that compiles them into immutable `Mappers`
//! - `Connection` trait for executing flush statements
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod mapper;
pub mod registry;
pub mod relationship;
pub mod value;

pub use connection::{Connection, Dialect};
pub use error::{
    ConcurrentModificationError, ConfigError, ConnectionError, ConnectionErrorKind, Error,
    FlushError, FlushErrorKind, QueryError, QueryErrorKind, Result,
};
pub use mapper::{ColumnInfo, MapperInfo};
pub use registry::{
    Direction, Mapper, MapperId, MapperRegistry, Mappers, Relationship, RelationshipId,
    Secondary, Table,
};
pub use relationship::{Cascade, LinkTableInfo, PassiveDeletes, RelationshipInfo, RelationshipKind};
pub use value::Value;
