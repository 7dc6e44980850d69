//! Error types for flush and mapping operations.

use std::fmt;

/// The primary error type for all flushkit operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors reported by the database driver
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Mapping configuration errors (raised while compiling mappers)
    Config(ConfigError),
    /// Flush ordering or bookkeeping errors
    Flush(FlushError),
    /// An UPDATE or DELETE matched a different number of rows than expected
    ConcurrentModification(ConcurrentModificationError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Error raised while resolving or executing a flush.
#[derive(Debug, Clone)]
pub struct FlushError {
    pub kind: FlushErrorKind,
    pub message: String,
    /// Instances involved in the failure, rendered for diagnostics.
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushErrorKind {
    /// The row-level sort found a cycle that no post_update breaks
    CircularDependency,
    /// flush() was invoked while a flush is already running
    Reentrant,
    /// An instance handle passed in is not known to the session
    UnknownInstance,
    /// A pending instance carries the identity of a live persistent instance
    IdentityConflict,
    /// Clearing a foreign key would null out part of a primary key
    BlankOutPrimaryKey,
    /// A related instance is not of the mapper the relationship targets
    TypeMismatch,
}

/// Rowcount mismatch on UPDATE or DELETE.
#[derive(Debug, Clone)]
pub struct ConcurrentModificationError {
    pub table: String,
    pub operation: &'static str,
    pub expected: u64,
    pub actual: u64,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, pool exhausted, statement timeout)?
    ///
    /// Flush ordering and concurrent-modification failures are never
    /// retryable: the in-memory graph has to be reconciled first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23503" for foreign key violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// The flush error kind, if this is a flush error.
    pub fn flush_kind(&self) -> Option<FlushErrorKind> {
        match self {
            Error::Flush(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Shorthand for a configuration error without a source.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a flush error without instance details.
    pub fn flush(kind: FlushErrorKind, message: impl Into<String>) -> Self {
        Error::Flush(FlushError {
            kind,
            message: message.into(),
            instances: Vec::new(),
        })
    }
}

impl QueryError {
    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl FlushError {
    pub fn new(kind: FlushErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            instances: Vec::new(),
        }
    }

    /// Attach rendered instance descriptions.
    pub fn with_instances(mut self, instances: Vec<String>) -> Self {
        self.instances = instances;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Flush(e) => write!(f, "Flush error: {}", e),
            Error::ConcurrentModification(e) => write!(f, "Concurrent modification: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.instances.is_empty() {
            write!(f, " [{}]", self.instances.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for ConcurrentModificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on table '{}' expected to affect {} row(s), affected {}",
            self.operation, self.table, self.expected, self.actual
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<FlushError> for Error {
    fn from(err: FlushError) -> Self {
        Error::Flush(err)
    }
}

impl From<ConcurrentModificationError> for Error {
    fn from(err: ConcurrentModificationError) -> Self {
        Error::ConcurrentModification(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for flushkit operations.
pub type Result<T> = std::result::Result<T, Error>;
