//! Database connection trait used by the flush executor.
//!
//! The flush engine only ever needs two primitives from a driver:
//!
//! - [`Connection::execute`] - run a statement and report the affected rowcount
//! - [`Connection::insert`] - run an INSERT and report the generated key
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::value::Value;
use asupersync::{Cx, Outcome};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Properly escapes embedded quote characters by doubling them:
    /// - For Postgres/SQLite: `"` becomes `""`
    /// - For MySQL: `` ` `` becomes ``` `` ```
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }
}

/// A database connection capable of running flush statements.
///
/// Statements are issued strictly sequentially within a single flush; the
/// executor never runs two statements concurrently on one connection.
pub trait Connection: Send + Sync {
    /// The SQL dialect spoken by this connection.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a statement and return the number of affected rows.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the last inserted ID.
    ///
    /// Only called when the table has a single-column integer primary key
    /// that the instance left unset.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;
}
