//! Shared helpers for the integration tests.
//!
//! `MockConnection` is a tiny in-memory database that understands exactly the
//! statement shapes the flush executor emits (single and multi-row INSERT,
//! UPDATE ... SET ... WHERE, DELETE with AND/OR key clauses). It records every
//! statement, hands out serial keys, and can enforce foreign keys so tests
//! notice a statement issued in the wrong order.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use flushkit::{Connection, Cx, Error, Outcome, QueryError, QueryErrorKind, Value};

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
struct ForeignKey {
    table: &'static str,
    column: &'static str,
    ref_table: &'static str,
    ref_column: &'static str,
}

#[derive(Debug, Default)]
struct MockState {
    tables: BTreeMap<String, Vec<Row>>,
    serial: HashMap<String, i64>,
    log: Vec<(String, Vec<Value>)>,
    foreign_keys: Vec<ForeignKey>,
    rowcount: Option<u64>,
}

/// In-memory database shared between a test and the session that owns it.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

fn constraint(sql: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        sql: Some(sql.to_string()),
        sqlstate: Some("23503".to_string()),
        message,
        source: None,
    })
}

fn syntax(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: format!("mock database cannot parse: {sql}"),
        source: None,
    })
}

/// `"name"` at the start of `s`; returns the name and the remainder.
fn ident(s: &str) -> Option<(String, &str)> {
    let s = s.strip_prefix('"')?;
    let end = s.find('"')?;
    Some((s[..end].to_string(), &s[end + 1..]))
}

fn param(token: &str, params: &[Value]) -> Option<Value> {
    let n: usize = token.trim().strip_prefix('$')?.parse().ok()?;
    params.get(n.checked_sub(1)?).cloned()
}

/// `"col" = $n` pairs joined by `sep`.
fn assignments(s: &str, sep: &str, params: &[Value]) -> Option<Vec<(String, Value)>> {
    s.split(sep)
        .map(|part| {
            let (col, rest) = ident(part.trim())?;
            let value = param(rest.trim().strip_prefix('=')?, params)?;
            Some((col, value))
        })
        .collect()
}

fn matches(row: &Row, conditions: &[(String, Value)]) -> bool {
    conditions
        .iter()
        .all(|(col, value)| row.get(col).unwrap_or(&Value::Null) == value)
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce `table.column REFERENCES ref_table(ref_column)`.
    pub fn with_foreign_key(
        self,
        table: &'static str,
        column: &'static str,
        ref_table: &'static str,
        ref_column: &'static str,
    ) -> Self {
        self.state.lock().expect("lock poisoned").foreign_keys.push(ForeignKey {
            table,
            column,
            ref_table,
            ref_column,
        });
        self
    }

    /// Report this row count for every UPDATE and DELETE instead of the real one.
    pub fn set_rowcount(&self, rowcount: Option<u64>) {
        self.state.lock().expect("lock poisoned").rowcount = rowcount;
    }

    /// Insert a row directly, bypassing the log.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) {
        let mut state = self.state.lock().expect("lock poisoned");
        let row: Row = values.iter().map(|(c, v)| ((*c).to_string(), v.clone())).collect();
        if let Some(id) = row.get("id").and_then(Value::as_i64) {
            let serial = state.serial.entry(table.to_string()).or_insert(0);
            *serial = (*serial).max(id);
        }
        state.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .expect("lock poisoned")
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .log
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn log(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().expect("lock poisoned").log.clear();
    }

    fn run(&self, sql: &str, params: &[Value], generate_key: bool) -> Result<(u64, i64), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.log.push((sql.to_string(), params.to_vec()));
        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            state.insert(sql, rest, params, generate_key)
        } else if let Some(rest) = sql.strip_prefix("UPDATE ") {
            let count = state.update(sql, rest, params)?;
            Ok((state.rowcount.unwrap_or(count), 0))
        } else if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let count = state.delete(sql, rest, params)?;
            Ok((state.rowcount.unwrap_or(count), 0))
        } else {
            Err(syntax(sql))
        }
    }
}

impl MockState {
    fn insert(&mut self, sql: &str, rest: &str, params: &[Value], generate_key: bool) -> Result<(u64, i64), Error> {
        let (table, rest) = ident(rest).ok_or_else(|| syntax(sql))?;
        let columns: Vec<String> = if rest.trim() == "DEFAULT VALUES" {
            Vec::new()
        } else {
            let inner = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.split_once(") VALUES "))
                .ok_or_else(|| syntax(sql))?
                .0;
            inner
                .split(", ")
                .map(|c| ident(c).map(|(name, _)| name))
                .collect::<Option<_>>()
                .ok_or_else(|| syntax(sql))?
        };

        let row_len = columns.len().max(1);
        let row_count = if columns.is_empty() { 1 } else { params.len() / row_len };
        let mut last_id = 0;
        for i in 0..row_count {
            let mut row: Row = columns
                .iter()
                .enumerate()
                .map(|(j, col)| (col.clone(), params[i * row_len + j].clone()))
                .collect();
            let serial = self.serial.entry(table.clone()).or_insert(0);
            match row.get("id").and_then(Value::as_i64) {
                Some(id) => *serial = (*serial).max(id),
                None if generate_key => {
                    *serial += 1;
                    last_id = *serial;
                    row.insert("id".to_string(), Value::BigInt(*serial));
                }
                None => {}
            }
            self.check_references(sql, &table, &row)?;
            self.tables.entry(table.clone()).or_default().push(row);
        }
        Ok((row_count as u64, last_id))
    }

    fn update(&mut self, sql: &str, rest: &str, params: &[Value]) -> Result<u64, Error> {
        let (table, rest) = ident(rest).ok_or_else(|| syntax(sql))?;
        let (set, filter) = rest
            .strip_prefix(" SET ")
            .and_then(|r| r.split_once(" WHERE "))
            .ok_or_else(|| syntax(sql))?;
        let set = assignments(set, ", ", params).ok_or_else(|| syntax(sql))?;
        let filter = assignments(filter, " AND ", params).ok_or_else(|| syntax(sql))?;

        let mut updated = Vec::new();
        if let Some(rows) = self.tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|r| matches(r, &filter)) {
                for (col, value) in &set {
                    row.insert(col.clone(), value.clone());
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            self.check_references(sql, &table, row)?;
        }
        Ok(updated.len() as u64)
    }

    fn delete(&mut self, sql: &str, rest: &str, params: &[Value]) -> Result<u64, Error> {
        let (table, rest) = ident(rest).ok_or_else(|| syntax(sql))?;
        let filter = rest.strip_prefix(" WHERE ").ok_or_else(|| syntax(sql))?;
        let groups: Vec<Vec<(String, Value)>> = filter
            .split(" OR ")
            .map(|g| assignments(g.trim().trim_start_matches('(').trim_end_matches(')'), " AND ", params))
            .collect::<Option<_>>()
            .ok_or_else(|| syntax(sql))?;

        let rows = self.tables.entry(table.clone()).or_default();
        let (gone, kept): (Vec<Row>, Vec<Row>) = rows
            .drain(..)
            .partition(|r| groups.iter().any(|g| matches(r, g)));
        *rows = kept;

        for fk in self.foreign_keys.iter().filter(|fk| fk.ref_table == table) {
            for removed in &gone {
                let key = removed.get(fk.ref_column).unwrap_or(&Value::Null);
                if key.is_null() {
                    continue;
                }
                let referenced = self
                    .tables
                    .get(fk.table)
                    .is_some_and(|rows| rows.iter().any(|r| r.get(fk.column) == Some(key)));
                if referenced {
                    return Err(constraint(
                        sql,
                        format!("{}.{} still references {table}.{} = {key}", fk.table, fk.column, fk.ref_column),
                    ));
                }
            }
        }
        Ok(gone.len() as u64)
    }

    fn check_references(&self, sql: &str, table: &str, row: &Row) -> Result<(), Error> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(value) = row.get(fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let exists = self
                .tables
                .get(fk.ref_table)
                .is_some_and(|rows| rows.iter().any(|r| r.get(fk.ref_column) == Some(value)));
            if !exists {
                return Err(constraint(
                    sql,
                    format!("{table}.{} = {value} has no row in {}", fk.column, fk.ref_table),
                ));
            }
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn execute(&self, _cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = match self.run(sql, params, false) {
            Ok((count, _)) => Outcome::Ok(count),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn insert(&self, _cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = match self.run(sql, params, true) {
            Ok((_, id)) => Outcome::Ok(id),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => std::panic::panic_any(format!("unexpected error: {e}")),
        Outcome::Cancelled(r) => std::panic::panic_any(format!("cancelled: {r:?}")),
        Outcome::Panicked(p) => std::panic::panic_any(format!("panicked: {p:?}")),
    }
}

pub fn expect_error<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got {other:?}")),
    }
}

/// Run an async test body on a fresh current-thread runtime.
pub fn block_on<F: Future>(f: impl FnOnce(Cx) -> F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(f(cx))
}

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Position of the first statement starting with `prefix`.
pub fn position(statements: &[String], prefix: &str) -> usize {
    statements
        .iter()
        .position(|s| s.starts_with(prefix))
        .unwrap_or_else(|| std::panic::panic_any(format!("no statement starting with {prefix:?} in {statements:#?}")))
}
