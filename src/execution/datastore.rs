//! Business data access for compiled reports.
//!
//! A [`DataStore`] runs one bound [`Statement`] and hands back the
//! materialized rows. Calls are blocking; the engine drives them from
//! `spawn_blocking`. Every call carries a [`RunGuard`]; the store starts its
//! clock once a connection is in hand and must abort the statement when the
//! deadline passes or the cancel handle fires.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use uuid::Uuid;
use serde_json::{Number, Value};

use crate::sql::{Dialect, Literal, Statement};

/// Progress callback interval in SQLite virtual machine steps.
const PROGRESS_STEPS: i32 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("Query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Query exceeded the {}s time limit", .0.as_secs())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("Data store lock poisoned")]
    LockPoisoned,
}

pub type DataStoreResult<T> = Result<T, DataStoreError>;

/// Cooperative cancellation for one run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Time budget and cancellation for one statement.
#[derive(Debug, Clone)]
pub struct RunGuard {
    pub timeout: Duration,
    pub cancel: CancelHandle,
}

impl RunGuard {
    pub fn new(timeout: Duration, cancel: CancelHandle) -> Self {
        Self { timeout, cancel }
    }

    /// Start the clock. Stores call this once the statement can actually run,
    /// so time spent waiting for a connection is not charged to the budget.
    pub fn start(&self) -> Watchdog {
        Watchdog {
            deadline: Instant::now() + self.timeout,
            guard: self.clone(),
        }
    }
}

/// A started [`RunGuard`].
#[derive(Debug, Clone)]
pub struct Watchdog {
    deadline: Instant,
    guard: RunGuard,
}

impl Watchdog {
    /// Whether the statement should stop now.
    pub fn should_abort(&self) -> bool {
        self.guard.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// The error explaining why the statement was aborted.
    pub fn abort_error(&self) -> DataStoreError {
        if self.guard.cancel.is_cancelled() {
            DataStoreError::Cancelled
        } else {
            DataStoreError::Timeout(self.guard.timeout)
        }
    }
}

/// Materialized result set. Cells are JSON values; blobs arrive base64
/// encoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Source of the business rows reports read.
pub trait DataStore: Send + Sync {
    /// Placeholder style statements must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Run `statement` to completion or until `guard` aborts it.
    fn query(&self, statement: &Statement, guard: &RunGuard) -> DataStoreResult<RowSet>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed data store.
///
/// Each query opens its own connection, so runs never queue behind each
/// other. The setup connection keeps in-memory databases alive and serves
/// [`SqliteDataStore::execute_batch`].
pub struct SqliteDataStore {
    target: PathBuf,
    setup: Mutex<Connection>,
}

impl SqliteDataStore {
    pub fn open(path: impl AsRef<Path>) -> DataStoreResult<Self> {
        let target = path.as_ref().to_path_buf();
        let setup = Connection::open(&target)?;
        Ok(Self {
            target,
            setup: Mutex::new(setup),
        })
    }

    /// Open a private in-memory database (for testing). Connections share it
    /// through a uniquely named shared cache.
    pub fn open_in_memory() -> DataStoreResult<Self> {
        let uri = format!("file:quarry-{}?mode=memory&cache=shared", Uuid::new_v4().simple());
        Self::open(uri)
    }

    /// Run a batch of setup statements (schema, fixtures).
    pub fn execute_batch(&self, sql: &str) -> DataStoreResult<()> {
        let conn = self.setup.lock().map_err(|_| DataStoreError::LockPoisoned)?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

impl DataStore for SqliteDataStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, statement: &Statement, guard: &RunGuard) -> DataStoreResult<RowSet> {
        let conn = Connection::open(&self.target)?;
        let watchdog = guard.start();
        if watchdog.should_abort() {
            return Err(watchdog.abort_error());
        }

        let watch = watchdog.clone();
        conn.progress_handler(PROGRESS_STEPS, Some(move || watch.should_abort()));
        let result = read_rows(&conn, statement);

        result.map_err(|err| match err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted => {
                watchdog.abort_error()
            }
            other => DataStoreError::Sqlite(other),
        })
    }
}

fn read_rows(conn: &Connection, statement: &Statement) -> rusqlite::Result<RowSet> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for idx in 0..width {
            cells.push(cell_value(row.get_ref(idx)?));
        }
        out.push(cells);
    }

    Ok(RowSet { columns, rows: out })
}

fn cell_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

impl ToSql for Literal {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Literal::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Literal::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Literal::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Literal::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Literal::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}
