// SQLite connection provider
//
// SQLite has no row locks. A connection with auto-commit off opens its
// transaction with BEGIN IMMEDIATE, which takes the database write lock, so
// a control-row read serializes against other connections just like a
// locking select on a server database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, ErrorCode};

use crate::sql::connection::{Connection, ConnectionError, ConnectionProvider};
use crate::sql::error::{SqlError, SqlErrorKind, SqlResult};
use crate::sql::value::{SqlRow, SqlValue};

/// Default time a connection waits for another connection's write lock
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a new SQLite connection to one database file per request.
#[derive(Debug)]
pub struct SqliteConnectionProvider {
    path: PathBuf,
    busy_timeout: Duration,
    connections_opened: AtomicU64,
}

impl SqliteConnectionProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            connections_opened: AtomicU64::new(0),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Opens a connection directly, without the provider trait object.
    pub fn open(&self) -> SqlResult<SqliteConnection> {
        let conn = rusqlite::Connection::open(&self.path).map_err(map_sqlite_error)?;
        conn.busy_timeout(self.busy_timeout).map_err(map_sqlite_error)?;
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        debug!("Opened SQLite connection to {}", self.path.display());
        Ok(SqliteConnection { conn: Some(conn), auto_commit: true })
    }
}

impl ConnectionProvider for SqliteConnectionProvider {
    fn get_connection(&self, _logical_name: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        Ok(Box::new(self.open()?))
    }
}

pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
    auto_commit: bool,
}

impl SqliteConnection {
    fn handle(&self) -> SqlResult<&rusqlite::Connection> {
        self.conn.as_ref().ok_or_else(SqlError::connection_closed)
    }

    /// Starts the implicit transaction of a non auto-commit connection.
    fn begin_if_needed(&self) -> SqlResult<&rusqlite::Connection> {
        let conn = self.handle()?;
        if !self.auto_commit && conn.is_autocommit() {
            conn.execute_batch("BEGIN IMMEDIATE").map_err(map_sqlite_error)?;
        }
        Ok(conn)
    }
}

impl Connection for SqliteConnection {
    fn set_auto_commit(&mut self, auto_commit: bool) -> SqlResult<()> {
        if auto_commit && !self.auto_commit {
            self.commit()?;
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> SqlResult<Vec<SqlRow>> {
        let conn = self.begin_if_needed()?;
        let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sqlite_value)))
            .map_err(map_sqlite_error)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let mut values = Vec::with_capacity(column_count);
            for column in 0..column_count {
                let value: Value = row.get(column).map_err(map_sqlite_error)?;
                values.push(from_sqlite_value(value));
            }
            result.push(SqlRow::new(values));
        }
        Ok(result)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> SqlResult<u64> {
        let conn = self.begin_if_needed()?;
        let changed = conn
            .execute(sql, params_from_iter(params.iter().map(to_sqlite_value)))
            .map_err(map_sqlite_error)?;
        Ok(changed as u64)
    }

    fn commit(&mut self) -> SqlResult<()> {
        let conn = self.handle()?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT").map_err(map_sqlite_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> SqlResult<()> {
        let conn = self.handle()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK").map_err(map_sqlite_error)?;
        }
        Ok(())
    }

    fn close(&mut self) -> SqlResult<()> {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("ROLLBACK");
            }
            conn.close().map_err(|(_, e)| map_sqlite_error(e))?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn product_name(&self) -> String {
        format!("SQLite {}", rusqlite::version())
    }
}

fn to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn from_sqlite_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(v),
        Value::Real(v) => SqlValue::Text(v.to_string()),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Bytes(b),
    }
}

/// Busy and locked databases are transient; everything else is reported as
/// the driver gives it.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> SqlError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let kind = match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => SqlErrorKind::Transient,
                ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => SqlErrorKind::Recoverable,
                _ => SqlErrorKind::NonTransient,
            };
            let message = message.clone().unwrap_or_else(|| err.to_string());
            SqlError::new(kind, failure.extended_code, "HY000", message)
        }
        _ => SqlError::non_transient(0, "HY000", err.to_string()),
    }
}
