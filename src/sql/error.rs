use thiserror::Error;

/// Category a driver assigns to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    /// The driver says the same statement may succeed if retried
    Transient,
    /// The connection is unusable but a new one may work
    Recoverable,
    NonTransient,
}

/// A database failure as reported through a [`Connection`](super::Connection).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("SQL error {code} (SQLSTATE {sql_state}): {message}")]
pub struct SqlError {
    pub kind: SqlErrorKind,
    /// Vendor error code
    pub code: i32,
    pub sql_state: String,
    pub message: String,
    /// Causes chained behind this error, e.g. the per-entry failures of a batch
    pub chained: Vec<SqlError>,
    /// Update counts of a batch that failed part way
    pub update_counts: Option<Vec<u64>>,
}

pub type SqlResult<T> = std::result::Result<T, SqlError>;

impl SqlError {
    pub fn new(kind: SqlErrorKind, code: i32, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            sql_state: sql_state.into(),
            message: message.into(),
            chained: Vec::new(),
            update_counts: None,
        }
    }

    pub fn transient(code: i32, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SqlErrorKind::Transient, code, sql_state, message)
    }

    pub fn non_transient(code: i32, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SqlErrorKind::NonTransient, code, sql_state, message)
    }

    /// Error for a use of a closed connection.
    pub fn connection_closed() -> Self {
        Self::new(SqlErrorKind::Recoverable, 0, "08003", "connection is closed")
    }

    /// Wraps the failure of entry `position` of a batch.
    pub fn batch(position: usize, update_counts: Vec<u64>, cause: SqlError) -> Self {
        Self {
            kind: SqlErrorKind::NonTransient,
            code: 0,
            sql_state: cause.sql_state.clone(),
            message: format!("batch entry {} failed: {}", position, cause.message),
            chained: vec![cause],
            update_counts: Some(update_counts),
        }
    }

    pub fn with_cause(mut self, cause: SqlError) -> Self {
        self.chained.push(cause);
        self
    }

    /// This error followed by every chained cause, depth first.
    pub fn walk(&self) -> Vec<&SqlError> {
        let mut out = vec![self];
        for cause in &self.chained {
            out.extend(cause.walk());
        }
        out
    }
}
