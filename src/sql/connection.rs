use std::sync::Arc;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::sql::dialect::Dialect;
use crate::sql::error::{SqlError, SqlErrorKind, SqlResult};
use crate::sql::value::{SqlRow, SqlValue};

/// A database connection. Statements run inside the current transaction
/// when auto-commit is off.
pub trait Connection: Send {
    fn set_auto_commit(&mut self, auto_commit: bool) -> SqlResult<()>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> SqlResult<Vec<SqlRow>>;

    /// Runs a statement and returns the number of rows it changed.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> SqlResult<u64>;

    /// Runs `sql` once per parameter set. A failing entry is reported as a
    /// batch error chaining the entry's own error.
    fn execute_batch(&mut self, sql: &str, batch: &[Vec<SqlValue>]) -> SqlResult<Vec<u64>> {
        let mut counts = Vec::with_capacity(batch.len());
        for (position, params) in batch.iter().enumerate() {
            match self.execute(sql, params) {
                Ok(count) => counts.push(count),
                Err(e) => return Err(SqlError::batch(position, counts, e)),
            }
        }
        Ok(counts)
    }

    fn commit(&mut self) -> SqlResult<()>;

    fn rollback(&mut self) -> SqlResult<()>;

    fn close(&mut self) -> SqlResult<()>;

    fn is_closed(&self) -> bool;

    /// Database product name, used to pick the dialect.
    fn product_name(&self) -> String;
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The resolved datasource can no longer hand out connections and must
    /// be resolved again.
    #[error("Resource allocation failed for datasource {name}: {reason}")]
    ResourceAllocation { name: String, reason: String },

    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),
}

impl From<ConnectionError> for SqlError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Sql(e) => e,
            ConnectionError::ResourceAllocation { .. } => {
                SqlError::new(SqlErrorKind::Recoverable, 0, "08001", err.to_string())
            }
        }
    }
}

/// Hands out connections for logical datasource names.
pub trait ConnectionProvider: Send + Sync {
    fn get_connection(&self, logical_name: &str) -> Result<Box<dyn Connection>, ConnectionError>;

    /// Resolves `logical_name` again after a resource allocation failure.
    fn refresh(&self, _logical_name: &str) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// One logical datasource: gets connections with auto-commit off and
/// remembers the dialect of the database behind it.
pub struct DataSource {
    provider: Arc<dyn ConnectionProvider>,
    logical_name: String,
    dialect: OnceCell<Dialect>,
}

impl DataSource {
    pub fn new(provider: Arc<dyn ConnectionProvider>, logical_name: impl Into<String>) -> Self {
        Self {
            provider,
            logical_name: logical_name.into(),
            dialect: OnceCell::new(),
        }
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Dialect of the database, `Generic` until a connection has been made.
    pub fn dialect(&self) -> Dialect {
        self.dialect.get().copied().unwrap_or(Dialect::Generic)
    }

    pub fn get_connection(&self) -> SqlResult<Box<dyn Connection>> {
        let mut conn = match self.provider.get_connection(&self.logical_name) {
            Ok(conn) => conn,
            Err(ConnectionError::ResourceAllocation { reason, .. }) => {
                warn!("Datasource {} failed to allocate a connection ({}), resolving it again",
                      self.logical_name, reason);
                self.provider.refresh(&self.logical_name)?;
                let conn = self.provider.get_connection(&self.logical_name)?;
                info!("Datasource {} resolved again", self.logical_name);
                conn
            }
            Err(ConnectionError::Sql(e)) => return Err(e),
        };

        let dialect = *self.dialect.get_or_init(|| {
            let product = conn.product_name();
            let dialect = Dialect::from_product_name(&product);
            debug!("Datasource {} is {} ({:?} dialect)", self.logical_name, product, dialect);
            dialect
        });
        debug!("Got {:?} connection for {}", dialect, self.logical_name);

        conn.set_auto_commit(false)?;
        Ok(conn)
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("logical_name", &self.logical_name)
            .field("dialect", &self.dialect.get())
            .finish()
    }
}
