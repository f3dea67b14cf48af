// rlsdb SQL Access Module
//
// The narrow connection contract the recovery log is written against, the
// per-database dialect table and the providers shipped with the crate.

pub mod value;
pub mod error;
pub mod connection;
pub mod dialect;
pub mod sqlite;
pub mod fault;

pub use value::{SqlRow, SqlValue};
pub use error::{SqlError, SqlErrorKind, SqlResult};
pub use connection::{Connection, ConnectionError, ConnectionProvider, DataSource};
pub use dialect::Dialect;
pub use sqlite::SqliteConnectionProvider;
pub use fault::{FaultInjectingProvider, FaultInjector};
