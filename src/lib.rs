// rlsdb: SQL-table-backed recovery log for a distributed transaction manager

pub mod common;
pub mod sql;
pub mod retry;
pub mod ownership;
pub mod recovery;

// Re-export key items for convenient access
pub use common::{FailureScope, LogIdentity, LogType, OwnershipScheme, ServerContext};
pub use sql::{ConnectionProvider, SqliteConnectionProvider};
pub use retry::RetryPolicy;
pub use ownership::{ControlRow, PeerLease, ServerLeaseLog};
pub use recovery::{
    LogError, RecoverableUnitHandle, RecoveryLogConfig, RecoveryLogProperties, SectionHandle,
    SqlRecoveryLog,
};
