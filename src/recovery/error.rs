use std::sync::Arc;

use thiserror::Error;

use crate::common::types::{RuId, SectionId};
use crate::ownership::OwnershipError;
use crate::sql::error::SqlError;

/// Error type for recovery log operations
#[derive(Error, Debug, Clone)]
pub enum LogError {
    #[error("Recovery log {0} is not open")]
    Closed(String),

    /// The log failed earlier; the cause is the first failure it saw
    #[error("Recovery log has failed: {0}")]
    Failed(Arc<LogError>),

    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),

    #[error("Recovery log table {table} does not exist: {source}")]
    StorageMissing {
        table: String,
        #[source]
        source: SqlError,
    },

    /// This server was recovering a peer's log and the peer, or another
    /// server, has taken it back
    #[error("Server {owner} has taken ownership of the log")]
    PeerLostLogOwnership { owner: String },

    #[error("Server {owner} owns the log; this server may no longer write to it")]
    OwnershipLost { owner: String },

    #[error("Log is owned by {owner} whose lease is still live")]
    OwnershipRefused { owner: String },

    #[error("Ownership record missing from table {0}")]
    ControlRowMissing(String),

    #[error("Recoverable unit {0} does not exist")]
    InvalidRecoverableUnit(RuId),

    #[error("Recoverable unit {0} already exists")]
    DuplicateRecoverableUnit(RuId),

    #[error("Section {section} already exists in recoverable unit {unit}")]
    SectionExists { unit: RuId, section: SectionId },

    #[error("Section {section} does not exist in recoverable unit {unit}")]
    InvalidSection { unit: RuId, section: SectionId },

    #[error("Server is stopping")]
    ServerStopping,

    #[error("Internal recovery log error: {0}")]
    Internal(String),
}

/// Result type for recovery log operations
pub type Result<T> = std::result::Result<T, LogError>;

impl LogError {
    /// Failures that are reported without audit and cleared by a re-open.
    pub fn is_quiet(&self) -> bool {
        matches!(self.root_cause(), LogError::PeerLostLogOwnership { .. })
    }

    /// The error behind any `Failed` wrappers.
    pub fn root_cause(&self) -> &LogError {
        match self {
            LogError::Failed(cause) => cause.root_cause(),
            other => other,
        }
    }
}

impl From<OwnershipError> for LogError {
    fn from(err: OwnershipError) -> Self {
        match err {
            OwnershipError::Sql(e) => LogError::Sql(e),
            OwnershipError::StorageMissing { table, source } => LogError::StorageMissing { table, source },
            OwnershipError::ControlRowMissing(table) => LogError::ControlRowMissing(table),
            OwnershipError::Refused { owner, .. } => LogError::OwnershipRefused { owner },
            OwnershipError::PeerLost { owner } => LogError::PeerLostLogOwnership { owner },
            OwnershipError::Lost { owner } => LogError::OwnershipLost { owner },
        }
    }
}
