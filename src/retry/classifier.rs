use crate::recovery::config::RecoveryLogConfig;
use crate::sql::dialect::Dialect;
use crate::sql::error::{SqlError, SqlErrorKind};

/// Decides whether a SQL error is worth retrying on a fresh connection.
///
/// In order of precedence: a code on the deny-list is never retried; with
/// `retry_all` every other error is; a code on the allow-list or among the
/// dialect's failover codes is; otherwise the driver's own category decides.
/// Chained causes are checked the same way and any one of them can make the
/// error transient.
#[derive(Debug, Clone, Default)]
pub struct TransientClassifier {
    retry_all: bool,
    allow: Vec<i32>,
    deny: Vec<i32>,
}

impl TransientClassifier {
    pub fn new(retry_all: bool, allow: Vec<i32>, deny: Vec<i32>) -> Self {
        Self { retry_all, allow, deny }
    }

    pub fn from_config(config: &RecoveryLogConfig) -> Self {
        Self::new(
            config.retry_all_sql_errors,
            config.retriable_sql_codes.clone(),
            config.non_retriable_sql_codes.clone(),
        )
    }

    pub fn is_transient(&self, dialect: Dialect, err: &SqlError) -> bool {
        self.classify_one(dialect, err) || err.chained.iter().any(|cause| self.is_transient(dialect, cause))
    }

    fn classify_one(&self, dialect: Dialect, err: &SqlError) -> bool {
        if err.code != 0 && self.deny.contains(&err.code) {
            return false;
        }
        if self.retry_all {
            return true;
        }
        if err.code != 0 && (self.allow.contains(&err.code) || dialect.transient_codes().contains(&err.code)) {
            return true;
        }
        err.kind == SqlErrorKind::Transient
    }
}
