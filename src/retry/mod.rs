// rlsdb Transient Retry Module
//
// Runs a unit of SQL work on a connection and, when it fails with a
// transient error, rolls back, drops the connection and reruns the work on
// a fresh one until it succeeds or the policy runs out.

pub mod classifier;

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::common::context::ServerContext;
use crate::recovery::error::{LogError, Result};
use crate::sql::connection::{Connection, DataSource};

pub use classifier::TransientClassifier;

/// How many times to retry and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub attempts: u32,
    pub sleep: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, sleep: Duration) -> Self {
        Self { attempts, sleep }
    }

    /// Policy for open, flush and close processing.
    pub const fn normal() -> Self {
        Self::new(180, Duration::from_secs(10))
    }

    /// Policy for heartbeats and standalone ownership claims.
    pub const fn lightweight() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::normal()
    }
}

/// Retry driver bound to one datasource.
pub struct SqlRetry<'a> {
    data_source: &'a DataSource,
    classifier: &'a TransientClassifier,
    context: &'a ServerContext,
}

impl<'a> SqlRetry<'a> {
    pub fn new(data_source: &'a DataSource, classifier: &'a TransientClassifier, context: &'a ServerContext) -> Self {
        Self { data_source, classifier, context }
    }

    /// Runs `work` on a new connection and commits; retries transient failures.
    pub fn run<T, F>(&self, operation: &str, policy: RetryPolicy, mut work: F) -> Result<T>
    where
        F: FnMut(&mut dyn Connection) -> Result<T>,
    {
        match self.attempt(&mut work) {
            Ok(value) => Ok(value),
            Err(failure) => self.retry_after(operation, policy, failure, work),
        }
    }

    /// Continues after a first attempt that failed with `failure`.
    pub fn retry_after<T, F>(&self, operation: &str, policy: RetryPolicy, failure: LogError, mut work: F) -> Result<T>
    where
        F: FnMut(&mut dyn Connection) -> Result<T>,
    {
        let mut last = failure;
        let mut retries = 0;

        loop {
            let sql_error = match &last {
                LogError::Sql(e) => e,
                _ => return Err(last),
            };
            if self.context.is_stopping() {
                info!("Server is stopping, not retrying {} after: {}", operation, sql_error);
                return Err(last);
            }
            if !self.classifier.is_transient(self.data_source.dialect(), sql_error) {
                debug!("Error while {} is not transient: {}", operation, sql_error);
                return Err(last);
            }
            if retries >= policy.attempts {
                warn!("Giving up {} after {} retries: {}", operation, retries, sql_error);
                return Err(last);
            }

            retries += 1;
            warn!("Caught transient SQL error while {} (retry {}/{} in {:?}): {}",
                  operation, retries, policy.attempts, policy.sleep, sql_error);
            thread::sleep(policy.sleep);

            match self.attempt(&mut work) {
                Ok(value) => {
                    info!("{} succeeded after {} retries", operation, retries);
                    return Ok(value);
                }
                Err(e) => last = e,
            }
        }
    }

    /// Runs `work` on an existing connection and commits. On failure the
    /// transaction is rolled back and the connection is left open.
    pub fn attempt_on<T, F>(&self, conn: &mut dyn Connection, work: &mut F) -> Result<T>
    where
        F: FnMut(&mut dyn Connection) -> Result<T>,
    {
        let result = work(&mut *conn).and_then(|value| {
            conn.commit()?;
            Ok(value)
        });
        if result.is_err() {
            if let Err(e) = conn.rollback() {
                debug!("Rollback after failed work also failed: {}", e);
            }
        }
        result
    }

    fn attempt<T, F>(&self, work: &mut F) -> Result<T>
    where
        F: FnMut(&mut dyn Connection) -> Result<T>,
    {
        let mut conn = self.data_source.get_connection()?;
        let result = self.attempt_on(conn.as_mut(), work);
        if let Err(e) = conn.close() {
            debug!("Closing connection failed: {}", e);
        }
        result
    }
}
