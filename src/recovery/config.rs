use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Prefix of every recovery log table name
pub const DEFAULT_TABLE_PREFIX: &str = "RLS_";

/// Flush callers that engage the write throttle
pub const DEFAULT_THROTTLE_WAITER_THRESHOLD: usize = 6;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runtime settings of a recovery log
#[derive(Debug, Clone)]
pub struct RecoveryLogConfig {
    /// Retry policy for open, flush and close processing
    pub transient_retry: RetryPolicy,

    /// Retry policy for heartbeats and standalone claims
    pub lightweight_retry: RetryPolicy,

    /// Concurrent flush callers at which writers are held back
    pub throttle_waiter_threshold: usize,

    /// Age after which a peer may take over a lease
    pub lease_timeout: Duration,

    /// Interval between lease renewals
    pub heartbeat_interval: Duration,

    /// Retry every SQL error not on the deny-list
    pub retry_all_sql_errors: bool,

    /// Vendor codes always treated as transient
    pub retriable_sql_codes: Vec<i32>,

    /// Vendor codes never treated as transient
    pub non_retriable_sql_codes: Vec<i32>,

    /// A home server respects a peer's live lease instead of reclaiming
    pub peer_recovery_precedence: bool,

    /// Run the failure hook when a log fails
    pub terminate_on_failure: bool,

    /// Use lease ownership from the start instead of waiting for a peer claim
    pub lease_scheme: bool,

    pub table_prefix: String,

    pub table_suffix: String,

    /// Pause between control-row reads while waiting for a latched owner
    pub latch_wait: Duration,
}

impl Default for RecoveryLogConfig {
    fn default() -> Self {
        Self {
            transient_retry: RetryPolicy::normal(),
            lightweight_retry: RetryPolicy::lightweight(),
            throttle_waiter_threshold: DEFAULT_THROTTLE_WAITER_THRESHOLD,
            lease_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            retry_all_sql_errors: false,
            retriable_sql_codes: Vec::new(),
            non_retriable_sql_codes: Vec::new(),
            peer_recovery_precedence: false,
            terminate_on_failure: false,
            lease_scheme: false,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            table_suffix: String::new(),
            latch_wait: Duration::from_secs(1),
        }
    }
}

/// Recovery log settings as written in a configuration file. Every field is
/// optional; missing ones take the defaults of [`RecoveryLogConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryLogProperties {
    pub transient_retry_attempts: Option<u32>,
    pub transient_retry_sleep_ms: Option<u64>,
    pub lightweight_retry_attempts: Option<u32>,
    pub lightweight_retry_sleep_ms: Option<u64>,
    pub throttle_waiter_threshold: Option<usize>,
    pub lease_timeout_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub retry_all_sql_errors: Option<bool>,
    pub retriable_sql_codes: Option<Vec<i32>>,
    pub non_retriable_sql_codes: Option<Vec<i32>>,
    pub peer_recovery_precedence: Option<bool>,
    pub terminate_on_failure: Option<bool>,
    pub lease_scheme: Option<bool>,
    pub table_prefix: Option<String>,
    pub table_suffix: Option<String>,
}

impl RecoveryLogProperties {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

impl From<RecoveryLogProperties> for RecoveryLogConfig {
    fn from(props: RecoveryLogProperties) -> Self {
        let defaults = RecoveryLogConfig::default();
        Self {
            transient_retry: RetryPolicy::new(
                props.transient_retry_attempts.unwrap_or(defaults.transient_retry.attempts),
                props
                    .transient_retry_sleep_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.transient_retry.sleep),
            ),
            lightweight_retry: RetryPolicy::new(
                props.lightweight_retry_attempts.unwrap_or(defaults.lightweight_retry.attempts),
                props
                    .lightweight_retry_sleep_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.lightweight_retry.sleep),
            ),
            // A threshold of zero would hold writers back forever.
            throttle_waiter_threshold: props
                .throttle_waiter_threshold
                .unwrap_or(defaults.throttle_waiter_threshold)
                .max(1),
            lease_timeout: props.lease_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.lease_timeout),
            heartbeat_interval: props
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            retry_all_sql_errors: props.retry_all_sql_errors.unwrap_or(defaults.retry_all_sql_errors),
            retriable_sql_codes: props.retriable_sql_codes.unwrap_or(defaults.retriable_sql_codes),
            non_retriable_sql_codes: props.non_retriable_sql_codes.unwrap_or(defaults.non_retriable_sql_codes),
            peer_recovery_precedence: props.peer_recovery_precedence.unwrap_or(defaults.peer_recovery_precedence),
            terminate_on_failure: props.terminate_on_failure.unwrap_or(defaults.terminate_on_failure),
            lease_scheme: props.lease_scheme.unwrap_or(defaults.lease_scheme),
            table_prefix: props.table_prefix.unwrap_or(defaults.table_prefix),
            table_suffix: props.table_suffix.unwrap_or(defaults.table_suffix),
            latch_wait: defaults.latch_wait,
        }
    }
}
