#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rusqlite::params;
use tempfile::TempDir;

use rlsdb::sql::{FaultInjectingProvider, FaultInjector};
use rlsdb::{
    ConnectionProvider, LogIdentity, LogType, RecoveryLogConfig, RetryPolicy, ServerContext,
    SqlRecoveryLog, SqliteConnectionProvider,
};

pub const HOME: &str = "server1";
pub const PEER: &str = "server2";
pub const TABLE: &str = "RLS_TRAN_LOG";

// Create a temporary directory holding the database file
pub fn create_temp_db() -> Result<(TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rls.db");
    Ok((dir, path))
}

// Configuration with short retry pauses
pub fn quick_config() -> RecoveryLogConfig {
    RecoveryLogConfig {
        transient_retry: RetryPolicy::new(3, Duration::from_millis(5)),
        lightweight_retry: RetryPolicy::new(1, Duration::from_millis(5)),
        latch_wait: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

pub fn lease_config(lease_timeout: Duration) -> RecoveryLogConfig {
    RecoveryLogConfig { lease_scheme: true, lease_timeout, ..quick_config() }
}

// Transaction log of `log_server` as seen from `local_server`
pub fn new_log(path: &Path, log_server: &str, local_server: &str, config: RecoveryLogConfig) -> Arc<SqlRecoveryLog> {
    let provider: Arc<dyn ConnectionProvider> = Arc::new(SqliteConnectionProvider::new(path));
    new_log_with(provider, log_server, Arc::new(ServerContext::new(local_server)), config)
}

pub fn new_log_with(
    provider: Arc<dyn ConnectionProvider>,
    log_server: &str,
    context: Arc<ServerContext>,
    config: RecoveryLogConfig,
) -> Arc<SqlRecoveryLog> {
    SqlRecoveryLog::new(
        LogIdentity::new(log_server, LogType::Transaction, "jdbc/tranlog"),
        config,
        provider,
        context,
    )
}

// Home log whose connections go through a fault injector
pub fn faulty_log(path: &Path, config: RecoveryLogConfig) -> (Arc<SqlRecoveryLog>, Arc<FaultInjector>) {
    let injector = FaultInjector::new();
    let provider = Arc::new(FaultInjectingProvider::new(SqliteConnectionProvider::new(path), injector.clone()));
    let log = new_log_with(provider, HOME, Arc::new(ServerContext::new(HOME)), config);
    (log, injector)
}

// Generate test data of specified size
pub fn generate_test_data(size: usize, seed: u8) -> Vec<u8> {
    (0..size).map(|i| (i as u8).wrapping_add(seed)).collect()
}

// Data rows of a table as (ru_id, section_id, index, data), control row excluded
pub fn read_rows(path: &Path, table: &str) -> Result<Vec<(i64, i64, i64, Vec<u8>)>> {
    let conn = rusqlite::Connection::open(path)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX, DATA FROM {} WHERE RU_ID <> ?1 \
         ORDER BY RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX",
        table
    ))?;
    let rows = stmt
        .query_map(params![-1i64], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn drop_table(path: &Path, table: &str) -> Result<()> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(&format!("DROP TABLE {}", table))?;
    Ok(())
}
