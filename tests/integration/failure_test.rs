// Recovery Log Failure Handling Tests

use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;

use rlsdb::common::FailureHook;
use rlsdb::sql::{FaultInjectingProvider, FaultInjector, SqlError};
use rlsdb::{FailureScope, LogError, LogIdentity, LogType, ServerContext, SqlRecoveryLog, SqliteConnectionProvider};

#[path = "../common/mod.rs"]
mod common;
use common::*;

fn transient() -> SqlError {
    SqlError::transient(5, "40001", "database is busy")
}

fn fatal() -> SqlError {
    SqlError::non_transient(19, "23000", "constraint failed")
}

fn queue_item(log: &SqlRecoveryLog, data: &[u8]) -> Result<i64> {
    let unit = log.create_recoverable_unit(FailureScope::new(HOME))?;
    unit.create_section(1, false)?.add_data(data)?;
    unit.write_sections()?;
    Ok(unit.identity())
}

#[derive(Default)]
struct CountingHook {
    terminations: AtomicUsize,
    departures: AtomicUsize,
}

impl FailureHook for CountingHook {
    fn terminate_server(&self, _log_name: &str, _cause: &(dyn StdError + 'static)) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }

    fn leave_group(&self, _failure_scope: &FailureScope, _log_name: &str) {
        self.departures.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_transient_errors_are_retried() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (log, injector) = faulty_log(&path, quick_config());
    injector.fail_connect(transient(), 2);
    log.open_log()?;

    queue_item(&log, b"retried")?;
    injector.fail_statement("INSERT", transient(), 2);
    log.force_sections()?;

    assert!(!log.is_failed());
    assert_eq!(injector.pending(), 0);
    assert_eq!(read_rows(&path, TABLE)?.len(), 1);
    log.close_log()?;
    Ok(())
}

#[test]
fn test_non_transient_error_fails_the_log() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (log, injector) = faulty_log(&path, quick_config());
    log.open_log()?;

    queue_item(&log, b"doomed")?;
    injector.fail_statement("INSERT", fatal(), 1);
    let err = log.force_sections().unwrap_err();
    // Batch failures chain the statement error as their cause.
    assert!(matches!(err, LogError::Sql(ref e) if e.walk().iter().any(|cause| cause.code == 19)));
    assert!(log.is_failed());

    // Every later operation fails without touching the database.
    let executed = injector.statements_executed();
    assert!(matches!(log.force_sections(), Err(LogError::Failed(_))));
    assert!(matches!(log.write_ru_section(1, 1, 1, b"x"), Err(LogError::Failed(_))));
    assert!(matches!(log.create_recoverable_unit(FailureScope::new(HOME)), Err(LogError::Failed(_))));
    assert!(matches!(log.keypoint(), Err(LogError::Failed(_))));
    assert_eq!(injector.statements_executed(), executed);

    assert!(matches!(log.close_log(), Err(LogError::Failed(_))));
    assert!(matches!(log.open_log(), Err(LogError::Failed(_))));
    assert!(read_rows(&path, TABLE)?.is_empty());
    Ok(())
}

#[test]
fn test_exhausted_retries_fail_the_log() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (log, injector) = faulty_log(&path, quick_config());
    log.open_log()?;

    queue_item(&log, b"never lands")?;
    injector.fail_statement("INSERT", transient(), 10);
    assert!(matches!(log.force_sections(), Err(LogError::Sql(_))));
    assert!(log.is_failed());
    // One attempt plus three retries.
    assert_eq!(injector.pending(), 6);
    Ok(())
}

#[test]
fn test_ambiguous_commit_duplicates_collapse_on_recovery() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (log, injector) = faulty_log(&path, quick_config());
    log.open_log()?;

    let ru_id = queue_item(&log, b"applied twice")?;
    injector.fail_commit_after_apply(transient(), 1);
    log.force_sections()?;
    log.close_log()?;

    // The first commit landed before its failure was reported.
    assert_eq!(read_rows(&path, TABLE)?.len(), 2);

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    let section = log.lookup_recoverable_unit(ru_id).and_then(|u| u.lookup_section(1)).expect("section");
    assert_eq!(section.data(), vec![b"applied twice".to_vec()]);
    log.close_log()?;
    Ok(())
}

#[test]
fn test_missing_table_is_reported() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    queue_item(&log, b"lost")?;

    drop_table(&path, TABLE)?;
    let err = log.force_sections().unwrap_err();
    assert!(matches!(err, LogError::StorageMissing { ref table, .. } if table == TABLE));
    assert!(log.is_failed());
    Ok(())
}

#[test]
fn test_stopping_server_does_not_retry() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (log, injector) = faulty_log(&path, quick_config());
    log.open_log()?;
    queue_item(&log, b"shutdown")?;

    log.server_stopping();
    injector.fail_statement("INSERT", transient(), 1);
    assert!(log.force_sections().is_err());
    assert!(log.is_failed());
    Ok(())
}

#[test]
fn test_reserved_connection_used_after_stopping() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (log, injector) = faulty_log(&path, quick_config());
    log.open_log()?;
    queue_item(&log, b"flushed at shutdown")?;

    log.server_stopping();
    let opened = injector.connections_opened();
    injector.fail_connect(fatal(), 10);

    log.close_log()?;
    assert_eq!(injector.connections_opened(), opened);
    assert_eq!(read_rows(&path, TABLE)?.len(), 1);
    Ok(())
}

#[test]
fn test_open_rejected_while_stopping() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.server_stopping();
    assert!(matches!(log.open_log(), Err(LogError::ServerStopping)));
    assert!(!log.is_failed());
    Ok(())
}

#[test]
fn test_failure_hook_invoked_once() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let hook = Arc::new(CountingHook::default());
    let injector = FaultInjector::new();
    let provider = Arc::new(FaultInjectingProvider::new(SqliteConnectionProvider::new(&path), injector.clone()));
    let context = Arc::new(ServerContext::new(HOME).with_failure_hook(hook.clone()));
    let config = rlsdb::RecoveryLogConfig { terminate_on_failure: true, ..quick_config() };
    let log = new_log_with(provider, HOME, context, config);
    log.open_log()?;

    queue_item(&log, b"fatal")?;
    injector.fail_statement("INSERT", fatal(), 1);
    assert!(log.force_sections().is_err());
    assert!(log.force_sections().is_err());

    assert_eq!(hook.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(hook.departures.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_associated_log_fails_together() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (tran, injector) = faulty_log(&path, quick_config());
    let partner = SqlRecoveryLog::new(
        LogIdentity::new(HOME, LogType::Partner, "jdbc/tranlog"),
        quick_config(),
        Arc::new(SqliteConnectionProvider::new(&path)),
        Arc::new(ServerContext::new(HOME)),
    );
    tran.open_log()?;
    partner.open_log()?;
    tran.associate_log(&partner, true);

    queue_item(&tran, b"fatal")?;
    injector.fail_statement("INSERT", fatal(), 1);
    assert!(tran.force_sections().is_err());

    assert!(partner.is_failed());
    assert!(matches!(partner.force_sections(), Err(LogError::Failed(_))));
    Ok(())
}

#[test]
fn test_associated_log_reported_only() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let (tran, injector) = faulty_log(&path, quick_config());
    let partner = SqlRecoveryLog::new(
        LogIdentity::new(HOME, LogType::Partner, "jdbc/tranlog"),
        quick_config(),
        Arc::new(SqliteConnectionProvider::new(&path)),
        Arc::new(ServerContext::new(HOME)),
    );
    tran.open_log()?;
    partner.open_log()?;
    tran.associate_log(&partner, false);

    queue_item(&tran, b"fatal")?;
    injector.fail_statement("INSERT", fatal(), 1);
    assert!(tran.force_sections().is_err());

    assert!(!partner.is_failed());
    partner.close_log()?;
    Ok(())
}
