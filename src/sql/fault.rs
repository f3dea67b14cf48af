// Fault injection for connection providers
//
// Wraps any provider so tests and soak runs can make chosen statements,
// commits or connection requests fail or stall a set number of times.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::sql::connection::{Connection, ConnectionError, ConnectionProvider};
use crate::sql::error::{SqlError, SqlResult};
use crate::sql::value::{SqlRow, SqlValue};

/// Where a fault fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultPoint {
    /// A statement whose text contains the pattern (case-insensitive)
    Statement(String),
    Commit,
    Connect,
}

/// What a fault does when it fires.
#[derive(Debug, Clone)]
pub enum FaultAction {
    /// Fail without running the operation
    Fail(SqlError),
    /// Run the operation, then report failure anyway (a lost acknowledgement)
    FailAfterApply(SqlError),
    /// Run the operation after a pause
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct Fault {
    point: FaultPoint,
    action: FaultAction,
    remaining: usize,
}

impl FaultPoint {
    fn matches(&self, other: &FaultPoint) -> bool {
        match (self, other) {
            (FaultPoint::Statement(pattern), FaultPoint::Statement(sql)) => {
                sql.to_ascii_uppercase().contains(&pattern.to_ascii_uppercase())
            }
            (FaultPoint::Commit, FaultPoint::Commit) => true,
            (FaultPoint::Connect, FaultPoint::Connect) => true,
            _ => false,
        }
    }
}

/// Fault injection controller shared by a wrapped provider and its connections.
#[derive(Debug, Default)]
pub struct FaultInjector {
    faults: Mutex<Vec<Fault>>,
    statements: AtomicU64,
    commits: AtomicU64,
    connections: AtomicU64,
}

impl FaultInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `times` statements containing `pattern`.
    pub fn fail_statement(&self, pattern: &str, error: SqlError, times: usize) {
        self.inject(FaultPoint::Statement(pattern.to_string()), FaultAction::Fail(error), times);
    }

    /// Delays the next `times` statements containing `pattern`.
    pub fn delay_statement(&self, pattern: &str, delay: Duration, times: usize) {
        self.inject(FaultPoint::Statement(pattern.to_string()), FaultAction::Delay(delay), times);
    }

    pub fn fail_commit(&self, error: SqlError, times: usize) {
        self.inject(FaultPoint::Commit, FaultAction::Fail(error), times);
    }

    /// Commits the next `times` transactions but reports them as failed.
    pub fn fail_commit_after_apply(&self, error: SqlError, times: usize) {
        self.inject(FaultPoint::Commit, FaultAction::FailAfterApply(error), times);
    }

    pub fn fail_connect(&self, error: SqlError, times: usize) {
        self.inject(FaultPoint::Connect, FaultAction::Fail(error), times);
    }

    pub fn inject(&self, point: FaultPoint, action: FaultAction, times: usize) {
        debug!("Injecting {:?} at {:?} ({} times)", action, point, times);
        self.faults.lock().push(Fault { point, action, remaining: times });
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Number of injected faults that have not fired yet.
    pub fn pending(&self) -> usize {
        self.faults.lock().iter().map(|f| f.remaining).sum()
    }

    /// Statements that reached the wrapped connection.
    pub fn statements_executed(&self) -> u64 {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Takes one firing of the first armed fault matching `point`.
    fn fire(&self, point: &FaultPoint) -> Option<FaultAction> {
        let mut faults = self.faults.lock();
        let position = faults.iter().position(|f| f.remaining > 0 && f.point.matches(point))?;
        let fault = &mut faults[position];
        fault.remaining -= 1;
        let action = fault.action.clone();
        if fault.remaining == 0 {
            faults.remove(position);
        }
        debug!("Fault fired at {:?}: {:?}", point, action);
        Some(action)
    }

    /// Runs `op` at `point` under whatever fault fires there.
    fn apply<T>(&self, point: FaultPoint, op: impl FnOnce() -> SqlResult<T>) -> SqlResult<T> {
        match self.fire(&point) {
            None => op(),
            Some(FaultAction::Fail(error)) => Err(error),
            Some(FaultAction::FailAfterApply(error)) => {
                op()?;
                Err(error)
            }
            Some(FaultAction::Delay(delay)) => {
                thread::sleep(delay);
                op()
            }
        }
    }
}

/// Provider wrapper whose connections consult a [`FaultInjector`].
pub struct FaultInjectingProvider<P> {
    inner: P,
    injector: Arc<FaultInjector>,
}

impl<P: ConnectionProvider> FaultInjectingProvider<P> {
    pub fn new(inner: P, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: ConnectionProvider> ConnectionProvider for FaultInjectingProvider<P> {
    fn get_connection(&self, logical_name: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        if let Some(action) = self.injector.fire(&FaultPoint::Connect) {
            match action {
                FaultAction::Fail(error) | FaultAction::FailAfterApply(error) => return Err(error.into()),
                FaultAction::Delay(delay) => thread::sleep(delay),
            }
        }
        let inner = self.inner.get_connection(logical_name)?;
        self.injector.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FaultInjectingConnection { inner, injector: self.injector.clone() }))
    }

    fn refresh(&self, logical_name: &str) -> Result<(), ConnectionError> {
        self.inner.refresh(logical_name)
    }
}

struct FaultInjectingConnection {
    inner: Box<dyn Connection>,
    injector: Arc<FaultInjector>,
}

impl Connection for FaultInjectingConnection {
    fn set_auto_commit(&mut self, auto_commit: bool) -> SqlResult<()> {
        self.inner.set_auto_commit(auto_commit)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> SqlResult<Vec<SqlRow>> {
        let inner = &mut self.inner;
        let statements = &self.injector.statements;
        self.injector.apply(FaultPoint::Statement(sql.to_string()), || {
            statements.fetch_add(1, Ordering::SeqCst);
            inner.query(sql, params)
        })
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> SqlResult<u64> {
        let inner = &mut self.inner;
        let statements = &self.injector.statements;
        self.injector.apply(FaultPoint::Statement(sql.to_string()), || {
            statements.fetch_add(1, Ordering::SeqCst);
            inner.execute(sql, params)
        })
    }

    fn commit(&mut self) -> SqlResult<()> {
        let inner = &mut self.inner;
        let commits = &self.injector.commits;
        self.injector.apply(FaultPoint::Commit, || {
            commits.fetch_add(1, Ordering::SeqCst);
            inner.commit()
        })
    }

    fn rollback(&mut self) -> SqlResult<()> {
        self.inner.rollback()
    }

    fn close(&mut self) -> SqlResult<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn product_name(&self) -> String {
        self.inner.product_name()
    }
}
