// rlsdb Server Context
//
// Process-wide state shared by every recovery log of one server: its name,
// the shutdown flag, the ownership scheme and the hook run when a log fails.

use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};
use parking_lot::{Mutex, MutexGuard};

use crate::common::types::FailureScope;

/// How log ownership is decided between servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipScheme {
    /// Owner name plus a shutdown latch in the control row
    Latch,
    /// Owner name plus a heartbeat timestamp in the control row
    Lease,
}

/// Actions taken when a log fails in a way the server cannot continue from.
pub trait FailureHook: Send + Sync {
    /// The failed log belongs to this server.
    fn terminate_server(&self, log_name: &str, cause: &(dyn StdError + 'static));

    /// The failed log belongs to a peer this server was recovering.
    fn leave_group(&self, failure_scope: &FailureScope, log_name: &str);
}

/// Default hook: report only.
#[derive(Debug, Default)]
pub struct LoggingFailureHook;

impl FailureHook for LoggingFailureHook {
    fn terminate_server(&self, log_name: &str, cause: &(dyn StdError + 'static)) {
        error!("Recovery log {} failed, server should terminate: {}", log_name, cause);
    }

    fn leave_group(&self, failure_scope: &FailureScope, log_name: &str) {
        error!("Recovery log {} for {} failed, leaving the recovery group", log_name, failure_scope);
    }
}

pub struct ServerContext {
    local_server_name: String,
    stopping: AtomicBool,
    lease_scheme: AtomicBool,
    create_table_lock: Mutex<()>,
    failure_hook: Arc<dyn FailureHook>,
}

impl ServerContext {
    pub fn new(local_server_name: impl Into<String>) -> Self {
        Self {
            local_server_name: local_server_name.into(),
            stopping: AtomicBool::new(false),
            lease_scheme: AtomicBool::new(false),
            create_table_lock: Mutex::new(()),
            failure_hook: Arc::new(LoggingFailureHook),
        }
    }

    pub fn with_failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.failure_hook = hook;
        self
    }

    pub fn local_server_name(&self) -> &str {
        &self.local_server_name
    }

    /// Whether `server_name` names this server.
    pub fn is_local(&self, server_name: &str) -> bool {
        self.local_server_name.eq_ignore_ascii_case(server_name)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn signal_stopping(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            info!("Server {} is stopping", self.local_server_name);
        }
    }

    pub fn ownership_scheme(&self) -> OwnershipScheme {
        if self.lease_scheme.load(Ordering::Acquire) {
            OwnershipScheme::Lease
        } else {
            OwnershipScheme::Latch
        }
    }

    /// Switches the process to the lease scheme. One-way; returns true if
    /// this call made the switch.
    pub fn enable_lease_scheme(&self) -> bool {
        let switched = !self.lease_scheme.swap(true, Ordering::AcqRel);
        if switched {
            info!("Server {} now uses lease based log ownership", self.local_server_name);
        }
        switched
    }

    pub(crate) fn create_table_lock(&self) -> MutexGuard<'_, ()> {
        self.create_table_lock.lock()
    }

    pub fn failure_hook(&self) -> &dyn FailureHook {
        self.failure_hook.as_ref()
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("local_server_name", &self.local_server_name)
            .field("stopping", &self.is_stopping())
            .field("ownership_scheme", &self.ownership_scheme())
            .finish()
    }
}
