// rlsdb Recovery Log Module
//
// The SQL-backed recovery log: recoverable units and sections in memory, a
// double-buffered write cache and the table-backed store that flushes it.

pub mod config;
pub mod error;
pub mod unit;
pub mod cache;
pub mod throttle;
pub mod statements;
pub mod store;
pub mod handle;

pub use config::{ConfigError, RecoveryLogConfig, RecoveryLogProperties};
pub use error::{LogError, Result};
pub use unit::{RecoverableUnit, RecoverableUnitSection};
pub use store::SqlRecoveryLog;
pub use handle::{RecoverableUnitHandle, SectionHandle};
