// rlsdb Log Ownership Module
//
// Every log table carries one control row (RU_ID = -1). Its SERVER_NAME is
// the server allowed to write the table and its RUSECTION_ID holds either
// the shutdown latch or the lease timestamp, depending on the scheme.

pub mod latch;
pub mod lease;
pub mod heartbeat;
pub mod server_lease;

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::common::context::OwnershipScheme;
use crate::common::types::{current_time_millis, ServiceId, CONTROL_ROW_ID};
use crate::sql::connection::Connection;
use crate::sql::dialect::Dialect;
use crate::sql::error::{SqlError, SqlResult};
use crate::sql::value::SqlValue;

use self::latch::LatchDecision;
use self::lease::LeaseDecision;

pub use heartbeat::Heartbeat;
pub use server_lease::{PeerLease, ServerLeaseLog};

/// Latch value while the owner is running
pub const LATCH_UNSET: i64 = 1;

/// Latch value set by an owner that is shutting down
pub const LATCH_SET: i64 = 255;

/// Control-row reads while waiting for a latched owner to finish closing
pub const LATCH_WAIT_ATTEMPTS: u32 = 3;

/// Placeholder stored in the DATA column of the control row
const CONTROL_ROW_DATA: [u8; 2] = [0, 0];

#[derive(Error, Debug)]
pub enum OwnershipError {
    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),

    #[error("Recovery log table {table} does not exist")]
    StorageMissing {
        table: String,
        #[source]
        source: SqlError,
    },

    #[error("Control row missing from table {0}")]
    ControlRowMissing(String),

    #[error("Log is owned by {owner} whose lease was renewed {age_ms}ms ago")]
    Refused { owner: String, age_ms: i64 },

    #[error("Server {owner} has taken ownership of the log")]
    PeerLost { owner: String },

    #[error("Server {owner} owns the log")]
    Lost { owner: String },
}

pub type Result<T> = std::result::Result<T, OwnershipError>;

/// Contents of the control row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRow {
    pub owner: String,
    /// Latch value or lease timestamp in milliseconds
    pub marker: i64,
}

/// Result of acquiring ownership at open time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    AlreadyOwned,
    Claimed { previous_owner: String },
    /// There was no control row; one was written naming this server
    Created,
}

/// Ownership checks for one log table, run on connections supplied by the
/// caller inside the caller's transaction.
#[derive(Debug, Clone)]
pub struct Ownership {
    table: String,
    service_id: ServiceId,
    /// Home server of the log
    log_server: String,
    /// The server running this process
    local_server: String,
    lease_timeout: Duration,
    peer_recovery_precedence: bool,
    latch_wait: Duration,
}

impl Ownership {
    pub fn new(
        table: impl Into<String>,
        service_id: ServiceId,
        log_server: impl Into<String>,
        local_server: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            service_id,
            log_server: log_server.into(),
            local_server: local_server.into(),
            lease_timeout: Duration::from_secs(10),
            peer_recovery_precedence: false,
            latch_wait: Duration::from_secs(1),
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_peer_recovery_precedence(mut self, precedence: bool) -> Self {
        self.peer_recovery_precedence = precedence;
        self
    }

    pub fn with_latch_wait(mut self, latch_wait: Duration) -> Self {
        self.latch_wait = latch_wait;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether this process is the log's home server.
    pub fn is_home(&self) -> bool {
        self.log_server.eq_ignore_ascii_case(&self.local_server)
    }

    fn is_local(&self, owner: &str) -> bool {
        owner.eq_ignore_ascii_case(&self.local_server)
    }

    pub fn read_control_row(&self, conn: &mut dyn Connection, dialect: Dialect, lock: bool) -> SqlResult<Option<ControlRow>> {
        let predicate = format!("RU_ID = {}", CONTROL_ROW_ID);
        let sql = if lock {
            dialect.select_for_update("SERVER_NAME, RUSECTION_ID", &self.table, &predicate)
        } else {
            format!("SELECT SERVER_NAME, RUSECTION_ID FROM {} WHERE {}", self.table, predicate)
        };

        let rows = conn.query(&sql, &[])?;
        match rows.first() {
            Some(row) => Ok(Some(ControlRow {
                owner: row.get_string(0)?.unwrap_or_default(),
                marker: row.get_i64(1)?,
            })),
            None => Ok(None),
        }
    }

    pub fn insert_control_row(&self, conn: &mut dyn Connection, marker: i64) -> SqlResult<()> {
        let sql = format!(
            "INSERT INTO {} (SERVER_NAME, SERVICE_ID, RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX, DATA) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        );
        conn.execute(&sql, &[
            SqlValue::from(self.local_server.as_str()),
            SqlValue::from(self.service_id),
            SqlValue::from(CONTROL_ROW_ID),
            SqlValue::from(marker),
            SqlValue::from(1i16),
            SqlValue::from(&CONTROL_ROW_DATA[..]),
        ])?;
        debug!("Inserted control row in {} for {} with marker {}", self.table, self.local_server, marker);
        Ok(())
    }

    /// Marker written by a new owner under `scheme`.
    pub fn initial_marker(scheme: OwnershipScheme) -> i64 {
        match scheme {
            OwnershipScheme::Latch => LATCH_UNSET,
            OwnershipScheme::Lease => current_time_millis(),
        }
    }

    fn take_over(&self, conn: &mut dyn Connection, marker: i64) -> SqlResult<()> {
        let sql = format!("UPDATE {} SET SERVER_NAME = ?, RUSECTION_ID = ? WHERE RU_ID = ?", self.table);
        conn.execute(&sql, &[
            SqlValue::from(self.local_server.as_str()),
            SqlValue::from(marker),
            SqlValue::from(CONTROL_ROW_ID),
        ])?;
        Ok(())
    }

    /// Updates the marker if this server owns the row. Returns whether it did.
    fn update_own_marker(&self, conn: &mut dyn Connection, marker: i64) -> SqlResult<bool> {
        let sql = format!("UPDATE {} SET RUSECTION_ID = ? WHERE RU_ID = ? AND SERVER_NAME = ?", self.table);
        let updated = conn.execute(&sql, &[
            SqlValue::from(marker),
            SqlValue::from(CONTROL_ROW_ID),
            SqlValue::from(self.local_server.as_str()),
        ])?;
        Ok(updated > 0)
    }

    fn storage_missing(&self, dialect: Dialect, err: SqlError) -> OwnershipError {
        if dialect.is_table_missing(&err) {
            OwnershipError::StorageMissing { table: self.table.clone(), source: err }
        } else {
            OwnershipError::Sql(err)
        }
    }

    /// Takes ownership when a log is opened.
    pub fn acquire_at_open(&self, conn: &mut dyn Connection, dialect: Dialect, scheme: OwnershipScheme) -> Result<ClaimOutcome> {
        match scheme {
            OwnershipScheme::Latch => self.acquire_latch(conn, dialect),
            OwnershipScheme::Lease => self.acquire_lease(conn, dialect),
        }
    }

    fn acquire_latch(&self, conn: &mut dyn Connection, dialect: Dialect) -> Result<ClaimOutcome> {
        let mut waits = 0;
        loop {
            let row = match self.read_control_row(conn, dialect, true)? {
                Some(row) => row,
                None => {
                    self.insert_control_row(conn, LATCH_UNSET)?;
                    return Ok(ClaimOutcome::Created);
                }
            };

            match latch::decide(&row, &self.local_server, waits, LATCH_WAIT_ATTEMPTS) {
                LatchDecision::Owned { clear_latch } => {
                    if clear_latch {
                        debug!("Clearing shutdown latch on {}", self.table);
                        self.update_own_marker(conn, LATCH_UNSET)?;
                    }
                    return Ok(ClaimOutcome::AlreadyOwned);
                }
                LatchDecision::AwaitHandoff => {
                    waits += 1;
                    info!("Log {} is latched by {}, waiting for it to close ({}/{})",
                          self.table, row.owner, waits, LATCH_WAIT_ATTEMPTS);
                    // Release the row so the outgoing owner can finish.
                    conn.rollback()?;
                    thread::sleep(self.latch_wait);
                }
                LatchDecision::Claim => {
                    self.take_over(conn, LATCH_UNSET)?;
                    info!("Server {} took log {} over from {}", self.local_server, self.table, row.owner);
                    return Ok(ClaimOutcome::Claimed { previous_owner: row.owner });
                }
            }
        }
    }

    /// Lease claim, used at open time and by standalone peer claims.
    pub fn acquire_lease(&self, conn: &mut dyn Connection, dialect: Dialect) -> Result<ClaimOutcome> {
        let now = current_time_millis();
        let row = match self.read_control_row(conn, dialect, true)? {
            Some(row) => row,
            None => {
                self.insert_control_row(conn, now)?;
                return Ok(ClaimOutcome::Created);
            }
        };

        match lease::decide(&row, &self.local_server, self.is_home(), now, self.lease_timeout, self.peer_recovery_precedence) {
            LeaseDecision::Renew => {
                self.update_own_marker(conn, now)?;
                Ok(ClaimOutcome::AlreadyOwned)
            }
            LeaseDecision::Reclaim | LeaseDecision::TakeExpired => {
                self.take_over(conn, now)?;
                info!("Server {} took the lease on {} from {}", self.local_server, self.table, row.owner);
                Ok(ClaimOutcome::Claimed { previous_owner: row.owner })
            }
            LeaseDecision::Refuse => {
                let age_ms = now - row.marker;
                info!("Lease on {} is held by {} ({}ms old), not claiming", self.table, row.owner, age_ms);
                Err(OwnershipError::Refused { owner: row.owner, age_ms })
            }
        }
    }

    /// Verifies inside the flush transaction that this server still owns the log.
    pub fn assert_at_runtime(&self, conn: &mut dyn Connection, dialect: Dialect) -> Result<()> {
        let row = self
            .read_control_row(conn, dialect, true)
            .map_err(|e| self.storage_missing(dialect, e))?;
        match row {
            Some(row) if self.is_local(&row.owner) => Ok(()),
            Some(row) => Err(self.lost_to(row.owner)),
            None => Err(OwnershipError::ControlRowMissing(self.table.clone())),
        }
    }

    fn lost_to(&self, owner: String) -> OwnershipError {
        if self.is_home() {
            warn!("Home server {} has lost log {} to {}", self.local_server, self.table, owner);
            OwnershipError::Lost { owner }
        } else {
            info!("Server {} has lost peer log {} to {}", self.local_server, self.table, owner);
            OwnershipError::PeerLost { owner }
        }
    }

    /// Refreshes the lease timestamp.
    pub fn renew_lease(&self, conn: &mut dyn Connection, dialect: Dialect) -> Result<()> {
        let renewed = self
            .update_own_marker(conn, current_time_millis())
            .map_err(|e| self.storage_missing(dialect, e))?;
        if renewed {
            return Ok(());
        }
        match self.read_control_row(conn, dialect, false)? {
            Some(row) => Err(self.lost_to(row.owner)),
            None => Err(OwnershipError::ControlRowMissing(self.table.clone())),
        }
    }

    /// Sets the shutdown latch to `value` if this server owns the log.
    pub fn set_latch(&self, conn: &mut dyn Connection, dialect: Dialect, value: i64) -> Result<bool> {
        let updated = self
            .update_own_marker(conn, value)
            .map_err(|e| self.storage_missing(dialect, e))?;
        debug!("Latch on {} set to {}: {}", self.table, value, updated);
        Ok(updated)
    }
}
