// rlsdb Server Lease Module
//
// One row per server in a table shared by a recovery group. A running
// server keeps LEASE_TIME fresh; a peer that finds an expired lease may claim
// it and recover that server's logs. LEASE_OWNER holds "<owner>,<backend>".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::common::context::ServerContext;
use crate::common::types::current_time_millis;
use crate::recovery::config::RecoveryLogConfig;
use crate::recovery::error::{LogError, Result};
use crate::retry::{RetryPolicy, SqlRetry, TransientClassifier};
use crate::sql::connection::{Connection, ConnectionProvider, DataSource};
use crate::sql::error::SqlError;
use crate::sql::value::{SqlRow, SqlValue};

/// Lease of one server as read from the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLease {
    pub recovery_identity: String,
    pub lease_time: i64,
}

impl PeerLease {
    pub fn is_expired(&self, now_ms: i64, lease_timeout: Duration) -> bool {
        now_ms.saturating_sub(self.lease_time) > lease_timeout.as_millis() as i64
    }
}

/// Splits a LEASE_OWNER column into owner and backend.
pub fn split_lease_owner(column: &str) -> (&str, Option<&str>) {
    match column.split_once(',') {
        Some((owner, backend)) if !owner.is_empty() => (owner, Some(backend)),
        _ => (column, None),
    }
}

/// The lease table of a recovery group.
pub struct ServerLeaseLog {
    table: String,
    index: String,
    lease_timeout: Mutex<Duration>,
    config: RecoveryLogConfig,
    context: Arc<ServerContext>,
    data_source: DataSource,
    classifier: TransientClassifier,
    table_exists: AtomicBool,
    /// Serializes the public operations of this instance
    busy: Mutex<()>,
}

impl ServerLeaseLog {
    pub fn new(
        config: RecoveryLogConfig,
        provider: Arc<dyn ConnectionProvider>,
        datasource: impl Into<String>,
        context: Arc<ServerContext>,
    ) -> Self {
        let table = format!("{}LEASES_LOG{}", config.table_prefix, config.table_suffix);
        Self {
            index: format!("IX{}", table),
            table,
            lease_timeout: Mutex::new(config.lease_timeout),
            classifier: TransientClassifier::from_config(&config),
            data_source: DataSource::new(provider, datasource),
            config,
            context,
            table_exists: AtomicBool::new(false),
            busy: Mutex::new(()),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn lease_timeout(&self) -> Duration {
        *self.lease_timeout.lock()
    }

    pub fn set_lease_timeout(&self, lease_timeout: Duration) {
        debug!("Peer recovery lease timeout set to {:?}", lease_timeout);
        *self.lease_timeout.lock() = lease_timeout;
    }

    fn retry(&self) -> SqlRetry<'_> {
        SqlRetry::new(&self.data_source, &self.classifier, &self.context)
    }

    fn owner_column(&self, identity: &str) -> String {
        format!("{},{}", identity, self.data_source.logical_name())
    }

    fn storage_error(&self, err: SqlError) -> LogError {
        if self.data_source.dialect().is_table_missing(&err) {
            LogError::StorageMissing { table: self.table.clone(), source: err }
        } else {
            LogError::Sql(err)
        }
    }

    /// Refreshes the lease of `identity`, inserting it if it has none. At
    /// startup the table is created when missing, and a home server takes
    /// its lease back from a peer unless peers have precedence.
    pub fn update_server_lease(&self, identity: &str, recovery_group: &str, startup: bool) -> Result<()> {
        let _busy = self.busy.lock();
        if self.context.is_stopping() {
            debug!("Server is stopping, lease of {} not updated", identity);
            return Ok(());
        }
        let updated = self.retry().run("updating the server lease", self.config.transient_retry, |conn| {
            self.update_work(conn, identity, recovery_group, startup)
        });
        match updated {
            Err(e) if self.context.is_stopping() => {
                debug!("Server is stopping, lease update for {} failed: {}", identity, e);
                Ok(())
            }
            Err(e) => {
                warn!("Cannot update server lease for {}: {}", identity, e);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    fn update_work(&self, conn: &mut dyn Connection, identity: &str, group: &str, startup: bool) -> Result<()> {
        let dialect = self.data_source.dialect();
        let sql = dialect.select_for_update("LEASE_TIME, LEASE_OWNER", &self.table, "SERVER_IDENTITY = ?");
        let stored = match conn.query(&sql, &[SqlValue::from(identity)]) {
            Ok(rows) => rows.first().map(read_lease_row).transpose()?,
            Err(e) if startup && dialect.is_table_missing(&e) && !self.table_exists.load(Ordering::Acquire) => {
                conn.rollback()?;
                self.create_table(conn)?;
                None
            }
            Err(e) => return Err(self.storage_error(e)),
        };
        self.table_exists.store(true, Ordering::Release);

        let now = current_time_millis();
        let Some((lease_time, owner_column)) = stored else {
            info!("Inserting new lease for server {} in group '{}'", identity, group);
            conn.execute(
                &format!(
                    "INSERT INTO {} (SERVER_IDENTITY, RECOVERY_GROUP, LEASE_OWNER, LEASE_TIME) VALUES (?, ?, ?, ?)",
                    self.table
                ),
                &[
                    SqlValue::from(identity),
                    SqlValue::from(group),
                    SqlValue::from(self.owner_column(identity)),
                    SqlValue::from(now),
                ],
            )?;
            return Ok(());
        };

        let (owner, _) = split_lease_owner(&owner_column);
        let lease = PeerLease { recovery_identity: identity.to_string(), lease_time };
        if startup && !lease.is_expired(now, self.lease_timeout()) && !owner.eq_ignore_ascii_case(identity) {
            if self.config.peer_recovery_precedence {
                info!("{} is recovering the logs of {} and has precedence", owner, identity);
                return Err(LogError::OwnershipRefused { owner: owner.to_string() });
            }
            info!("{} is recovering the logs of {}, taking the lease back", owner, identity);
        }

        conn.execute(
            &format!(
                "UPDATE {} SET LEASE_TIME = ?, RECOVERY_GROUP = ?, LEASE_OWNER = ? WHERE SERVER_IDENTITY = ?",
                self.table
            ),
            &[
                SqlValue::from(now),
                SqlValue::from(group),
                SqlValue::from(self.owner_column(identity)),
                SqlValue::from(identity),
            ],
        )?;
        debug!("Updated lease of {}", identity);
        Ok(())
    }

    fn create_table(&self, conn: &mut dyn Connection) -> Result<()> {
        let _create = self.context.create_table_lock();
        let dialect = self.data_source.dialect();
        info!("Creating server lease table {}", self.table);
        conn.execute(&dialect.create_lease_table_ddl(&self.table), &[])?;
        conn.execute(&dialect.create_lease_index_ddl(&self.index, &self.table), &[])?;
        Ok(())
    }

    /// Leases of every server in `recovery_group`. Creates the table, and
    /// returns no leases, if it does not exist yet.
    pub fn leases_for_peers(&self, recovery_group: &str) -> Result<Vec<PeerLease>> {
        let _busy = self.busy.lock();
        if self.context.is_stopping() {
            return Ok(Vec::new());
        }
        let leases = self.retry().run("reading peer leases", self.config.lightweight_retry, |conn| -> Result<Vec<PeerLease>> {
            let dialect = self.data_source.dialect();
            let sql = dialect.select_for_update("SERVER_IDENTITY, LEASE_TIME", &self.table, "RECOVERY_GROUP = ?");
            match conn.query(&sql, &[SqlValue::from(recovery_group)]) {
                Ok(rows) => {
                    self.table_exists.store(true, Ordering::Release);
                    rows.iter()
                        .map(|row| -> Result<PeerLease> {
                            Ok(PeerLease {
                                recovery_identity: row.get_string(0)?.unwrap_or_default(),
                                lease_time: row.get_i64(1)?,
                            })
                        })
                        .collect()
                }
                Err(e) if dialect.is_table_missing(&e) && !self.table_exists.load(Ordering::Acquire) => {
                    conn.rollback()?;
                    self.create_table(conn)?;
                    self.table_exists.store(true, Ordering::Release);
                    Ok(Vec::new())
                }
                Err(e) => Err(self.storage_error(e)),
            }
        });
        match leases {
            Err(e) if self.context.is_stopping() => {
                debug!("Server is stopping, peer lease read failed: {}", e);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Takes the lease of `to_recover` for `my_identity` if it is still
    /// expired. Returns false if another server renewed or claimed it first.
    pub fn claim_peer_lease(&self, to_recover: &str, my_identity: &str) -> Result<bool> {
        let _busy = self.busy.lock();
        let claimed = self.retry().run("claiming a peer lease", self.config.lightweight_retry, |conn| {
            let dialect = self.data_source.dialect();
            let sql = dialect.select_for_update("LEASE_TIME", &self.table, "SERVER_IDENTITY = ?");
            let rows = conn.query(&sql, &[SqlValue::from(to_recover)]).map_err(|e| self.storage_error(e))?;
            let Some(row) = rows.first() else {
                debug!("No lease found for {}", to_recover);
                return Ok(false);
            };

            let now = current_time_millis();
            let lease = PeerLease { recovery_identity: to_recover.to_string(), lease_time: row.get_i64(0)? };
            if !lease.is_expired(now, self.lease_timeout()) {
                debug!("Lease of {} is no longer expired", to_recover);
                return Ok(false);
            }
            conn.execute(
                &format!("UPDATE {} SET LEASE_TIME = ?, LEASE_OWNER = ? WHERE SERVER_IDENTITY = ?", self.table),
                &[SqlValue::from(now), SqlValue::from(self.owner_column(my_identity)), SqlValue::from(to_recover)],
            )?;
            Ok(true)
        })?;
        if claimed {
            info!("Server {} claimed the lease of {} for recovery", my_identity, to_recover);
        }
        Ok(claimed)
    }

    /// Removes the lease of `identity`. A home server leaving also drops the
    /// table once no leases remain.
    pub fn delete_server_lease(&self, identity: &str, peer: bool) -> Result<()> {
        let _busy = self.busy.lock();
        let deleted = self.retry().run("deleting the server lease", self.config.lightweight_retry, |conn| {
            let sql = format!("DELETE FROM {} WHERE SERVER_IDENTITY = ?", self.table);
            Ok(conn.execute(&sql, &[SqlValue::from(identity)]).map_err(|e| self.storage_error(e))?)
        })?;
        debug!("Deleted {} lease rows for {}", deleted, identity);
        if !peer {
            self.drop_table_if_empty();
        }
        Ok(())
    }

    fn drop_table_if_empty(&self) {
        let dropped = self.retry().run("dropping the lease table", RetryPolicy::new(0, Duration::ZERO), |conn| {
            let rows = conn.query(&format!("SELECT COUNT(*) FROM {}", self.table), &[])?;
            let count = rows.first().map(|row| row.get_i64(0)).transpose()?.unwrap_or(0);
            if count > 0 {
                return Ok(false);
            }
            conn.execute(&format!("DROP TABLE {}", self.table), &[])?;
            Ok(true)
        });
        match dropped {
            Ok(true) => {
                self.table_exists.store(false, Ordering::Release);
                info!("Dropped empty lease table {}", self.table);
            }
            Ok(false) => debug!("Lease table {} still holds leases", self.table),
            Err(e) => debug!("Lease table {} not dropped: {}", self.table, e),
        }
    }

    /// Owner and backend recorded against `identity`.
    pub fn lease_owner(&self, identity: &str) -> Result<Option<(String, Option<String>)>> {
        self.retry().run("reading the lease owner", self.config.lightweight_retry, |conn| {
            let sql = format!("SELECT LEASE_OWNER FROM {} WHERE SERVER_IDENTITY = ?", self.table);
            let rows = conn.query(&sql, &[SqlValue::from(identity)]).map_err(|e| self.storage_error(e))?;
            let Some(column) = rows.first().map(|row| row.get_string(0)).transpose()?.flatten() else {
                return Ok(None);
            };
            let (owner, backend) = split_lease_owner(&column);
            Ok(Some((owner.to_string(), backend.map(str::to_string))))
        })
    }
}

fn read_lease_row(row: &SqlRow) -> Result<(i64, String)> {
    Ok((row.get_i64(0)?, row.get_string(1)?.unwrap_or_default()))
}
