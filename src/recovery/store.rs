// rlsdb SQL Recovery Log
//
// Lock order: `force_lock` before `state` before a cache side. Writers take
// `state` then the active side. A flush holds `force_lock`, swaps the active
// side under `state`, releases `state` and drains the other side.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::common::context::{OwnershipScheme, ServerContext};
use crate::common::types::{
    hex_preview, DataIndex, FailureScope, LogIdentity, RuId, SectionId, ServiceId, CONTROL_ROW_ID,
    SINGLE_DATA_INDEX,
};
use crate::ownership::{ClaimOutcome, ControlRow, Heartbeat, Ownership, LATCH_SET, LATCH_UNSET};
use crate::recovery::cache::{CacheBuffer, CacheRecord, CacheSide, WriteCache};
use crate::recovery::config::RecoveryLogConfig;
use crate::recovery::error::{LogError, Result};
use crate::recovery::handle::RecoverableUnitHandle;
use crate::recovery::statements::LogStatements;
use crate::recovery::throttle::Throttle;
use crate::recovery::unit::{RecoverableUnit, RecoverableUnitIdTable};
use crate::retry::{SqlRetry, TransientClassifier};
use crate::sql::connection::{Connection, ConnectionProvider, DataSource};
use crate::sql::dialect::Dialect;
use crate::sql::error::SqlError;
use crate::sql::value::SqlValue;

/// Attempts at creating the table while another server may be creating it
const TABLE_CREATE_ATTEMPTS: u32 = 3;

/// Pause between table creation attempts
const TABLE_CREATE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Failure {
    cause: Arc<LogError>,
    quiet: bool,
}

struct LogState {
    /// Outstanding opens; zero means closed
    closes_required: u32,
    failure: Option<Failure>,
    units: BTreeMap<RuId, RecoverableUnit>,
    id_table: RecoverableUnitIdTable,
    active_side: CacheSide,
    /// Connection kept for flushes after the server started stopping
    reserved: Option<Box<dyn Connection>>,
    /// This log set the shutdown latch
    latched: bool,
}

impl LogState {
    fn new() -> Self {
        Self {
            closes_required: 0,
            failure: None,
            units: BTreeMap::new(),
            id_table: RecoverableUnitIdTable::new(),
            active_side: CacheSide::A,
            reserved: None,
            latched: false,
        }
    }
}

#[derive(Default)]
struct RecoveredUnits {
    units: BTreeMap<RuId, RecoverableUnit>,
    id_table: RecoverableUnitIdTable,
}

struct AssociatedLog {
    log: Weak<SqlRecoveryLog>,
    fail_together: bool,
}

/// A recovery log kept in one database table.
pub struct SqlRecoveryLog {
    self_ref: Weak<SqlRecoveryLog>,
    identity: LogIdentity,
    config: RecoveryLogConfig,
    context: Arc<ServerContext>,
    data_source: DataSource,
    classifier: TransientClassifier,
    ownership: Ownership,
    statements: LogStatements,
    table_name: String,
    index_name: String,
    force_lock: Mutex<()>,
    state: Mutex<LogState>,
    cache: WriteCache,
    throttle: Throttle,
    heartbeat: Mutex<Option<Heartbeat>>,
    associated: Mutex<Option<AssociatedLog>>,
}

impl SqlRecoveryLog {
    pub fn new(
        identity: LogIdentity,
        config: RecoveryLogConfig,
        provider: Arc<dyn ConnectionProvider>,
        context: Arc<ServerContext>,
    ) -> Arc<Self> {
        let table_name = format!("{}{}{}", config.table_prefix, identity.log_type.table_fragment(), config.table_suffix);
        let index_name = format!("IX{}", table_name);
        if config.lease_scheme {
            context.enable_lease_scheme();
        }

        let ownership = Ownership::new(&table_name, identity.service_id, &identity.server_name, context.local_server_name())
            .with_lease_timeout(config.lease_timeout)
            .with_peer_recovery_precedence(config.peer_recovery_precedence)
            .with_latch_wait(config.latch_wait);

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            data_source: DataSource::new(provider, identity.datasource.clone()),
            classifier: TransientClassifier::from_config(&config),
            statements: LogStatements::new(&table_name),
            throttle: Throttle::new(config.throttle_waiter_threshold),
            ownership,
            identity,
            config,
            context,
            table_name,
            index_name,
            force_lock: Mutex::new(()),
            state: Mutex::new(LogState::new()),
            cache: WriteCache::new(),
            heartbeat: Mutex::new(None),
            associated: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &LogIdentity {
        &self.identity
    }

    pub fn log_name(&self) -> &'static str {
        self.identity.log_type.log_name()
    }

    pub fn server_name(&self) -> &str {
        &self.identity.server_name
    }

    pub fn service_id(&self) -> ServiceId {
        self.identity.service_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn config(&self) -> &RecoveryLogConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().closes_required > 0
    }

    pub fn closes_required(&self) -> u32 {
        self.state.lock().closes_required
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failure.is_some()
    }

    /// The first failure the log saw, if any.
    pub fn failure(&self) -> Option<Arc<LogError>> {
        self.state.lock().failure.as_ref().map(|f| f.cause.clone())
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().units.len()
    }

    /// Changes written but not yet flushed.
    pub fn pending_writes(&self) -> usize {
        self.cache.pending()
    }

    fn retry(&self) -> SqlRetry<'_> {
        SqlRetry::new(&self.data_source, &self.classifier, &self.context)
    }

    fn dialect(&self) -> Dialect {
        self.data_source.dialect()
    }

    fn check_usable(&self, state: &LogState) -> Result<()> {
        if let Some(failure) = &state.failure {
            return Err(LogError::Failed(failure.cause.clone()));
        }
        if state.closes_required == 0 {
            return Err(LogError::Closed(self.table_name.clone()));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Open and recovery
    // ---------------------------------------------------------------------

    /// Opens the log, taking ownership of the table and recovering its units
    /// on the first open. Nested opens only count.
    pub fn open_log(&self) -> Result<()> {
        let _force = self.force_lock.lock();
        let reopen_after_loss = {
            let mut state = self.state.lock();
            match &state.failure {
                Some(failure) if !failure.quiet => return Err(LogError::Failed(failure.cause.clone())),
                Some(_) => true,
                None if state.closes_required > 0 => {
                    state.closes_required += 1;
                    debug!("Recovery log {} already open ({} closes required)", self.table_name, state.closes_required);
                    return Ok(());
                }
                None => false,
            }
        };
        if reopen_after_loss {
            // Opens made before ownership was lost no longer count.
            debug!("Reopening {} after losing ownership", self.table_name);
            self.teardown(false);
        }
        if self.context.is_stopping() {
            return Err(LogError::ServerStopping);
        }

        info!("Opening recovery log {} for server {} service {}",
              self.table_name, self.identity.server_name, self.identity.service_id);
        let scheme = self.context.ownership_scheme();
        let opened = self.retry().run("opening the recovery log", self.config.transient_retry, |conn| {
            self.open_work(conn, scheme)
        });

        match opened {
            Ok(recovered) => {
                let unit_count = recovered.units.len();
                {
                    let mut state = self.state.lock();
                    state.units = recovered.units;
                    state.id_table = recovered.id_table;
                    state.failure = None;
                    state.active_side = CacheSide::A;
                    state.closes_required += 1;
                }
                self.cache.clear();
                if scheme == OwnershipScheme::Lease {
                    self.start_heartbeat();
                }
                info!("Opened recovery log {}, recovered {} units", self.table_name, unit_count);
                Ok(())
            }
            Err(e @ (LogError::OwnershipRefused { .. } | LogError::ServerStopping)) => Err(e),
            Err(e) => {
                error!("Failed to open recovery log {}: {}", self.table_name, e);
                self.mark_failed(e.clone());
                Err(e)
            }
        }
    }

    fn open_work(&self, conn: &mut dyn Connection, scheme: OwnershipScheme) -> Result<RecoveredUnits> {
        let dialect = self.dialect();
        if self.ensure_table(conn, dialect, scheme)? {
            return Ok(RecoveredUnits::default());
        }
        let outcome = self.ownership.acquire_at_open(conn, dialect, scheme)?;
        debug!("Ownership of {} at open: {:?}", self.table_name, outcome);
        self.recover(conn)
    }

    /// Creates the table when it does not exist. Returns true if this call
    /// created it, in which case the control row already names this server.
    fn ensure_table(&self, conn: &mut dyn Connection, dialect: Dialect, scheme: OwnershipScheme) -> Result<bool> {
        let _create = self.context.create_table_lock();
        let mut attempts = 0;
        loop {
            match self.ownership.read_control_row(conn, dialect, false) {
                Ok(_) => return Ok(false),
                Err(e) if !dialect.is_table_missing(&e) => return Err(e.into()),
                Err(e) => debug!("Table {} not found ({}), creating it", self.table_name, e),
            }
            conn.rollback()?;

            match self.create_table(conn, dialect, scheme) {
                Ok(()) => {
                    info!("Created recovery log table {}", self.table_name);
                    return Ok(true);
                }
                Err(e) => {
                    conn.rollback()?;
                    attempts += 1;
                    if attempts >= TABLE_CREATE_ATTEMPTS {
                        return Err(e.into());
                    }
                    warn!("Creating table {} failed, it may be in creation elsewhere: {}", self.table_name, e);
                    thread::sleep(TABLE_CREATE_WAIT);
                }
            }
        }
    }

    fn create_table(&self, conn: &mut dyn Connection, dialect: Dialect, scheme: OwnershipScheme) -> std::result::Result<(), SqlError> {
        conn.execute(&dialect.create_table_ddl(&self.table_name), &[])?;
        conn.execute(&dialect.create_index_ddl(&self.index_name, &self.table_name), &[])?;
        self.ownership.insert_control_row(conn, Ownership::initial_marker(scheme))
    }

    /// Rebuilds the units of this server and service from the table.
    fn recover(&self, conn: &mut dyn Connection) -> Result<RecoveredUnits> {
        let rows = conn.query(&self.statements.select_rows(), &[
            SqlValue::from(self.identity.server_name.as_str()),
            SqlValue::from(self.identity.service_id),
        ])?;

        let failure_scope = self.identity.failure_scope();
        let mut recovered = RecoveredUnits::default();
        for row in rows {
            let ru_id = row.get_i64(0)?;
            if ru_id == CONTROL_ROW_ID {
                debug!("Skipping control row of {}", self.table_name);
                continue;
            }
            let section_id: SectionId = row.get_i64(1)?;
            let index = DataIndex::try_from(row.get_i64(2)?)
                .map_err(|_| LogError::Internal(format!("unit {} section {} has an invalid data index", ru_id, section_id)))?;
            let data = row.get_bytes(3)?.unwrap_or_default();
            debug!("Recovered unit {} section {} item {}: {}", ru_id, section_id, index, hex_preview(&data));

            let unit = recovered.units.entry(ru_id).or_insert_with(|| {
                recovered.id_table.reserve_id(ru_id);
                RecoverableUnit::recovered(ru_id, failure_scope.clone())
            });
            if unit.lookup_section(section_id).is_none() {
                unit.create_section(section_id, index == SINGLE_DATA_INDEX)?;
            }
            let section = unit
                .lookup_section_mut(section_id)
                .ok_or(LogError::InvalidSection { unit: ru_id, section: section_id })?;
            section.recover_item(index, data)?;
        }
        Ok(recovered)
    }

    /// Confirms recovery of the log's units has finished.
    pub fn recovery_complete(&self) -> Result<()> {
        let state = self.state.lock();
        self.check_usable(&state)?;
        info!("Recovery complete for {} ({} units)", self.table_name, state.units.len());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Recoverable units
    // ---------------------------------------------------------------------

    pub fn create_recoverable_unit(&self, failure_scope: FailureScope) -> Result<RecoverableUnitHandle<'_>> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let id = state.id_table.next_id();
        state.units.insert(id, RecoverableUnit::new(id, failure_scope));
        debug!("Created recoverable unit {} in {}", id, self.table_name);
        Ok(RecoverableUnitHandle::new(self, id))
    }

    /// Creates a unit with a caller-chosen id.
    pub fn create_recoverable_unit_with_id(&self, id: RuId, failure_scope: FailureScope) -> Result<RecoverableUnitHandle<'_>> {
        if id < 1 {
            return Err(LogError::InvalidRecoverableUnit(id));
        }
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        if state.units.contains_key(&id) || !state.id_table.reserve_id(id) {
            return Err(LogError::DuplicateRecoverableUnit(id));
        }
        state.units.insert(id, RecoverableUnit::new(id, failure_scope));
        debug!("Created recoverable unit {} in {}", id, self.table_name);
        Ok(RecoverableUnitHandle::new(self, id))
    }

    pub fn lookup_recoverable_unit(&self, id: RuId) -> Option<RecoverableUnitHandle<'_>> {
        self.state
            .lock()
            .units
            .contains_key(&id)
            .then(|| RecoverableUnitHandle::new(self, id))
    }

    /// Ids of the units in the log, in id order, optionally only those of one
    /// failure scope.
    pub fn recoverable_units(&self, failure_scope: Option<&FailureScope>) -> Result<Vec<RuId>> {
        let state = self.state.lock();
        if state.closes_required == 0 {
            return Err(LogError::Closed(self.table_name.clone()));
        }
        Ok(state
            .units
            .values()
            .filter(|unit| failure_scope.map_or(true, |scope| unit.failure_scope() == scope))
            .map(RecoverableUnit::identity)
            .collect())
    }

    /// Copy of a unit's current contents.
    pub fn snapshot_unit(&self, id: RuId) -> Option<RecoverableUnit> {
        self.state.lock().units.get(&id).cloned()
    }

    pub fn remove_recoverable_unit(&self, id: RuId) -> Result<()> {
        self.throttle.wait_if_engaged();
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let mut unit = state.units.remove(&id).ok_or(LogError::InvalidRecoverableUnit(id))?;
        state.id_table.remove_id(id);
        unit.remove();
        self.cache.side(state.active_side).push(CacheRecord::Remove { ru_id: id });
        debug!("Removed recoverable unit {} from {}", id, self.table_name);
        Ok(())
    }

    pub(crate) fn with_unit<T>(&self, id: RuId, f: impl FnOnce(&RecoverableUnit) -> T) -> Option<T> {
        self.state.lock().units.get(&id).map(f)
    }

    pub(crate) fn with_unit_mut<T>(&self, id: RuId, f: impl FnOnce(&mut RecoverableUnit) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let unit = state.units.get_mut(&id).ok_or(LogError::InvalidRecoverableUnit(id))?;
        f(unit)
    }

    // ---------------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------------

    /// Queues an item for insertion. No I/O until the next flush.
    pub fn write_ru_section(&self, ru_id: RuId, section_id: SectionId, index: DataIndex, data: &[u8]) -> Result<()> {
        self.append(vec![CacheRecord::Insert { ru_id, section_id, index, data: data.to_vec() }])
    }

    /// Queues an overwrite of a single-data item.
    pub fn update_ru_section(&self, ru_id: RuId, section_id: SectionId, data: &[u8]) -> Result<()> {
        self.append(vec![CacheRecord::Update { ru_id, section_id, data: data.to_vec() }])
    }

    fn append(&self, records: Vec<CacheRecord>) -> Result<()> {
        self.throttle.wait_if_engaged();
        let state = self.state.lock();
        self.check_usable(&state)?;
        let mut buffer = self.cache.side(state.active_side);
        for record in records {
            buffer.push(record);
        }
        Ok(())
    }

    /// Moves the unwritten items of a unit, or of one of its sections, into
    /// the cache.
    pub(crate) fn write_unit(&self, ru_id: RuId, section: Option<SectionId>) -> Result<()> {
        self.throttle.wait_if_engaged();
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        let active = state.active_side;
        let unit = state.units.get_mut(&ru_id).ok_or(LogError::InvalidRecoverableUnit(ru_id))?;

        let records = unit.pending_records(section)?;
        if records.is_empty() {
            return Ok(());
        }
        {
            let mut buffer = self.cache.side(active);
            for record in records {
                buffer.push(record);
            }
        }
        unit.mark_written(section);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Flush path
    // ---------------------------------------------------------------------

    /// Writes every cached change to the table in one transaction.
    pub fn force_sections(&self) -> Result<()> {
        let _registered = self.throttle.enter();
        let _force = self.force_lock.lock();
        self.flush_locked("forcing the recovery log")
    }

    pub fn keypoint(&self) -> Result<()> {
        debug!("Keypoint of {}", self.table_name);
        self.force_sections()
    }

    fn flush_locked(&self, operation: &str) -> Result<()> {
        let (side, reserved) = {
            let mut state = self.state.lock();
            self.check_usable(&state)?;
            let active = state.active_side;
            if self.cache.side(active).is_empty() {
                return Ok(());
            }
            state.active_side = active.other();
            (active, state.reserved.take())
        };

        let mut buffer = self.cache.side(side);
        debug!("Flushing {} inserts, {} updates and {} removes to {}",
               buffer.inserts.len(), buffer.updates.len(), buffer.removes.len(), self.table_name);

        match self.write_buffer(&buffer, reserved, operation) {
            Ok(reserved) => {
                let removed = std::mem::take(&mut buffer.removes);
                buffer.clear();
                drop(buffer);
                let mut state = self.state.lock();
                state.id_table.release_retired(&removed);
                if reserved.is_some() {
                    state.reserved = reserved;
                }
                Ok(())
            }
            Err(e) => {
                drop(buffer);
                self.mark_failed(e.clone());
                Err(e)
            }
        }
    }

    /// Applies a drained buffer. Returns the reserved connection if it is
    /// still usable.
    fn write_buffer(
        &self,
        buffer: &CacheBuffer,
        reserved: Option<Box<dyn Connection>>,
        operation: &str,
    ) -> Result<Option<Box<dyn Connection>>> {
        let mut work = |conn: &mut dyn Connection| -> Result<()> {
            self.ownership.assert_at_runtime(conn, self.dialect())?;
            self.execute_batches(conn, buffer)
        };
        let retry = self.retry();

        if let Some(mut conn) = reserved {
            match retry.attempt_on(conn.as_mut(), &mut work) {
                Ok(()) => return Ok(Some(conn)),
                Err(e) => {
                    warn!("Caught error when {} on the reserved connection: {}", operation, e);
                    let _ = conn.close();
                    retry.retry_after(operation, self.config.transient_retry, e, work)?;
                    return Ok(None);
                }
            }
        }

        retry.run(operation, self.config.transient_retry, work)?;
        Ok(None)
    }

    fn execute_batches(&self, conn: &mut dyn Connection, buffer: &CacheBuffer) -> Result<()> {
        let server = SqlValue::from(self.identity.server_name.as_str());
        let service = SqlValue::from(self.identity.service_id);

        if !buffer.inserts.is_empty() {
            let batch: Vec<Vec<SqlValue>> = buffer
                .inserts
                .iter()
                .map(|w| {
                    debug!("Insert unit {} section {} item {}: {}", w.ru_id, w.section_id, w.index, hex_preview(&w.data));
                    vec![
                        server.clone(),
                        service.clone(),
                        SqlValue::from(w.ru_id),
                        SqlValue::from(w.section_id),
                        SqlValue::from(w.index),
                        SqlValue::from(w.data.clone()),
                    ]
                })
                .collect();
            conn.execute_batch(&self.statements.insert_row(), &batch)
                .map_err(|e| self.storage_error(e))?;
        }

        if !buffer.updates.is_empty() {
            let batch: Vec<Vec<SqlValue>> = buffer
                .updates
                .iter()
                .map(|w| {
                    debug!("Update unit {} section {}: {}", w.ru_id, w.section_id, hex_preview(&w.data));
                    vec![
                        SqlValue::from(w.data.clone()),
                        server.clone(),
                        service.clone(),
                        SqlValue::from(w.ru_id),
                        SqlValue::from(w.section_id),
                    ]
                })
                .collect();
            conn.execute_batch(&self.statements.update_single_data(), &batch)
                .map_err(|e| self.storage_error(e))?;
        }

        if !buffer.removes.is_empty() {
            let batch: Vec<Vec<SqlValue>> = buffer
                .removes
                .iter()
                .map(|ru_id| vec![server.clone(), service.clone(), SqlValue::from(*ru_id)])
                .collect();
            conn.execute_batch(&self.statements.delete_unit(), &batch)
                .map_err(|e| self.storage_error(e))?;
        }
        Ok(())
    }

    fn storage_error(&self, err: SqlError) -> LogError {
        if self.dialect().is_table_missing(&err) {
            LogError::StorageMissing { table: self.table_name.clone(), source: err }
        } else {
            LogError::Sql(err)
        }
    }

    // ---------------------------------------------------------------------
    // Close and shutdown
    // ---------------------------------------------------------------------

    /// Closes one open. The last close flushes, releases the shutdown latch
    /// and discards the in-memory state.
    pub fn close_log(&self) -> Result<()> {
        let _force = self.force_lock.lock();
        {
            let mut state = self.state.lock();
            match state.closes_required {
                0 => {
                    debug!("Recovery log {} is already closed", self.table_name);
                    return Ok(());
                }
                1 => {}
                _ => {
                    state.closes_required -= 1;
                    return Ok(());
                }
            }
        }

        let result = self.flush_locked("closing the recovery log");
        if result.is_ok() {
            self.release_latch();
        }
        self.teardown(result.is_ok());
        match &result {
            Ok(()) => info!("Closed recovery log {}", self.table_name),
            Err(e) => warn!("Recovery log {} closed after failure: {}", self.table_name, e),
        }
        result
    }

    pub fn close_log_immediate(&self) -> Result<()> {
        self.close_log()
    }

    fn teardown(&self, clear_failure: bool) {
        self.stop_heartbeat();
        let reserved = {
            let mut state = self.state.lock();
            state.closes_required = 0;
            state.units.clear();
            state.id_table = RecoverableUnitIdTable::new();
            state.active_side = CacheSide::A;
            state.latched = false;
            if clear_failure {
                state.failure = None;
            }
            state.reserved.take()
        };
        self.cache.clear();
        if let Some(mut conn) = reserved {
            let _ = conn.rollback();
            let _ = conn.close();
        }
    }

    fn release_latch(&self) {
        if self.context.ownership_scheme() != OwnershipScheme::Latch {
            return;
        }
        let reserved = {
            let mut state = self.state.lock();
            if !state.latched {
                return;
            }
            state.latched = false;
            state.reserved.take()
        };

        let mut work = |conn: &mut dyn Connection| -> Result<bool> {
            Ok(self.ownership.set_latch(conn, self.dialect(), LATCH_UNSET)?)
        };
        let result = match reserved {
            Some(mut conn) => {
                let result = self.retry().attempt_on(conn.as_mut(), &mut work);
                let _ = conn.close();
                result
            }
            None => self.retry().run("clearing the shutdown latch", self.config.lightweight_retry, work),
        };
        match result {
            Ok(true) => debug!("Cleared shutdown latch on {}", self.table_name),
            Ok(false) => warn!("Shutdown latch on {} not cleared, log is owned by another server", self.table_name),
            Err(e) => warn!("Unable to clear shutdown latch on {}: {}", self.table_name, e),
        }
    }

    /// Called when the server begins to stop. Keeps a connection for the
    /// flushes of close processing and, under the latch scheme, tells other
    /// servers this one is still closing the log.
    pub fn server_stopping(&self) {
        self.context.signal_stopping();
        let _force = self.force_lock.lock();
        {
            let state = self.state.lock();
            if state.closes_required == 0 || state.failure.is_some() || state.reserved.is_some() {
                return;
            }
        }

        let Some(mut conn) = self.reserve_connection() else {
            return;
        };

        let mut latched = false;
        if self.context.ownership_scheme() == OwnershipScheme::Latch {
            let set = self
                .ownership
                .set_latch(conn.as_mut(), self.dialect(), LATCH_SET)
                .map_err(LogError::from)
                .and_then(|set| {
                    conn.commit()?;
                    Ok(set)
                });
            match set {
                Ok(set) => {
                    debug!("Shutdown latch on {} set: {}", self.table_name, set);
                    latched = set;
                }
                Err(e) => {
                    warn!("Unable to set shutdown latch on {}: {}", self.table_name, e);
                    let _ = conn.rollback();
                }
            }
        }

        let mut state = self.state.lock();
        state.reserved = Some(conn);
        state.latched = latched;
    }

    fn reserve_connection(&self) -> Option<Box<dyn Connection>> {
        for attempt in 0..2 {
            match self.validated_connection() {
                Ok(conn) => return Some(conn),
                Err(LogError::Sql(e)) if attempt == 0 && self.classifier.is_transient(self.dialect(), &e) => {
                    warn!("Transient error reserving a shutdown connection for {}, retrying: {}", self.table_name, e);
                }
                Err(e) => {
                    warn!("Unable to reserve a shutdown connection for {}: {}", self.table_name, e);
                    return None;
                }
            }
        }
        None
    }

    fn validated_connection(&self) -> Result<Box<dyn Connection>> {
        let mut conn = self.data_source.get_connection()?;
        let checked = self
            .ownership
            .read_control_row(conn.as_mut(), self.dialect(), false)
            .and_then(|_| conn.commit());
        match checked {
            Ok(()) => Ok(conn),
            Err(e) => {
                let _ = conn.close();
                Err(e.into())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Ownership
    // ---------------------------------------------------------------------

    /// Peer-aware claim of the log outside of open processing. Switches the
    /// process to lease ownership. Returns false if another server holds a
    /// live lease.
    pub fn claim_ownership(&self) -> Result<bool> {
        self.context.enable_lease_scheme();
        let _force = self.force_lock.lock();
        let claimed = self.retry().run("claiming the recovery log", self.config.lightweight_retry, |conn| {
            let dialect = self.dialect();
            if self.ensure_table(conn, dialect, OwnershipScheme::Lease)? {
                return Ok(ClaimOutcome::Created);
            }
            Ok(self.ownership.acquire_lease(conn, dialect)?)
        });

        match claimed {
            Ok(outcome) => {
                info!("Server {} claimed {}: {:?}", self.context.local_server_name(), self.table_name, outcome);
                Ok(true)
            }
            Err(LogError::OwnershipRefused { owner }) => {
                info!("Claim of {} refused, {} holds a live lease", self.table_name, owner);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the control row without locking it.
    pub fn inspect_control_row(&self) -> Result<Option<ControlRow>> {
        self.retry().run("reading the control row", self.config.lightweight_retry, |conn| {
            Ok(self.ownership.read_control_row(conn, self.dialect(), false)?)
        })
    }

    fn start_heartbeat(&self) {
        let log = self.self_ref.clone();
        let name = format!("rls-lease-{}", self.table_name.to_ascii_lowercase());
        let spawned = Heartbeat::spawn(name, self.config.heartbeat_interval, move || match log.upgrade() {
            Some(log) => log.renew_lease(),
            None => false,
        });
        match spawned {
            Ok(heartbeat) => {
                let previous = self.heartbeat.lock().replace(heartbeat);
                drop(previous);
            }
            Err(e) => warn!("Unable to start lease heartbeat for {}: {}", self.table_name, e),
        }
    }

    fn stop_heartbeat(&self) {
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
    }

    /// One heartbeat. Returns false once the log no longer needs renewing.
    fn renew_lease(&self) -> bool {
        {
            let state = self.state.lock();
            if state.failure.is_some() || state.closes_required == 0 {
                return false;
            }
        }
        let renewed = self.retry().run("renewing the lease", self.config.lightweight_retry, |conn| {
            Ok(self.ownership.renew_lease(conn, self.dialect())?)
        });
        match renewed {
            Ok(()) => {
                debug!("Renewed lease on {}", self.table_name);
                true
            }
            Err(e @ (LogError::PeerLostLogOwnership { .. }
            | LogError::OwnershipLost { .. }
            | LogError::StorageMissing { .. }
            | LogError::ControlRowMissing(_))) => {
                self.mark_failed(e);
                false
            }
            Err(e) => {
                warn!("Lease renewal for {} failed: {}", self.table_name, e);
                true
            }
        }
    }

    // ---------------------------------------------------------------------
    // Failure handling
    // ---------------------------------------------------------------------

    /// Links another log to this one. When this log fails, `other` is
    /// failed too if `fail_together`, otherwise only reported.
    pub fn associate_log(&self, other: &Arc<SqlRecoveryLog>, fail_together: bool) {
        debug!("Associating {} with {} (fail together: {})", self.table_name, other.table_name, fail_together);
        *self.associated.lock() = Some(AssociatedLog { log: Arc::downgrade(other), fail_together });
    }

    /// Records the first failure of the log and returns it.
    fn mark_failed(&self, cause: LogError) -> Arc<LogError> {
        let quiet = cause.is_quiet();
        let (failure, first) = {
            let mut state = self.state.lock();
            match &state.failure {
                Some(existing) => (existing.cause.clone(), false),
                None => {
                    let cause = Arc::new(cause);
                    state.failure = Some(Failure { cause: cause.clone(), quiet });
                    (cause, true)
                }
            }
        };
        if !first {
            return failure;
        }

        if quiet {
            info!("Recovery log {} of {} is no longer owned by this server: {}",
                  self.table_name, self.identity.server_name, failure);
        } else {
            error!("Recovery log {} of {} has failed: {}", self.table_name, self.identity.server_name, failure);
            if self.config.terminate_on_failure {
                let hook = self.context.failure_hook();
                if self.context.is_local(&self.identity.server_name) {
                    hook.terminate_server(&self.table_name, &*failure);
                } else {
                    hook.leave_group(&self.identity.failure_scope(), &self.table_name);
                }
            }
        }
        self.notify_associated();
        failure
    }

    fn notify_associated(&self) {
        let associated = self
            .associated
            .lock()
            .as_ref()
            .map(|a| (a.log.clone(), a.fail_together));
        let Some((log, fail_together)) = associated else {
            return;
        };
        let Some(log) = log.upgrade() else {
            return;
        };
        if fail_together {
            log.fail_by_association(&self.table_name);
        } else {
            info!("Associated recovery log {} is unaffected ({} units, open: {})",
                  log.table_name, log.unit_count(), log.is_open());
        }
    }

    fn fail_by_association(&self, other: &str) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            error!("Recovery log {} failed together with associated log {}", self.table_name, other);
            state.failure = Some(Failure {
                cause: Arc::new(LogError::Internal(format!("associated recovery log {} failed", other))),
                quiet: false,
            });
        }
    }
}

impl std::fmt::Debug for SqlRecoveryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SqlRecoveryLog")
            .field("table", &self.table_name)
            .field("server_name", &self.identity.server_name)
            .field("service_id", &self.identity.service_id)
            .field("closes_required", &state.closes_required)
            .field("units", &state.units.len())
            .field("failed", &state.failure.is_some())
            .finish()
    }
}
