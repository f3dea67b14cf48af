use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Recoverable unit identifier (`RU_ID` column)
pub type RuId = i64;

/// Section identifier, unique within a recoverable unit (`RUSECTION_ID` column)
pub type SectionId = i64;

/// Service identifier (`SERVICE_ID` column)
pub type ServiceId = i16;

/// Data item index within a section (`RUSECTION_DATA_INDEX` column)
pub type DataIndex = i16;

/// `RU_ID` of the per-table control row that records ownership
pub const CONTROL_ROW_ID: RuId = -1;

/// Index used by single-data sections, whose one item is overwritten in place
pub const SINGLE_DATA_INDEX: DataIndex = 0;

/// Number of bytes rendered when data items are logged
const MAX_DISPLAYED_BYTES: usize = 32;

/// The kind of log a table holds. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    Transaction,
    Partner,
    Compensation,
}

impl LogType {
    /// Fragment used in the table name, between the prefix and the suffix.
    pub fn table_fragment(self) -> &'static str {
        match self {
            LogType::Transaction => "TRAN_LOG",
            LogType::Partner => "PARTNER_LOG",
            LogType::Compensation => "COMP_LOG",
        }
    }

    /// Numeric log identifier used by recovery agents (1, 2 and 3).
    pub fn identifier(self) -> i32 {
        match self {
            LogType::Transaction => 1,
            LogType::Partner => 2,
            LogType::Compensation => 3,
        }
    }

    pub fn from_identifier(identifier: i32) -> Option<Self> {
        match identifier {
            1 => Some(LogType::Transaction),
            2 => Some(LogType::Partner),
            3 => Some(LogType::Compensation),
            _ => None,
        }
    }

    /// Short log name used in messages ("tranlog", "partnerlog", "complog").
    pub fn log_name(self) -> &'static str {
        match self {
            LogType::Transaction => "tranlog",
            LogType::Partner => "partnerlog",
            LogType::Compensation => "complog",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.log_name())
    }
}

/// Logical owner of recoverable units, identified by server name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureScope {
    server_name: String,
}

impl FailureScope {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self { server_name: server_name.into() }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Server names compare case-insensitively.
    pub fn is_same_server(&self, server_name: &str) -> bool {
        self.server_name.eq_ignore_ascii_case(server_name)
    }
}

impl fmt::Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FailureScope({})", self.server_name)
    }
}

/// Identifies one recovery log: whose log it is, for which service and of
/// which kind, and which logical datasource stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIdentity {
    /// Home server of the log; written to `SERVER_NAME` of every data row
    pub server_name: String,
    /// Name of the recovery agent using the log
    pub client_name: String,
    /// Version of the recovery agent
    pub client_version: i32,
    pub service_id: ServiceId,
    pub log_type: LogType,
    /// Logical datasource name handed to the connection provider
    pub datasource: String,
}

impl LogIdentity {
    pub fn new(server_name: impl Into<String>, log_type: LogType, datasource: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            client_name: "transaction".to_string(),
            client_version: 1,
            service_id: 1,
            log_type,
            datasource: datasource.into(),
        }
    }

    pub fn with_service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = service_id;
        self
    }

    pub fn with_client(mut self, client_name: impl Into<String>, client_version: i32) -> Self {
        self.client_name = client_name.into();
        self.client_version = client_version;
        self
    }

    pub fn failure_scope(&self) -> FailureScope {
        FailureScope::new(self.server_name.clone())
    }
}

/// Milliseconds since the Unix epoch, as stored in a lease timestamp.
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Hex rendering of a data item for debug output, truncated for long items.
pub fn hex_preview(data: &[u8]) -> String {
    if data.len() > MAX_DISPLAYED_BYTES {
        format!("{}... ({} bytes)", hex::encode(&data[..MAX_DISPLAYED_BYTES]), data.len())
    } else {
        hex::encode(data)
    }
}
