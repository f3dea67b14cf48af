use crate::sql::error::SqlError;

/// Database flavours the recovery log knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Db2,
    Oracle,
    PostgreSql,
    SqlServer,
    Sqlite,
    Generic,
}

/// Per-dialect table of SQL fragments and error codes.
struct DialectSpec {
    name: &'static str,
    id_type: &'static str,
    small_type: &'static str,
    blob_type: &'static str,
    /// Placed after the table name in a locking select
    table_hint: &'static str,
    /// Placed after the predicate in a locking select
    lock_clause: &'static str,
    missing_table_codes: &'static [i32],
    missing_table_states: &'static [&'static str],
    missing_table_message: Option<&'static str>,
    /// Vendor codes that indicate failover or a lost connection
    transient_codes: &'static [i32],
}

const DB2: DialectSpec = DialectSpec {
    name: "DB2",
    id_type: "BIGINT",
    small_type: "SMALLINT",
    blob_type: "BLOB",
    table_hint: "",
    lock_clause: " FOR UPDATE",
    missing_table_codes: &[-204],
    missing_table_states: &["42704"],
    missing_table_message: None,
    transient_codes: &[
        -1015, -1034, -1035, -6036, -30081, -30108, -1224, -1229, -518, -514, -30080, -924, -923, -906,
        -4498, -4499, -1776,
    ],
};

const ORACLE: DialectSpec = DialectSpec {
    name: "Oracle",
    id_type: "NUMBER(19)",
    small_type: "NUMBER(5)",
    blob_type: "BLOB",
    table_hint: "",
    lock_clause: " FOR UPDATE",
    missing_table_codes: &[942],
    missing_table_states: &[],
    missing_table_message: None,
    transient_codes: &[
        20, 28, 1012, 1014, 1033, 1034, 1035, 1089, 1090, 1092, 3113, 3114, 12505, 12514, 12541, 12560,
        12571, 17002, 17008, 17009, 17410, 17401, 17430, 25408, 24794, 17447, 30006,
    ],
};

const POSTGRESQL: DialectSpec = DialectSpec {
    name: "PostgreSQL",
    id_type: "BIGINT",
    small_type: "SMALLINT",
    blob_type: "BYTEA",
    table_hint: "",
    lock_clause: " FOR UPDATE",
    missing_table_codes: &[],
    missing_table_states: &["42P01"],
    missing_table_message: None,
    transient_codes: &[],
};

const SQL_SERVER: DialectSpec = DialectSpec {
    name: "Microsoft SQL Server",
    id_type: "BIGINT",
    small_type: "SMALLINT",
    blob_type: "VARBINARY(MAX)",
    table_hint: " WITH (ROWLOCK, UPDLOCK, HOLDLOCK)",
    lock_clause: "",
    missing_table_codes: &[208],
    missing_table_states: &["S0002", "42S02"],
    missing_table_message: None,
    transient_codes: &[],
};

// SQLite has no row locks; the connection takes the database write lock
// when its transaction begins.
const SQLITE: DialectSpec = DialectSpec {
    name: "SQLite",
    id_type: "INTEGER",
    small_type: "INTEGER",
    blob_type: "BLOB",
    table_hint: "",
    lock_clause: "",
    missing_table_codes: &[],
    missing_table_states: &[],
    missing_table_message: Some("no such table"),
    transient_codes: &[],
};

const GENERIC: DialectSpec = DialectSpec {
    name: "Generic",
    id_type: "BIGINT",
    small_type: "SMALLINT",
    blob_type: "BLOB",
    table_hint: "",
    lock_clause: " FOR UPDATE",
    missing_table_codes: &[],
    missing_table_states: &["42X05", "42S02"],
    missing_table_message: None,
    transient_codes: &[],
};

impl Dialect {
    fn spec(self) -> &'static DialectSpec {
        match self {
            Dialect::Db2 => &DB2,
            Dialect::Oracle => &ORACLE,
            Dialect::PostgreSql => &POSTGRESQL,
            Dialect::SqlServer => &SQL_SERVER,
            Dialect::Sqlite => &SQLITE,
            Dialect::Generic => &GENERIC,
        }
    }

    pub fn from_product_name(product: &str) -> Self {
        let product = product.to_ascii_lowercase();
        if product.contains("oracle") {
            Dialect::Oracle
        } else if product.contains("postgres") {
            Dialect::PostgreSql
        } else if product.contains("db2") {
            Dialect::Db2
        } else if product.contains("microsoft sql") || product.contains("sql server") {
            Dialect::SqlServer
        } else if product.contains("sqlite") {
            Dialect::Sqlite
        } else {
            Dialect::Generic
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn create_table_ddl(self, table: &str) -> String {
        let spec = self.spec();
        format!(
            "CREATE TABLE {} (SERVER_NAME VARCHAR(128), SERVICE_ID {}, RU_ID {}, RUSECTION_ID {}, \
             RUSECTION_DATA_INDEX {}, DATA {})",
            table, spec.small_type, spec.id_type, spec.id_type, spec.small_type, spec.blob_type
        )
    }

    pub fn create_index_ddl(self, index: &str, table: &str) -> String {
        format!("CREATE INDEX {} ON {} (RU_ID ASC, SERVICE_ID ASC, SERVER_NAME ASC)", index, table)
    }

    /// Table of server leases shared by every server of a recovery group.
    pub fn create_lease_table_ddl(self, table: &str) -> String {
        format!(
            "CREATE TABLE {} (SERVER_IDENTITY VARCHAR(128) NOT NULL UNIQUE, RECOVERY_GROUP VARCHAR(128), \
             LEASE_OWNER VARCHAR(128), LEASE_TIME {})",
            table,
            self.spec().id_type
        )
    }

    pub fn create_lease_index_ddl(self, index: &str, table: &str) -> String {
        format!("CREATE INDEX {} ON {} (SERVER_IDENTITY ASC)", index, table)
    }

    /// A select that locks the matching rows until the transaction ends.
    pub fn select_for_update(self, columns: &str, table: &str, predicate: &str) -> String {
        let spec = self.spec();
        format!("SELECT {} FROM {}{} WHERE {}{}", columns, table, spec.table_hint, predicate, spec.lock_clause)
    }

    /// Whether `err`, or any error chained to it, says the table does not exist.
    pub fn is_table_missing(self, err: &SqlError) -> bool {
        let spec = self.spec();
        err.walk().into_iter().any(|e| {
            (e.code != 0 && spec.missing_table_codes.contains(&e.code))
                || spec.missing_table_states.contains(&e.sql_state.as_str())
                || spec
                    .missing_table_message
                    .map(|m| e.message.to_ascii_lowercase().contains(m))
                    .unwrap_or(false)
        })
    }

    pub fn transient_codes(self) -> &'static [i32] {
        self.spec().transient_codes
    }
}
