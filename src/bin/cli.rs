use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use rlsdb::common::ServerContext;
use rlsdb::sql::{Connection, SqlValue};
use rlsdb::{
    FailureScope, LogIdentity, LogType, RecoveryLogConfig, RecoveryLogProperties, SqlRecoveryLog,
    SqliteConnectionProvider,
};

#[derive(Parser)]
#[command(author, version, about = "rlsctl - inspect and exercise SQL recovery logs")]
struct Cli {
    /// SQLite database file holding the log tables
    #[arg(short, long, default_value = "rls.db")]
    db_path: PathBuf,

    /// Server whose log is addressed
    #[arg(short, long, default_value = "server1")]
    server: String,

    /// Server this process runs as (defaults to --server)
    #[arg(long)]
    local_server: Option<String>,

    /// Which of the server's logs
    #[arg(short = 't', long, value_enum, default_value_t = LogKind::Tran)]
    log_type: LogKind,

    #[arg(long, default_value_t = 1)]
    service_id: i16,

    /// JSON file of recovery log properties
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogKind {
    Tran,
    Partner,
    Comp,
}

impl From<LogKind> for LogType {
    fn from(kind: LogKind) -> Self {
        match kind {
            LogKind::Tran => LogType::Transaction,
            LogKind::Partner => LogType::Partner,
            LogKind::Comp => LogType::Compensation,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print every row of the log table, control row included
    Rows,

    /// Open the log and print the recovered units
    Units,

    /// Print the owner recorded in the control row
    Owner,

    /// Claim the log with a lease
    Claim,

    /// Write items to a section and force them
    Write {
        /// Unit to write to; a new unit is created when omitted
        #[arg(long)]
        unit: Option<i64>,

        #[arg(long, default_value_t = 1)]
        section: i64,

        /// Create the section as single-data
        #[arg(long)]
        single: bool,

        /// Items to add, as text
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Remove a unit and force the removal
    Remove { unit: i64 },
}

fn load_config(path: Option<&PathBuf>) -> Result<RecoveryLogConfig> {
    match path {
        Some(path) => {
            let props = RecoveryLogProperties::load(path)
                .with_context(|| format!("Failed to read properties from {}", path.display()))?;
            Ok(props.into())
        }
        None => Ok(RecoveryLogConfig::default()),
    }
}

fn build_log(cli: &Cli) -> Result<Arc<SqlRecoveryLog>> {
    let config = load_config(cli.config.as_ref())?;
    let local = cli.local_server.clone().unwrap_or_else(|| cli.server.clone());
    let identity = LogIdentity::new(&cli.server, cli.log_type.into(), cli.db_path.display().to_string())
        .with_service_id(cli.service_id);
    Ok(SqlRecoveryLog::new(
        identity,
        config,
        Arc::new(SqliteConnectionProvider::new(&cli.db_path)),
        Arc::new(ServerContext::new(local)),
    ))
}

fn print_rows(cli: &Cli, log: &SqlRecoveryLog) -> Result<()> {
    let mut conn = SqliteConnectionProvider::new(&cli.db_path).open()?;
    let rows = conn.query(
        &format!(
            "SELECT SERVER_NAME, SERVICE_ID, RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX, DATA FROM {} \
             ORDER BY SERVER_NAME, SERVICE_ID, RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX",
            log.table_name()
        ),
        &[],
    )?;
    conn.rollback()?;

    println!("{:<16} {:>7} {:>8} {:>10} {:>5}  DATA", "SERVER_NAME", "SERVICE", "RU_ID", "SECTION", "INDEX");
    for row in &rows {
        let cells: Vec<String> = row.values().iter().map(SqlValue::to_string).collect();
        if let [server, service, ru, section, index, data] = cells.as_slice() {
            println!("{:<16} {:>7} {:>8} {:>10} {:>5}  {}", server, service, ru, section, index, data);
        }
    }
    println!("{} rows", rows.len());
    Ok(())
}

fn print_units(log: &SqlRecoveryLog) -> Result<()> {
    for ru_id in log.recoverable_units(None)? {
        let Some(unit) = log.lookup_recoverable_unit(ru_id) else {
            continue;
        };
        println!("Unit {}", ru_id);
        for section_id in unit.section_ids() {
            let Some(section) = unit.lookup_section(section_id) else {
                continue;
            };
            let kind = if section.is_single_data() { "single" } else { "multi" };
            println!("  Section {} ({})", section_id, kind);
            for (i, item) in section.data().iter().enumerate() {
                println!("    [{}] {} ({})", i + 1, hex::encode(item), String::from_utf8_lossy(item));
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let log = build_log(&cli)?;

    match &cli.command {
        Commands::Rows => print_rows(&cli, &log)?,
        Commands::Units => {
            log.open_log().context("Failed to open recovery log")?;
            print_units(&log)?;
            log.close_log()?;
        }
        Commands::Owner => match log.inspect_control_row()? {
            Some(row) => println!("{} is owned by {} (marker {})", log.table_name(), row.owner, row.marker),
            None => println!("{} has no control row", log.table_name()),
        },
        Commands::Claim => {
            if log.claim_ownership()? {
                println!("Claimed {}", log.table_name());
            } else {
                println!("{} is held by another server", log.table_name());
            }
        }
        Commands::Write { unit, section, single, items } => {
            log.open_log().context("Failed to open recovery log")?;
            let handle = match unit {
                Some(id) => match log.lookup_recoverable_unit(*id) {
                    Some(handle) => handle,
                    None => log.create_recoverable_unit_with_id(*id, FailureScope::new(&cli.server))?,
                },
                None => log.create_recoverable_unit(FailureScope::new(&cli.server))?,
            };
            let target = match handle.lookup_section(*section) {
                Some(target) => target,
                None => handle.create_section(*section, *single)?,
            };
            for item in items {
                target.add_data(item.as_bytes())?;
            }
            target.force()?;
            println!("Wrote {} items to unit {} section {}", items.len(), handle.identity(), section);
            log.close_log()?;
        }
        Commands::Remove { unit } => {
            log.open_log().context("Failed to open recovery log")?;
            log.remove_recoverable_unit(*unit)?;
            log.force_sections()?;
            println!("Removed unit {}", unit);
            log.close_log()?;
        }
    }

    Ok(())
}
