use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crewdesk_core::{
    backup_file_name, export_all, restore, Actor, CollisionPolicy, DecodedSnapshot, Envelope,
    MemoryStore, RelabelScan, RestoreContext, RestoreOptions, TableName, DEFAULT_CHUNK_SIZE,
    PRODUCT_NAME,
};
use crewdesk_store_sqlite::{Access, SqliteStore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "CREWDESK_LOG";
const CONFIRMATION_WORD: &str = "yes";

#[derive(Debug, Parser)]
#[command(name = "crewdesk")]
#[command(about = "Crewdesk snapshot export and restore")]
struct Cli {
    #[arg(long, env = "CREWDESK_DB", default_value = "./crewdesk.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a full snapshot of every table.
    Export(ExportArgs),
    /// Validate a snapshot file and summarize its contents.
    Inspect(InspectArgs),
    /// Restore a snapshot into the database.
    Restore(Box<RestoreArgs>),
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Snapshot file, or a directory to place a date-stamped file in.
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = PRODUCT_NAME)]
    product: String,
    #[arg(long, env = "CREWDESK_ACTOR_EMAIL", default_value = "crewdesk-cli")]
    produced_by: String,
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, env = "CREWDESK_ACTOR_EMAIL")]
    actor_email: String,
    #[arg(long, env = "CREWDESK_ACTOR_AUTH_ID")]
    actor_auth_id: Option<String>,
    #[arg(long)]
    actor_label: Option<String>,
    /// Skip the interactive confirmation.
    #[arg(long, default_value_t = false)]
    yes: bool,
    /// Restore into an in-memory copy of the database instead.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Copy the database here before the first write; `db revert` undoes a partial restore.
    #[arg(long, conflicts_with = "dry_run")]
    safety_copy: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[arg(long, value_enum, default_value_t = RelabelScanArg::Declared)]
    relabel_scan: RelabelScanArg,
    #[arg(long, value_enum, default_value_t = CollisionArg::LastWins)]
    on_collision: CollisionArg,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Allow reads or writes on a table.
    Grant(AccessArgs),
    /// Deny reads or writes on a table.
    Revoke(AccessArgs),
    /// Restrict the columns a table accepts; no columns lifts the restriction.
    Columns(ColumnsArgs),
    Counts,
    Policies,
    /// Copy the whole database file.
    Backup(BackupArgs),
    /// Replace the database with a copy taken by `db backup` or `restore --safety-copy`.
    Revert(RevertArgs),
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct RevertArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AccessArgs {
    #[arg(long, value_parser = parse_table)]
    table: TableName,
    #[arg(long, value_enum, default_value_t = AccessArg::Write)]
    access: AccessArg,
}

#[derive(Debug, Args)]
struct ColumnsArgs {
    #[arg(long, value_parser = parse_table)]
    table: TableName,
    #[arg(long = "column")]
    columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RelabelScanArg {
    Declared,
    Everywhere,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CollisionArg {
    LastWins,
    Reject,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AccessArg {
    Read,
    Write,
}

impl From<RelabelScanArg> for RelabelScan {
    fn from(value: RelabelScanArg) -> Self {
        match value {
            RelabelScanArg::Declared => Self::Declared,
            RelabelScanArg::Everywhere => Self::Everywhere,
        }
    }
}

impl From<CollisionArg> for CollisionPolicy {
    fn from(value: CollisionArg) -> Self {
        match value {
            CollisionArg::LastWins => Self::LastWins,
            CollisionArg::Reject => Self::Reject,
        }
    }
}

impl From<AccessArg> for Access {
    fn from(value: AccessArg) -> Self {
        match value {
            AccessArg::Read => Self::Read,
            AccessArg::Write => Self::Write,
        }
    }
}

fn parse_table(value: &str) -> std::result::Result<TableName, String> {
    TableName::parse(value).ok_or_else(|| format!("unknown table `{value}`"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to install log subscriber: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Export(args) => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_export(&args, &mut store).await
        }
        Command::Inspect(args) => run_inspect(&args),
        Command::Restore(args) => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_restore(&args, &cli.db, &mut store).await
        }
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(&command, &mut store)
        }
    }
}

async fn run_export(args: &ExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let envelope = export_all(&*store, &args.produced_by).await.context("export failed")?;
    let text = envelope.to_json_pretty()?;

    let path = if args.out.is_dir() {
        args.out.join(backup_file_name(&args.product, envelope.created_at.date()))
    } else {
        args.out.clone()
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create export directory {}", parent.display()))?;
    }
    fs::write(&path, &text)
        .with_context(|| format!("failed to write snapshot file {}", path.display()))?;

    emit_json(serde_json::json!({
        "path": path,
        "sha256": sha256_hex(text.as_bytes()),
        "created_at": envelope.created_at.format(&Rfc3339)?,
        "format_version": envelope.format_version,
        "produced_by": envelope.produced_by,
        "total_rows": envelope.total_rows(),
        "row_counts": envelope.row_counts()
    }))
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let (decoded, digest) = read_snapshot(&args.input)?;
    let envelope = &decoded.envelope;
    emit_json(serde_json::json!({
        "path": args.input,
        "sha256": digest,
        "created_at": envelope.created_at.format(&Rfc3339)?,
        "format_version": envelope.format_version,
        "produced_by": envelope.produced_by,
        "total_rows": envelope.total_rows(),
        "row_counts": envelope.row_counts(),
        "ignored_tables": decoded.ignored_tables,
        "legacy_tables": decoded.legacy_tables
    }))
}

async fn run_restore(args: &RestoreArgs, db: &Path, store: &mut SqliteStore) -> Result<()> {
    let (decoded, digest) = read_snapshot(&args.input)?;
    for name in &decoded.ignored_tables {
        tracing::warn!(table = %name, "ignoring unknown table in snapshot");
    }
    store.migrate()?;

    if !args.yes && !args.dry_run && !confirm_restore(args, db)? {
        return emit_json(serde_json::json!({
            "restored_from": args.input,
            "cancelled": true
        }));
    }

    let actor = Actor::new(args.actor_email.clone(), args.actor_auth_id.clone())
        .with_label(args.actor_label.clone().unwrap_or_else(|| args.actor_email.clone()));
    let options = RestoreOptions {
        chunk_size: args.chunk_size,
        relabel_scan: args.relabel_scan.into(),
        collision_policy: args.on_collision.into(),
    };
    let mut context = RestoreContext::new();

    if let Some(copy) = &args.safety_copy {
        store.backup_database(copy)?;
        tracing::info!(path = %copy.display(), "wrote safety copy");
    }

    let result = if args.dry_run {
        let preview = preview_store(store)?;
        restore(&preview, decoded.envelope, &actor, &options, &mut context).await
    } else {
        restore(&*store, decoded.envelope, &actor, &options, &mut context).await
    };

    match result {
        Ok(report) => emit_json(serde_json::json!({
            "restored_from": args.input,
            "sha256": digest,
            "dry_run": args.dry_run,
            "safety_copy": args.safety_copy,
            "actor": actor.label,
            "progress": context.progress(),
            "rows_written": report.rows_written(),
            "report": report,
            "ignored_tables": decoded.ignored_tables,
            "legacy_tables": decoded.legacy_tables,
            "log": context.lines()
        })),
        Err(err) => {
            for line in context.lines() {
                eprintln!("{line}");
            }
            if let Some(copy) = &args.safety_copy {
                eprintln!("Database state before this restore is saved at {}", copy.display());
            }
            Err(anyhow!("restore failed: {err}"))
        }
    }
}

/// An in-memory copy of the database carrying the same grants and column sets.
fn preview_store(store: &SqliteStore) -> Result<MemoryStore> {
    let preview = MemoryStore::from_tables(store.load_tables()?);
    for policy in store.restricted_tables()? {
        if !policy.readable {
            preview.deny_reads(policy.table);
        }
        if !policy.writable {
            preview.deny_writes(policy.table);
        }
        if !policy.columns.is_empty() {
            preview.declare_columns(policy.table, policy.columns);
        }
    }
    Ok(preview)
}

fn confirm_restore(args: &RestoreArgs, db: &Path) -> Result<bool> {
    let mut stderr = io::stderr();
    write!(
        stderr,
        "Restoring {} into {} overwrites every row with a matching identifier and \
         disconnects the login of every staff member except {}.\nType '{CONFIRMATION_WORD}' to continue: ",
        args.input.display(),
        db.display(),
        args.actor_email
    )?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).context("failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case(CONFIRMATION_WORD))
}

fn read_snapshot(path: &Path) -> Result<(DecodedSnapshot, String)> {
    if path.extension() != Some(OsStr::new("json")) {
        return Err(anyhow!("snapshot files must have a .json extension: {}", path.display()));
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
    let decoded = Envelope::decode(&text)
        .with_context(|| format!("invalid snapshot file {}", path.display()))?;
    Ok((decoded, sha256_hex(text.as_bytes())))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::Grant(args) => run_db_access(args, store, true),
        DbCommand::Revoke(args) => run_db_access(args, store, false),
        DbCommand::Columns(args) => run_db_columns(args, store),
        DbCommand::Counts => run_db_counts(store),
        DbCommand::Policies => run_db_policies(store),
        DbCommand::Backup(args) => run_db_backup(args, store),
        DbCommand::Revert(args) => run_db_revert(args, store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_access(args: &AccessArgs, store: &mut SqliteStore, allowed: bool) -> Result<()> {
    store.migrate()?;
    store.set_access(args.table, args.access.into(), allowed)?;
    let policy = store.policy(args.table)?;
    emit_json(serde_json::to_value(&policy).context("failed to serialize table policy")?)
}

fn run_db_columns(args: &ColumnsArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.set_columns(args.table, &args.columns)?;
    let policy = store.policy(args.table)?;
    emit_json(serde_json::to_value(&policy).context("failed to serialize table policy")?)
}

fn run_db_counts(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let counts = store.row_counts()?;
    emit_json(serde_json::json!({
        "total_rows": counts.values().sum::<usize>(),
        "row_counts": counts
    }))
}

fn run_db_policies(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    emit_json(serde_json::json!({ "restricted": store.restricted_tables()? }))
}

fn run_db_backup(args: &BackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "row_counts": store.row_counts()?
    }))
}

fn run_db_revert(args: &RevertArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let counts = store.row_counts()?;
    emit_json(serde_json::json!({
        "reverted_from": args.input,
        "total_rows": counts.values().sum::<usize>(),
        "row_counts": counts
    }))
}
