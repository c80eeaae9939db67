//! `SQLite`-backed restore target.
//!
//! Every table lives in one `table_rows` relation as JSON documents keyed by the
//! table's conflict key, so upserts behave like a PostgREST merge-duplicates write:
//! provided fields replace, omitted fields survive. Per-table read/write grants and
//! declared column sets let an operator reproduce the permission and schema
//! mismatches a hosted target would report.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use crewdesk_core::store::{check_columns, merge_row, prepare_row_key, stamp_inserted_row};
use crewdesk_core::{Record, StoreError, TableName, TableStore};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS table_rows (
  table_name TEXT NOT NULL,
  row_key TEXT NOT NULL,
  row_json TEXT NOT NULL,
  PRIMARY KEY (table_name, row_key)
);

CREATE TABLE IF NOT EXISTS table_policies (
  table_name TEXT PRIMARY KEY,
  readable INTEGER NOT NULL DEFAULT 1 CHECK (readable IN (0, 1)),
  writable INTEGER NOT NULL DEFAULT 1 CHECK (writable IN (0, 1))
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS table_columns (
  table_name TEXT NOT NULL,
  column_name TEXT NOT NULL,
  PRIMARY KEY (table_name, column_name)
);

CREATE INDEX IF NOT EXISTS idx_table_columns_table ON table_columns(table_name);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

impl Access {
    fn column(self) -> &'static str {
        match self {
            Self::Read => "readable",
            Self::Write => "writable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TablePolicy {
    pub table: TableName,
    pub readable: bool,
    pub writable: bool,
    /// Empty when any column is accepted.
    pub columns: Vec<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed target store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Grant or revoke read or write access to one table.
    ///
    /// # Errors
    /// Returns an error when the policy row cannot be written.
    pub fn set_access(&self, table: TableName, access: Access, allowed: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO table_policies(table_name) VALUES (?1) ON CONFLICT(table_name) DO NOTHING",
                params![table.as_str()],
            )
            .with_context(|| format!("failed to create policy for {table}"))?;
        self.conn
            .execute(
                &format!("UPDATE table_policies SET {} = ?2 WHERE table_name = ?1", access.column()),
                params![table.as_str(), allowed],
            )
            .with_context(|| format!("failed to update {} policy for {table}", access.column()))?;
        Ok(())
    }

    /// Restrict the columns `table` accepts. An empty list accepts any column.
    ///
    /// # Errors
    /// Returns an error when the column set cannot be replaced.
    pub fn set_columns(&mut self, table: TableName, columns: &[String]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM table_columns WHERE table_name = ?1", params![table.as_str()])
            .with_context(|| format!("failed to clear declared columns for {table}"))?;
        for column in columns {
            tx.execute(
                "INSERT OR IGNORE INTO table_columns(table_name, column_name) VALUES (?1, ?2)",
                params![table.as_str(), column],
            )
            .with_context(|| format!("failed to declare column {column} for {table}"))?;
        }
        tx.commit().context("failed to commit declared columns")?;
        Ok(())
    }

    /// Access and column policy of one table.
    ///
    /// # Errors
    /// Returns an error when policy metadata cannot be read.
    pub fn policy(&self, table: TableName) -> Result<TablePolicy> {
        let grants = self
            .conn
            .query_row(
                "SELECT readable, writable FROM table_policies WHERE table_name = ?1",
                params![table.as_str()],
                |row| Ok((row.get::<_, bool>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read policy for {table}"))?;
        let (readable, writable) = grants.unwrap_or((true, true));
        let columns = self.declared_columns(table)?.into_iter().collect();
        Ok(TablePolicy { table, readable, writable, columns })
    }

    /// Policies of every table that differs from the default (fully open).
    ///
    /// # Errors
    /// Returns an error when policy metadata cannot be read.
    pub fn restricted_tables(&self) -> Result<Vec<TablePolicy>> {
        let mut restricted = Vec::new();
        for table in TableName::ALL {
            let policy = self.policy(table)?;
            if !policy.readable || !policy.writable || !policy.columns.is_empty() {
                restricted.push(policy);
            }
        }
        Ok(restricted)
    }

    /// Row count of every known table.
    ///
    /// # Errors
    /// Returns an error when the counts cannot be queried.
    pub fn row_counts(&self) -> Result<BTreeMap<TableName, usize>> {
        let mut counts: BTreeMap<TableName, usize> =
            TableName::ALL.into_iter().map(|table| (table, 0)).collect();
        let mut stmt = self
            .conn
            .prepare("SELECT table_name, COUNT(*) FROM table_rows GROUP BY table_name")
            .context("failed to prepare row count query")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (name, count) = row?;
            if let Some(table) = TableName::parse(&name) {
                counts.insert(table, usize::try_from(count).context("row count out of range")?);
            }
        }
        Ok(counts)
    }

    /// Every row of every known table, ignoring read grants.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_tables(&self) -> Result<BTreeMap<TableName, Vec<Record>>> {
        let mut tables = BTreeMap::new();
        for table in TableName::ALL {
            let rows = self.read_rows(table)?;
            if !rows.is_empty() {
                tables.insert(table, rows);
            }
        }
        Ok(tables)
    }

    /// Copy the whole database, grants included, to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for safety copy {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite safety copy at {}", out_file.display()))
    }

    /// Replace this database with a copy taken by [`Self::backup_database`], then migrate.
    ///
    /// # Errors
    /// Returns an error when the copy is missing, the restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("safety copy does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to revert from safety copy {}", in_file.display()))?;

        self.migrate()
    }

    fn read_rows(&self, table: TableName) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare("SELECT row_json FROM table_rows WHERE table_name = ?1 ORDER BY rowid ASC")
            .context("failed to prepare row query")?;
        let rows = stmt.query_map(params![table.as_str()], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let json = row?;
            let record: Record = serde_json::from_str(&json)
                .with_context(|| format!("failed to decode stored {table} row"))?;
            records.push(record);
        }
        Ok(records)
    }

    fn allowed(&self, table: TableName, access: Access) -> Result<bool> {
        let policy = self.policy(table)?;
        Ok(match access {
            Access::Read => policy.readable,
            Access::Write => policy.writable,
        })
    }

    fn declared_columns(&self, table: TableName) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT column_name FROM table_columns WHERE table_name = ?1 ORDER BY column_name")
            .context("failed to prepare declared column query")?;
        let rows = stmt.query_map(params![table.as_str()], |row| row.get::<_, String>(0))?;
        let mut columns = BTreeSet::new();
        for row in rows {
            columns.insert(row?);
        }
        Ok(columns)
    }

    fn write_rows(&self, table: TableName, rows: &[Record]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(sqlite_error)?;
        let now = OffsetDateTime::now_utc();

        for row in rows {
            let mut row = row.clone();
            let key = prepare_row_key(table, &mut row)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT row_json FROM table_rows WHERE table_name = ?1 AND row_key = ?2",
                    params![table.as_str(), key],
                    |stored| stored.get(0),
                )
                .optional()
                .map_err(sqlite_error)?;

            let row = match existing {
                Some(json) => {
                    let mut current: Record = serde_json::from_str(&json).map_err(|err| {
                        StoreError::other(format!("stored {table} row {key} is corrupt: {err}"))
                    })?;
                    merge_row(&mut current, &row);
                    current
                }
                None => {
                    stamp_inserted_row(&mut row, now);
                    row
                }
            };
            let json = serde_json::to_string(&row)
                .map_err(|err| StoreError::other(format!("failed to encode {table} row: {err}")))?;

            tx.execute(
                "INSERT INTO table_rows(table_name, row_key, row_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(table_name, row_key) DO UPDATE SET row_json = excluded.row_json",
                params![table.as_str(), key, json],
            )
            .map_err(sqlite_error)?;
        }

        tx.commit().map_err(sqlite_error)?;
        tracing::debug!(%table, rows = rows.len(), "upserted rows");
        Ok(())
    }
}

impl TableStore for SqliteStore {
    async fn fetch_all(&self, table: TableName) -> Result<Vec<Record>, StoreError> {
        if !self.allowed(table, Access::Read).map_err(backend_error)? {
            return Err(StoreError::permission_denied(table));
        }
        self.read_rows(table).map_err(backend_error)
    }

    async fn upsert(&self, table: TableName, rows: &[Record]) -> Result<(), StoreError> {
        if !self.allowed(table, Access::Write).map_err(backend_error)? {
            return Err(StoreError::permission_denied(table));
        }
        let columns = self.declared_columns(table).map_err(backend_error)?;
        if !columns.is_empty() {
            check_columns(table, &columns, rows)?;
        }
        self.write_rows(table, rows)
    }

    async fn delete(&self, table: TableName, keys: &[String]) -> Result<usize, StoreError> {
        if !self.allowed(table, Access::Write).map_err(backend_error)? {
            return Err(StoreError::permission_denied(table));
        }
        let tx = self.conn.unchecked_transaction().map_err(sqlite_error)?;
        let mut removed = 0;
        for key in keys {
            removed += tx
                .execute(
                    "DELETE FROM table_rows WHERE table_name = ?1 AND row_key = ?2",
                    params![table.as_str(), key],
                )
                .map_err(sqlite_error)?;
        }
        tx.commit().map_err(sqlite_error)?;
        Ok(removed)
    }
}

fn sqlite_error(err: rusqlite::Error) -> StoreError {
    StoreError::other(format!("sqlite error: {err}"))
}

fn backend_error(err: anyhow::Error) -> StoreError {
    StoreError::other(format!("{err:#}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
