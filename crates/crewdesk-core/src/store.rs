//! The data-client seam: per-table reads and primary-key upserts against a target
//! store, plus an in-memory implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::future::Future;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::catalog::{TableName, SERVER_MANAGED_FIELDS};
use crate::Record;

pub const PERMISSION_DENIED_CODE: &str = "42501";
pub const UNDEFINED_COLUMN_CODE: &str = "42703";
pub const SCHEMA_CACHE_COLUMN_CODE: &str = "PGRST204";
pub const NOT_NULL_VIOLATION_CODE: &str = "23502";

const ROW_KEY_SEPARATOR: &str = "|";

/// Set-oriented access to the target store. Upserts are idempotent on the table's
/// conflict key and merge the provided fields over any existing row.
pub trait TableStore {
    /// Every row of `table`, unpaginated.
    fn fetch_all(&self, table: TableName)
        -> impl Future<Output = Result<Vec<crate::Record>, StoreError>>;

    fn upsert(
        &self,
        table: TableName,
        rows: &[crate::Record],
    ) -> impl Future<Output = Result<(), StoreError>>;

    /// Delete rows by their [`row_key`]; returns the number removed.
    fn delete(
        &self,
        table: TableName,
        keys: &[String],
    ) -> impl Future<Output = Result<usize, StoreError>>;
}

/// A backend failure as reported by the data client.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoreError {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StoreFailure {
    PermissionDenied,
    UnknownColumn,
    Other,
}

impl StoreError {
    #[must_use]
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self { code: code.map(str::to_string), message: message.into(), details: None }
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    #[must_use]
    pub fn permission_denied(table: TableName) -> Self {
        Self::new(Some(PERMISSION_DENIED_CODE), format!("permission denied for table {table}"))
    }

    #[must_use]
    pub fn unknown_column(table: TableName, column: &str) -> Self {
        Self::new(
            Some(SCHEMA_CACHE_COLUMN_CODE),
            format!("Could not find the '{column}' column of '{table}' in the schema cache"),
        )
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn failure(&self) -> StoreFailure {
        match self.code.as_deref() {
            Some(PERMISSION_DENIED_CODE) => StoreFailure::PermissionDenied,
            Some(UNDEFINED_COLUMN_CODE | SCHEMA_CACHE_COLUMN_CODE) => StoreFailure::UnknownColumn,
            _ if mentions_missing_column(&self.message) => StoreFailure::UnknownColumn,
            _ => StoreFailure::Other,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(details) = &self.details {
            write!(f, ": {details}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {}

fn mentions_missing_column(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("column")
        && (lower.contains("does not exist")
            || lower.contains("could not find")
            || lower.contains("unknown"))
}

/// The conflict-key value of `row`, or `None` when any key field is absent or null.
#[must_use]
pub fn row_key(table: TableName, row: &Record) -> Option<String> {
    let mut parts = Vec::new();
    for field in table.descriptor().conflict_key {
        match row.get(*field)? {
            Value::String(text) => parts.push(text.clone()),
            Value::Number(number) => parts.push(number.to_string()),
            Value::Bool(flag) => parts.push(flag.to_string()),
            _ => return None,
        }
    }
    Some(parts.join(ROW_KEY_SEPARATOR))
}

/// Resolve the key a row will be stored under, assigning a fresh UUID when a plain
/// `id`-keyed row arrives without one.
///
/// # Errors
/// Returns a not-null violation when a composite conflict key is incomplete.
pub fn prepare_row_key(table: TableName, row: &mut Record) -> Result<String, StoreError> {
    if let Some(key) = row_key(table, row) {
        return Ok(key);
    }

    let conflict_key = table.descriptor().conflict_key;
    if conflict_key == ["id"] && row.get("id").map_or(true, Value::is_null) {
        let id = uuid::Uuid::new_v4().to_string();
        row.insert("id".to_string(), Value::String(id.clone()));
        return Ok(id);
    }

    let missing = conflict_key
        .iter()
        .find(|field| row.get(**field).map_or(true, Value::is_null))
        .copied()
        .unwrap_or("id");
    Err(StoreError::new(
        Some(NOT_NULL_VIOLATION_CODE),
        format!("null value in column \"{missing}\" of relation \"{table}\" violates not-null constraint"),
    ))
}

/// Merge `incoming` over `existing`: provided fields replace, absent fields stay.
pub fn merge_row(existing: &mut Record, incoming: &Record) {
    for (field, value) in incoming {
        existing.insert(field.clone(), value.clone());
    }
}

/// Fill server-managed timestamps on a freshly inserted row.
pub fn stamp_inserted_row(row: &mut Record, now: OffsetDateTime) {
    let stamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    for field in SERVER_MANAGED_FIELDS {
        row.entry((*field).to_string()).or_insert_with(|| Value::String(stamp.clone()));
    }
}

/// Reject rows carrying fields outside a declared column set.
///
/// # Errors
/// Returns an unknown-column error naming the first undeclared field.
pub fn check_columns(
    table: TableName,
    columns: &BTreeSet<String>,
    rows: &[Record],
) -> Result<(), StoreError> {
    for row in rows {
        if let Some(column) = row.keys().find(|field| !columns.contains(*field)) {
            return Err(StoreError::unknown_column(table, column));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpsertCall {
    pub table: TableName,
    pub rows: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<TableName, Vec<Record>>,
    denied_reads: BTreeSet<TableName>,
    denied_writes: BTreeSet<TableName>,
    columns: BTreeMap<TableName, BTreeSet<String>>,
    pending_failures: BTreeMap<TableName, VecDeque<StoreError>>,
    upserts: Vec<UpsertCall>,
}

/// In-process [`TableStore`] with the same upsert semantics as the `SQLite` target,
/// plus fault injection for exercising restore error routing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding exactly `tables`, bypassing write checks and stamping.
    #[must_use]
    pub fn from_tables(tables: BTreeMap<TableName, Vec<Record>>) -> Self {
        let store = Self::new();
        store.state.lock().tables = tables;
        store
    }

    /// Append rows verbatim.
    pub fn seed(&self, table: TableName, rows: impl IntoIterator<Item = Record>) {
        self.state.lock().tables.entry(table).or_default().extend(rows);
    }

    #[must_use]
    pub fn rows(&self, table: TableName) -> Vec<Record> {
        self.state.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn tables(&self) -> BTreeMap<TableName, Vec<Record>> {
        self.state.lock().tables.clone()
    }

    pub fn deny_reads(&self, table: TableName) {
        self.state.lock().denied_reads.insert(table);
    }

    pub fn deny_writes(&self, table: TableName) {
        self.state.lock().denied_writes.insert(table);
    }

    pub fn declare_columns<I, S>(&self, table: TableName, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns.into_iter().map(Into::into).collect();
        self.state.lock().columns.insert(table, columns);
    }

    /// Make the next upsert into `table` fail with `error`.
    pub fn fail_next_upsert(&self, table: TableName, error: StoreError) {
        self.state.lock().pending_failures.entry(table).or_default().push_back(error);
    }

    /// Every upsert call received so far, including failed ones.
    #[must_use]
    pub fn upsert_calls(&self) -> Vec<UpsertCall> {
        self.state.lock().upserts.clone()
    }
}

impl TableStore for MemoryStore {
    async fn fetch_all(&self, table: TableName) -> Result<Vec<Record>, StoreError> {
        let state = self.state.lock();
        if state.denied_reads.contains(&table) {
            return Err(StoreError::permission_denied(table));
        }
        Ok(state.tables.get(&table).cloned().unwrap_or_default())
    }

    async fn upsert(&self, table: TableName, rows: &[Record]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.upserts.push(UpsertCall { table, rows: rows.len() });

        if let Some(error) = state.pending_failures.get_mut(&table).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if state.denied_writes.contains(&table) {
            return Err(StoreError::permission_denied(table));
        }
        if let Some(columns) = state.columns.get(&table) {
            check_columns(table, columns, rows)?;
        }

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.clone();
            let key = prepare_row_key(table, &mut row)?;
            prepared.push((key, row));
        }

        let now = OffsetDateTime::now_utc();
        let existing = state.tables.entry(table).or_default();
        let mut positions: HashMap<String, usize> = existing
            .iter()
            .enumerate()
            .filter_map(|(index, row)| row_key(table, row).map(|key| (key, index)))
            .collect();
        for (key, mut row) in prepared {
            if let Some(&index) = positions.get(&key) {
                merge_row(&mut existing[index], &row);
            } else {
                stamp_inserted_row(&mut row, now);
                positions.insert(key, existing.len());
                existing.push(row);
            }
        }
        Ok(())
    }

    async fn delete(&self, table: TableName, keys: &[String]) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        if state.denied_writes.contains(&table) {
            return Err(StoreError::permission_denied(table));
        }
        let Some(rows) = state.tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| row_key(table, row).map_or(true, |key| !keys.contains(&key)));
        Ok(before - rows.len())
    }
}
