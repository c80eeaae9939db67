//! Restore orchestration: reconcile, then walk the plan phase by phase, sanitizing
//! and upserting each table in fixed-size batches.
//!
//! Batches already committed stay committed when a later one fails; there is no
//! rollback.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::TableName;
use crate::context::RestoreContext;
use crate::envelope::{Envelope, SnapshotError};
use crate::plan::{Actor, Phase};
use crate::reconcile::{reconcile, CollisionPolicy, ReconcileReport, RelabelScan};
use crate::sanitize::sanitize;
use crate::store::{StoreError, StoreFailure, TableStore};
use crate::Record;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RestoreError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("invalid restore options: {0}")]
    InvalidOptions(String),
    #[error("failed to look up live {table}: {source}")]
    Lookup { table: TableName, source: StoreError },
    #[error("ambiguous match in {table}: backup ids {} all resolve to live id {live_id}", .backup_ids.join(", "))]
    AmbiguousMatch { table: TableName, live_id: String, backup_ids: Vec<String> },
    #[error("permission denied writing {table}; restore halted")]
    PermissionDenied { table: TableName, source: StoreError },
    #[error("schema mismatch in {table}: {detail}")]
    SchemaMismatch { table: TableName, detail: String },
    #[error("failed to restore {table}: {source}")]
    TableFailed { table: TableName, source: StoreError },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreOptions {
    pub chunk_size: usize,
    pub relabel_scan: RelabelScan,
    pub collision_policy: CollisionPolicy,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            relabel_scan: RelabelScan::default(),
            collision_policy: CollisionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Restored { rows: usize, batches: usize },
    /// `committed_rows` were written by earlier batches before the table was given up.
    Skipped { reason: String, committed_rows: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableRestore {
    pub phase: Phase,
    pub table: TableName,
    #[serde(flatten)]
    pub outcome: TableOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreReport {
    pub produced_by: String,
    pub format_version: String,
    pub reconciliation: ReconcileReport,
    pub tables: Vec<TableRestore>,
    pub stripped_ids: BTreeMap<TableName, usize>,
    pub dropped_rows: BTreeMap<TableName, usize>,
}

impl RestoreReport {
    #[must_use]
    pub fn rows_written(&self) -> usize {
        self.tables
            .iter()
            .map(|entry| match entry.outcome {
                TableOutcome::Restored { rows, .. } => rows,
                TableOutcome::Skipped { committed_rows, .. } => committed_rows,
            })
            .sum()
    }

    #[must_use]
    pub fn skipped_tables(&self) -> Vec<TableName> {
        self.tables
            .iter()
            .filter(|entry| matches!(entry.outcome, TableOutcome::Skipped { .. }))
            .map(|entry| entry.table)
            .collect()
    }
}

/// Restore `envelope` into `store` on behalf of `actor`.
///
/// `context` keeps the log and progress even when the restore fails part way.
///
/// # Errors
/// Returns the first fatal [`RestoreError`]; remaining phases are not run.
pub async fn restore<S: TableStore>(
    store: &S,
    envelope: Envelope,
    actor: &Actor,
    options: &RestoreOptions,
    context: &mut RestoreContext,
) -> Result<RestoreReport, RestoreError> {
    match run(store, envelope, actor, options, context).await {
        Ok(report) => Ok(report),
        Err(error) => {
            context.warn(format!("Restore aborted: {error}"));
            Err(error)
        }
    }
}

async fn run<S: TableStore>(
    store: &S,
    mut envelope: Envelope,
    actor: &Actor,
    options: &RestoreOptions,
    context: &mut RestoreContext,
) -> Result<RestoreReport, RestoreError> {
    if options.chunk_size == 0 {
        return Err(RestoreError::InvalidOptions("chunk size must be at least 1".to_string()));
    }

    context.info(format!(
        "Restoring snapshot from {} (format {}, created {}, {} rows)",
        envelope.produced_by,
        envelope.format_version,
        envelope.created_at.date(),
        envelope.total_rows()
    ));

    let reconciliation = reconcile(
        &mut envelope,
        store,
        options.relabel_scan,
        options.collision_policy,
        context,
    )
    .await?;
    context.checkpoint(10);

    let mut report = RestoreReport {
        produced_by: envelope.produced_by.clone(),
        format_version: envelope.format_version.clone(),
        reconciliation,
        ..RestoreReport::default()
    };
    let mut retained: BTreeMap<TableName, Vec<Record>> = BTreeMap::new();

    for phase in Phase::ORDER {
        context.info(format!("Restoring {}", phase.label()));
        for &table in phase.tables() {
            let rows = match retained.remove(&table) {
                Some(rows) => rows,
                None => {
                    let raw = envelope.tables.remove(&table).unwrap_or_default();
                    sanitized_rows(table, raw, &mut report, context)
                }
            };
            if phase.revisited_later(table) {
                retained.insert(table, rows.clone());
            }

            let rows = phase.prepare(rows, actor);
            let outcome = upsert_table(store, table, &rows, options.chunk_size, context).await?;
            report.tables.push(TableRestore { phase, table, outcome });
        }
        context.checkpoint(phase.checkpoint());
    }

    context.checkpoint(100);
    context.info(format!(
        "Restore complete: {} rows written, {} table(s) skipped",
        report.rows_written(),
        report.skipped_tables().len()
    ));
    Ok(report)
}

fn sanitized_rows(
    table: TableName,
    rows: Vec<Record>,
    report: &mut RestoreReport,
    context: &mut RestoreContext,
) -> Vec<Record> {
    let outcome = sanitize(table, rows);
    if outcome.stripped_ids > 0 {
        context.warn(format!(
            "{table}: {} row(s) had a non-UUID id; the store will assign new ids",
            outcome.stripped_ids
        ));
        report.stripped_ids.insert(table, outcome.stripped_ids);
    }
    if outcome.dropped_invalid > 0 {
        let field = table.descriptor().required_date_field.unwrap_or("date");
        context.warn(format!(
            "{table}: dropped {} row(s) with a missing or invalid {field}",
            outcome.dropped_invalid
        ));
        report.dropped_rows.insert(table, outcome.dropped_invalid);
    }
    outcome.rows
}

async fn upsert_table<S: TableStore>(
    store: &S,
    table: TableName,
    rows: &[Record],
    chunk_size: usize,
    context: &mut RestoreContext,
) -> Result<TableOutcome, RestoreError> {
    if rows.is_empty() {
        tracing::debug!(%table, "no rows to restore");
        return Ok(TableOutcome::Restored { rows: 0, batches: 0 });
    }

    let mut batches = 0;
    let mut committed = 0;
    for (index, batch) in rows.chunks(chunk_size).enumerate() {
        tracing::debug!(%table, batch = index + 1, rows = batch.len(), "upserting batch");
        if let Err(error) = store.upsert(table, batch).await {
            return route_failure(table, error, committed, context);
        }
        batches += 1;
        committed += batch.len();
    }

    context.info(format!("Restored {table}: {} row(s) in {batches} batch(es)", rows.len()));
    Ok(TableOutcome::Restored { rows: rows.len(), batches })
}

fn route_failure(
    table: TableName,
    error: StoreError,
    committed_rows: usize,
    context: &mut RestoreContext,
) -> Result<TableOutcome, RestoreError> {
    match error.failure() {
        StoreFailure::PermissionDenied if table.descriptor().role.tolerates_denied_writes() => {
            let reason = format!("permission denied: {error}");
            if committed_rows > 0 {
                context.warn(format!(
                    "Skipped the rest of {table} after {committed_rows} row(s) were written: {reason}"
                ));
            } else {
                context.warn(format!("Skipped {table}: {reason}"));
            }
            Ok(TableOutcome::Skipped { reason, committed_rows })
        }
        StoreFailure::PermissionDenied => Err(RestoreError::PermissionDenied { table, source: error }),
        StoreFailure::UnknownColumn => {
            Err(RestoreError::SchemaMismatch { table, detail: error.to_string() })
        }
        StoreFailure::Other => Err(RestoreError::TableFailed { table, source: error }),
    }
}
