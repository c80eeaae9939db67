use std::collections::BTreeMap;

use futures::future::try_join_all;

use crate::catalog::TableName;
use crate::envelope::Envelope;
use crate::store::{StoreError, TableStore};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("failed to export {table}: {source}")]
pub struct ExportError {
    pub table: TableName,
    pub source: StoreError,
}

/// Read every known table in full, concurrently, into a current-format envelope.
///
/// # Errors
/// Returns the first failed table fetch; nothing is returned partially.
pub async fn export_all<S: TableStore>(store: &S, produced_by: &str) -> Result<Envelope, ExportError> {
    let fetches = TableName::ALL.into_iter().map(|table| async move {
        store
            .fetch_all(table)
            .await
            .map(|rows| (table, rows))
            .map_err(|source| ExportError { table, source })
    });
    let tables: BTreeMap<_, _> = try_join_all(fetches).await?.into_iter().collect();

    let envelope = Envelope::new(produced_by, tables);
    tracing::info!(
        target: "crewdesk::export",
        tables = envelope.tables.len(),
        rows = envelope.total_rows(),
        "exported snapshot"
    );
    Ok(envelope)
}
