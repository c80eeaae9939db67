//! Versioned snapshot envelope: encoding, decoding, and shape validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::catalog::TableName;
use crate::normalize::normalize_table;
use crate::Record;

pub const FORMAT_VERSION: &str = "1.8";
pub const PRODUCT_NAME: &str = "crewdesk";
const SUPPORTED_MAJOR: &str = "1";
const UNKNOWN_PRODUCER: &str = "unknown";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Json(String),
    #[error("snapshot root must be a JSON object")]
    NotAnObject,
    #[error("snapshot field `{0}` is missing or has the wrong type")]
    MissingField(&'static str),
    #[error("unsupported snapshot format version {0} (expected {SUPPORTED_MAJOR}.x)")]
    UnsupportedVersion(String),
    #[error("invalid createdAt timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("table {table} is malformed: {reason}")]
    InvalidTable { table: TableName, reason: String },
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub format_version: String,
    pub produced_by: String,
    pub tables: BTreeMap<TableName, Vec<Record>>,
}

/// A decoded envelope plus what decoding had to set aside or rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSnapshot {
    pub envelope: Envelope,
    pub ignored_tables: Vec<String>,
    pub legacy_tables: Vec<TableName>,
}

impl Envelope {
    /// A current-format envelope stamped now.
    #[must_use]
    pub fn new(produced_by: impl Into<String>, tables: BTreeMap<TableName, Vec<Record>>) -> Self {
        Self {
            created_at: OffsetDateTime::now_utc(),
            format_version: FORMAT_VERSION.to_string(),
            produced_by: produced_by.into(),
            tables,
        }
    }

    /// Rows of `table`; a missing table reads as empty.
    #[must_use]
    pub fn rows(&self, table: TableName) -> &[Record] {
        self.tables.get(&table).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn row_counts(&self) -> BTreeMap<TableName, usize> {
        TableName::ALL.into_iter().map(|table| (table, self.rows(table).len())).collect()
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Two-space indented JSON with every known table present.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Encode`] if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, SnapshotError> {
        let mut complete = self.clone();
        for table in TableName::ALL {
            complete.tables.entry(table).or_default();
        }
        serde_json::to_string_pretty(&complete).map_err(|err| SnapshotError::Encode(err.to_string()))
    }

    /// Parse and validate snapshot text.
    ///
    /// # Errors
    /// Returns a [`SnapshotError`] for malformed JSON, missing envelope fields, an
    /// unsupported major version, or a table that cannot be normalized into rows.
    pub fn decode(text: &str) -> Result<DecodedSnapshot, SnapshotError> {
        let root: Value =
            serde_json::from_str(text).map_err(|err| SnapshotError::Json(err.to_string()))?;
        let Value::Object(mut root) = root else {
            return Err(SnapshotError::NotAnObject);
        };

        let format_version = match root.remove("formatVersion") {
            Some(Value::String(version)) => version,
            _ => return Err(SnapshotError::MissingField("formatVersion")),
        };
        if format_version.split('.').next() != Some(SUPPORTED_MAJOR) {
            return Err(SnapshotError::UnsupportedVersion(format_version));
        }

        let created_at = match root.remove("createdAt") {
            Some(Value::String(stamp)) => OffsetDateTime::parse(&stamp, &Rfc3339)
                .map_err(|_| SnapshotError::InvalidTimestamp(stamp))?,
            _ => return Err(SnapshotError::MissingField("createdAt")),
        };

        let produced_by = match root.remove("producedBy") {
            Some(Value::String(label)) if !label.trim().is_empty() => label,
            _ => UNKNOWN_PRODUCER.to_string(),
        };

        let Some(Value::Object(raw_tables)) = root.remove("tables") else {
            return Err(SnapshotError::MissingField("tables"));
        };

        let mut tables = BTreeMap::new();
        let mut ignored_tables = Vec::new();
        let mut legacy_tables = Vec::new();
        for (name, value) in raw_tables {
            let Some(table) = TableName::parse(&name) else {
                ignored_tables.push(name);
                continue;
            };
            let normalized = normalize_table(table, value)?;
            if normalized.from_legacy {
                legacy_tables.push(table);
            }
            tables.insert(table, normalized.rows);
        }
        for table in TableName::ALL {
            tables.entry(table).or_default();
        }

        Ok(DecodedSnapshot {
            envelope: Envelope { created_at, format_version, produced_by, tables },
            ignored_tables,
            legacy_tables,
        })
    }
}

/// `<product>_backup_<YYYY-MM-DD>.json`
#[must_use]
pub fn backup_file_name(product: &str, date: Date) -> String {
    let stamp = date
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| date.to_string());
    format!("{product}_backup_{stamp}.json")
}
