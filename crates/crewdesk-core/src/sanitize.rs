//! Per-table row cleanup applied right before upsert.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde_json::Value;
use time::macros::format_description;
use time::Date;

use crate::catalog::{TableName, SERVER_MANAGED_FIELDS};
use crate::Record;

static STRICT_UUID: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .ok()
});

static STRICT_DATE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").ok());

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizeOutcome {
    pub rows: Vec<Record>,
    /// Rows whose non-UUID `id` was removed so the store assigns a fresh one.
    pub stripped_ids: usize,
    /// Rows dropped for failing the table's required date check.
    pub dropped_invalid: usize,
}

/// `8-4-4-4-12` hex groups, either case.
#[must_use]
pub fn is_strict_uuid(value: &str) -> bool {
    STRICT_UUID.as_ref().is_some_and(|pattern| pattern.is_match(value))
}

/// `YYYY-MM-DD` naming a real calendar day.
#[must_use]
pub fn is_strict_date(value: &str) -> bool {
    STRICT_DATE.as_ref().is_some_and(|pattern| pattern.is_match(value))
        && Date::parse(value, format_description!("[year]-[month]-[day]")).is_ok()
}

/// Strip server-managed fields, apply the table's field migrations, drop rows with
/// an invalid required date, and remove non-UUID ids on strict-id tables.
///
/// A deprecated field is renamed only when its replacement is absent; otherwise the
/// replacement is kept and the deprecated field discarded.
#[must_use]
pub fn sanitize(table: TableName, rows: Vec<Record>) -> SanitizeOutcome {
    let descriptor = table.descriptor();
    let mut outcome = SanitizeOutcome { rows: Vec::with_capacity(rows.len()), ..SanitizeOutcome::default() };

    for mut row in rows {
        for field in SERVER_MANAGED_FIELDS.iter().chain(descriptor.retired_fields) {
            row.shift_remove(*field);
        }

        for (deprecated, replacement) in descriptor.renamed_fields {
            if let Some(value) = row.shift_remove(*deprecated) {
                row.entry((*replacement).to_string()).or_insert(value);
            }
        }

        if let Some(field) = descriptor.required_date_field {
            if !row.get(field).and_then(Value::as_str).is_some_and(is_strict_date) {
                outcome.dropped_invalid += 1;
                continue;
            }
        }

        if descriptor.requires_strict_id {
            let strict = match row.get("id") {
                None | Some(Value::Null) => true,
                Some(Value::String(id)) => is_strict_uuid(id),
                Some(_) => false,
            };
            if !strict {
                row.shift_remove("id");
                outcome.stripped_ids += 1;
            }
        }

        outcome.rows.push(row);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {other}"),
        }
    }

    fn rows(outcome: &SanitizeOutcome) -> Value {
        Value::Array(outcome.rows.iter().cloned().map(Value::Object).collect())
    }

    #[test]
    fn uuid_shape_is_checked_case_insensitively() {
        assert!(is_strict_uuid("3fa85f64-5717-4562-b3fc-2c963f66afa6"));
        assert!(is_strict_uuid("3FA85F64-5717-4562-B3FC-2C963F66AFA6"));
        assert!(!is_strict_uuid("fd_123"));
        assert!(!is_strict_uuid("3fa85f64-5717-4562-b3fc-2c963f66afa6x"));
        assert!(!is_strict_uuid("3fa85f6457174562b3fc2c963f66afa6"));
    }

    #[test]
    fn dates_must_be_real_calendar_days() {
        assert!(is_strict_date("2024-02-29"));
        assert!(!is_strict_date("2023-02-29"));
        assert!(!is_strict_date("2024-2-9"));
        assert!(!is_strict_date("2024-05-01T00:00:00Z"));
    }

    #[test]
    fn strict_id_tables_lose_non_uuid_ids() {
        let outcome = sanitize(
            TableName::FlightLogs,
            vec![
                record(json!({ "id": "fd_123", "date": "2024-05-01", "hours": 3 })),
                record(json!({ "id": "3fa85f64-5717-4562-b3fc-2c963f66afa6", "date": "2024-05-02" })),
                record(json!({ "id": 17, "date": "2024-05-03" })),
            ],
        );
        assert_eq!(outcome.stripped_ids, 2);
        assert_eq!(
            rows(&outcome),
            json!([
                { "date": "2024-05-01", "hours": 3 },
                { "id": "3fa85f64-5717-4562-b3fc-2c963f66afa6", "date": "2024-05-02" },
                { "date": "2024-05-03" }
            ])
        );
    }

    #[test]
    fn opaque_ids_survive_on_lenient_tables() {
        let outcome = sanitize(TableName::Goals, vec![record(json!({ "id": "fd_123" }))]);
        assert_eq!(outcome.stripped_ids, 0);
        assert_eq!(rows(&outcome), json!([{ "id": "fd_123" }]));
    }

    #[test]
    fn rows_with_invalid_dates_are_dropped_and_counted() {
        let outcome = sanitize(
            TableName::Holidays,
            vec![
                record(json!({ "id": "h1", "date": "2024-12-25" })),
                record(json!({ "id": "h2", "date": "25/12/2024" })),
                record(json!({ "id": "h3" })),
            ],
        );
        assert_eq!(outcome.dropped_invalid, 2);
        assert_eq!(rows(&outcome), json!([{ "id": "h1", "date": "2024-12-25" }]));
    }

    #[test]
    fn server_fields_and_retired_fields_are_removed_and_renames_applied() {
        let outcome = sanitize(
            TableName::Staff,
            vec![
                record(json!({
                    "id": "s1",
                    "dept_id": "d1",
                    "password": "hunter2",
                    "created_at": "2024-01-01T00:00:00Z",
                    "updated_at": "2024-01-02T00:00:00Z"
                })),
                record(json!({ "id": "s2", "dept_id": "old", "department_id": "d2", "avatar_data": "..." })),
            ],
        );
        assert_eq!(
            rows(&outcome),
            json!([
                { "id": "s1", "department_id": "d1" },
                { "id": "s2", "department_id": "d2" }
            ])
        );
    }
}
