//! Adapters that turn legacy nested table shapes into canonical row lists.

use serde_json::Value;

use crate::catalog::{LegacyShape, TableName};
use crate::envelope::SnapshotError;
use crate::Record;

const DEPARTMENT_FIELD: &str = "department_id";
const MONTH_FIELD: &str = "month";

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTable {
    pub rows: Vec<Record>,
    pub from_legacy: bool,
}

/// Normalize one table value from a snapshot into rows.
///
/// `null` counts as an empty table. Lists must hold objects; objects are only
/// accepted for tables with a declared [`LegacyShape`].
///
/// # Errors
/// Returns [`SnapshotError::InvalidTable`] when the value fits neither shape.
pub fn normalize_table(table: TableName, value: Value) -> Result<NormalizedTable, SnapshotError> {
    match value {
        Value::Null => Ok(NormalizedTable { rows: Vec::new(), from_legacy: false }),
        Value::Array(items) => {
            let mut rows = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let Value::Object(row) = item else {
                    return Err(invalid(table, format!("row {index} is not an object")));
                };
                rows.push(row);
            }
            Ok(NormalizedTable { rows, from_legacy: false })
        }
        Value::Object(nested) => {
            let rows = match table.descriptor().legacy_shape {
                Some(LegacyShape::ByDepartment) => by_department(table, nested)?,
                Some(LegacyShape::ByMonthAndDepartment { payload_field }) => {
                    by_month_and_department(table, nested, payload_field)?
                }
                None => return Err(invalid(table, "expected a list of rows".to_string())),
            };
            Ok(NormalizedTable { rows, from_legacy: true })
        }
        other => Err(invalid(table, format!("expected a list of rows, found {}", kind(&other)))),
    }
}

/// `{departmentId: {fields}}`. The map key wins over a `department_id` field.
fn by_department(table: TableName, nested: Record) -> Result<Vec<Record>, SnapshotError> {
    let mut rows = Vec::with_capacity(nested.len());
    for (department_id, fields) in nested {
        let Value::Object(fields) = fields else {
            return Err(invalid(table, format!("settings for department {department_id} are not an object")));
        };
        let mut row = Record::new();
        row.insert(DEPARTMENT_FIELD.to_string(), Value::String(department_id));
        row.extend(fields.into_iter().filter(|(field, _)| field != DEPARTMENT_FIELD));
        rows.push(row);
    }
    Ok(rows)
}

/// `{monthKey: {departmentId: payload}}`.
fn by_month_and_department(
    table: TableName,
    nested: Record,
    payload_field: Option<&'static str>,
) -> Result<Vec<Record>, SnapshotError> {
    let mut rows = Vec::new();
    for (month, departments) in nested {
        let Value::Object(departments) = departments else {
            return Err(invalid(table, format!("month {month} is not keyed by department")));
        };
        for (department_id, payload) in departments {
            let mut row = Record::new();
            row.insert(MONTH_FIELD.to_string(), Value::String(month.clone()));
            row.insert(DEPARTMENT_FIELD.to_string(), Value::String(department_id.clone()));
            match (payload_field, payload) {
                (Some(field), payload) => {
                    row.insert(field.to_string(), payload);
                }
                (None, Value::Object(fields)) => row.extend(
                    fields
                        .into_iter()
                        .filter(|(field, _)| field != MONTH_FIELD && field != DEPARTMENT_FIELD),
                ),
                (None, other) => {
                    return Err(invalid(
                        table,
                        format!("{month}/{department_id} holds {} instead of an object", kind(&other)),
                    ));
                }
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

fn invalid(table: TableName, reason: String) -> SnapshotError {
    SnapshotError::InvalidTable { table, reason }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
