//! Incremental cursor tracking.
//!
//! A cursor position is stored as a SQL literal so it can be spliced into
//! the next read's `WHERE cursor > <position>` predicate.

use outflow_types::error::{ConnectorError, Result};
use outflow_types::schema::{FieldType, Row, Schema, Value};

/// Render a value as a cursor literal: integers bare, everything else
/// single-quoted with embedded quotes doubled. `None` for nulls.
#[must_use]
pub fn format_cursor(field_type: FieldType, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) if field_type == FieldType::Integer => Some(i.to_string()),
        other => Some(format!("'{}'", other.to_string().replace('\'', "''"))),
    }
}

/// Compute the cursor position after a read.
///
/// `last_row` is the final row of the final batch; `None` means the read
/// returned nothing and the position is unchanged (`Ok(None)`). A null
/// cursor value also leaves it unchanged.
///
/// # Errors
///
/// Returns a `schema` error when `cursor_field` is not in the result schema.
pub fn next_cursor(schema: &Schema, cursor_field: &str, last_row: Option<&Row>) -> Result<Option<String>> {
    let Some(row) = last_row else {
        return Ok(None);
    };
    let index = schema.index_of(cursor_field).ok_or_else(|| {
        ConnectorError::schema(
            "CURSOR_FIELD_MISSING",
            format!("cursor field '{cursor_field}' is not in the query result"),
        )
    })?;
    let field_type = schema
        .field(index)
        .map_or(FieldType::String, |f| f.field_type);
    Ok(row
        .get(index)
        .and_then(|value| format_cursor(field_type, value)))
}
