//! Snowflake type names and `jsonv2` result decoding.
//!
//! The SQL API returns every cell as a string (or `null`). Dates are days
//! since the epoch; timestamps are fractional epoch seconds, with
//! `TIMESTAMP_TZ` carrying a trailing `offset + 1440` in minutes.

use chrono::{DateTime, Duration, NaiveDate};
use outflow_types::schema::{Field, FieldType, Row, Schema, Value};
use serde::Deserialize;

/// Column metadata from `resultSetMetaData.rowType`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RowType {
    pub name: String,
    #[serde(rename = "type", default)]
    pub native: String,
    #[serde(default)]
    pub scale: Option<i64>,
}

/// Map a Snowflake type name (catalog or result-set spelling) to its
/// canonical type. Fixed-point numbers with a non-zero scale are `Number`.
#[must_use]
pub fn field_type(native: &str, scale: Option<i64>) -> FieldType {
    match native.trim().to_ascii_uppercase().as_str() {
        "FIXED" | "NUMBER" | "DECIMAL" | "NUMERIC" => {
            if scale.unwrap_or(0) == 0 {
                FieldType::Integer
            } else {
                FieldType::Number
            }
        }
        "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "BYTEINT" => FieldType::Integer,
        "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => {
            FieldType::Number
        }
        "BOOLEAN" => FieldType::Boolean,
        "DATE" => FieldType::Date,
        "TIMESTAMP_TZ" | "TIMESTAMP_LTZ" => FieldType::TimestampTz,
        "TIMESTAMP_NTZ" | "TIMESTAMP" | "DATETIME" => FieldType::TimestampNtz,
        "" | "VARIANT" | "OBJECT" | "ARRAY" => FieldType::Json,
        _ => FieldType::String,
    }
}

pub(crate) fn canonical_schema(row_type: &[RowType]) -> Schema {
    Schema::new(
        row_type
            .iter()
            .map(|c| Field::new(c.name.clone(), field_type(&c.native, c.scale)))
            .collect(),
    )
}

pub(crate) fn decode_row(schema: &Schema, cells: &[Option<String>]) -> Row {
    schema
        .fields()
        .iter()
        .zip(cells)
        .map(|(field, cell)| match cell {
            None => Value::Null,
            Some(text) => decode_cell(field.field_type, text),
        })
        .collect()
}

/// Split `seconds.fraction` into whole seconds and nanoseconds.
fn epoch_parts(raw: &str) -> Option<(i64, u32)> {
    let (secs, frac) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: i64 = secs.parse().ok()?;
    if frac.is_empty() {
        return Some((secs, 0));
    }
    let digits: String = frac.chars().take(9).collect();
    let scaled = format!("{digits:0<9}");
    let nanos: u32 = scaled.parse().ok()?;
    // Negative epochs carry the fraction with the same sign.
    if raw.starts_with('-') {
        if nanos == 0 {
            return Some((secs, 0));
        }
        return Some((secs - 1, 1_000_000_000 - nanos));
    }
    Some((secs, nanos))
}

fn decode_cell(field_type: FieldType, text: &str) -> Value {
    let decoded = match field_type {
        FieldType::Date => text
            .parse::<i64>()
            .ok()
            .and_then(|days| {
                NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(Duration::days(days))
            })
            .map(Value::Date),
        FieldType::TimestampNtz => epoch_parts(text)
            .and_then(|(s, n)| DateTime::from_timestamp(s, n))
            .map(|ts| Value::TimestampNtz(ts.naive_utc())),
        FieldType::TimestampTz => {
            // The offset suffix only affects presentation; the epoch is UTC.
            let epoch = text.split_whitespace().next().unwrap_or(text);
            epoch_parts(epoch)
                .and_then(|(s, n)| DateTime::from_timestamp(s, n))
                .map(Value::TimestampTz)
        }
        _ => None,
    };
    decoded.unwrap_or_else(|| Value::parse_text(field_type, text))
}
