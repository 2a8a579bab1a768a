//! T-SQL type names and TDS value decoding.

use std::borrow::Cow;

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use outflow_types::schema::{FieldType, Value};
use tiberius::numeric::Numeric;
use tiberius::{ColumnData, ColumnType, Row};

/// Map a T-SQL type name (as in `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE`) to
/// its canonical type.
#[must_use]
pub fn field_type(native: &str) -> FieldType {
    match native.trim().to_ascii_lowercase().as_str() {
        "bit" => FieldType::Boolean,
        "tinyint" | "smallint" | "int" | "bigint" => FieldType::Integer,
        "decimal" | "numeric" | "money" | "smallmoney" | "float" | "real" => FieldType::Number,
        "date" => FieldType::Date,
        "datetimeoffset" => FieldType::TimestampTz,
        "datetime" | "datetime2" | "smalldatetime" => FieldType::TimestampNtz,
        "" | "json" => FieldType::Json,
        _ => FieldType::String,
    }
}

/// Canonical type of a result column's wire type.
pub(crate) fn column_field_type(ty: ColumnType) -> FieldType {
    match ty {
        ColumnType::Bit | ColumnType::Bitn => FieldType::Boolean,
        ColumnType::Int1
        | ColumnType::Int2
        | ColumnType::Int4
        | ColumnType::Int8
        | ColumnType::Intn => FieldType::Integer,
        ColumnType::Float4
        | ColumnType::Float8
        | ColumnType::Floatn
        | ColumnType::Money
        | ColumnType::Money4
        | ColumnType::Decimaln
        | ColumnType::Numericn => FieldType::Number,
        ColumnType::Daten => FieldType::Date,
        ColumnType::DatetimeOffsetn => FieldType::TimestampTz,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2 => FieldType::TimestampNtz,
        _ => FieldType::String,
    }
}

fn numeric_to_f64(n: Numeric) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let value = n.value() as f64;
    value / 10f64.powi(i32::from(n.scale()))
}

fn integer(row: &Row, idx: usize) -> Option<Value> {
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Some(Value::Integer(v));
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Some(Value::Integer(v.into()));
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Some(Value::Integer(v.into()));
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Some(Value::Integer(v.into()));
    }
    None
}

fn number(row: &Row, idx: usize) -> Option<Value> {
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Some(Value::Number(v));
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Some(Value::Number(v.into()));
    }
    if let Ok(Some(v)) = row.try_get::<Numeric, _>(idx) {
        return Some(Value::Number(numeric_to_f64(v)));
    }
    None
}

fn fallback(row: &Row, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::Uuid, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(bytes)) = row.try_get::<&[u8], _>(idx) {
        return Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
    }
    Value::Null
}

/// Decode one cell, falling back to text when the typed read fails.
pub(crate) fn decode_cell(row: &Row, idx: usize, field_type: FieldType) -> Value {
    let typed = match field_type {
        FieldType::Boolean => row.try_get::<bool, _>(idx).ok().flatten().map(Value::Boolean),
        FieldType::Integer => integer(row, idx),
        FieldType::Number => number(row, idx),
        FieldType::Date => row.try_get::<NaiveDate, _>(idx).ok().flatten().map(Value::Date),
        FieldType::TimestampTz => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .flatten()
            .map(Value::TimestampTz),
        FieldType::TimestampNtz => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(Value::TimestampNtz),
        FieldType::String | FieldType::Json => None,
    };
    typed.unwrap_or_else(|| fallback(row, idx))
}

/// Positional query parameter bound as a typed TDS value.
pub(crate) struct SqlParam<'a>(pub &'a Value);

impl tiberius::ToSql for SqlParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0 {
            Value::Null => ColumnData::String(None),
            Value::Boolean(b) => ColumnData::Bit(Some(*b)),
            Value::Integer(i) => ColumnData::I64(Some(*i)),
            Value::Number(n) => ColumnData::F64(Some(*n)),
            Value::String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            other => ColumnData::String(Some(Cow::Owned(other.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiberius::ToSql;

    #[test]
    fn type_table() {
        let cases = [
            ("bit", FieldType::Boolean),
            ("INT", FieldType::Integer),
            ("bigint", FieldType::Integer),
            ("decimal", FieldType::Number),
            ("money", FieldType::Number),
            ("float", FieldType::Number),
            ("date", FieldType::Date),
            ("datetimeoffset", FieldType::TimestampTz),
            ("datetime2", FieldType::TimestampNtz),
            ("nvarchar", FieldType::String),
            ("uniqueidentifier", FieldType::String),
            ("", FieldType::Json),
        ];
        for (native, expected) in cases {
            assert_eq!(field_type(native), expected, "{native}");
        }
    }

    #[test]
    fn wire_types() {
        assert_eq!(column_field_type(ColumnType::Intn), FieldType::Integer);
        assert_eq!(column_field_type(ColumnType::Numericn), FieldType::Number);
        assert_eq!(column_field_type(ColumnType::DatetimeOffsetn), FieldType::TimestampTz);
        assert_eq!(column_field_type(ColumnType::NVarchar), FieldType::String);
    }

    #[test]
    fn numeric_scaling() {
        assert!((numeric_to_f64(Numeric::new_with_scale(12_345, 2)) - 123.45).abs() < 1e-9);
    }

    #[test]
    fn params_are_typed() {
        assert!(matches!(SqlParam(&Value::Null).to_sql(), ColumnData::String(None)));
        assert!(matches!(
            SqlParam(&Value::Integer(7)).to_sql(),
            ColumnData::I64(Some(7))
        ));
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        match SqlParam(&date).to_sql() {
            ColumnData::String(Some(s)) => assert_eq!(s, "2024-05-01"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
