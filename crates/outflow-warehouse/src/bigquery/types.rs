//! BigQuery REST schema and cell decoding.
//!
//! Query results arrive as `{"f": [{"v": …}]}` rows where every scalar is a
//! string. Timestamps are requested as integer microseconds.

use chrono::DateTime;
use outflow_types::schema::{Field, FieldType, Row, Schema, Value};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TableSchema {
    #[serde(default)]
    pub fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TableFieldSchema {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub fields: Vec<TableFieldSchema>,
}

impl TableFieldSchema {
    fn is_repeated(&self) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("REPEATED"))
    }

    fn is_record(&self) -> bool {
        matches!(
            self.field_type.to_ascii_uppercase().as_str(),
            "RECORD" | "STRUCT"
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TableCell {
    #[serde(default)]
    pub v: serde_json::Value,
}

/// Map a BigQuery type name to its canonical type.
#[must_use]
pub fn field_type(native: &str) -> FieldType {
    match native.trim().to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" => FieldType::Integer,
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" | "DECIMAL" | "BIGDECIMAL" => {
            FieldType::Number
        }
        "BOOLEAN" | "BOOL" => FieldType::Boolean,
        "DATE" => FieldType::Date,
        "TIMESTAMP" => FieldType::TimestampTz,
        "DATETIME" => FieldType::TimestampNtz,
        "" | "RECORD" | "STRUCT" | "JSON" => FieldType::Json,
        _ => FieldType::String,
    }
}

pub(crate) fn canonical_schema(schema: &TableSchema) -> Schema {
    Schema::new(
        schema
            .fields
            .iter()
            .map(|f| {
                let ty = if f.is_repeated() {
                    FieldType::Json
                } else {
                    field_type(&f.field_type)
                };
                Field::new(f.name.clone(), ty)
            })
            .collect(),
    )
}

pub(crate) fn decode_row(fields: &[TableFieldSchema], row: &TableRow) -> Row {
    fields
        .iter()
        .zip(row.f.iter())
        .map(|(field, cell)| decode_cell(field, &cell.v))
        .collect()
}

fn decode_cell(field: &TableFieldSchema, raw: &serde_json::Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    if field.is_repeated() || field.is_record() {
        return Value::Json(nested_json(field, raw));
    }
    decode_scalar(field, raw)
}

fn decode_scalar(field: &TableFieldSchema, raw: &serde_json::Value) -> Value {
    let Some(text) = raw.as_str() else {
        return Value::Json(raw.clone());
    };
    let ty = field_type(&field.field_type);
    if ty == FieldType::TimestampTz {
        if let Some(ts) = text
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_micros)
        {
            return Value::TimestampTz(ts);
        }
    }
    Value::parse_text(ty, text)
}

/// Unwrap the `f`/`v` envelope of records and repeated fields into plain JSON.
fn nested_json(field: &TableFieldSchema, raw: &serde_json::Value) -> serde_json::Value {
    if raw.is_null() {
        return serde_json::Value::Null;
    }
    if field.is_repeated() {
        let element = TableFieldSchema {
            mode: None,
            ..field.clone()
        };
        let items = raw.as_array().map_or_else(Vec::new, |items| {
            items
                .iter()
                .map(|item| nested_json(&element, item.get("v").unwrap_or(item)))
                .collect()
        });
        return serde_json::Value::Array(items);
    }
    if field.is_record() {
        let cells = raw.get("f").and_then(serde_json::Value::as_array);
        let mut object = serde_json::Map::new();
        for (i, child) in field.fields.iter().enumerate() {
            let value = cells
                .and_then(|c| c.get(i))
                .and_then(|c| c.get("v"))
                .unwrap_or(&serde_json::Value::Null);
            object.insert(child.name.clone(), nested_json(child, value));
        }
        return serde_json::Value::Object(object);
    }
    decode_scalar(field, raw).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(raw: serde_json::Value) -> TableSchema {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn type_table() {
        let cases = [
            ("INTEGER", FieldType::Integer),
            ("INT64", FieldType::Integer),
            ("FLOAT", FieldType::Number),
            ("NUMERIC", FieldType::Number),
            ("BIGNUMERIC", FieldType::Number),
            ("BOOL", FieldType::Boolean),
            ("STRING", FieldType::String),
            ("BYTES", FieldType::String),
            ("DATE", FieldType::Date),
            ("TIMESTAMP", FieldType::TimestampTz),
            ("DATETIME", FieldType::TimestampNtz),
            ("RECORD", FieldType::Json),
            ("JSON", FieldType::Json),
            ("", FieldType::Json),
        ];
        for (native, expected) in cases {
            assert_eq!(field_type(native), expected, "{native}");
        }
    }

    #[test]
    fn repeated_columns_are_json() {
        let s = schema(json!({"fields": [
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "id", "type": "INT64", "mode": "REQUIRED"}
        ]}));
        let canonical = canonical_schema(&s);
        assert_eq!(canonical.fields()[0].field_type, FieldType::Json);
        assert_eq!(canonical.fields()[1].field_type, FieldType::Integer);
    }

    #[test]
    fn decodes_scalars() {
        let s = schema(json!({"fields": [
            {"name": "id", "type": "INTEGER"},
            {"name": "score", "type": "FLOAT"},
            {"name": "active", "type": "BOOLEAN"},
            {"name": "signup", "type": "DATE"},
            {"name": "seen_at", "type": "TIMESTAMP"},
            {"name": "note", "type": "STRING"}
        ]}));
        let row: TableRow = serde_json::from_value(json!({"f": [
            {"v": "42"}, {"v": "1.5"}, {"v": "true"}, {"v": "2024-03-01"},
            {"v": "1700000000000000"}, {"v": null}
        ]}))
        .unwrap();
        let decoded = decode_row(&s.fields, &row);
        assert_eq!(decoded[0], Value::Integer(42));
        assert_eq!(decoded[1], Value::Number(1.5));
        assert_eq!(decoded[2], Value::Boolean(true));
        assert_eq!(decoded[3].to_string(), "2024-03-01");
        assert_eq!(
            decoded[4],
            Value::TimestampTz(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
        );
        assert_eq!(decoded[5], Value::Null);
    }

    #[test]
    fn unwraps_records_and_arrays() {
        let s = schema(json!({"fields": [
            {"name": "address", "type": "RECORD", "fields": [
                {"name": "city", "type": "STRING"},
                {"name": "zip", "type": "INTEGER"}
            ]},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"}
        ]}));
        let row: TableRow = serde_json::from_value(json!({"f": [
            {"v": {"f": [{"v": "Oslo"}, {"v": "150"}]}},
            {"v": [{"v": "a"}, {"v": "b"}]}
        ]}))
        .unwrap();
        let decoded = decode_row(&s.fields, &row);
        assert_eq!(decoded[0], Value::Json(json!({"city": "Oslo", "zip": 150})));
        assert_eq!(decoded[1], Value::Json(json!(["a", "b"])));
    }

    #[test]
    fn json_column_parses_text() {
        let s = schema(json!({"fields": [{"name": "attrs", "type": "JSON"}]}));
        let row: TableRow =
            serde_json::from_value(json!({"f": [{"v": "{\"plan\":\"pro\"}"}]})).unwrap();
        assert_eq!(
            decode_row(&s.fields, &row)[0],
            Value::Json(json!({"plan": "pro"}))
        );
    }
}
