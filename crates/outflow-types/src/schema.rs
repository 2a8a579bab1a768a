//! Canonical, warehouse-agnostic column and value model.
//!
//! Every dialect normalizes its native types into [`FieldType`] and its
//! native values into [`Value`]. Rows are positional: `row[i]` belongs to
//! `schema.fields()[i]`.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Unified value category shared by all warehouses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Integer,
    Number,
    String,
    Date,
    TimestampTz,
    TimestampNtz,
    Json,
}

impl FieldType {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Date => "date",
            Self::TimestampTz => "timestamp_tz",
            Self::TimestampNtz => "timestamp_ntz",
            Self::Json => "json",
        }
    }

    /// Parse the storage form produced by [`FieldType::as_str`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let ty = match raw {
            "boolean" => Self::Boolean,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "string" => Self::String,
            "date" => Self::Date,
            "timestamp_tz" => Self::TimestampTz,
            "timestamp_ntz" => Self::TimestampNtz,
            "json" => Self::Json,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered list of fields. Column order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    #[must_use]
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the first field called `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }
}

impl From<Vec<Field>> for Schema {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(fields)
    }
}

/// A single cell value in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Date(NaiveDate),
    TimestampTz(DateTime<Utc>),
    TimestampNtz(NaiveDateTime),
    Json(serde_json::Value),
}

/// One result row, positionally aligned to a [`Schema`].
pub type Row = Vec<Value>;

/// A projected destination record, keyed by destination field name.
pub type Record = serde_json::Map<String, serde_json::Value>;

const NTZ_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const TZ_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f %#z"];

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert into a JSON value for records and webhook payloads.
    ///
    /// Dates and timestamps become ISO-8601 strings; non-finite numbers
    /// become `null` since JSON cannot carry them.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Boolean(b) => J::Bool(*b),
            Self::Integer(i) => J::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(J::Null, J::Number),
            Self::String(s) => J::String(s.clone()),
            Self::Date(d) => J::String(d.format("%Y-%m-%d").to_string()),
            Self::TimestampTz(ts) => J::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::TimestampNtz(ts) => J::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Decode a textual wire value into the given canonical type.
    ///
    /// Text that does not parse as the requested type degrades to
    /// [`Value::String`] so no data is dropped.
    #[must_use]
    pub fn parse_text(field_type: FieldType, raw: &str) -> Self {
        let parsed = match field_type {
            FieldType::String => return Self::String(raw.to_string()),
            FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" => Some(Self::Boolean(true)),
                "false" | "f" | "0" | "no" | "n" => Some(Self::Boolean(false)),
                _ => None,
            },
            FieldType::Integer => raw.trim().parse::<i64>().ok().map(Self::Integer),
            FieldType::Number => raw.trim().parse::<f64>().ok().map(Self::Number),
            FieldType::Date => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .ok()
                .map(Self::Date),
            FieldType::TimestampTz => parse_timestamp_tz(raw.trim()).map(Self::TimestampTz),
            FieldType::TimestampNtz => NTZ_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
                .map(Self::TimestampNtz),
            FieldType::Json => Some(Self::Json(
                serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.into())),
            )),
        };
        parsed.unwrap_or_else(|| Self::String(raw.to_string()))
    }
}

fn parse_timestamp_tz(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    TZ_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Default textual form, used for cursor literals and diagnostics.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::TimestampTz(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f%:z")),
            Self::TimestampNtz(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_storage_roundtrip() {
        for ty in [
            FieldType::Boolean,
            FieldType::Integer,
            FieldType::Number,
            FieldType::String,
            FieldType::Date,
            FieldType::TimestampTz,
            FieldType::TimestampNtz,
            FieldType::Json,
        ] {
            assert_eq!(FieldType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(FieldType::parse("varchar"), None);
    }

    #[test]
    fn schema_index_of_finds_first_match() {
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::String),
        ]);
        assert_eq!(schema.index_of("name"), Some(1));
        assert_eq!(schema.index_of("missing"), None);
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn parse_text_by_type() {
        assert_eq!(Value::parse_text(FieldType::Integer, "42"), Value::Integer(42));
        assert_eq!(Value::parse_text(FieldType::Boolean, "t"), Value::Boolean(true));
        assert_eq!(Value::parse_text(FieldType::Number, "1.5"), Value::Number(1.5));
        assert_eq!(
            Value::parse_text(FieldType::Date, "2024-03-01"),
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert_eq!(
            Value::parse_text(FieldType::Json, r#"{"a":1}"#),
            Value::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn parse_text_timestamps() {
        let ntz = Value::parse_text(FieldType::TimestampNtz, "2024-01-15 10:00:00");
        assert!(matches!(ntz, Value::TimestampNtz(_)));
        let tz = Value::parse_text(FieldType::TimestampTz, "2024-01-15 10:00:00+02");
        match tz {
            Value::TimestampTz(ts) => assert_eq!(ts.to_rfc3339(), "2024-01-15T08:00:00+00:00"),
            other => panic!("expected timestamp, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_text_degrades_to_string() {
        assert_eq!(
            Value::parse_text(FieldType::Integer, "abc"),
            Value::String("abc".into())
        );
    }

    #[test]
    fn to_json_formats_temporal_values() {
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(date.to_json(), serde_json::json!("2024-01-02"));
        assert_eq!(Value::Number(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
    }
}
