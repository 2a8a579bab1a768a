//! Redshift native type names to canonical [`FieldType`].

use outflow_types::schema::FieldType;

/// Map a Redshift / `PostgreSQL` type name to its canonical type.
///
/// Accepts both catalog spellings (`timestamp with time zone`) and wire
/// names (`int4`, `timestamptz`). Unknown types fall back to `String`;
/// an empty name or `SUPER` maps to `Json`.
#[must_use]
pub fn field_type(native: &str) -> FieldType {
    let upper = native.trim().to_ascii_uppercase();
    match upper.as_str() {
        "" | "SUPER" | "JSON" | "JSONB" => FieldType::Json,
        "BOOL" | "BOOLEAN" => FieldType::Boolean,
        "DATE" => FieldType::Date,
        "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => FieldType::TimestampTz,
        "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => FieldType::TimestampNtz,
        "INT" | "INT2" | "INT4" | "INT8" | "INTEGER" | "BIGINT" | "SMALLINT" => FieldType::Integer,
        s if s.starts_with("FLOAT")
            || s.starts_with("NUMERIC")
            || s.starts_with("DOUBLE")
            || s.starts_with("DECIMAL")
            || s == "REAL" =>
        {
            FieldType::Number
        }
        _ => FieldType::String,
    }
}
