//! Field-mapping projection: positional source rows into destination records.

use std::collections::HashMap;

use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::{FieldMapping, Object, ObjectField};
use outflow_types::schema::{Record, Row};
use outflow_types::state::ObjectFieldId;

/// Destination fields keyed by id, built once per run.
pub type FieldsById<'a> = HashMap<ObjectFieldId, &'a ObjectField>;

#[must_use]
pub fn fields_by_id(object: &Object) -> FieldsById<'_> {
    object
        .fields
        .iter()
        .filter_map(|f| f.id.map(|id| (id, f)))
        .collect()
}

/// Project one row.
///
/// Mapping `i` reads `row[i]`. Scalar mappings write `record[dest]` only for
/// non-null values. JSON mappings nest under `record[dest][source_field]`
/// and keep nulls; several JSON mappings into one field become siblings.
///
/// # Errors
///
/// Returns a `data` error when the row is shorter than the mapping list or
/// a mapping names an unknown destination field.
pub fn project(row: &Row, mappings: &[FieldMapping], fields: &FieldsById<'_>) -> Result<Record> {
    if row.len() < mappings.len() {
        return Err(ConnectorError::data(
            "ROW_TOO_SHORT",
            format!(
                "row has {} values but {} fields are mapped",
                row.len(),
                mappings.len()
            ),
        ));
    }

    let mut out = Record::new();
    for (mapping, value) in mappings.iter().zip(row) {
        let dest = fields.get(&mapping.destination_field_id).ok_or_else(|| {
            ConnectorError::data(
                "UNKNOWN_DESTINATION_FIELD",
                format!(
                    "mapping for '{}' targets unknown field id {}",
                    mapping.source_field_name, mapping.destination_field_id
                ),
            )
        })?;

        if mapping.is_json_field {
            let slot = out
                .entry(dest.name.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if !slot.is_object() {
                *slot = serde_json::Value::Object(serde_json::Map::new());
            }
            if let serde_json::Value::Object(group) = slot {
                group.insert(mapping.source_field_name.clone(), value.to_json());
            }
        } else if !value.is_null() {
            out.insert(dest.name.clone(), value.to_json());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_types::schema::{FieldType, Value};
    use serde_json::json;

    fn field(id: i64, name: &str, field_type: FieldType) -> ObjectField {
        ObjectField {
            id: Some(ObjectFieldId::new(id)),
            name: name.into(),
            field_type,
            display_name: None,
            description: None,
            nullable: true,
        }
    }

    fn mapping(source: &str, dest: i64, json: bool) -> FieldMapping {
        FieldMapping {
            source_field_name: source.into(),
            source_field_type: FieldType::String,
            destination_field_id: ObjectFieldId::new(dest),
            is_json_field: json,
        }
    }

    fn fixture() -> (Vec<ObjectField>, Vec<FieldMapping>) {
        (
            vec![
                field(1, "email", FieldType::String),
                field(2, "seats", FieldType::Integer),
                field(3, "traits", FieldType::Json),
            ],
            vec![
                mapping("email_address", 1, false),
                mapping("seat_count", 2, false),
                mapping("plan", 3, true),
                mapping("region", 3, true),
            ],
        )
    }

    #[test]
    fn test_scalar_and_json_grouping() {
        let (object_fields, mappings) = fixture();
        let fields: FieldsById<'_> = object_fields.iter().map(|f| (f.id.unwrap(), f)).collect();
        let row = vec![
            Value::String("a@x.io".into()),
            Value::Integer(3),
            Value::String("pro".into()),
            Value::String("eu".into()),
        ];
        let record = project(&row, &mappings, &fields).unwrap();
        assert_eq!(
            serde_json::Value::Object(record),
            json!({"email": "a@x.io", "seats": 3, "traits": {"plan": "pro", "region": "eu"}})
        );
    }

    #[test]
    fn test_null_scalars_omitted_json_nulls_kept() {
        let (object_fields, mappings) = fixture();
        let fields: FieldsById<'_> = object_fields.iter().map(|f| (f.id.unwrap(), f)).collect();
        let row = vec![
            Value::String("a@x.io".into()),
            Value::Null,
            Value::Null,
            Value::String("eu".into()),
        ];
        let record = project(&row, &mappings, &fields).unwrap();
        assert!(!record.contains_key("seats"));
        assert_eq!(record["traits"], json!({"plan": null, "region": "eu"}));
    }

    #[test]
    fn test_address_parts_aggregate_into_one_json_column() {
        let object_fields = vec![
            field(1, "name", FieldType::String),
            field(2, "address_json", FieldType::Json),
        ];
        let fields: FieldsById<'_> = object_fields.iter().map(|f| (f.id.unwrap(), f)).collect();
        let mappings = vec![
            mapping("name", 1, false),
            mapping("street", 2, true),
            mapping("zip", 2, true),
        ];
        let row = vec![
            Value::String("Ada".into()),
            Value::String("1 Main St".into()),
            Value::Null,
        ];
        let record = project(&row, &mappings, &fields).unwrap();
        assert_eq!(
            serde_json::Value::Object(record),
            json!({"name": "Ada", "address_json": {"street": "1 Main St", "zip": null}})
        );
    }

    #[test]
    fn test_extra_trailing_columns_ignored() {
        let (object_fields, mappings) = fixture();
        let fields: FieldsById<'_> = object_fields.iter().map(|f| (f.id.unwrap(), f)).collect();
        let mut row = vec![Value::Null; 4];
        row.push(Value::Integer(99));
        let record = project(&row, &mappings, &fields).unwrap();
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_short_row_is_data_error() {
        let (object_fields, mappings) = fixture();
        let fields: FieldsById<'_> = object_fields.iter().map(|f| (f.id.unwrap(), f)).collect();
        let err = project(&vec![Value::Null], &mappings, &fields).unwrap_err();
        assert_eq!(err.code, "ROW_TOO_SHORT");
        assert!(!err.retryable);
    }

    #[test]
    fn test_unknown_destination_is_data_error() {
        let (object_fields, _) = fixture();
        let fields: FieldsById<'_> = object_fields.iter().map(|f| (f.id.unwrap(), f)).collect();
        let err = project(&vec![Value::Integer(1)], &[mapping("x", 77, false)], &fields)
            .unwrap_err();
        assert_eq!(err.code, "UNKNOWN_DESTINATION_FIELD");
    }

    #[test]
    fn test_fields_by_id_skips_unsaved() {
        let mut object_fields = fixture().0;
        object_fields[0].id = None;
        let object = Object {
            name: "contacts".into(),
            destination: "crm".into(),
            namespace: "crm".into(),
            table_name: "contacts".into(),
            end_customer_id_field: "customer_id".into(),
            sync_mode: outflow_types::model::SyncMode::FullAppend,
            cursor_field: None,
            primary_key: None,
            frequency: 1,
            frequency_units: outflow_types::model::FrequencyUnits::Hours,
            fields: object_fields,
        };
        assert_eq!(fields_by_id(&object).len(), 2);
    }
}
