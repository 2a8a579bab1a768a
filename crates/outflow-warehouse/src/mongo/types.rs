//! BSON to canonical values, and schema inference from sampled documents.

use base64::Engine;
use chrono::DateTime;
use mongodb::bson::spec::ElementType;
use mongodb::bson::{Bson, Document};
use outflow_types::schema::{Field, FieldType, Schema, Value};

/// Canonical type of a BSON element type; `None` for nulls.
#[must_use]
pub fn field_type(element: ElementType) -> Option<FieldType> {
    let ty = match element {
        ElementType::Null | ElementType::Undefined => return None,
        ElementType::Double | ElementType::Decimal128 => FieldType::Number,
        ElementType::Int32 | ElementType::Int64 => FieldType::Integer,
        ElementType::Boolean => FieldType::Boolean,
        ElementType::DateTime => FieldType::TimestampTz,
        ElementType::String | ElementType::ObjectId | ElementType::Symbol => FieldType::String,
        ElementType::EmbeddedDocument | ElementType::Array => FieldType::Json,
        _ => FieldType::String,
    };
    Some(ty)
}

pub(crate) fn to_value(bson: Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Double(d) => Value::Number(d),
        Bson::Int32(i) => Value::Integer(i.into()),
        Bson::Int64(i) => Value::Integer(i),
        Bson::Boolean(b) => Value::Boolean(b),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis())
            .map_or(Value::Null, Value::TimestampTz),
        Bson::Decimal128(d) => {
            let text = match Bson::Decimal128(d).into_relaxed_extjson() {
                serde_json::Value::Object(mut o) => match o.remove("$numberDecimal") {
                    Some(serde_json::Value::String(s)) => s,
                    _ => String::new(),
                },
                _ => String::new(),
            };
            text.parse::<f64>().map_or(Value::String(text), Value::Number)
        }
        Bson::Binary(bin) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bin.bytes))
        }
        other => Value::Json(other.into_relaxed_extjson()),
    }
}

/// Field order follows first appearance across the sample. A field seen
/// with two different types becomes `Json`; a field only ever null is `Json`.
pub(crate) fn infer_schema(documents: &[Document]) -> Schema {
    let mut fields: Vec<(String, Option<FieldType>)> = Vec::new();
    for doc in documents {
        for (name, value) in doc {
            let seen = field_type(value.element_type());
            match fields.iter_mut().find(|(n, _)| n == name) {
                None => fields.push((name.clone(), seen)),
                Some((_, slot)) => match (*slot, seen) {
                    (_, None) => {}
                    (None, Some(ty)) => *slot = Some(ty),
                    (Some(current), Some(ty)) if current != ty => *slot = Some(FieldType::Json),
                    _ => {}
                },
            }
        }
    }
    Schema::new(
        fields
            .into_iter()
            .map(|(name, ty)| Field::new(name, ty.unwrap_or(FieldType::Json)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn converts_scalars_and_documents() {
        let oid = ObjectId::parse_str("65a1b2c3d4e5f60718293a4b").unwrap();
        assert_eq!(
            to_value(Bson::ObjectId(oid)),
            Value::String("65a1b2c3d4e5f60718293a4b".into())
        );
        assert_eq!(to_value(Bson::Int32(3)), Value::Integer(3));
        assert_eq!(
            to_value(Bson::DateTime(mongodb::bson::DateTime::from_millis(1_700_000_000_000))),
            Value::TimestampTz(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
        );
        assert_eq!(
            to_value(Bson::Document(doc! {"plan": "pro", "seats": 3})),
            Value::Json(serde_json::json!({"plan": "pro", "seats": 3}))
        );
    }

    #[test]
    fn infers_types_from_sample() {
        let docs = vec![
            doc! {"_id": 1, "email": "a@x.io", "score": Bson::Null, "tag": "x"},
            doc! {"_id": 2, "email": "b@x.io", "score": 1.5, "tag": 7, "extra": true},
        ];
        let schema = infer_schema(&docs);
        let types: Vec<_> = schema
            .fields()
            .iter()
            .map(|f| (f.name.as_str(), f.field_type))
            .collect();
        assert_eq!(
            types,
            vec![
                ("_id", FieldType::Integer),
                ("email", FieldType::String),
                ("score", FieldType::Number),
                ("tag", FieldType::Json),
                ("extra", FieldType::Boolean),
            ]
        );
    }
}
