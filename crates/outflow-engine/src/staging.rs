//! CSV serialization of projected records for stage-then-load destinations.
//!
//! Layout: a header row, then one line per record with the object's fields
//! in definition order followed by the end-customer id column. String and
//! JSON values are always quoted with `"` doubled; other values use their
//! plain form; nulls and omitted values are empty.

use bytes::Bytes;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::Object;
use outflow_types::schema::{FieldType, Record};

/// Column layout of staged files for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvLayout {
    fields: Vec<(String, FieldType)>,
    end_customer_column: String,
}

fn quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

fn needs_quoting(raw: &str) -> bool {
    raw.contains([',', '"', '\n', '\r'])
}

fn encode_value(field_type: FieldType, value: Option<&serde_json::Value>) -> String {
    use serde_json::Value as J;
    match (field_type, value) {
        (_, None | Some(J::Null)) => String::new(),
        (FieldType::Json, Some(v)) => quote(&v.to_string()),
        (_, Some(J::String(s))) if field_type == FieldType::String || needs_quoting(s) => {
            quote(s)
        }
        (_, Some(J::String(s))) => s.clone(),
        (FieldType::String, Some(v)) => quote(&v.to_string()),
        (_, Some(v @ (J::Array(_) | J::Object(_)))) => quote(&v.to_string()),
        (_, Some(v)) => v.to_string(),
    }
}

impl CsvLayout {
    #[must_use]
    pub fn for_object(object: &Object) -> Self {
        Self {
            fields: object
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.field_type))
                .collect(),
            end_customer_column: object.end_customer_id_field.clone(),
        }
    }

    /// Destination columns in file order, end-customer column last.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|(name, _)| name.clone())
            .chain(std::iter::once(self.end_customer_column.clone()))
            .collect()
    }

    /// Encode one batch, header included.
    ///
    /// # Errors
    ///
    /// Returns an `internal` error if the CSV writer fails.
    pub fn encode(&self, records: &[Record], end_customer_id: i64) -> Result<Bytes> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Never)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        let encode_err = |e: csv::Error| ConnectorError::internal("CSV_ENCODE", e.to_string());

        writer.write_record(self.column_names()).map_err(encode_err)?;
        let customer = end_customer_id.to_string();
        for record in records {
            let line = self
                .fields
                .iter()
                .map(|(name, ty)| encode_value(*ty, record.get(name)))
                .chain(std::iter::once(customer.clone()));
            writer.write_record(line).map_err(encode_err)?;
        }

        let buf = writer
            .into_inner()
            .map_err(|e| ConnectorError::internal("CSV_ENCODE", e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}
