//! Dialect-neutral description of a replication read.
//!
//! The engine builds a [`SelectQuery`] from a sync definition; each client
//! renders it into its own query language via
//! [`WarehouseClient::render_select`](crate::WarehouseClient::render_select).

use outflow_types::error::{ConnectorError, Result};
use serde::{Deserialize, Serialize};

use crate::ident;

/// Incremental read predicate: rows strictly after `after`, ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFilter {
    pub field: String,
    /// Stored cursor literal; `None` on the first incremental run.
    pub after: Option<String>,
}

/// What to read: a table or a custom join, the columns in mapping order,
/// and an optional cursor predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub namespace: Option<String>,
    pub table: Option<String>,
    pub custom_join: Option<String>,
    pub columns: Vec<String>,
    pub cursor: Option<CursorFilter>,
}

impl SelectQuery {
    /// Column list with the cursor column appended when it is not mapped.
    #[must_use]
    pub fn select_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        if let Some(cursor) = &self.cursor {
            if !columns.contains(&cursor.field.as_str()) {
                columns.push(&cursor.field);
            }
        }
        columns
    }

    /// Render as ANSI-style SQL.
    ///
    /// A custom join is used verbatim when no cursor applies; with a cursor
    /// it is wrapped as a derived table so the predicate and ordering can be
    /// appended.
    ///
    /// # Errors
    ///
    /// Returns a `config` error for invalid identifiers or when neither a
    /// table nor a custom join is set.
    pub fn to_sql(&self) -> Result<String> {
        let mut sql = match &self.custom_join {
            Some(join) if self.cursor.is_none() => return Ok(join.trim().to_string()),
            Some(join) => format!("SELECT * FROM ({}) AS q", join.trim()),
            None => {
                let columns = self
                    .select_columns()
                    .into_iter()
                    .map(ident::validate)
                    .collect::<Result<Vec<_>>>()?;
                if columns.is_empty() {
                    return Err(ConnectorError::config(
                        "NO_COLUMNS",
                        "select requires at least one column",
                    ));
                }
                format!("SELECT {} FROM {}", columns.join(", "), self.from_target()?)
            }
        };

        if let Some(cursor) = &self.cursor {
            let field = ident::validate(&cursor.field)?;
            if let Some(after) = &cursor.after {
                sql.push_str(&format!(" WHERE {field} > {after}"));
            }
            sql.push_str(&format!(" ORDER BY {field} ASC"));
        }
        Ok(sql)
    }

    fn from_target(&self) -> Result<String> {
        match (&self.namespace, &self.table) {
            (Some(ns), Some(table)) => ident::qualified(ns, table),
            (None, Some(table)) => Ok(ident::validate(table)?.to_string()),
            _ => Err(ConnectorError::config(
                "NO_TABLE",
                "source has neither a table nor a custom join",
            )),
        }
    }
}

/// Decode a stored cursor literal back into a JSON scalar.
///
/// Quoted literals (`'…'` with `''` escapes) become strings; bare literals
/// become numbers when they parse as one.
#[must_use]
pub fn parse_cursor_literal(literal: &str) -> serde_json::Value {
    let trimmed = literal.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        let inner = &trimmed[1..trimmed.len() - 1];
        return serde_json::Value::String(inner.replace("''", "'"));
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map_or_else(
            || serde_json::Value::String(trimmed.to_string()),
            serde_json::Value::Number,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_query() -> SelectQuery {
        SelectQuery {
            namespace: Some("public".into()),
            table: Some("users".into()),
            columns: vec!["id".into(), "email".into()],
            ..SelectQuery::default()
        }
    }

    #[test]
    fn plain_select_keeps_mapping_order() {
        assert_eq!(
            table_query().to_sql().unwrap(),
            "SELECT id, email FROM public.users"
        );
    }

    #[test]
    fn first_incremental_run_orders_without_predicate() {
        let mut query = table_query();
        query.cursor = Some(CursorFilter {
            field: "id".into(),
            after: None,
        });
        assert_eq!(
            query.to_sql().unwrap(),
            "SELECT id, email FROM public.users ORDER BY id ASC"
        );
    }

    #[test]
    fn cursor_predicate_and_unmapped_cursor_column() {
        let mut query = table_query();
        query.cursor = Some(CursorFilter {
            field: "updated_at".into(),
            after: Some("'2024-01-01 00:00:00'".into()),
        });
        assert_eq!(
            query.to_sql().unwrap(),
            "SELECT id, email, updated_at FROM public.users \
             WHERE updated_at > '2024-01-01 00:00:00' ORDER BY updated_at ASC"
        );
    }

    #[test]
    fn custom_join_is_verbatim_without_cursor() {
        let query = SelectQuery {
            custom_join: Some("SELECT u.id FROM u JOIN o ON u.id = o.uid ".into()),
            columns: vec!["id".into()],
            ..SelectQuery::default()
        };
        assert_eq!(
            query.to_sql().unwrap(),
            "SELECT u.id FROM u JOIN o ON u.id = o.uid"
        );
    }

    #[test]
    fn custom_join_with_cursor_is_wrapped() {
        let query = SelectQuery {
            custom_join: Some("SELECT id FROM u".into()),
            columns: vec!["id".into()],
            cursor: Some(CursorFilter {
                field: "id".into(),
                after: Some("7".into()),
            }),
            ..SelectQuery::default()
        };
        assert_eq!(
            query.to_sql().unwrap(),
            "SELECT * FROM (SELECT id FROM u) AS q WHERE id > 7 ORDER BY id ASC"
        );
    }

    #[test]
    fn missing_table_is_config_error() {
        let query = SelectQuery {
            columns: vec!["id".into()],
            ..SelectQuery::default()
        };
        assert!(query.to_sql().is_err());
    }

    #[test]
    fn invalid_column_is_rejected() {
        let mut query = table_query();
        query.columns.push("email; DROP TABLE users".into());
        assert!(query.to_sql().is_err());
    }

    #[test]
    fn cursor_literals_decode() {
        assert_eq!(parse_cursor_literal("42"), serde_json::json!(42));
        assert_eq!(parse_cursor_literal("1.5"), serde_json::json!(1.5));
        assert_eq!(parse_cursor_literal("'O''Brien'"), serde_json::json!("O'Brien"));
        assert_eq!(parse_cursor_literal("''"), serde_json::json!(""));
    }
}
