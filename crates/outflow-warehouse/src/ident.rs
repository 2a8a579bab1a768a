//! Identifier validation for generated queries.
//!
//! Identifiers are interpolated unquoted, so anything outside the plain
//! identifier alphabet is rejected up front as a configuration error.

use std::sync::LazyLock;

use outflow_types::error::{ConnectorError, Result};
use regex::Regex;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("valid regex"));

/// Validate a single identifier.
///
/// # Errors
///
/// Returns a `config` error when `name` is not a plain identifier.
pub fn validate(name: &str) -> Result<&str> {
    if IDENT_RE.is_match(name) {
        Ok(name)
    } else {
        Err(ConnectorError::config(
            "INVALID_IDENTIFIER",
            format!("'{name}' is not a valid identifier"),
        ))
    }
}

/// Validate a dot-separated name such as `schema.table`.
///
/// # Errors
///
/// Returns a `config` error when any part is not a plain identifier.
pub fn validate_qualified(name: &str) -> Result<&str> {
    for part in name.split('.') {
        validate(part).map_err(|_| {
            ConnectorError::config(
                "INVALID_IDENTIFIER",
                format!("'{name}' is not a valid qualified name"),
            )
        })?;
    }
    Ok(name)
}

/// `namespace.table`, both parts validated.
///
/// # Errors
///
/// Returns a `config` error when either part is invalid.
pub fn qualified(namespace: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", validate(namespace)?, validate(table)?))
}
