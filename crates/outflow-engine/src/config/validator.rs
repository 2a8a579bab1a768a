//! Semantic validation for parsed manifests.

use std::collections::HashSet;

use anyhow::{bail, Result};
use outflow_types::model::{ConnectionType, Object};
use outflow_types::schema::FieldType;
use outflow_warehouse::ident;

use crate::config::types::{EngineConfig, Manifest, SyncManifest};

fn check_unique<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a str>,
    errors: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            errors.push(format!("{kind} with an empty name"));
        } else if !seen.insert(name) {
            errors.push(format!("Duplicate {kind} name '{name}'"));
        }
    }
}

fn validate_engine(engine: &EngineConfig, errors: &mut Vec<String>) {
    if engine.read_batch_size == 0 {
        errors.push("engine.read_batch_size must be at least 1".to_string());
    }
    if engine.write_batch_size == 0 {
        errors.push("engine.write_batch_size must be at least 1".to_string());
    }
    if engine.channel_capacity == 0 {
        errors.push("engine.channel_capacity must be at least 1".to_string());
    }
    if engine.activity_timeout_secs == 0 {
        errors.push("engine.activity_timeout_secs must be > 0".to_string());
    }
    if engine.run_lease_secs == 0 {
        errors.push("engine.run_lease_secs must be > 0".to_string());
    }
    let rate = &engine.rate_limit;
    if !rate.requests_per_second.is_finite() || rate.requests_per_second < 0.0 {
        errors.push("engine.rate_limit.requests_per_second must be >= 0".to_string());
    }
    if rate.requests_per_second > 0.0 && rate.burst == 0 {
        errors.push("engine.rate_limit.burst must be at least 1".to_string());
    }
    let retry = &engine.retry;
    if retry.max_attempts == 0 {
        errors.push("engine.retry.max_attempts must be at least 1".to_string());
    }
    if retry.backoff_coefficient.is_nan() || retry.backoff_coefficient < 1.0 {
        errors.push(format!(
            "engine.retry.backoff_coefficient must be >= 1, got {}",
            retry.backoff_coefficient
        ));
    }
    if retry.max_interval_ms < retry.initial_interval_ms {
        errors.push(
            "engine.retry.max_interval_ms must not be below initial_interval_ms".to_string(),
        );
    }
}

fn validate_object(object: &Object, manifest: &Manifest, errors: &mut Vec<String>) {
    let ctx = format!("Object '{}'", object.name);
    if manifest.destination(&object.destination).is_none() {
        errors.push(format!(
            "{ctx} references unknown destination '{}'",
            object.destination
        ));
    }
    if ident::validate(&object.namespace).is_err() || ident::validate(&object.table_name).is_err()
    {
        errors.push(format!(
            "{ctx} has an invalid namespace or table '{}.{}'",
            object.namespace, object.table_name
        ));
    }
    if ident::validate(&object.end_customer_id_field).is_err() {
        errors.push(format!(
            "{ctx} has an invalid end_customer_id_field '{}'",
            object.end_customer_id_field
        ));
    }
    if object.fields.is_empty() {
        errors.push(format!("{ctx} must define at least one field"));
    }
    check_unique(
        &format!("{ctx} field"),
        object.fields.iter().map(|f| f.name.as_str()),
        errors,
    );
    for field in &object.fields {
        if ident::validate(&field.name).is_err() {
            errors.push(format!("{ctx} field '{}' is not a valid identifier", field.name));
        }
        if field.name == object.end_customer_id_field {
            errors.push(format!(
                "{ctx} field '{}' collides with the end customer id column",
                field.name
            ));
        }
    }
    if object.frequency == 0 {
        errors.push(format!("{ctx} frequency must be at least 1"));
    }
    if object.sync_mode.uses_cursor() && object.cursor_field.is_none() {
        errors.push(format!(
            "{ctx} uses {} but has no cursor_field",
            object.sync_mode
        ));
    }
}

fn validate_sync(sync: &SyncManifest, manifest: &Manifest, errors: &mut Vec<String>) {
    let ctx = format!("Sync '{}'", sync.name);
    let source = manifest.source(&sync.source);
    if source.is_none() {
        errors.push(format!("{ctx} references unknown source '{}'", sync.source));
    }
    let Some(object) = manifest.object(&sync.object) else {
        errors.push(format!("{ctx} references unknown object '{}'", sync.object));
        return;
    };

    let mode = sync.effective_mode(object);
    if mode.uses_cursor() && sync.effective_cursor_field(object).is_none() {
        errors.push(format!("{ctx} uses {mode} sync but has no cursor field"));
    }
    if sync.frequency == Some(0) {
        errors.push(format!("{ctx} frequency must be at least 1"));
    }
    if let Some(source) = source {
        let has_join = sync.custom_join.is_some() || source.custom_join.is_some();
        if !has_join && source.table_name.is_none() {
            errors.push(format!(
                "{ctx} reads from source '{}' which has neither a table nor a custom join",
                source.name
            ));
        }
    }

    if sync.mappings.is_empty() {
        errors.push(format!("{ctx} must define at least one mapping"));
    }
    let mut scalar_targets = HashSet::new();
    for mapping in &sync.mappings {
        let Some(field) = object.field_by_name(&mapping.destination_field) else {
            errors.push(format!(
                "{ctx} maps '{}' to unknown field '{}' of object '{}'",
                mapping.source_field, mapping.destination_field, object.name
            ));
            continue;
        };
        if mapping.is_json_field && field.field_type != FieldType::Json {
            errors.push(format!(
                "{ctx} maps '{}' as JSON into field '{}' of type {}",
                mapping.source_field, field.name, field.field_type
            ));
        }
        if !mapping.is_json_field && !scalar_targets.insert(field.name.as_str()) {
            errors.push(format!(
                "{ctx} maps more than one scalar column into field '{}'",
                field.name
            ));
        }
    }
}

/// Validate a parsed manifest.
///
/// Returns `Ok(())` if valid, Err listing every problem found if not.
///
/// # Errors
///
/// Returns an error listing all validation failures.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    let mut errors = Vec::new();

    if manifest.version != "1.0" {
        errors.push(format!(
            "Unsupported manifest version '{}', expected '1.0'",
            manifest.version
        ));
    }
    if manifest.organization.trim().is_empty() {
        errors.push("Organization must not be empty".to_string());
    }
    validate_engine(&manifest.engine, &mut errors);

    check_unique(
        "connection",
        manifest.connections.iter().map(|c| c.name.as_str()),
        &mut errors,
    );
    check_unique(
        "source",
        manifest.sources.iter().map(|s| s.name.as_str()),
        &mut errors,
    );
    check_unique(
        "destination",
        manifest.destinations.iter().map(|d| d.name.as_str()),
        &mut errors,
    );
    check_unique(
        "object",
        manifest.objects.iter().map(|o| o.name.as_str()),
        &mut errors,
    );
    check_unique(
        "sync",
        manifest.syncs.iter().map(|s| s.name.as_str()),
        &mut errors,
    );

    for source in &manifest.sources {
        match manifest.connection(&source.connection) {
            None => errors.push(format!(
                "Source '{}' references unknown connection '{}'",
                source.name, source.connection
            )),
            Some(conn) if conn.connection_type == ConnectionType::Webhook => errors.push(format!(
                "Source '{}' uses webhook connection '{}', which cannot be read from",
                source.name, conn.name
            )),
            Some(_) => {}
        }
    }

    for destination in &manifest.destinations {
        let ctx = format!("Destination '{}'", destination.name);
        match manifest.connection(&destination.connection) {
            None => errors.push(format!(
                "{ctx} references unknown connection '{}'",
                destination.connection
            )),
            Some(conn) => match conn.connection_type {
                ConnectionType::BigQuery | ConnectionType::Redshift => {
                    if destination
                        .staging_bucket
                        .as_deref()
                        .map_or(true, |b| b.trim().is_empty())
                    {
                        errors.push(format!(
                            "{ctx} uses {} and requires a staging_bucket",
                            conn.connection_type
                        ));
                    }
                }
                ConnectionType::Webhook => {}
                other => errors.push(format!(
                    "{ctx} uses {other} connection '{}', which cannot be written to",
                    conn.name
                )),
            },
        }
    }

    for object in &manifest.objects {
        validate_object(object, manifest, &mut errors);
    }
    for sync in &manifest.syncs {
        validate_sync(sync, manifest, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "Manifest validation failed:\n  - {}",
            errors.join("\n  - ")
        )
    }
}
