//! Integration tests for manifest parsing, validation, and apply.
//!
//! These tests run the full path from YAML fixture through validation into
//! an in-memory metadata store.

use std::path::PathBuf;

use outflow_engine::config::apply::{apply_manifest, resolve_sync};
use outflow_engine::config::parser;
use outflow_engine::config::types::StateBackendKind;
use outflow_engine::config::validator;
use outflow_state::{MetadataStore, SqliteMetadataStore};
use outflow_types::model::{ConnectionType, SyncMode};
use outflow_types::schema::FieldType;
use outflow_types::state::OrgId;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn set_fixture_env() {
    std::env::set_var("OF_FIXTURE_SNOWFLAKE_ACCOUNT", "xy12345.us-east-1");
    std::env::set_var("OF_FIXTURE_GCP_CREDENTIALS", "{}");
}

#[test]
fn test_parse_and_validate_fixture_manifest() {
    set_fixture_env();
    let manifest = parser::parse_manifest(&fixture("snowflake_to_bigquery.yaml"))
        .expect("Failed to parse fixture manifest");

    assert_eq!(manifest.organization, "acme");
    assert_eq!(manifest.state.backend, StateBackendKind::Sqlite);
    assert_eq!(manifest.engine.write_batch_size, 5000);
    assert_eq!(manifest.engine.read_batch_size, 1000, "defaults fill the rest");
    assert_eq!(manifest.engine.retry.max_attempts, 5);
    assert_eq!(manifest.connections[0].connection_type, ConnectionType::Snowflake);
    assert_eq!(manifest.connections[0].config["account"], "xy12345.us-east-1");
    assert_eq!(manifest.connections[1].connection_type, ConnectionType::BigQuery);
    assert_eq!(manifest.objects[0].fields[2].field_type, FieldType::TimestampTz);
    assert!(!manifest.objects[0].fields[0].nullable);
    assert!(manifest.objects[0].fields[1].nullable);

    validator::validate_manifest(&manifest).expect("Validation should pass");

    let policy = manifest.engine.retry_policy();
    assert_eq!(policy.max_attempts, 5);
    let options = manifest.engine.pipeline_options();
    assert_eq!(options.rate_limit.burst, 4);
}

#[test]
fn test_fixture_applies_into_store() {
    set_fixture_env();
    let manifest = parser::parse_manifest(&fixture("snowflake_to_bigquery.yaml")).unwrap();
    let store = SqliteMetadataStore::in_memory().unwrap();
    apply_manifest(&store, &manifest).unwrap();

    let org = OrgId::new("acme");
    let id = resolve_sync(&store, &org, "accounts-to-bq").unwrap();
    let config = store.load_sync_config(&org, id).unwrap();
    assert_eq!(config.sync.sync_mode, SyncMode::IncrementalUpdate);
    assert_eq!(config.sync.source_cursor_field.as_deref(), Some("UPDATED_AT"));
    assert_eq!(config.sync.end_customer_id, 1001);
    assert_eq!(config.sync.field_mappings.len(), 5);
    assert_eq!(
        config.sync.field_mappings[3].destination_field_id,
        config.sync.field_mappings[4].destination_field_id,
        "both JSON mappings land in properties"
    );
    assert_eq!(config.destination.staging_bucket.as_deref(), Some("outflow-staging-1001"));
    assert_eq!(config.destination_connection.connection_type, ConnectionType::BigQuery);
    assert_eq!(config.sync.period(), std::time::Duration::from_secs(30 * 60));
}

#[test]
fn test_invalid_fixture_reports_every_problem() {
    let manifest = parser::parse_manifest(&fixture("invalid_manifest.yaml")).unwrap();
    let err = validator::validate_manifest(&manifest)
        .unwrap_err()
        .to_string();

    assert!(err.starts_with("Manifest validation failed:"), "{err}");
    assert!(err.contains("cannot be read from"), "{err}");
    assert!(err.contains("requires a staging_bucket"), "{err}");
    assert!(err.contains("has no cursor_field"), "{err}");
    assert!(err.contains("neither a table nor a custom join"), "{err}");
    assert!(err.contains("unknown field 'missing_field'"), "{err}");
}

#[test]
fn test_unknown_connection_type_fails_at_parse_time() {
    let result = parser::parse_manifest(&fixture("bad_enum.yaml"));
    let err = format!("{:#}", result.unwrap_err());
    assert!(
        err.contains("unknown variant") && err.contains("Failed to parse manifest YAML"),
        "Expected serde enum parse error, got: {err}"
    );
}

#[test]
fn test_missing_env_var_is_reported() {
    std::env::remove_var("OF_FIXTURE_UNSET_VAR");
    let err = parser::parse_manifest_str("version: ${OF_FIXTURE_UNSET_VAR}")
        .unwrap_err()
        .to_string();
    assert!(err.contains("OF_FIXTURE_UNSET_VAR"));
}
