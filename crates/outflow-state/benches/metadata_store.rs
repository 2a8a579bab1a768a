//! Criterion benchmarks for the `SQLite` metadata store.
//!
//! These measure the run lifecycle and cursor writes that happen on every
//! sync execution.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use outflow_state::prelude::*;

fn seed(store: &SqliteMetadataStore, org: &OrgId, syncs: usize) -> Vec<SyncId> {
    store
        .put_connection(
            org,
            &Connection {
                name: "wh".into(),
                connection_type: ConnectionType::Redshift,
                config: serde_json::json!({}),
            },
        )
        .unwrap();
    store
        .put_source(
            org,
            &Source {
                name: "src".into(),
                connection: "wh".into(),
                end_customer_id: 1,
                namespace: Some("public".into()),
                table_name: Some("users".into()),
                custom_join: None,
            },
        )
        .unwrap();
    let object = store
        .put_object(
            org,
            &Object {
                name: "obj".into(),
                destination: "dst".into(),
                namespace: "crm".into(),
                table_name: "contacts".into(),
                end_customer_id_field: "end_customer_id".into(),
                sync_mode: SyncMode::IncrementalAppend,
                cursor_field: None,
                primary_key: None,
                frequency: 1,
                frequency_units: FrequencyUnits::Hours,
                fields: vec![ObjectField {
                    id: None,
                    name: "id".into(),
                    field_type: FieldType::Integer,
                    display_name: None,
                    description: None,
                    nullable: false,
                }],
            },
        )
        .unwrap();
    let field_id = object.fields[0].id.unwrap();

    (0..syncs)
        .map(|i| {
            store
                .put_sync(
                    org,
                    &NewSync {
                        name: format!("sync_{i}"),
                        source: "src".into(),
                        object: "obj".into(),
                        end_customer_id: 1,
                        sync_mode: SyncMode::IncrementalAppend,
                        source_cursor_field: Some("id".into()),
                        frequency: 1,
                        frequency_units: FrequencyUnits::Hours,
                        custom_join: None,
                        field_mappings: vec![FieldMapping {
                            source_field_name: "id".into(),
                            source_field_type: FieldType::Integer,
                            destination_field_id: field_id,
                            is_json_field: false,
                        }],
                    },
                )
                .unwrap()
        })
        .collect()
}

fn bench_run_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/run_lifecycle");

    group.bench_function("start_and_commit", |b| {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let org = OrgId::new("bench");
        let sync = seed(&store, &org, 1)[0];
        let mut position = 0u64;

        b.iter(|| {
            let run = store
                .start_run(sync, "bench", Duration::from_secs(60))
                .unwrap()
                .run;
            position += 1;
            store
                .commit_run(run.id, 1000, Some(&position.to_string()))
                .unwrap();
        });
    });

    group.finish();
}

fn bench_set_cursor(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/set_cursor");

    for sync_count in [1, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("syncs", sync_count),
            &sync_count,
            |b, &sync_count| {
                let store = SqliteMetadataStore::in_memory().unwrap();
                let syncs = seed(&store, &OrgId::new("bench"), sync_count);
                let mut counter = 0u64;

                b.iter(|| {
                    for sync in &syncs {
                        store.set_cursor(*sync, Some(&counter.to_string())).unwrap();
                    }
                    counter += 1;
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_run_lifecycle, bench_set_cursor);
criterion_main!(benches);
