//! Scheduler behaviour over the in-memory warehouse.

mod common;

use std::time::Duration;

use common::{fast_policy, staged_manifest, Harness, MemoryWarehouse};
use outflow_engine::{Scheduler, SchedulerError};
use outflow_types::state::RunStatus;

fn scheduler(h: &Harness) -> (Scheduler, String) {
    let scheduler = Scheduler::new(h.activities.clone(), h.org.clone(), fast_policy());
    let syncs = h.store.list_syncs(&h.org).unwrap();
    scheduler.schedule(&syncs[0]).unwrap();
    (scheduler, syncs[0].workflow_id.clone())
}

#[tokio::test]
async fn test_trigger_now_runs_once_and_reports() {
    let h = Harness::new(
        &staged_manifest("full_overwrite"),
        MemoryWarehouse::with_users(&[(1, "ada@example.com")]),
    );
    let (scheduler, workflow_id) = scheduler(&h);
    let mut reports = scheduler.subscribe();

    scheduler.trigger_now(&workflow_id).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.workflow_id, workflow_id);
    assert_eq!(report.qualifier, format!("{workflow_id}/1"));
    let execution = report.result.unwrap();
    assert_eq!(execution.status, RunStatus::Succeeded);
    assert_eq!(execution.rows_written, 1);
    assert_eq!(h.warehouse.loaded("crm.contacts").len(), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_in_flight_execution() {
    let warehouse = MemoryWarehouse::with_users(&[(1, "ada@example.com"), (2, "bob@example.com")]);
    warehouse.set_row_delay(Duration::from_millis(500));
    let h = Harness::new(&staged_manifest("full_append"), warehouse);
    let (scheduler, workflow_id) = scheduler(&h);
    let mut reports = scheduler.subscribe();

    assert!(!scheduler.cancel(&workflow_id, "").unwrap(), "nothing is running yet");
    scheduler.trigger_now(&workflow_id).unwrap();

    let mut active = None;
    for _ in 0..100 {
        active = scheduler.active_execution(&workflow_id);
        if active.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let qualifier = active.expect("execution should start");
    assert!(!scheduler.cancel(&workflow_id, "other/9").unwrap());
    assert!(scheduler.cancel(&workflow_id, &qualifier).unwrap());

    let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.result.unwrap().status, RunStatus::Cancelled);
    assert!(scheduler.active_execution(&workflow_id).is_none());
    assert!(h.store.active_run(h.sync_id).unwrap().is_none());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unknown_and_duplicate_workflows() {
    let h = Harness::new(
        &staged_manifest("full_append"),
        MemoryWarehouse::with_users(&[]),
    );
    let (scheduler, _) = scheduler(&h);

    assert!(matches!(
        scheduler.trigger_now("missing"),
        Err(SchedulerError::UnknownWorkflow(_))
    ));
    assert!(matches!(
        scheduler.cancel("missing", ""),
        Err(SchedulerError::UnknownWorkflow(_))
    ));
    let syncs = h.store.list_syncs(&h.org).unwrap();
    assert!(matches!(
        scheduler.schedule(&syncs[0]),
        Err(SchedulerError::AlreadyScheduled(_))
    ));

    scheduler.shutdown().await;
    assert!(matches!(
        scheduler.schedule(&syncs[0]),
        Err(SchedulerError::ShutDown)
    ));
}
