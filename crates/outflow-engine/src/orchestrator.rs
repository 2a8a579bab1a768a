//! Sync workflow: fetch config, start the run, replicate with retries, and
//! record the outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use outflow_types::error::ConnectorError;
use outflow_types::state::{OrgId, RunId, RunOutcome, RunStatus, SyncId};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::activities::Activities;
use crate::errors::{RetryPolicy, SyncError};

/// Summary of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncExecution {
    pub sync_id: SyncId,
    pub run_id: RunId,
    pub status: RunStatus,
    pub rows_read: u64,
    pub rows_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Replicate attempts, including the successful one.
    pub attempts: u32,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn timeout_error(activity: &str, timeout: Duration) -> SyncError {
    SyncError::Connector(ConnectorError::transient_network(
        "ACTIVITY_TIMEOUT",
        format!("{activity} did not finish within {timeout:?}"),
    ))
}

/// Run `op` under the policy's per-attempt timeout, retrying retryable
/// failures with exponential backoff.
///
/// Returns the final result and the number of attempts made.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    activity: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> (Result<T, SyncError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.activity_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(activity, policy.activity_timeout)),
        };

        match result {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.compute_backoff(&err, attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                if let Some(connector_err) = err.as_connector_error() {
                    tracing::warn!(
                        activity,
                        attempt,
                        max_attempts,
                        delay_ms,
                        category = %connector_err.category,
                        code = %connector_err.code,
                        "Retryable error, will retry"
                    );
                }
                tokio::select! {
                    () = cancel.cancelled() => return (Err(SyncError::Cancelled), attempt),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(activity, attempt, max_attempts, error = %err, "Max attempts exhausted");
                } else if !matches!(err, SyncError::Cancelled) {
                    tracing::error!(activity, attempt, error = %err, "Non-retryable error");
                }
                return (Err(err), attempt);
            }
        }
    }
}

/// Refresh cadence for a run lease; short enough that an external cancel
/// reaches the execution within a few seconds.
fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).clamp(Duration::from_millis(10), Duration::from_secs(5))
}

static EXECUTIONS: AtomicU64 = AtomicU64::new(0);

/// Lease owner token, unique per execution.
fn execution_owner() -> String {
    let seq = EXECUTIONS.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}:{}:{seq}",
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    )
}

/// Keep `owner`'s lease on `run` fresh. Resolves only once the lease is
/// lost, after cancelling `run_cancel`.
async fn hold_lease(
    activities: &Activities,
    run: RunId,
    owner: &str,
    run_cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval(activities.run_lease()));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match activities.heartbeat(run, owner).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(run_id = %run, "Run lease lost, cancelling execution");
                run_cancel.cancel();
                return;
            }
            Err(err) => tracing::warn!(run_id = %run, error = %err, "Run heartbeat failed"),
        }
    }
}

/// Execute one sync end to end.
///
/// The execution owns its run through a heartbeat lease. When the sync's
/// active run is held by another live execution nothing is replicated and
/// [`SyncError::RunInProgress`] is returned. If the run is finished or taken
/// over elsewhere while replicating, the execution stops and reports
/// `Cancelled` without committing its cursor.
///
/// Replication failures and cancellation are recorded on the run and
/// reported through [`SyncExecution::status`]; `Err` is returned only when
/// no run could be claimed or its outcome could not be recorded.
///
/// # Errors
///
/// Returns [`SyncError::RunInProgress`], or the error from `fetch_config`,
/// `start_sync`, or recording the outcome.
pub async fn execute_sync(
    activities: &Activities,
    org: &OrgId,
    sync: SyncId,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<SyncExecution, SyncError> {
    let started = std::time::Instant::now();
    let owner = execution_owner();

    let (config, _) = with_retry(policy, "fetch_config", cancel, |_| {
        activities.fetch_config(org, sync)
    })
    .await;
    let config = config?;
    let (claim, _) = with_retry(policy, "start_sync", cancel, |_| {
        activities.start_sync(org, sync, &owner)
    })
    .await;
    let claim = claim?;
    if !claim.is_owned() {
        return Err(SyncError::RunInProgress(claim.run.id));
    }
    let run = claim.run;

    let run_cancel = cancel.child_token();
    let replicate = with_retry(policy, "replicate", &run_cancel, |attempt| {
        tracing::info!(sync_id = %sync, run_id = %run.id, attempt, "Replicate attempt");
        activities.replicate(&config, &run, &run_cancel)
    });
    tokio::pin!(replicate);
    let finished = tokio::select! {
        out = &mut replicate => Some(out),
        () = hold_lease(activities, run.id, &owner, &run_cancel) => None,
    };
    let lease_lost = finished.is_none();
    let (replicated, attempts) = match finished {
        Some(out) => out,
        None => replicate.await,
    };

    let mut execution = SyncExecution {
        sync_id: sync,
        run_id: run.id,
        status: RunStatus::Succeeded,
        rows_read: 0,
        rows_written: 0,
        cursor: None,
        attempts,
        duration_secs: 0.0,
        error: None,
    };

    match replicated {
        _ if lease_lost => mark_lost(&mut execution),
        Ok(output) => {
            execution.rows_read = output.rows_read;
            execution.rows_written = output.rows_written;
            // The lease may have lapsed since the last heartbeat.
            let committed = activities.heartbeat(run.id, &owner).await?
                && activities
                    .record_status(
                        run.id,
                        RunOutcome::Succeeded {
                            rows_written: output.rows_written,
                        },
                        output.cursor.clone(),
                    )
                    .await?;
            if committed {
                execution.cursor = output.cursor.or(config.sync.cursor_position.clone());
            } else {
                mark_lost(&mut execution);
            }
        }
        Err(SyncError::Cancelled) => {
            activities.cleanup(run.id).await?;
            execution.status = RunStatus::Cancelled;
            execution.error = Some(SyncError::Cancelled.to_string());
        }
        Err(err) => {
            let error = err.to_string();
            let recorded = activities
                .record_status(
                    run.id,
                    RunOutcome::Failed {
                        rows_written: 0,
                        error: error.clone(),
                    },
                    None,
                )
                .await?;
            if recorded {
                execution.status = RunStatus::Failed;
                execution.error = Some(error);
            } else {
                mark_lost(&mut execution);
            }
        }
    }

    execution.duration_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        sync_id = %sync,
        run_id = %run.id,
        status = %execution.status,
        rows = execution.rows_written,
        attempts,
        duration_secs = execution.duration_secs,
        "Sync execution finished"
    );
    Ok(execution)
}

/// The run was finished or taken over by another actor: nothing of this
/// execution was committed.
fn mark_lost(execution: &mut SyncExecution) {
    execution.status = RunStatus::Cancelled;
    execution.cursor = None;
    execution.error = Some(format!(
        "run {} was finished or taken over elsewhere; cursor not committed",
        execution.run_id
    ));
}
