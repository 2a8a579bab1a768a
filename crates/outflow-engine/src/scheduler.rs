//! In-process scheduler: one task loop per sync.
//!
//! Each loop fires every `frequency * units` and on demand. A loop runs one
//! execution at a time, so a run-now request made while a run is in flight
//! queues behind it. Executions are identified by a per-workflow sequence
//! qualifier (`<workflow_id>/<n>`) that `cancel` can target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use outflow_types::model::SyncDefinition;
use outflow_types::state::{OrgId, SyncId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::activities::Activities;
use crate::errors::RetryPolicy;
use crate::orchestrator::{execute_sync, SyncExecution};

const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no scheduled sync with workflow id '{0}'")]
    UnknownWorkflow(String),
    #[error("workflow '{0}' is already scheduled")]
    AlreadyScheduled(String),
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Outcome of one scheduled execution, broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub workflow_id: String,
    pub qualifier: String,
    pub result: Result<SyncExecution, String>,
}

struct ActiveExecution {
    qualifier: String,
    cancel: CancellationToken,
}

struct ScheduledSync {
    trigger: mpsc::Sender<()>,
    active: Arc<Mutex<Option<ActiveExecution>>>,
}

pub struct Scheduler {
    activities: Arc<Activities>,
    org: OrgId,
    policy: RetryPolicy,
    syncs: Mutex<HashMap<String, ScheduledSync>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    reports: broadcast::Sender<ExecutionReport>,
}

impl Scheduler {
    #[must_use]
    pub fn new(activities: Arc<Activities>, org: OrgId, policy: RetryPolicy) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            activities,
            org,
            policy,
            syncs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
            reports,
        }
    }

    /// Receive a report after every execution.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionReport> {
        self.reports.subscribe()
    }

    /// Start the loop for one sync. The first scheduled run fires one
    /// period from now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyScheduled`] for a duplicate workflow
    /// id, or [`SchedulerError::ShutDown`].
    pub fn schedule(&self, sync: &SyncDefinition) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let mut syncs = self.syncs.lock().unwrap_or_else(PoisonError::into_inner);
        if syncs.contains_key(&sync.workflow_id) {
            return Err(SchedulerError::AlreadyScheduled(sync.workflow_id.clone()));
        }

        let (trigger, trigger_rx) = mpsc::channel(1);
        let active = Arc::new(Mutex::new(None));
        let period = sync.period().max(MIN_PERIOD);
        let sync_loop = SyncLoop {
            activities: Arc::clone(&self.activities),
            org: self.org.clone(),
            policy: self.policy.clone(),
            sync_id: sync.id,
            workflow_id: sync.workflow_id.clone(),
            period,
            trigger: trigger_rx,
            active: Arc::clone(&active),
            shutdown: self.shutdown.clone(),
            reports: self.reports.clone(),
        };
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(sync_loop.run());

        tracing::info!(
            sync_id = %sync.id,
            workflow_id = %sync.workflow_id,
            period_secs = period.as_secs(),
            "Scheduled sync"
        );
        syncs.insert(sync.workflow_id.clone(), ScheduledSync { trigger, active });
        Ok(())
    }

    /// Fire an execution now without changing the cadence. A request made
    /// while another is already queued is coalesced with it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownWorkflow`] or
    /// [`SchedulerError::ShutDown`].
    pub fn trigger_now(&self, workflow_id: &str) -> Result<(), SchedulerError> {
        let syncs = self.syncs.lock().unwrap_or_else(PoisonError::into_inner);
        let scheduled = syncs
            .get(workflow_id)
            .ok_or_else(|| SchedulerError::UnknownWorkflow(workflow_id.to_string()))?;
        match scheduled.trigger.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SchedulerError::ShutDown),
        }
    }

    /// Cancel the in-flight execution of a workflow. An empty `qualifier`
    /// matches whichever execution is active.
    ///
    /// Returns `false` when nothing matching is running.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownWorkflow`].
    pub fn cancel(&self, workflow_id: &str, qualifier: &str) -> Result<bool, SchedulerError> {
        let syncs = self.syncs.lock().unwrap_or_else(PoisonError::into_inner);
        let scheduled = syncs
            .get(workflow_id)
            .ok_or_else(|| SchedulerError::UnknownWorkflow(workflow_id.to_string()))?;
        let active = scheduled.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(execution) if qualifier.is_empty() || execution.qualifier == qualifier => {
                tracing::info!(
                    workflow_id,
                    qualifier = %execution.qualifier,
                    "Cancelling execution"
                );
                execution.cancel.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Qualifier of the workflow's in-flight execution, if any.
    #[must_use]
    pub fn active_execution(&self, workflow_id: &str) -> Option<String> {
        let syncs = self.syncs.lock().unwrap_or_else(PoisonError::into_inner);
        let scheduled = syncs.get(workflow_id)?;
        let active = scheduled.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().map(|e| e.qualifier.clone())
    }

    /// Stop every loop, cancelling in-flight executions, and wait for them
    /// to record their outcome.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Scheduler task failed");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

struct SyncLoop {
    activities: Arc<Activities>,
    org: OrgId,
    policy: RetryPolicy,
    sync_id: SyncId,
    workflow_id: String,
    period: Duration,
    trigger: mpsc::Receiver<()>,
    active: Arc<Mutex<Option<ActiveExecution>>>,
    shutdown: CancellationToken,
    reports: broadcast::Sender<ExecutionReport>,
}

impl SyncLoop {
    async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence = 0u64;

        loop {
            let reason = tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => "schedule",
                Some(()) = self.trigger.recv() => "trigger",
            };
            sequence += 1;
            let qualifier = format!("{}/{sequence}", self.workflow_id);
            let cancel = self.shutdown.child_token();
            *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveExecution {
                qualifier: qualifier.clone(),
                cancel: cancel.clone(),
            });
            tracing::info!(
                sync_id = %self.sync_id,
                workflow_id = %self.workflow_id,
                qualifier = %qualifier,
                reason,
                "Starting execution"
            );

            let result =
                execute_sync(&self.activities, &self.org, self.sync_id, &self.policy, &cancel)
                    .await;
            *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;

            if let Err(e) = &result {
                tracing::error!(sync_id = %self.sync_id, error = %e, "Execution failed");
            }
            // No subscribers is fine.
            let _ = self.reports.send(ExecutionReport {
                workflow_id: self.workflow_id.clone(),
                qualifier,
                result: result.map_err(|e| e.to_string()),
            });
        }
    }
}
