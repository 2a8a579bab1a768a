//! Sync error model and retry backoff policy.

use std::time::Duration;

use outflow_state::StateError;
use outflow_types::error::ConnectorError;
use outflow_types::state::RunId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SyncError: categorised errors for retry decisions
// ---------------------------------------------------------------------------

/// Categorized sync error for retry decisions.
///
/// `Connector` wraps a typed [`ConnectorError`] carrying its own `retryable`
/// flag. Everything else is host-side and never retried by the loop.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Typed warehouse or pipeline error with retry metadata.
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    /// Metadata store failure.
    #[error("metadata store: {0}")]
    Store(#[from] StateError),
    /// The execution was cancelled before it finished.
    #[error("sync cancelled")]
    Cancelled,
    /// The sync's active run is owned by another live execution.
    #[error("run {0} is held by another live execution")]
    RunInProgress(RunId),
    /// Join failures, panics, timeouts and other host-side errors.
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl SyncError {
    /// Returns `true` if this is a connector error marked retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connector(e) => e.retryable,
            Self::Store(_) | Self::Cancelled | Self::RunInProgress(_) | Self::Infrastructure(_) => {
                false
            }
        }
    }

    #[must_use]
    pub fn as_connector_error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Connector(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Activity retry policy: exponential backoff capped at `max_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Upper bound on a single attempt.
    pub activity_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 3,
            activity_timeout: Duration::from_secs(3_600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// A server-provided `retry_after_ms` on the error wins when present.
    #[must_use]
    pub fn compute_backoff(&self, err: &SyncError, attempt: u32) -> Duration {
        if let Some(ms) = err.as_connector_error().and_then(|e| e.retry_after_ms) {
            return Duration::from_millis(ms).min(self.max_interval);
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let delay = self.initial_interval.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(delay)
    }
}
