//! Identifiers and sync-run bookkeeping types.
//!
//! Pure data shared by the metadata store and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Owning organization (tenant) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OrgId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OrgId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            #[must_use]
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Primary key of a persisted sync.
    SyncId
);
row_id!(
    /// Primary key of a sync run.
    RunId
);
row_id!(
    /// Primary key of a destination object field.
    ObjectFieldId
);

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Lifecycle state of a sync run.
///
/// `Queued` and `Started` are active; the other three are terminal and a
/// run never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw {
            "queued" => Self::Queued,
            "started" => Self::Started,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: RunId,
    pub sync_id: SyncId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cursor position the run started reading from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_before: Option<String>,
    /// Cursor position committed together with a successful outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<String>,
}

/// How `start_run` came to hand out a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lease {
    /// No run was active; a new one was created for the caller.
    Created,
    /// The active run's owner stopped heartbeating and the caller took it over.
    TakenOver,
    /// The active run belongs to a live execution and was left untouched.
    Held,
}

/// A run returned by `start_run` together with the caller's claim on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunClaim {
    pub run: SyncRun,
    pub lease: Lease,
}

impl RunClaim {
    /// Whether the caller may replicate under this run.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        !matches!(self.lease, Lease::Held)
    }
}

/// Terminal outcome reported by `RecordStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { rows_written: u64 },
    Failed { rows_written: u64, error: String },
}

impl RunOutcome {
    #[must_use]
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Succeeded { .. } => RunStatus::Succeeded,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }

    #[must_use]
    pub fn rows_written(&self) -> u64 {
        match self {
            Self::Succeeded { rows_written } | Self::Failed { rows_written, .. } => *rows_written,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}
