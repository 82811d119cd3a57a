use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Lifecycle state of one job attempt.
///
/// ```text
/// Queued ──► Running ──► Successful
///   │           ├──────► Failed
///   │           └──────► Cancelled
///   └──────────────────► Cancelled
/// ```
///
/// Terminal states never transition within the same attempt; only a retry
/// (which opens a new attempt) brings a job back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Job is accepted and waiting for execution.
    Queued,
    /// A worker is executing the job.
    Running,
    /// Execution finished and produced its assets.
    Successful,
    /// Execution finished with an error.
    Failed,
    /// Job was cancelled before it finished.
    Cancelled,
}

impl JobStatus {
    /// Returns `true` if the attempt is finished (won't transition further).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns `true` if the attempt is still queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Returns `true` if a retry may open a new attempt from this state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether `self -> next` is an edge of the per-attempt state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Successful)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "successful" | "success" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            _ => Err(ModelError::InvalidStatus(s.to_string())),
        }
    }
}
