use std::{collections::BTreeMap, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{Attempt, JobId, JobMeta, JobStatus, LogResourceId};

/// Full record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Status of the current attempt.
    pub status: JobStatus,
    /// Repository event the job was submitted for.
    pub meta: JobMeta,
    /// Log resources of every attempt, keyed by resource id.
    #[serde(default)]
    pub logs: BTreeMap<LogResourceId, LogRef>,
    /// Produced assets (name -> content address), set on success only.
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
    /// How many times the job was re-queued.
    pub retry_count: u32,
    /// Current attempt (starts at 1).
    pub attempt: Attempt,
    /// When the job was submitted.
    #[serde(with = "time_serde")]
    pub created_at: SystemTime,
    /// When the job last changed.
    #[serde(with = "time_serde")]
    pub updated_at: SystemTime,
    /// Last failure reason of the current attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Fresh job for a submission: queued, first attempt, no logs.
    pub fn queued(id: JobId, meta: JobMeta) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            status: JobStatus::Queued,
            meta,
            logs: BTreeMap::new(),
            assets: BTreeMap::new(),
            retry_count: 0,
            attempt: 1,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Log resources written by the given attempt.
    pub fn logs_of(&self, attempt: Attempt) -> impl Iterator<Item = (&LogResourceId, &LogRef)> {
        self.logs.iter().filter(move |(_, r)| r.attempt == attempt)
    }
}

/// Reference to one log segment of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRef {
    /// Attempt that owns the segment.
    pub attempt: Attempt,
    /// Lines appended so far.
    pub lines: u64,
}

/// Status report for one attempt, optionally carrying outcome data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    /// Only applied when `status` is [`JobStatus::Successful`].
    pub assets: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            assets: BTreeMap::new(),
            error: None,
        }
    }

    pub fn successful(assets: BTreeMap<String, String>) -> Self {
        Self {
            status: JobStatus::Successful,
            assets,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            assets: BTreeMap::new(),
            error: Some(reason.into()),
        }
    }
}

mod time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        since_epoch.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}
