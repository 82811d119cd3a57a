use serde::{Deserialize, Serialize};

use crate::ProjectId;

/// Immutable descriptor of the repository event that produced a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    /// Project the repository is attached to.
    pub project_id: ProjectId,
    /// Provider-side repository identifier.
    pub repository_id: String,
    /// Human readable `owner/name` of the repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    /// Source provider (e.g. `"github"`).
    pub provider: String,
    /// Branch the event was pushed to.
    pub branch: String,
    /// Head commit of the push.
    pub head_commit: String,
}

impl JobMeta {
    /// Checks the fields a job cannot be scheduled without.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.project_id.trim().is_empty() {
            return Some("projectId");
        }
        if self.repository_id.trim().is_empty() {
            return Some("repositoryId");
        }
        if self.branch.trim().is_empty() {
            return Some("branch");
        }
        None
    }
}
