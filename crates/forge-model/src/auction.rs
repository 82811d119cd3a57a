use std::{
    collections::BTreeMap,
    fmt::{self, Write as _},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Attempt, JobId, ModelError};

/// Whether an auction announces a need or withdraws it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuctionKind {
    New,
    Cancel,
}

/// Category of backend resource an auction asks for.
///
/// Each kind has its own pub/sub topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Database,
    Storage,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Database, ResourceKind::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Storage => "storage",
        }
    }

    /// Pub/sub topic auctions of this kind are published on.
    pub fn topic(&self) -> String {
        format!("forge.auction.{}", self.as_str())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(ResourceKind::Database),
            "storage" => Ok(ResourceKind::Storage),
            _ => Err(ModelError::InvalidResourceKind(s.to_string())),
        }
    }
}

/// Deterministic dedup key of a resource need.
///
/// Hex SHA-256 over the length-prefixed `(config, application, project, branch)`
/// tuple, so no choice of separator characters can make two tuples collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn derive(config_id: &str, application_id: &str, project_id: &str, branch: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [config_id, application_id, project_id, branch] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }

        let mut hex = String::with_capacity(64);
        for byte in hasher.finalize() {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Wraps an already derived signature (e.g. one read off the wire).
impl From<String> for Signature {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Signature {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The configuration a resource need was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSubject {
    pub config_id: String,
    pub application_id: String,
    pub project_id: String,
    pub branch: String,
}

impl AuctionSubject {
    pub fn signature(&self) -> Signature {
        Signature::derive(
            &self.config_id,
            &self.application_id,
            &self.project_id,
            &self.branch,
        )
    }
}

/// Origin of a need: the job attempt that announced it.
///
/// Two `New` deliveries with the same signature and ticket are the same need;
/// a different ticket is a fresh need for the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub job_id: JobId,
    pub attempt: Attempt,
}

impl Ticket {
    pub fn new(job_id: JobId, attempt: Attempt) -> Self {
        Self { job_id, attempt }
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.attempt)
    }
}

/// Capabilities a worker advertises to itself when evaluating matchers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Free slots the worker can still provision.
    pub capacity: u32,
}

impl WorkerProfile {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Locally evaluated eligibility predicate carried by an auction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    /// Name of the requested resource (e.g. a database path).
    pub name: String,
    /// Labels the worker must carry with identical values.
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
    /// Minimum free capacity the worker must have.
    #[serde(default)]
    pub min_capacity: u32,
}

impl Matcher {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn require(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn with_min_capacity(mut self, min: u32) -> Self {
        self.min_capacity = min;
        self
    }

    pub fn admits(&self, profile: &WorkerProfile) -> bool {
        profile.capacity >= self.min_capacity
            && self
                .requirements
                .iter()
                .all(|(k, v)| profile.labels.get(k) == Some(v))
    }
}

/// Broadcast announcement of a resource need (or its withdrawal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auction {
    pub kind: AuctionKind,
    pub resource_kind: ResourceKind,
    pub signature: Signature,
    pub matcher: Matcher,
    pub subject: AuctionSubject,
    /// Always set for `New`; a `Cancel` may not know which attempt it targets.
    pub origin: Option<Ticket>,
}

impl Auction {
    /// A `New` auction for `subject`, signed from the subject's identity.
    pub fn need(
        resource_kind: ResourceKind,
        subject: AuctionSubject,
        matcher: Matcher,
        origin: Ticket,
    ) -> Self {
        Self {
            kind: AuctionKind::New,
            resource_kind,
            signature: subject.signature(),
            matcher,
            subject,
            origin: Some(origin),
        }
    }

    /// The `Cancel` counterpart of this auction.
    pub fn withdrawal(&self) -> Self {
        Self {
            kind: AuctionKind::Cancel,
            ..self.clone()
        }
    }

    pub fn is_new(&self) -> bool {
        self.kind == AuctionKind::New
    }
}
