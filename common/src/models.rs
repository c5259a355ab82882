use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::envelope::Envelope;

/// `Service.status`. Five states; no "pending delete" or "suspended"
/// variants because nothing in the core needs them — this is the
/// deliberately-small lifecycle the spec names, not the teacher's own
/// fifteen-variant container state machine (see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Created,
    Deploying,
    Running,
    Stopped,
    Failed,
}

/// `Deployment.status`. Strictly `Queued -> Building -> {Success, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// Normalized: no trailing `.git`.
    pub repo_url: String,
    pub branch: String,
    pub runtime_hint: Option<String>,
    /// Immutable once assigned; globally unique.
    pub subdomain: String,
    pub status: ServiceStatus,
    pub container_id: Option<String>,
    pub env: std::collections::BTreeMap<String, Envelope>,
    pub health_check_path: Option<String>,
    pub health_check_interval_sec: Option<u32>,
    pub health_check_timeout_sec: Option<u32>,
    pub webhook_secret: Envelope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: Uuid,
    pub status: DeploymentStatus,
    pub commit_sha: Option<String>,
    pub image_tag: Option<String>,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub service_id: Uuid,
    pub hostname: String,
    pub verified: bool,
    pub verification_token: String,
}
