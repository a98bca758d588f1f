//! Durable job records for the resource-keyed lifecycle queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::util::now_ts;

/// The lifecycle work a job carries. The queue treats the body as opaque;
/// only the registered handler for the kind interprets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SessionInit,
    SessionDelete,
    SessionCommit,
    WorkspaceInit,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SessionInit => "session_init",
            JobKind::SessionDelete => "session_delete",
            JobKind::SessionCommit => "session_commit",
            JobKind::WorkspaceInit => "workspace_init",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Session,
    Workspace,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Session => f.write_str("session"),
            ResourceType::Workspace => f.write_str("workspace"),
        }
    }
}

/// Scope of job mutual exclusion: at most one job per distinct key runs at
/// any instant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::Session,
            resource_id: id.into(),
        }
    }

    pub fn workspace(id: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::Workspace,
            resource_id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// What a caller hands to the queue.
#[derive(Clone, Debug)]
pub struct JobPayload {
    pub kind: JobKind,
    pub body: Value,
    pub resource: ResourceKey,
    pub allow_duplicates: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persisted job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project_id: String,
    pub kind: JobKind,
    pub body: Value,
    pub resource: ResourceKey,
    pub allow_duplicates: bool,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    /// Store-assigned monotonic sequence; dispatch order follows it.
    #[serde(default)]
    pub seq: u64,
    pub created_at: u64,
    #[serde(default)]
    pub claimed_at: Option<u64>,
    #[serde(default)]
    pub finished_at: Option<u64>,
}

impl JobRecord {
    pub fn new(project_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: format!("job-{}", uuid::Uuid::new_v4()),
            project_id: project_id.into(),
            kind: payload.kind,
            body: payload.body,
            resource: payload.resource,
            allow_duplicates: payload.allow_duplicates,
            status: JobStatus::Queued,
            error: None,
            retries: 0,
            seq: 0,
            created_at: now_ts(),
            claimed_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&JobKind::SessionInit).unwrap();
        assert_eq!(json, "\"session_init\"");
        assert_eq!(JobKind::WorkspaceInit.as_str(), "workspace_init");
    }

    #[test]
    fn resource_key_display() {
        assert_eq!(ResourceKey::session("s1").to_string(), "session/s1");
        assert_eq!(ResourceKey::workspace("w1").to_string(), "workspace/w1");
    }

    #[test]
    fn new_job_is_queued() {
        let job = JobRecord::new(
            "p1",
            JobPayload {
                kind: JobKind::SessionInit,
                body: serde_json::json!({"sessionId": "s1"}),
                resource: ResourceKey::session("s1"),
                allow_duplicates: false,
            },
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.id.starts_with("job-"));
        assert!(!job.status.is_finished());
    }
}
