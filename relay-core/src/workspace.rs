//! Workspace records.
//!
//! A workspace is an on-disk source tree backing zero or more sessions. It
//! is a shared resource: mutations happen only inside `workspace_init` and
//! `session_commit` handlers, both keyed on the workspace resource.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::now_ts;

/// Where the workspace's source tree comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceSource {
    /// An existing local directory; seeded with an initial commit if empty.
    Local,
    /// A git URL; cloned on first use, fast-forwarded afterwards.
    Git,
}

impl fmt::Display for WorkspaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceSource::Local => f.write_str("local"),
            WorkspaceSource::Git => f.write_str("git"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Pending,
    Initializing,
    Ready,
    Error,
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Initializing => "initializing",
            WorkspaceStatus::Ready => "ready",
            WorkspaceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted workspace record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub project_id: String,
    pub source: WorkspaceSource,
    /// Local filesystem path or git clone URL, depending on `source`.
    pub path: String,
    #[serde(default)]
    pub status: WorkspaceStatus,
    #[serde(default)]
    pub current_commit: Option<String>,
    pub updated_at: u64,
}

impl WorkspaceRecord {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        source: WorkspaceSource,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            source,
            path: path.into(),
            status: WorkspaceStatus::Pending,
            current_commit: None,
            updated_at: now_ts(),
        }
    }
}
