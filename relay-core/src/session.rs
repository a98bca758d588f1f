//! Session records and the lifecycle state machine.
//!
//! A session is the central entity of the control plane: one user chat
//! thread, backed by exactly one sandbox and rooted on one workspace. The
//! status field tracks the persisted view of the lifecycle; the real sandbox
//! may diverge transiently and reconciliation closes the gap.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::util::now_ts;

/// Persisted lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Initializing,
    Cloning,
    PullingImage,
    CreatingSandbox,
    Ready,
    Running,
    Reinitializing,
    Stopped,
    Error,
    Removing,
    Removed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Cloning => "cloning",
            SessionStatus::PullingImage => "pulling-image",
            SessionStatus::CreatingSandbox => "creating-sandbox",
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Reinitializing => "reinitializing",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
            SessionStatus::Removing => "removing",
            SessionStatus::Removed => "removed",
        }
    }

    /// `removed` is absolute: a removed session is a tombstone and every
    /// further transition is rejected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Removed)
    }

    /// States in which the session is expected to own a live sandbox.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::Running | SessionStatus::Reinitializing
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events that drive [`SessionStatus`] transitions.
///
/// `ExternalReady` and `ExternalStop` carry the sandbox watcher's observed
/// drift into the table, so external state changes face the same legality
/// gate as everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    CloneBegin,
    ImageMissing,
    SandboxCreateBegin,
    SandboxRunning,
    BeginChat,
    EndChat,
    SandboxLost,
    IdleTimeout,
    UserSend,
    UserDelete,
    DeletionDone,
    Unrecoverable,
    ExternalReady,
    ExternalStop,
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::CloneBegin => "clone-begin",
            SessionEvent::ImageMissing => "image-missing",
            SessionEvent::SandboxCreateBegin => "sandbox-create-begin",
            SessionEvent::SandboxRunning => "sandbox-running",
            SessionEvent::BeginChat => "begin-chat",
            SessionEvent::EndChat => "end-chat",
            SessionEvent::SandboxLost => "sandbox-lost",
            SessionEvent::IdleTimeout => "idle-timeout",
            SessionEvent::UserSend => "user-send",
            SessionEvent::UserDelete => "user-delete",
            SessionEvent::DeletionDone => "deletion-done",
            SessionEvent::Unrecoverable => "unrecoverable",
            SessionEvent::ExternalReady => "external-ready",
            SessionEvent::ExternalStop => "external-stop",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply a lifecycle event to a status, returning the successor state.
/// Every pair outside the transition table is rejected.
pub fn apply_event(current: SessionStatus, event: SessionEvent) -> Result<SessionStatus> {
    use SessionEvent as E;
    use SessionStatus as S;

    let next = match (current, event) {
        (S::Initializing, E::CloneBegin) => S::Cloning,
        (S::Cloning, E::ImageMissing) => S::PullingImage,
        (S::Cloning | S::PullingImage, E::SandboxCreateBegin) => S::CreatingSandbox,
        (S::CreatingSandbox | S::Reinitializing, E::SandboxRunning) => S::Ready,
        (S::Ready, E::BeginChat) => S::Running,
        (S::Running, E::EndChat) => S::Ready,
        (S::Ready | S::Running, E::SandboxLost) => S::Reinitializing,
        (S::Ready | S::Running | S::Reinitializing, E::IdleTimeout) => S::Stopped,
        (S::Stopped | S::Error, E::UserSend) => S::Reinitializing,
        // The watcher observed a live sandbox for a session that was not
        // ready (mid-provisioning, reinitializing, or recorded stopped).
        (S::CreatingSandbox | S::Reinitializing | S::Stopped, E::ExternalReady) => S::Ready,
        // The watcher observed the sandbox stopped or removed under a
        // session that believed it was live.
        (
            S::Initializing | S::CreatingSandbox | S::Ready | S::Running | S::Reinitializing,
            E::ExternalStop,
        ) => S::Stopped,
        (S::Removing, E::DeletionDone) => S::Removed,
        (s, E::UserDelete) if !s.is_terminal() && s != S::Removing => S::Removing,
        (s, E::Unrecoverable) if !s.is_terminal() => S::Error,
        (current, event) => {
            return Err(Error::Validation(format!(
                "illegal transition: {event} while {current}"
            )));
        }
    };
    Ok(next)
}

/// State of the commit workflow on a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    #[default]
    None,
    Pending,
    Committing,
    Completed,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::None => "none",
            CommitStatus::Pending => "pending",
            CommitStatus::Committing => "committing",
            CommitStatus::Completed => "completed",
            CommitStatus::Failed => "failed",
        }
    }

    /// States in which the `base_commit` invariant must hold.
    pub fn requires_base_commit(&self) -> bool {
        matches!(
            self,
            CommitStatus::Pending | CommitStatus::Committing | CommitStatus::Completed
        )
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted session record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Workspace path on disk, written once on first successful
    /// initialization and reused on every later run.
    #[serde(default)]
    pub workspace_path: Option<String>,
    /// Workspace HEAD captured alongside `workspace_path`; the stable
    /// reconciliation anchor.
    #[serde(default)]
    pub workspace_commit: Option<String>,
    #[serde(default)]
    pub commit_status: CommitStatus,
    #[serde(default)]
    pub commit_error: Option<String>,
    /// Workspace HEAD the commit workflow anchors its patch series on.
    #[serde(default)]
    pub base_commit: Option<String>,
    /// Workspace HEAD after the agent's patches were applied.
    #[serde(default)]
    pub applied_commit: Option<String>,
    pub updated_at: u64,
}

impl SessionRecord {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        workspace_id: impl Into<String>,
        agent_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            workspace_id: workspace_id.into(),
            agent_id,
            status: SessionStatus::Initializing,
            error_message: None,
            workspace_path: None,
            workspace_commit: None,
            commit_status: CommitStatus::None,
            commit_error: None,
            base_commit: None,
            applied_commit: None,
            updated_at: now_ts(),
        }
    }

    /// Apply a lifecycle event in place, refreshing `updated_at`.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionStatus> {
        let next = apply_event(self.status, event)?;
        self.status = next;
        self.updated_at = now_ts();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [SessionStatus; 11] = [
        SessionStatus::Initializing,
        SessionStatus::Cloning,
        SessionStatus::PullingImage,
        SessionStatus::CreatingSandbox,
        SessionStatus::Ready,
        SessionStatus::Running,
        SessionStatus::Reinitializing,
        SessionStatus::Stopped,
        SessionStatus::Error,
        SessionStatus::Removing,
        SessionStatus::Removed,
    ];

    #[test]
    fn happy_path_init_sequence() {
        let mut s = SessionStatus::Initializing;
        for event in [
            SessionEvent::CloneBegin,
            SessionEvent::SandboxCreateBegin,
            SessionEvent::SandboxRunning,
            SessionEvent::BeginChat,
            SessionEvent::EndChat,
        ] {
            s = apply_event(s, event).unwrap();
        }
        assert_eq!(s, SessionStatus::Ready);
    }

    #[test]
    fn image_pull_detour() {
        let s = apply_event(SessionStatus::Cloning, SessionEvent::ImageMissing).unwrap();
        assert_eq!(s, SessionStatus::PullingImage);
        let s = apply_event(s, SessionEvent::SandboxCreateBegin).unwrap();
        assert_eq!(s, SessionStatus::CreatingSandbox);
    }

    #[test]
    fn sandbox_lost_reinitializes() {
        for from in [SessionStatus::Ready, SessionStatus::Running] {
            assert_eq!(
                apply_event(from, SessionEvent::SandboxLost).unwrap(),
                SessionStatus::Reinitializing
            );
        }
        assert!(apply_event(SessionStatus::Stopped, SessionEvent::SandboxLost).is_err());
    }

    #[test]
    fn idle_timeout_stops_active_states() {
        for from in [
            SessionStatus::Ready,
            SessionStatus::Running,
            SessionStatus::Reinitializing,
        ] {
            assert_eq!(
                apply_event(from, SessionEvent::IdleTimeout).unwrap(),
                SessionStatus::Stopped
            );
        }
        assert!(apply_event(SessionStatus::Initializing, SessionEvent::IdleTimeout).is_err());
    }

    #[test]
    fn user_send_wakes_stopped_and_error() {
        for from in [SessionStatus::Stopped, SessionStatus::Error] {
            assert_eq!(
                apply_event(from, SessionEvent::UserSend).unwrap(),
                SessionStatus::Reinitializing
            );
        }
        assert!(apply_event(SessionStatus::Ready, SessionEvent::UserSend).is_err());
    }

    #[test]
    fn external_ready_promotes_only_not_ready_states() {
        for from in [
            SessionStatus::CreatingSandbox,
            SessionStatus::Reinitializing,
            SessionStatus::Stopped,
        ] {
            assert_eq!(
                apply_event(from, SessionEvent::ExternalReady).unwrap(),
                SessionStatus::Ready
            );
        }
        for from in [
            SessionStatus::Initializing,
            SessionStatus::Ready,
            SessionStatus::Running,
            SessionStatus::Error,
            SessionStatus::Removing,
            SessionStatus::Removed,
        ] {
            assert!(
                apply_event(from, SessionEvent::ExternalReady).is_err(),
                "accepted external-ready from {from}"
            );
        }
    }

    #[test]
    fn external_stop_covers_live_states_only() {
        for from in [
            SessionStatus::Initializing,
            SessionStatus::CreatingSandbox,
            SessionStatus::Ready,
            SessionStatus::Running,
            SessionStatus::Reinitializing,
        ] {
            assert_eq!(
                apply_event(from, SessionEvent::ExternalStop).unwrap(),
                SessionStatus::Stopped
            );
        }
        for from in [
            SessionStatus::Stopped,
            SessionStatus::Error,
            SessionStatus::Removing,
            SessionStatus::Removed,
        ] {
            assert!(
                apply_event(from, SessionEvent::ExternalStop).is_err(),
                "accepted external-stop from {from}"
            );
        }
    }

    #[test]
    fn user_delete_from_any_non_terminal() {
        for from in ALL_STATUSES {
            let result = apply_event(from, SessionEvent::UserDelete);
            if from == SessionStatus::Removed || from == SessionStatus::Removing {
                assert!(result.is_err(), "accepted user-delete from {from}");
            } else {
                assert_eq!(result.unwrap(), SessionStatus::Removing);
            }
        }
    }

    #[test]
    fn unrecoverable_from_any_non_terminal() {
        for from in ALL_STATUSES {
            let result = apply_event(from, SessionEvent::Unrecoverable);
            if from == SessionStatus::Removed {
                assert!(result.is_err());
            } else {
                assert_eq!(result.unwrap(), SessionStatus::Error);
            }
        }
    }

    #[test]
    fn removed_is_a_tombstone() {
        for event in [
            SessionEvent::CloneBegin,
            SessionEvent::SandboxRunning,
            SessionEvent::BeginChat,
            SessionEvent::UserSend,
            SessionEvent::UserDelete,
            SessionEvent::Unrecoverable,
            SessionEvent::DeletionDone,
            SessionEvent::ExternalReady,
            SessionEvent::ExternalStop,
        ] {
            assert!(
                apply_event(SessionStatus::Removed, event).is_err(),
                "accepted {event} on removed"
            );
        }
    }

    #[test]
    fn deletion_done_only_from_removing() {
        assert_eq!(
            apply_event(SessionStatus::Removing, SessionEvent::DeletionDone).unwrap(),
            SessionStatus::Removed
        );
        for from in ALL_STATUSES {
            if from != SessionStatus::Removing {
                assert!(apply_event(from, SessionEvent::DeletionDone).is_err());
            }
        }
    }

    #[test]
    fn status_strings_are_kebab_case() {
        assert_eq!(SessionStatus::PullingImage.as_str(), "pulling-image");
        assert_eq!(SessionStatus::CreatingSandbox.as_str(), "creating-sandbox");
        let json = serde_json::to_string(&SessionStatus::PullingImage).unwrap();
        assert_eq!(json, "\"pulling-image\"");
    }

    #[test]
    fn record_apply_updates_timestamp() {
        let mut record = SessionRecord::new("s1", "p1", "w1", None);
        record.updated_at = 0;
        record.apply(SessionEvent::CloneBegin).unwrap();
        assert_eq!(record.status, SessionStatus::Cloning);
        assert!(record.updated_at > 0);
    }

    #[test]
    fn commit_status_base_commit_invariant_states() {
        assert!(!CommitStatus::None.requires_base_commit());
        assert!(CommitStatus::Pending.requires_base_commit());
        assert!(CommitStatus::Committing.requires_base_commit());
        assert!(CommitStatus::Completed.requires_base_commit());
        assert!(!CommitStatus::Failed.requires_base_commit());
    }
}
