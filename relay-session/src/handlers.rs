//! Lifecycle job handlers.
//!
//! One handler struct serves all four job kinds; the dispatcher registers
//! it per kind. Every handler is idempotent: a crash-recovered job re-runs
//! from whatever state the session reached and converges.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use relay_core::event::publish_session_event;
use relay_core::store::transition_session;
use relay_core::util::now_ts;
use relay_core::{
    Dispatcher, Error, EventBroker, JobContext, JobHandler, JobKind, JobOutcome, JobRecord,
    Result, SessionEvent, SessionRecord, SessionStatus, Store, WorkspaceStatus,
};
use relay_sandbox::SandboxService;

use crate::agents::AgentDirectory;
use crate::git::GitClient;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInitPayload {
    pub session_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDeletePayload {
    pub session_id: String,
    #[serde(default)]
    pub remove_volumes: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCommitPayload {
    pub session_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInitPayload {
    pub workspace_id: String,
}

pub struct SessionHandlers {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) broker: Arc<dyn EventBroker>,
    pub(crate) sandboxes: Arc<SandboxService>,
    pub(crate) git: Arc<dyn GitClient>,
    pub(crate) agents: Arc<dyn AgentDirectory>,
}

impl SessionHandlers {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        sandboxes: Arc<SandboxService>,
        git: Arc<dyn GitClient>,
        agents: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            store,
            broker,
            sandboxes,
            git,
            agents,
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(job: &JobRecord) -> Result<T> {
        serde_json::from_value(job.body.clone()).map_err(|err| {
            Error::Validation(format!("malformed {} payload: {err}", job.kind))
        })
    }

    pub(crate) async fn transition(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<SessionRecord> {
        let updated = transition_session(self.store.as_ref(), session_id, event).await?;
        publish_session_event(self.broker.as_ref(), &updated).await;
        Ok(updated)
    }

    /// Record an unrecoverable failure on the session and surface it as the
    /// job's error.
    pub(crate) async fn fail_session(&self, session_id: &str, message: &str) -> Error {
        error!("session {session_id}: {message}");
        let text = message.to_string();
        let result = self
            .store
            .update_session(
                session_id,
                Box::new(move |session| {
                    if !session.status.is_terminal() {
                        session.apply(SessionEvent::Unrecoverable)?;
                        session.error_message = Some(text);
                    }
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(updated) => publish_session_event(self.broker.as_ref(), &updated).await,
            Err(err) => error!("session {session_id}: failed to record error state: {err}"),
        }
        Error::Initialization(message.to_string())
    }

    // ── session_init ─────────────────────────────────────────────────────

    async fn handle_init(
        &self,
        ctx: &JobContext,
        payload: SessionInitPayload,
    ) -> Result<JobOutcome> {
        let session_id = payload.session_id.as_str();
        let Some(mut session) = self.store.get_session(session_id).await? else {
            warn!("init: session {session_id} vanished; nothing to converge");
            return Ok(JobOutcome::Done);
        };
        if session.status.is_terminal() {
            return Err(Error::Validation(format!(
                "session '{session_id}' is removed"
            )));
        }
        ctx.ensure_live()?;

        // A stopped or failed session re-enters through reinitializing so
        // the rest of the algorithm sees a legal state.
        if matches!(
            session.status,
            SessionStatus::Stopped | SessionStatus::Error
        ) {
            session = self.transition(session_id, SessionEvent::UserSend).await?;
        }

        // 2. Resolve the agent, substituting the project default when the
        // reference is missing or dangling.
        let agent_ok = match &session.agent_id {
            Some(agent_id) => self.agents.agent_exists(agent_id).await?,
            None => false,
        };
        if !agent_ok {
            match self.agents.default_agent(&session.project_id).await? {
                Some(default) => {
                    session = self
                        .store
                        .update_session(
                            session_id,
                            Box::new(move |session| {
                                session.agent_id = Some(default);
                                session.updated_at = now_ts();
                                Ok(())
                            }),
                        )
                        .await?;
                }
                None => {
                    return Err(self
                        .fail_session(
                            session_id,
                            "no usable agent: the session's agent is gone and the project has no default agent",
                        )
                        .await);
                }
            }
        }

        // 3. Ensure the workspace exists on disk.
        let Some(workspace) = self.store.get_workspace(&session.workspace_id).await? else {
            return Err(self
                .fail_session(
                    session_id,
                    &format!("workspace '{}' no longer exists", session.workspace_id),
                )
                .await);
        };
        if session.status == SessionStatus::Initializing {
            session = self.transition(session_id, SessionEvent::CloneBegin).await?;
        }
        let prepared = match self.git.ensure_workspace(&workspace).await {
            Ok(prepared) => prepared,
            Err(err) => {
                return Err(self
                    .fail_session(session_id, &format!("workspace setup failed: {err}"))
                    .await);
            }
        };
        {
            let head = prepared.head.clone();
            self.store
                .update_workspace(
                    &workspace.id,
                    Box::new(move |workspace| {
                        workspace.status = WorkspaceStatus::Ready;
                        workspace.current_commit = Some(head);
                        workspace.updated_at = now_ts();
                        Ok(())
                    }),
                )
                .await?;
        }

        // 4. Workspace anchors are written exactly once, on the first
        // successful initialization.
        if session.workspace_path.is_none() {
            let path = prepared.path.clone();
            let head = prepared.head.clone();
            session = self
                .store
                .update_session(
                    session_id,
                    Box::new(move |session| {
                        if session.workspace_path.is_none() {
                            session.workspace_path = Some(path);
                            session.workspace_commit = Some(head);
                            session.updated_at = now_ts();
                        }
                        Ok(())
                    }),
                )
                .await?;
        }

        ctx.ensure_live()?;

        // 5. Idempotently ensure the sandbox, recording the image-pull
        // detour when the provider does not have the image yet.
        if session.status == SessionStatus::Cloning {
            let image = self.sandboxes.image();
            if !self.sandboxes.image_exists(&image).await? {
                session = self
                    .transition(session_id, SessionEvent::ImageMissing)
                    .await?;
            }
        }
        if matches!(
            session.status,
            SessionStatus::Cloning | SessionStatus::PullingImage
        ) {
            session = self
                .transition(session_id, SessionEvent::SandboxCreateBegin)
                .await?;
        }
        if let Err(err) = self.sandboxes.ensure_running(&session).await {
            return Err(self
                .fail_session(session_id, &format!("sandbox provisioning failed: {err}"))
                .await);
        }

        // 6. Ready. The watcher may have folded the provider's running
        // event in already, so the transition is guarded inside the store's
        // critical section and the event is published only for a real
        // change.
        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();
        let updated = self
            .store
            .update_session(
                session_id,
                Box::new(move |session| {
                    if !matches!(
                        session.status,
                        SessionStatus::Ready | SessionStatus::Running
                    ) {
                        session.apply(SessionEvent::SandboxRunning)?;
                        flag.store(true, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .await?;
        if changed.load(Ordering::SeqCst) {
            publish_session_event(self.broker.as_ref(), &updated).await;
        }
        Ok(JobOutcome::Done)
    }

    // ── session_delete ───────────────────────────────────────────────────

    async fn handle_delete(
        &self,
        _ctx: &JobContext,
        payload: SessionDeletePayload,
    ) -> Result<JobOutcome> {
        let session_id = payload.session_id.as_str();
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(JobOutcome::Done);
        };
        if session.status == SessionStatus::Removed {
            return Ok(JobOutcome::Done);
        }
        if session.status != SessionStatus::Removing {
            self.transition(session_id, SessionEvent::UserDelete).await?;
        }
        self.sandboxes
            .destroy_for_session(session_id, payload.remove_volumes)
            .await?;
        self.transition(session_id, SessionEvent::DeletionDone)
            .await?;
        Ok(JobOutcome::Done)
    }

    // ── workspace_init ───────────────────────────────────────────────────

    async fn handle_workspace_init(
        &self,
        _ctx: &JobContext,
        payload: WorkspaceInitPayload,
    ) -> Result<JobOutcome> {
        let workspace_id = payload.workspace_id.as_str();
        let Some(workspace) = self.store.get_workspace(workspace_id).await? else {
            return Err(Error::NotFound(format!("workspace '{workspace_id}'")));
        };
        self.store
            .update_workspace(
                workspace_id,
                Box::new(|workspace| {
                    workspace.status = WorkspaceStatus::Initializing;
                    workspace.updated_at = now_ts();
                    Ok(())
                }),
            )
            .await?;
        match self.git.ensure_workspace(&workspace).await {
            Ok(prepared) => {
                self.store
                    .update_workspace(
                        workspace_id,
                        Box::new(move |workspace| {
                            workspace.status = WorkspaceStatus::Ready;
                            workspace.current_commit = Some(prepared.head);
                            workspace.updated_at = now_ts();
                            Ok(())
                        }),
                    )
                    .await?;
                Ok(JobOutcome::Done)
            }
            Err(err) => {
                self.store
                    .update_workspace(
                        workspace_id,
                        Box::new(|workspace| {
                            workspace.status = WorkspaceStatus::Error;
                            workspace.updated_at = now_ts();
                            Ok(())
                        }),
                    )
                    .await?;
                Err(Error::Workspace(format!(
                    "workspace '{workspace_id}' setup failed: {err}"
                )))
            }
        }
    }
}

#[async_trait]
impl JobHandler for SessionHandlers {
    async fn run(&self, ctx: &JobContext, job: &JobRecord) -> Result<JobOutcome> {
        match job.kind {
            JobKind::SessionInit => self.handle_init(ctx, Self::decode(job)?).await,
            JobKind::SessionDelete => self.handle_delete(ctx, Self::decode(job)?).await,
            JobKind::SessionCommit => self.handle_commit(ctx, Self::decode(job)?).await,
            JobKind::WorkspaceInit => {
                self.handle_workspace_init(ctx, Self::decode(job)?).await
            }
        }
    }
}

/// Register the handler set for every kind it serves.
pub fn register_handlers(dispatcher: &mut Dispatcher, handlers: Arc<SessionHandlers>) {
    for kind in [
        JobKind::SessionInit,
        JobKind::SessionDelete,
        JobKind::SessionCommit,
        JobKind::WorkspaceInit,
    ] {
        dispatcher.register(kind, handlers.clone());
    }
}
