//! Session service: the public face of the lifecycle state machine.
//!
//! Validates requests, persists transitions, enqueues the matching jobs,
//! and implements the reconciliation-on-demand wait: a fast DB-only check,
//! a bounded wait on the job's completion event, then a short DB poll while
//! the session works through its intermediate states.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::info;

use relay_core::event::publish_session_event;
use relay_core::event::wait_for_job_completion;
use relay_core::ids::validate_session_id;
use relay_core::store::transition_session;
use relay_core::util::now_ts;
use relay_core::{
    CommitStatus, ControlConfig, Error, EventBroker, JobKind, JobPayload, JobQueue, JobStatus,
    ResourceKey, Result, SessionEvent, SessionRecord, SessionStatus, Store,
};
use relay_sandbox::sse::SseEvent;
use relay_sandbox::{SandboxService, SessionInitializer};

use crate::git::GitClient;
use crate::handlers::{
    SessionCommitPayload, SessionDeletePayload, SessionInitPayload,
};

#[derive(Clone, Debug)]
pub struct CreateSessionRequest {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub agent_id: Option<String>,
}

/// What one enqueue-wait-poll pass observed.
enum AttemptOutcome {
    Ready,
    TerminalFailure(String),
}

pub struct SessionService {
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    queue: Arc<JobQueue>,
    sandboxes: Arc<SandboxService>,
    git: Arc<dyn GitClient>,
    poller_kick: Arc<Notify>,
    config: ControlConfig,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        queue: Arc<JobQueue>,
        sandboxes: Arc<SandboxService>,
        git: Arc<dyn GitClient>,
        poller_kick: Arc<Notify>,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            broker,
            queue,
            sandboxes,
            git,
            poller_kick,
            config,
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))
    }

    /// Validate and persist a new session, then enqueue initialization.
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionRecord> {
        validate_session_id(&request.id)?;
        let workspace = self
            .store
            .get_workspace(&request.workspace_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workspace '{}'", request.workspace_id)))?;
        if workspace.project_id != request.project_id {
            return Err(Error::Validation(format!(
                "workspace '{}' belongs to a different project",
                workspace.id
            )));
        }

        let record = SessionRecord::new(
            request.id,
            request.project_id,
            request.workspace_id,
            request.agent_id,
        );
        self.store.insert_session(record.clone()).await?;
        publish_session_event(self.broker.as_ref(), &record).await;
        self.enqueue_init(&record.project_id, &record.id).await?;
        Ok(record)
    }

    async fn enqueue_init(&self, project_id: &str, session_id: &str) -> Result<()> {
        let body = serde_json::to_value(SessionInitPayload {
            session_id: session_id.to_string(),
        })
        .map_err(|err| Error::Storage(format!("failed to encode init payload: {err}")))?;
        self.queue
            .enqueue(
                project_id,
                JobPayload {
                    kind: JobKind::SessionInit,
                    body,
                    resource: ResourceKey::session(session_id),
                    allow_duplicates: false,
                },
            )
            .await?;
        Ok(())
    }

    /// Reconciliation-on-demand: kick (or join) initialization and wait
    /// until the session reaches `ready`. A terminal failure during the
    /// follow-up poll re-kicks reconciliation once.
    pub async fn initialize(&self, session_id: &str) -> Result<()> {
        match self.initialize_attempt(session_id).await? {
            AttemptOutcome::Ready => Ok(()),
            AttemptOutcome::TerminalFailure(_) => {
                info!("session {session_id} failed mid-wait; re-kicking reconciliation");
                match self.initialize_attempt(session_id).await? {
                    AttemptOutcome::Ready => Ok(()),
                    AttemptOutcome::TerminalFailure(message) => {
                        Err(Error::Initialization(message))
                    }
                }
            }
        }
    }

    async fn initialize_attempt(&self, session_id: &str) -> Result<AttemptOutcome> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(Error::Validation(format!(
                "session '{session_id}' is removed"
            )));
        }
        if matches!(
            session.status,
            SessionStatus::Stopped | SessionStatus::Error
        ) {
            let updated =
                transition_session(self.store.as_ref(), session_id, SessionEvent::UserSend)
                    .await?;
            publish_session_event(self.broker.as_ref(), &updated).await;
        }
        self.enqueue_init(&session.project_id, session_id).await?;

        let resource = ResourceKey::session(session_id);
        let (status, error) = wait_for_job_completion(
            self.broker.as_ref(),
            self.store.as_ref(),
            &session.project_id,
            &resource,
            self.config.reconcile_wait,
        )
        .await?;
        if status == JobStatus::Failed {
            return Err(Error::Initialization(
                error.unwrap_or_else(|| "session initialization failed".into()),
            ));
        }

        // The completion event is advisory; poll the DB while the session
        // works through intermediate states.
        let deadline = Instant::now() + self.config.ready_poll_window;
        loop {
            let session = self.get_session(session_id).await?;
            match session.status {
                SessionStatus::Ready | SessionStatus::Running => {
                    return Ok(AttemptOutcome::Ready);
                }
                SessionStatus::Stopped | SessionStatus::Error => {
                    return Ok(AttemptOutcome::TerminalFailure(
                        session.error_message.unwrap_or_else(|| {
                            format!("session '{session_id}' did not reach ready")
                        }),
                    ));
                }
                SessionStatus::Removing | SessionStatus::Removed => {
                    return Err(Error::Validation(format!(
                        "session '{session_id}' is being removed"
                    )));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "session '{session_id}' not ready within {:?}",
                    self.config.ready_poll_window
                )));
            }
            tokio::time::sleep(self.config.ready_poll_tick).await;
        }
    }

    /// Route user messages to the sandbox. Reconciles a non-ready session
    /// first, marks the chat running, and kicks the status poller.
    pub async fn send_messages(
        &self,
        session_id: &str,
        messages: Value,
    ) -> Result<mpsc::Receiver<SseEvent>> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() || session.status == SessionStatus::Removing {
            return Err(Error::Validation(format!(
                "session '{session_id}' is being removed"
            )));
        }
        if !matches!(
            session.status,
            SessionStatus::Ready | SessionStatus::Running
        ) {
            self.initialize(session_id).await?;
        }

        let client = self.sandboxes.get_client(session_id).await?;
        let stream = client.send_messages(messages).await?;

        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();
        let updated = self
            .store
            .update_session(
                session_id,
                Box::new(move |session| {
                    // The send may have raced a reconcile; only a ready
                    // session enters the chat state.
                    if session.status == SessionStatus::Ready {
                        session.apply(SessionEvent::BeginChat)?;
                        flag.store(true, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .await?;
        if changed.load(Ordering::SeqCst) {
            publish_session_event(self.broker.as_ref(), &updated).await;
        }
        self.poller_kick.notify_waiters();
        Ok(stream)
    }

    /// Tombstone workflow: mark the session `removing` and enqueue the
    /// deletion job. Idempotent for sessions already on their way out.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        match session.status {
            SessionStatus::Removed => return Ok(()),
            SessionStatus::Removing => {}
            _ => {
                let updated =
                    transition_session(self.store.as_ref(), session_id, SessionEvent::UserDelete)
                        .await?;
                publish_session_event(self.broker.as_ref(), &updated).await;
            }
        }
        let body = serde_json::to_value(SessionDeletePayload {
            session_id: session_id.to_string(),
            remove_volumes: true,
        })
        .map_err(|err| Error::Storage(format!("failed to encode delete payload: {err}")))?;
        self.queue
            .enqueue(
                &session.project_id,
                JobPayload {
                    kind: JobKind::SessionDelete,
                    body,
                    resource: ResourceKey::session(session_id),
                    allow_duplicates: false,
                },
            )
            .await?;
        Ok(())
    }

    /// Start the commit workflow: record `pending` with the workspace's
    /// current HEAD as the base, then enqueue the workspace-keyed job.
    pub async fn commit_session(&self, session_id: &str) -> Result<SessionRecord> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() || session.status == SessionStatus::Removing {
            return Err(Error::Validation(format!(
                "session '{session_id}' is being removed"
            )));
        }
        let workspace_path = session.workspace_path.clone().ok_or_else(|| {
            Error::Validation(format!(
                "session '{session_id}' has no initialized workspace"
            ))
        })?;
        let head = self.git.head_commit(&workspace_path).await?;

        let updated = self
            .store
            .update_session(
                session_id,
                Box::new(move |session| {
                    session.commit_status = CommitStatus::Pending;
                    session.base_commit = Some(head);
                    session.commit_error = None;
                    session.applied_commit = None;
                    session.updated_at = now_ts();
                    Ok(())
                }),
            )
            .await?;
        publish_session_event(self.broker.as_ref(), &updated).await;

        let body = serde_json::to_value(SessionCommitPayload {
            session_id: session_id.to_string(),
        })
        .map_err(|err| Error::Storage(format!("failed to encode commit payload: {err}")))?;
        self.queue
            .enqueue(
                &session.project_id,
                JobPayload {
                    kind: JobKind::SessionCommit,
                    body,
                    // Commits mutate the workspace's real git directory, so
                    // they serialize on the workspace, not the session.
                    resource: ResourceKey::workspace(&session.workspace_id),
                    allow_duplicates: false,
                },
            )
            .await?;
        Ok(updated)
    }

    /// Wait for the in-flight commit job on the session's workspace.
    pub async fn wait_for_commit(&self, session_id: &str) -> Result<SessionRecord> {
        let session = self.get_session(session_id).await?;
        let resource = ResourceKey::workspace(&session.workspace_id);
        let _ = wait_for_job_completion(
            self.broker.as_ref(),
            self.store.as_ref(),
            &session.project_id,
            &resource,
            self.config.reconcile_wait,
        )
        .await?;
        self.get_session(session_id).await
    }
}

#[async_trait]
impl SessionInitializer for SessionService {
    async fn initialize(&self, session_id: &str) -> Result<()> {
        SessionService::initialize(self, session_id).await
    }
}
