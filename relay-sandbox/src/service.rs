//! Sandbox service: owns the provider and the last-activity map.
//!
//! The service is the only component that talks to the provider on behalf
//! of sessions. It hands out session-bound clients, keeps idle accounting,
//! and is the authoritative kick path for reconciliation. Session
//! reinitialization itself belongs to the session layer; the cyclic
//! dependency is broken by the one-way [`SessionInitializer`] capability.

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use relay_core::metrics::metrics;
use relay_core::store::transition_session;
use relay_core::util::now_ts;
use relay_core::{
    ControlConfig, Error, EventBroker, Result, SessionEvent, SessionRecord, SessionStatus, Store,
};
use relay_core::event::publish_session_event;

use crate::client::{ClientHooks, SessionClient};
use crate::credentials::CredentialSource;
use crate::provider::{
    CreateSandboxOptions, LABEL_PROJECT, LABEL_SESSION, LABEL_WORKSPACE, SandboxHandle,
    SandboxProvider, SandboxStatus, StateEvent,
};

/// Freshly generated 32-byte hex shared secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Capability the session service satisfies so sandbox-side reconciliation
/// can re-enter initialization without a bidirectional reference.
#[async_trait]
pub trait SessionInitializer: Send + Sync {
    /// Bring the session to `ready`, waiting for the underlying job.
    async fn initialize(&self, session_id: &str) -> Result<()>;
}

pub struct SandboxService {
    provider: Arc<dyn SandboxProvider>,
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    config: ControlConfig,
    credentials: Option<Arc<dyn CredentialSource>>,
    /// Process-local idle accounting; safe to lose on restart because the
    /// idle monitor falls back to the session's `updated_at`.
    activity: DashMap<String, u64>,
    initializer: OnceCell<Arc<dyn SessionInitializer>>,
}

impl SandboxService {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        config: ControlConfig,
    ) -> Self {
        Self {
            provider,
            store,
            broker,
            config,
            credentials: None,
            activity: DashMap::new(),
            initializer: OnceCell::new(),
        }
    }

    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Wire the session layer in after construction. Later calls are
    /// ignored.
    pub fn set_initializer(&self, initializer: Arc<dyn SessionInitializer>) {
        if self.initializer.set(initializer).is_err() {
            warn!("session initializer already wired; ignoring replacement");
        }
    }

    fn initializer(&self) -> Result<&Arc<dyn SessionInitializer>> {
        self.initializer
            .get()
            .ok_or_else(|| Error::Config("session initializer not wired".into()))
    }

    pub fn image(&self) -> String {
        self.provider.image()
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        self.provider.image_exists(image).await
    }

    /// Subscribe to the provider's state-change stream.
    pub fn watch(&self) -> broadcast::Receiver<StateEvent> {
        self.provider.watch()
    }

    /// Create the session's sandbox from its persisted workspace anchors,
    /// labeled with the session/workspace/project identifiers and a fresh
    /// shared secret.
    pub async fn create_for_session(&self, session: &SessionRecord) -> Result<SandboxHandle> {
        let workspace_path = session.workspace_path.clone().ok_or_else(|| {
            Error::Validation(format!(
                "session '{}' has no initialized workspace",
                session.id
            ))
        })?;
        let workspace_commit = session.workspace_commit.clone().unwrap_or_default();

        let mut labels = HashMap::new();
        labels.insert(LABEL_SESSION.to_string(), session.id.clone());
        labels.insert(LABEL_WORKSPACE.to_string(), session.workspace_id.clone());
        labels.insert(LABEL_PROJECT.to_string(), session.project_id.clone());

        let opts = CreateSandboxOptions {
            image: self.provider.image(),
            workspace_path,
            workspace_commit,
            labels,
            secret: generate_secret(),
            env: Vec::new(),
        };
        let handle = self.provider.create(&session.id, opts).await?;
        metrics().record_sandbox_created();
        self.record_activity(&session.id);
        Ok(handle)
    }

    /// Idempotently bring the session's sandbox to running: create it when
    /// absent, start it when stopped (recreating on start failure), replace
    /// it when failed.
    pub async fn ensure_running(&self, session: &SessionRecord) -> Result<SandboxHandle> {
        match self.provider.get(&session.id).await {
            Err(Error::SandboxNotFound(_)) => self.create_for_session(session).await,
            Err(err) => Err(err),
            Ok(handle) => match handle.status {
                SandboxStatus::Running => Ok(handle),
                SandboxStatus::Created | SandboxStatus::Stopped => {
                    match self.provider.start(&session.id).await {
                        Ok(()) | Err(Error::SandboxAlreadyRunning(_)) => {
                            self.provider.get(&session.id).await
                        }
                        Err(err) => {
                            warn!(
                                "session {}: start failed ({err}), recreating sandbox",
                                session.id
                            );
                            self.provider.remove(&session.id, false).await?;
                            self.create_for_session(session).await
                        }
                    }
                }
                SandboxStatus::Failed => {
                    // Data volumes are preserved; only the failed sandbox
                    // is replaced.
                    self.provider.remove(&session.id, false).await?;
                    self.create_for_session(session).await
                }
                SandboxStatus::Removed => self.create_for_session(session).await,
            },
        }
    }

    /// Authoritative reconciliation kick. Fast DB check first: a session
    /// recorded ready/running whose caller just observed a failure gets
    /// marked `reinitializing`; then session initialization runs and is
    /// awaited.
    pub async fn reconcile_sandbox(&self, session_id: &str) -> Result<()> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;
        if session.status.is_terminal() {
            return Err(Error::Validation(format!(
                "session '{session_id}' is removed"
            )));
        }
        if matches!(
            session.status,
            SessionStatus::Ready | SessionStatus::Running
        ) {
            let updated =
                transition_session(self.store.as_ref(), session_id, SessionEvent::SandboxLost)
                    .await?;
            publish_session_event(self.broker.as_ref(), &updated).await;
        }
        self.initializer()?.initialize(session_id).await
    }

    /// Graceful stop with the configured deadline. A sandbox that is
    /// already gone or stopped counts as stopped.
    pub async fn stop_for_session(&self, session_id: &str) -> Result<()> {
        match self
            .provider
            .stop(session_id, self.config.stop_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::SandboxNotFound(_)) | Err(Error::SandboxNotRunning(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Remove the session's sandbox. Idempotent: a missing sandbox is
    /// success.
    pub async fn destroy_for_session(&self, session_id: &str, remove_volumes: bool) -> Result<()> {
        match self.provider.remove(session_id, remove_volumes).await {
            Ok(()) => {
                metrics().record_sandbox_removed();
                self.activity.remove(session_id);
                Ok(())
            }
            Err(Error::SandboxNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Build the session-bound client.
    pub async fn get_client(self: &Arc<Self>, session_id: &str) -> Result<SessionClient> {
        let transport = self.provider.http_client(session_id).await?;
        let secret = self.provider.get_secret(session_id).await?;
        let hooks: Arc<dyn ClientHooks> = self.clone();
        let mut client = SessionClient::new(session_id, transport, secret, hooks)
            .with_retry_settings(self.config.retry.clone());
        if let Some(source) = &self.credentials {
            client = client.with_credentials(source.clone());
        }
        if let Some(git_user) = &self.config.git_user {
            client = client.with_git_user(git_user.clone());
        }
        Ok(client)
    }

    pub fn record_activity(&self, session_id: &str) {
        self.activity.insert(session_id.to_string(), now_ts());
    }

    pub fn last_activity(&self, session_id: &str) -> Option<u64> {
        self.activity.get(session_id).map(|entry| *entry.value())
    }

    /// Startup reconciliation: sync drifted session statuses against the
    /// provider's view, then replace sandboxes built from a superseded
    /// image (preserving the session and its workspace).
    pub async fn reconcile_startup(&self) -> Result<()> {
        let handles = self.provider.list().await?;
        let current_image = self.provider.image();

        for handle in handles {
            let Some(session) = self.store.get_session(&handle.session_id).await? else {
                warn!(
                    "startup: orphan sandbox for unknown session {}, removing",
                    handle.session_id
                );
                let _ = self.provider.remove(&handle.session_id, true).await;
                continue;
            };

            if handle.image != current_image {
                info!(
                    "startup: recreating sandbox for session {} on image upgrade ({} -> {current_image})",
                    session.id, handle.image
                );
                self.provider.remove(&session.id, false).await?;
                if session.workspace_path.is_some() {
                    self.create_for_session(&session).await?;
                } else {
                    warn!(
                        "startup: session {} has no workspace anchor; sandbox left for next init",
                        session.id
                    );
                }
                continue;
            }

            // Sandbox stopped behind our back while the session thinks it
            // is live.
            if handle.status != SandboxStatus::Running && session.status.is_active() {
                info!(
                    "startup: session {} recorded {} but sandbox is {}; marking stopped",
                    session.id, session.status, handle.status
                );
                let updated = self
                    .store
                    .update_session(
                        &session.id,
                        Box::new(|s| {
                            s.apply(SessionEvent::ExternalStop)?;
                            Ok(())
                        }),
                    )
                    .await?;
                publish_session_event(self.broker.as_ref(), &updated).await;
            }
        }

        // Sessions recorded live whose sandbox is gone entirely.
        let live = self
            .store
            .sessions_with_status(&[SessionStatus::Ready, SessionStatus::Running])
            .await?;
        for session in live {
            if matches!(
                self.provider.get(&session.id).await,
                Err(Error::SandboxNotFound(_))
            ) {
                info!(
                    "startup: session {} recorded {} but has no sandbox; marking stopped",
                    session.id, session.status
                );
                let updated = self
                    .store
                    .update_session(
                        &session.id,
                        Box::new(|s| {
                            s.apply(SessionEvent::ExternalStop)?;
                            Ok(())
                        }),
                    )
                    .await?;
                publish_session_event(self.broker.as_ref(), &updated).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClientHooks for SandboxService {
    async fn reconcile(&self, session_id: &str) -> Result<()> {
        self.reconcile_sandbox(session_id).await
    }

    fn record_activity(&self, session_id: &str) {
        SandboxService::record_activity(self, session_id);
    }
}
