//! Session status poller.
//!
//! Runs alongside completions: kicked whenever a session enters `running`,
//! it checks `GetChatStatus` on every running session each period and
//! returns finished sessions to `ready`. The first check lands one full
//! interval after the kick, never immediately, to avoid racing the
//! just-started completion's own bookkeeping.

use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::event::publish_session_event;
use relay_core::store::transition_session;
use relay_core::{ControlConfig, EventBroker, Result, SessionEvent, SessionRecord,
    SessionStatus, Store};
use relay_sandbox::SandboxService;

pub struct StatusPoller {
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    sandboxes: Arc<SandboxService>,
    config: ControlConfig,
    kick: Arc<Notify>,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        sandboxes: Arc<SandboxService>,
        config: ControlConfig,
        kick: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            broker,
            sandboxes,
            config,
            kick,
        }
    }

    /// The notifier that wakes the poller out of its idle mode.
    pub fn kick_handle(&self) -> Arc<Notify> {
        self.kick.clone()
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        loop {
            let running = match self.running_sessions().await {
                Ok(sessions) => sessions,
                Err(err) => {
                    error!("status poller: failed to list sessions: {err}");
                    Vec::new()
                }
            };

            if running.is_empty() {
                // Idle mode: nothing to poll until a session starts a
                // completion.
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = self.kick.notified() => {}
                }
                // Fall through to the sleep below: the first check happens
                // one interval after the kick, not immediately.
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.status_poll_interval) => {}
            }
            self.poll_once().await;
        }
    }

    async fn running_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store
            .sessions_with_status(&[SessionStatus::Running])
            .await
    }

    /// One polling pass. Public so tests can drive it without the timer.
    pub async fn poll_once(&self) {
        let sessions = match self.running_sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                error!("status poller: failed to list sessions: {err}");
                return;
            }
        };
        for session in sessions {
            match self.completion_running(&session.id).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(err) = self.finish_chat(&session.id).await {
                        warn!(
                            "status poller: failed to mark session {} ready: {err}",
                            session.id
                        );
                    }
                }
                Err(err) => {
                    debug!(
                        "status poller: status check for session {} failed: {err}",
                        session.id
                    );
                }
            }
        }
    }

    async fn completion_running(&self, session_id: &str) -> Result<bool> {
        let client = self.sandboxes.get_client(session_id).await?.passive();
        Ok(client.get_chat_status().await?.is_running)
    }

    async fn finish_chat(&self, session_id: &str) -> Result<()> {
        let updated =
            transition_session(self.store.as_ref(), session_id, SessionEvent::EndChat).await?;
        info!("session {session_id} completion finished; back to ready");
        publish_session_event(self.broker.as_ref(), &updated).await;
        Ok(())
    }
}
