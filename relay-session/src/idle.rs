//! Idle monitor: suspends sessions with no recent activity.
//!
//! Last activity is the later of the in-memory activity map entry and the
//! session's own `updated_at`, so a restarted control plane degrades to
//! "idle since last persisted change" instead of stopping everything.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::event::publish_session_event;
use relay_core::metrics::metrics;
use relay_core::store::transition_session;
use relay_core::util::now_ts;
use relay_core::{ControlConfig, Error, EventBroker, Result, SessionEvent, SessionRecord,
    SessionStatus, Store};
use relay_sandbox::SandboxService;

pub struct IdleMonitor {
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    sandboxes: Arc<SandboxService>,
    config: ControlConfig,
}

impl IdleMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        sandboxes: Arc<SandboxService>,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            broker,
            sandboxes,
            config,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.idle_check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The interval fires immediately once; skip that so the first scan
        // happens a full interval after startup.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            self.scan().await;
        }
    }

    /// One pass over the live sessions. Public so tests can drive scans
    /// without the timer.
    pub async fn scan(&self) {
        let sessions = match self
            .store
            .sessions_with_status(&[SessionStatus::Ready, SessionStatus::Running])
            .await
        {
            Ok(sessions) => sessions,
            Err(err) => {
                error!("idle monitor: failed to list sessions: {err}");
                return;
            }
        };

        let now = now_ts();
        for session in sessions {
            let last_activity = self
                .sandboxes
                .last_activity(&session.id)
                .map_or(session.updated_at, |ts| ts.max(session.updated_at));
            let idle_for = now.saturating_sub(last_activity);
            // At exactly the timeout the session survives; one tick past
            // it, it stops.
            if idle_for <= self.config.idle_timeout.as_secs() {
                continue;
            }

            if session.status == SessionStatus::Running {
                match self.chat_in_progress(&session.id).await {
                    Ok(true) => {
                        debug!(
                            "idle monitor: session {} idle {idle_for}s but completion in progress",
                            session.id
                        );
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        // Status unknown; the sandbox is likely gone, and a
                        // stop on a gone sandbox is a no-op anyway.
                        warn!(
                            "idle monitor: status check for session {} failed: {err}",
                            session.id
                        );
                    }
                }
            }

            if let Err(err) = self.suspend(&session, idle_for).await {
                error!("idle monitor: failed to stop session {}: {err}", session.id);
            }
        }
    }

    async fn chat_in_progress(&self, session_id: &str) -> Result<bool> {
        let client = self.sandboxes.get_client(session_id).await?.passive();
        let status = tokio::time::timeout(
            self.config.chat_status_timeout,
            client.get_chat_status(),
        )
        .await
        .map_err(|_| Error::Timeout("chat status check timed out".into()))??;
        Ok(status.is_running)
    }

    async fn suspend(&self, session: &SessionRecord, idle_for: u64) -> Result<()> {
        self.sandboxes.stop_for_session(&session.id).await?;
        let updated =
            transition_session(self.store.as_ref(), &session.id, SessionEvent::IdleTimeout)
                .await?;
        metrics().record_session_stopped_idle();
        info!("session {} stopped after {idle_for}s idle", session.id);
        publish_session_event(self.broker.as_ref(), &updated).await;
        Ok(())
    }
}
