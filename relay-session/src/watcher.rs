//! Sandbox watcher: folds the provider's state events back into session
//! status.
//!
//! The mapping is deliberately narrow: only drift the control plane did
//! not itself cause gets persisted, and a removed session never leaves its
//! tombstone. Observed drift enters the state machine through the
//! `external-ready` / `external-stop` events, so every write here faces
//! the same transition table as the rest of the lifecycle.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::event::publish_session_event;
use relay_core::{EventBroker, Result, SessionEvent, SessionStatus, Store};
use relay_sandbox::provider::{SandboxStatus, StateEvent};
use relay_sandbox::SandboxService;

pub struct SandboxWatcher {
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    sandboxes: Arc<SandboxService>,
}

impl SandboxWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        sandboxes: Arc<SandboxService>,
    ) -> Self {
        Self {
            store,
            broker,
            sandboxes,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut events = self.sandboxes.watch();
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if let Err(err) = self.handle(event).await {
                        error!("watcher: {err}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("watcher lagged by {skipped} provider events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    pub async fn handle(&self, event: StateEvent) -> Result<()> {
        let Some(session) = self.store.get_session(&event.session_id).await? else {
            debug!(
                "watcher: event for unknown session {} ({})",
                event.session_id, event.status
            );
            return Ok(());
        };
        let current = session.status;

        let (lifecycle_event, error_message): (Option<SessionEvent>, Option<String>) =
            match event.status {
                // `created` is a half-way state the init flow owns.
                SandboxStatus::Created => (None, None),
                SandboxStatus::Running => {
                    // A ready or running session already reflects a live
                    // sandbox; only genuinely not-ready sessions move.
                    if matches!(
                        current,
                        SessionStatus::CreatingSandbox
                            | SessionStatus::Reinitializing
                            | SessionStatus::Stopped
                    ) {
                        (Some(SessionEvent::ExternalReady), None)
                    } else {
                        (None, None)
                    }
                }
                SandboxStatus::Stopped => {
                    if matches!(
                        current,
                        SessionStatus::Ready
                            | SessionStatus::Initializing
                            | SessionStatus::CreatingSandbox
                    ) {
                        (Some(SessionEvent::ExternalStop), None)
                    } else {
                        (None, None)
                    }
                }
                SandboxStatus::Failed => {
                    if current.is_terminal() {
                        (None, None)
                    } else {
                        let detail = event.error.as_deref().unwrap_or("unknown failure");
                        (
                            Some(SessionEvent::Unrecoverable),
                            Some(format!("Sandbox failed: {detail}")),
                        )
                    }
                }
                SandboxStatus::Removed => {
                    if current.is_active() {
                        (Some(SessionEvent::ExternalStop), None)
                    } else {
                        info!(
                            "watcher: sandbox for session {} removed while {current}; leaving status",
                            session.id
                        );
                        (None, None)
                    }
                }
            };

        let Some(lifecycle_event) = lifecycle_event else {
            return Ok(());
        };

        info!(
            "watcher: session {} {current} + {lifecycle_event} (sandbox {})",
            session.id, event.status
        );
        // `apply` validates against the freshly read row, so a racing
        // transition rejects this write instead of being overwritten.
        let updated = self
            .store
            .update_session(
                &session.id,
                Box::new(move |session| {
                    session.apply(lifecycle_event)?;
                    if let Some(message) = error_message {
                        session.error_message = Some(message);
                    }
                    Ok(())
                }),
            )
            .await?;
        publish_session_event(self.broker.as_ref(), &updated).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{ControlConfig, LocalBroker, LocalStore, SessionRecord};
    use relay_sandbox::MemorySandboxProvider;

    struct Fixture {
        watcher: SandboxWatcher,
        store: Arc<LocalStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        let broker = Arc::new(LocalBroker::new());
        let provider = Arc::new(MemorySandboxProvider::new("agent:1"));
        let sandboxes = Arc::new(SandboxService::new(
            provider,
            store.clone(),
            broker.clone(),
            ControlConfig::default(),
        ));
        Fixture {
            watcher: SandboxWatcher::new(store.clone(), broker, sandboxes),
            store,
        }
    }

    async fn seed(store: &LocalStore, status: SessionStatus) {
        let mut session = SessionRecord::new("s1", "p1", "w1", None);
        session.status = status;
        store.insert_session(session).await.unwrap();
    }

    fn event(status: SandboxStatus) -> StateEvent {
        StateEvent {
            session_id: "s1".into(),
            status,
            error: None,
        }
    }

    async fn status_after(
        fixture: &Fixture,
        current: SessionStatus,
        sandbox: SandboxStatus,
    ) -> SessionStatus {
        seed(&fixture.store, current).await;
        fixture.watcher.handle(event(sandbox)).await.unwrap();
        let status = fixture
            .store
            .get_session("s1")
            .await
            .unwrap()
            .unwrap()
            .status;
        status
    }

    #[tokio::test]
    async fn running_sandbox_readies_a_reinitializing_session() {
        let fixture = fixture();
        let status = status_after(
            &fixture,
            SessionStatus::Reinitializing,
            SandboxStatus::Running,
        )
        .await;
        assert_eq!(status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn running_sandbox_readies_a_stopped_session() {
        let fixture = fixture();
        let status =
            status_after(&fixture, SessionStatus::Stopped, SandboxStatus::Running).await;
        assert_eq!(status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn running_sandbox_leaves_a_chatting_session_alone() {
        let fixture = fixture();
        let status =
            status_after(&fixture, SessionStatus::Running, SandboxStatus::Running).await;
        assert_eq!(status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn stopped_sandbox_stops_a_ready_session() {
        let fixture = fixture();
        let status =
            status_after(&fixture, SessionStatus::Ready, SandboxStatus::Stopped).await;
        assert_eq!(status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn failed_sandbox_marks_error_with_detail() {
        let fixture = fixture();
        seed(&fixture.store, SessionStatus::Running).await;
        fixture
            .watcher
            .handle(StateEvent {
                session_id: "s1".into(),
                status: SandboxStatus::Failed,
                error: Some("oom-killed".into()),
            })
            .await
            .unwrap();
        let session = fixture.store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(
            session.error_message.as_deref(),
            Some("Sandbox failed: oom-killed")
        );
    }

    #[tokio::test]
    async fn removed_sandbox_stops_active_sessions_only() {
        let fixture = fixture();
        let status =
            status_after(&fixture, SessionStatus::Ready, SandboxStatus::Removed).await;
        assert_eq!(status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn removed_sandbox_for_inactive_session_is_an_orphan() {
        let fixture = fixture();
        let status =
            status_after(&fixture, SessionStatus::Stopped, SandboxStatus::Removed).await;
        assert_eq!(status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn created_events_are_ignored() {
        let fixture = fixture();
        let status = status_after(
            &fixture,
            SessionStatus::CreatingSandbox,
            SandboxStatus::Created,
        )
        .await;
        assert_eq!(status, SessionStatus::CreatingSandbox);
    }

    #[tokio::test]
    async fn tombstones_never_move() {
        let fixture = fixture();
        let status =
            status_after(&fixture, SessionStatus::Removed, SandboxStatus::Failed).await;
        assert_eq!(status, SessionStatus::Removed);
    }

    #[tokio::test]
    async fn unknown_sessions_are_skipped() {
        let fixture = fixture();
        fixture
            .watcher
            .handle(event(SandboxStatus::Running))
            .await
            .unwrap();
    }
}
