//! Session lifecycle layer of the relay control plane.
//!
//! Owns the session state machine driver, the lifecycle job handlers, the
//! commit workflow, and the background loops (sandbox watcher, idle
//! monitor, status poller). [`ControlPlane`] wires the whole stack together
//! for embedders; HTTP routing, auth, and CLI surfaces stay outside.

pub mod agents;
pub mod commit;
pub mod git;
pub mod handlers;
pub mod idle;
pub mod poller;
pub mod service;
pub mod watcher;

use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use relay_core::{ControlConfig, Dispatcher, DispatcherHandle, EventBroker, JobQueue, Result, Store};
use relay_sandbox::{SandboxProvider, SandboxService};
use relay_sandbox::credentials::CredentialSource;

pub use agents::AgentDirectory;
pub use git::{GitClient, PreparedWorkspace};
pub use handlers::{
    SessionCommitPayload, SessionDeletePayload, SessionHandlers, SessionInitPayload,
    WorkspaceInitPayload, register_handlers,
};
pub use idle::IdleMonitor;
pub use poller::StatusPoller;
pub use service::{CreateSessionRequest, SessionService};
pub use watcher::SandboxWatcher;

/// Builder wiring the store, broker, provider, and external collaborators
/// into a running control plane.
pub struct ControlPlaneBuilder {
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    provider: Arc<dyn SandboxProvider>,
    git: Arc<dyn GitClient>,
    agents: Arc<dyn AgentDirectory>,
    credentials: Option<Arc<dyn CredentialSource>>,
    config: ControlConfig,
}

impl ControlPlaneBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        provider: Arc<dyn SandboxProvider>,
        git: Arc<dyn GitClient>,
        agents: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            store,
            broker,
            provider,
            git,
            agents,
            credentials: None,
            config: ControlConfig::default(),
        }
    }

    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }

    pub fn credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Reconcile startup drift, spawn the dispatcher workers and background
    /// loops, and hand back the running plane.
    pub async fn start(self) -> Result<ControlPlane> {
        let shutdown = CancellationToken::new();

        let mut sandbox_service = SandboxService::new(
            self.provider,
            self.store.clone(),
            self.broker.clone(),
            self.config.clone(),
        );
        if let Some(source) = self.credentials {
            sandbox_service = sandbox_service.with_credentials(source);
        }
        let sandboxes = Arc::new(sandbox_service);

        let mut dispatcher = Dispatcher::new(
            self.store.clone(),
            self.broker.clone(),
            self.config.worker_count,
            shutdown.child_token(),
        );
        let queue = Arc::new(JobQueue::new(self.store.clone(), dispatcher.kick_handle()));
        let poller_kick = Arc::new(Notify::new());

        let sessions = Arc::new(SessionService::new(
            self.store.clone(),
            self.broker.clone(),
            queue.clone(),
            sandboxes.clone(),
            self.git.clone(),
            poller_kick.clone(),
            self.config.clone(),
        ));
        sandboxes.set_initializer(sessions.clone());

        let handlers = Arc::new(SessionHandlers::new(
            self.store.clone(),
            self.broker.clone(),
            sandboxes.clone(),
            self.git.clone(),
            self.agents.clone(),
        ));
        register_handlers(&mut dispatcher, handlers);

        // Close the gap between recorded state and the provider's view
        // before accepting any work.
        sandboxes.reconcile_startup().await?;

        let dispatcher = dispatcher.spawn();
        let tasks = vec![
            SandboxWatcher::new(self.store.clone(), self.broker.clone(), sandboxes.clone())
                .spawn(shutdown.child_token()),
            IdleMonitor::new(
                self.store.clone(),
                self.broker.clone(),
                sandboxes.clone(),
                self.config.clone(),
            )
            .spawn(shutdown.child_token()),
            StatusPoller::new(
                self.store.clone(),
                self.broker.clone(),
                sandboxes.clone(),
                self.config.clone(),
                poller_kick,
            )
            .spawn(shutdown.child_token()),
        ];

        info!("control plane started ({} workers)", self.config.worker_count);
        Ok(ControlPlane {
            sessions,
            sandboxes,
            queue,
            dispatcher: Some(dispatcher),
            shutdown,
            tasks,
        })
    }
}

/// The assembled, running control plane.
pub struct ControlPlane {
    pub sessions: Arc<SessionService>,
    pub sandboxes: Arc<SandboxService>,
    pub queue: Arc<JobQueue>,
    dispatcher: Option<DispatcherHandle>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Cancel every background task and wait for the workers to drain.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("control plane stopped");
    }
}
