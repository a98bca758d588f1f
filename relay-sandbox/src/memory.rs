//! In-process sandbox provider.
//!
//! Sandboxes are records in a map and the transport is plain TCP to a
//! configurable per-sandbox agent URL. This is the in-process transport:
//! tests point it at a mock agent server, embedders can point it at an
//! agent running in the same process.

use dashmap::DashMap;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;

use async_trait::async_trait;
use relay_core::{Error, Result};

use crate::provider::{
    CreateSandboxOptions, ExecOutput, SandboxHandle, SandboxProvider, SandboxStatus,
    SandboxTransport, StateEvent,
};
use crate::service::generate_secret;

struct MemorySandbox {
    handle: SandboxHandle,
    secret: String,
    agent_url: Option<Url>,
    labels: HashMap<String, String>,
}

pub struct MemorySandboxProvider {
    image: Mutex<String>,
    images: DashMap<String, ()>,
    sandboxes: DashMap<String, MemorySandbox>,
    events: broadcast::Sender<StateEvent>,
    default_agent_url: Mutex<Option<Url>>,
    /// Injected start failures per session, for provisioning tests.
    start_failures: DashMap<String, u32>,
}

impl MemorySandboxProvider {
    pub fn new(image: impl Into<String>) -> Self {
        let image = image.into();
        let images = DashMap::new();
        images.insert(image.clone(), ());
        Self {
            image: Mutex::new(image),
            images,
            sandboxes: DashMap::new(),
            events: broadcast::channel(64).0,
            default_agent_url: Mutex::new(None),
            start_failures: DashMap::new(),
        }
    }

    /// Make `image` known without switching to it.
    pub fn register_image(&self, image: impl Into<String>) {
        self.images.insert(image.into(), ());
    }

    /// Drop `image` from the known set, so the next creation goes through
    /// the image-pull detour.
    pub fn forget_image(&self, image: &str) {
        self.images.remove(image);
    }

    /// The labels a sandbox was created with.
    pub fn labels_for(&self, session_id: &str) -> Option<HashMap<String, String>> {
        self.sandboxes
            .get(session_id)
            .map(|sandbox| sandbox.labels.clone())
    }

    /// Switch the provider to a new current image (an "image upgrade").
    pub fn set_image(&self, image: impl Into<String>) {
        let image = image.into();
        self.images.insert(image.clone(), ());
        if let Ok(mut current) = self.image.lock() {
            *current = image;
        }
    }

    /// Agent base URL used for sandboxes created from now on.
    pub fn set_agent_url(&self, url: Url) {
        if let Ok(mut default) = self.default_agent_url.lock() {
            *default = Some(url);
        }
    }

    /// Agent base URL for one existing sandbox.
    pub fn set_agent_url_for(&self, session_id: &str, url: Url) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(session_id) {
            sandbox.agent_url = Some(url);
        }
    }

    /// Make the next `times` starts of the session's sandbox fail.
    pub fn fail_next_start(&self, session_id: &str, times: u32) {
        self.start_failures.insert(session_id.to_string(), times);
    }

    /// Emit a state event as if the runtime observed it (test hook for
    /// external crash/removal scenarios).
    pub fn emit(&self, event: StateEvent) {
        let _ = self.events.send(event);
    }

    /// Constant-time check of a presented Bearer secret.
    pub fn verify_secret(&self, session_id: &str, token: &str) -> Result<()> {
        let sandbox = self
            .sandboxes
            .get(session_id)
            .ok_or_else(|| Error::SandboxNotFound(format!("no such sandbox '{session_id}'")))?;
        if sandbox.secret.as_bytes().ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            Err(Error::Validation("invalid sandbox secret".into()))
        }
    }

    /// Drop a sandbox record without emitting events, simulating external
    /// deletion behind the control plane's back.
    pub fn remove_silently(&self, session_id: &str) {
        self.sandboxes.remove(session_id);
    }

    fn set_status(&self, session_id: &str, status: SandboxStatus) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(session_id) {
            sandbox.handle.status = status;
        }
        let _ = self.events.send(StateEvent {
            session_id: session_id.to_string(),
            status,
            error: None,
        });
    }
}

#[async_trait]
impl SandboxProvider for MemorySandboxProvider {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.images.contains_key(image))
    }

    fn image(&self) -> String {
        self.image
            .lock()
            .map(|image| image.clone())
            .unwrap_or_default()
    }

    async fn create(&self, session_id: &str, opts: CreateSandboxOptions) -> Result<SandboxHandle> {
        if self.sandboxes.contains_key(session_id) {
            return Err(Error::Provider(format!(
                "sandbox for session '{session_id}' already exists"
            )));
        }
        let secret = if opts.secret.is_empty() {
            generate_secret()
        } else {
            opts.secret.clone()
        };
        // Creation pulls the image as a side effect.
        self.images.insert(opts.image.clone(), ());
        let handle = SandboxHandle {
            session_id: session_id.to_string(),
            status: SandboxStatus::Running,
            image: opts.image.clone(),
            ports: Vec::new(),
        };
        let agent_url = self
            .default_agent_url
            .lock()
            .ok()
            .and_then(|url| url.clone());
        self.sandboxes.insert(
            session_id.to_string(),
            MemorySandbox {
                handle: handle.clone(),
                secret,
                agent_url,
                labels: opts.labels.clone(),
            },
        );
        let _ = self.events.send(StateEvent {
            session_id: session_id.to_string(),
            status: SandboxStatus::Running,
            error: None,
        });
        Ok(handle)
    }

    async fn get(&self, session_id: &str) -> Result<SandboxHandle> {
        self.sandboxes
            .get(session_id)
            .map(|sandbox| sandbox.handle.clone())
            .ok_or_else(|| Error::SandboxNotFound(format!("no such sandbox '{session_id}'")))
    }

    async fn start(&self, session_id: &str) -> Result<()> {
        let status = self.get(session_id).await?.status;
        if status == SandboxStatus::Running {
            return Err(Error::SandboxAlreadyRunning(format!(
                "sandbox for session '{session_id}' is already running"
            )));
        }
        if let Some(mut failures) = self.start_failures.get_mut(session_id) {
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Provider(format!(
                    "injected start failure for session '{session_id}'"
                )));
            }
        }
        self.set_status(session_id, SandboxStatus::Running);
        Ok(())
    }

    async fn stop(&self, session_id: &str, _timeout: Duration) -> Result<()> {
        let status = self.get(session_id).await?.status;
        if status != SandboxStatus::Running {
            return Err(Error::SandboxNotRunning(format!(
                "sandbox for session '{session_id}' is {status}"
            )));
        }
        self.set_status(session_id, SandboxStatus::Stopped);
        Ok(())
    }

    async fn remove(&self, session_id: &str, _remove_volumes: bool) -> Result<()> {
        if self.sandboxes.remove(session_id).is_none() {
            return Err(Error::SandboxNotFound(format!(
                "no such sandbox '{session_id}'"
            )));
        }
        let _ = self.events.send(StateEvent {
            session_id: session_id.to_string(),
            status: SandboxStatus::Removed,
            error: None,
        });
        Ok(())
    }

    async fn exec(&self, _session_id: &str, _command: &[String]) -> Result<ExecOutput> {
        Err(Error::Provider(
            "exec is not supported by the in-process provider".into(),
        ))
    }

    async fn list(&self) -> Result<Vec<SandboxHandle>> {
        Ok(self
            .sandboxes
            .iter()
            .map(|entry| entry.handle.clone())
            .collect())
    }

    async fn get_secret(&self, session_id: &str) -> Result<String> {
        self.sandboxes
            .get(session_id)
            .map(|sandbox| sandbox.secret.clone())
            .ok_or_else(|| Error::SandboxNotFound(format!("no such sandbox '{session_id}'")))
    }

    async fn http_client(&self, session_id: &str) -> Result<SandboxTransport> {
        let sandbox = self
            .sandboxes
            .get(session_id)
            .ok_or_else(|| Error::SandboxNotFound(format!("no such sandbox '{session_id}'")))?;
        let base_url = sandbox
            .agent_url
            .clone()
            .or_else(|| {
                self.default_agent_url
                    .lock()
                    .ok()
                    .and_then(|url| url.clone())
            })
            .ok_or_else(|| {
                Error::Config(format!(
                    "no agent URL configured for session '{session_id}'"
                ))
            })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(SandboxTransport { client, base_url })
    }

    fn watch(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }
}
