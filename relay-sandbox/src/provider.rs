//! The sandbox provider contract.
//!
//! Providers own the actual isolation mechanism (containers on Linux,
//! lightweight VMs elsewhere); the control plane consumes this trait and
//! never sees the mechanism. The in-process implementation lives in
//! [`crate::memory`]; container/VM providers are external crates.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

use relay_core::Result;

/// Observed runtime state of a sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Created,
    Running,
    Stopped,
    Failed,
    Removed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Created => "created",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A port published from the sandbox to the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    pub container_port: u16,
    pub host_ip: String,
    pub host_port: u16,
}

/// Runtime-only handle describing a sandbox. Never persisted; the session
/// record is the durable side of the pairing.
#[derive(Clone, Debug)]
pub struct SandboxHandle {
    pub session_id: String,
    pub status: SandboxStatus,
    pub image: String,
    pub ports: Vec<PublishedPort>,
}

/// Label keys attached to every sandbox at creation.
pub const LABEL_SESSION: &str = "relay.session";
pub const LABEL_WORKSPACE: &str = "relay.workspace";
pub const LABEL_PROJECT: &str = "relay.project";

#[derive(Clone, Debug, Default)]
pub struct CreateSandboxOptions {
    pub image: String,
    /// Workspace path mounted (or synced) into the sandbox.
    pub workspace_path: String,
    /// Workspace HEAD the sandbox starts from.
    pub workspace_commit: String,
    pub labels: HashMap<String, String>,
    /// Shared secret the in-sandbox agent requires as its Bearer token.
    pub secret: String,
    pub env: Vec<(String, String)>,
}

/// State-change event emitted by the provider's watch stream.
#[derive(Clone, Debug)]
pub struct StateEvent {
    pub session_id: String,
    pub status: SandboxStatus,
    pub error: Option<String>,
}

/// Transport for reaching the in-sandbox agent API. The URL host is
/// cosmetic; the client routes to the sandbox over whatever the provider
/// wired up (TCP, VSOCK, or in-process).
#[derive(Clone, Debug)]
pub struct SandboxTransport {
    pub client: reqwest::Client,
    pub base_url: Url,
}

#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Create, inspect, and tear down sandboxes.
///
/// Error sentinels: a missing sandbox is `Error::SandboxNotFound`, a
/// present-but-stopped one `Error::SandboxNotRunning`, a double start
/// `Error::SandboxAlreadyRunning`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;
    /// Identifier of the image new sandboxes are created from.
    fn image(&self) -> String;
    /// Create and start a sandbox for the session.
    async fn create(&self, session_id: &str, opts: CreateSandboxOptions) -> Result<SandboxHandle>;
    async fn get(&self, session_id: &str) -> Result<SandboxHandle>;
    async fn start(&self, session_id: &str) -> Result<()>;
    async fn stop(&self, session_id: &str, timeout: Duration) -> Result<()>;
    /// Remove the sandbox; `remove_volumes` also discards its data volumes.
    async fn remove(&self, session_id: &str, remove_volumes: bool) -> Result<()>;
    async fn exec(&self, session_id: &str, command: &[String]) -> Result<ExecOutput>;
    async fn list(&self) -> Result<Vec<SandboxHandle>>;
    /// The sandbox's shared Bearer secret.
    async fn get_secret(&self, session_id: &str) -> Result<String>;
    /// Transport bound to the session's sandbox.
    async fn http_client(&self, session_id: &str) -> Result<SandboxTransport>;
    /// Subscribe to state-change events. Each call returns an independent
    /// subscription.
    fn watch(&self) -> broadcast::Receiver<StateEvent>;
}
