//! Contract for the external agent registry.
//!
//! Project and agent CRUD stay outside the core; initialization only needs
//! to know whether a referenced agent still exists and what the project's
//! default is.

use async_trait::async_trait;

use relay_core::Result;

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent_exists(&self, agent_id: &str) -> Result<bool>;
    /// The project's default agent, if one is configured.
    async fn default_agent(&self, project_id: &str) -> Result<Option<String>>;
}
