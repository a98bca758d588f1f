//! Contract for the external git collaborator.

use async_trait::async_trait;

use relay_core::{Result, WorkspaceRecord};

/// Result of ensuring a workspace exists on disk.
#[derive(Clone, Debug)]
pub struct PreparedWorkspace {
    /// Absolute path of the working tree.
    pub path: String,
    /// HEAD after preparation.
    pub head: String,
}

/// The git operations the lifecycle handlers delegate. For `git` sources
/// the implementation clones on first use and fast-forwards afterwards;
/// for `local` sources it verifies the path exists and seeds `git init`
/// plus an initial commit when the directory is empty.
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn ensure_workspace(&self, workspace: &WorkspaceRecord) -> Result<PreparedWorkspace>;
    /// Current HEAD of the working tree at `path`.
    async fn head_commit(&self, path: &str) -> Result<String>;
    /// Apply a patch series (`git am` semantics) and return the new HEAD.
    async fn apply_patches(&self, path: &str, patches: &str) -> Result<String>;
}
