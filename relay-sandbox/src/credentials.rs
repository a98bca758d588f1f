//! Credential fetch and env-var mapping for sandbox requests.
//!
//! The credential store (encryption at rest included) is external; this
//! module only maps decrypted credentials onto the env vars the in-sandbox
//! agent understands and renders them into the credentials header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use relay_core::Result;

/// A credential rendered as the environment variable the agent expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarCredential {
    #[serde(rename = "envVar")]
    pub env_var: String,
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    ApiKey,
    OAuth,
}

/// A decrypted credential as handed over by the external credential store.
#[derive(Clone, Debug)]
pub struct ProviderCredential {
    /// Model provider slug, e.g. `anthropic`.
    pub provider: String,
    pub kind: CredentialKind,
    pub secret: String,
}

/// Acceptable env vars per model provider, in priority order: index 0 is
/// the API-key variable, index 1 (when declared) the OAuth-token variable.
pub struct ProviderEnvVars {
    pub provider: &'static str,
    pub env_vars: &'static [&'static str],
}

pub const PROVIDER_ENV_VARS: &[ProviderEnvVars] = &[
    ProviderEnvVars {
        provider: "anthropic",
        env_vars: &["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"],
    },
    ProviderEnvVars {
        provider: "openai",
        env_vars: &["OPENAI_API_KEY"],
    },
    ProviderEnvVars {
        provider: "google",
        env_vars: &["GEMINI_API_KEY"],
    },
];

/// Map a credential to its env var. OAuth credentials take the provider's
/// OAuth variable when one is declared, else the first; API keys always
/// take the first. Unknown providers map to nothing.
pub fn map_credential(credential: &ProviderCredential) -> Option<EnvVarCredential> {
    let entry = PROVIDER_ENV_VARS
        .iter()
        .find(|entry| entry.provider.eq_ignore_ascii_case(&credential.provider))?;
    let index = match credential.kind {
        CredentialKind::OAuth if entry.env_vars.len() > 1 => 1,
        _ => 0,
    };
    entry.env_vars.get(index).map(|var| EnvVarCredential {
        env_var: (*var).to_string(),
        value: credential.secret.clone(),
    })
}

/// Source of decrypted credentials for a session's project.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials_for_session(&self, session_id: &str) -> Result<Vec<ProviderCredential>>;
}

/// Fetch and map the session's credentials to env-var form. Failures are
/// logged and yield an empty list; credential trouble never blocks a call.
pub async fn fetch_env_credentials(
    source: &dyn CredentialSource,
    session_id: &str,
) -> Vec<EnvVarCredential> {
    match source.credentials_for_session(session_id).await {
        Ok(credentials) => credentials.iter().filter_map(map_credential).collect(),
        Err(err) => {
            warn!("credential fetch failed for session {session_id}: {err}");
            Vec::new()
        }
    }
}
