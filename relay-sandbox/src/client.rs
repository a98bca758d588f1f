//! Session-bound sandbox client.
//!
//! Wraps the provider's transport and attaches identity, credentials, and
//! reconciliation to every call against the in-sandbox agent API. All
//! public operations share the same plumbing: transport-level retry with
//! backoff, Bearer authorization, the credentials header, and a single
//! reconcile-and-retry-once pass when the sandbox turns out to be gone.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use relay_core::metrics::metrics;
use relay_core::{Error, GitUser, Result, RetrySettings};

use crate::credentials::{CredentialSource, fetch_env_credentials};
use crate::provider::SandboxTransport;
use crate::retry::{classify_request_error, is_retryable_status, retry_transient};
use crate::sse::{SseEvent, empty_stream, spawn_sse_pump};

pub const HEADER_CREDENTIALS: &str = "X-Relay-Credentials";
pub const HEADER_GIT_USER_NAME: &str = "X-Relay-Git-User-Name";
pub const HEADER_GIT_USER_EMAIL: &str = "X-Relay-Git-User-Email";

/// Hooks the sandbox service provides to every session-bound client.
#[async_trait]
pub trait ClientHooks: Send + Sync {
    /// Kick reconciliation for the session and return once the sandbox is
    /// expected to be usable again.
    async fn reconcile(&self, session_id: &str) -> Result<()>;
    /// Record activity against the session for idle accounting.
    fn record_activity(&self, session_id: &str);
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStatus {
    pub is_running: bool,
    #[serde(default)]
    pub completion_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitsResponse {
    pub patches: String,
    pub commit_count: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub content: String,
    pub encoding: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

pub struct SessionClient {
    session_id: String,
    transport: SandboxTransport,
    secret: String,
    hooks: Arc<dyn ClientHooks>,
    credentials: Option<Arc<dyn CredentialSource>>,
    git_user: Option<GitUser>,
    retry: RetrySettings,
    cancel: CancellationToken,
    reconcile_enabled: bool,
    activity_enabled: bool,
}

impl SessionClient {
    pub fn new(
        session_id: impl Into<String>,
        transport: SandboxTransport,
        secret: impl Into<String>,
        hooks: Arc<dyn ClientHooks>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            transport,
            secret: secret.into(),
            hooks,
            credentials: None,
            git_user: None,
            retry: RetrySettings::default(),
            cancel: CancellationToken::new(),
            reconcile_enabled: true,
            activity_enabled: true,
        }
    }

    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Suppress the credentials header for this client.
    pub fn without_credentials(mut self) -> Self {
        self.credentials = None;
        self
    }

    pub fn with_git_user(mut self, git_user: GitUser) -> Self {
        self.git_user = Some(git_user);
        self
    }

    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Bind the client to an external cancellation scope.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Observer mode for the background monitors: no reconciliation kicks,
    /// no activity recording. A status probe must neither resurrect a dead
    /// sandbox nor reset the idle clock.
    pub fn passive(mut self) -> Self {
        self.reconcile_enabled = false;
        self.activity_enabled = false;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── plumbing ─────────────────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url> {
        self.transport
            .base_url
            .join(path)
            .map_err(|err| Error::Http(format!("invalid path '{path}': {err}")))
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.secret))
            .map_err(|_| Error::Config("sandbox secret is not header-safe".into()))?;
        headers.insert(AUTHORIZATION, bearer);

        if let Some(source) = &self.credentials {
            let credentials = fetch_env_credentials(source.as_ref(), &self.session_id).await;
            if !credentials.is_empty() {
                let rendered = serde_json::to_string(&credentials)
                    .map_err(|err| Error::Http(format!("failed to encode credentials: {err}")))?;
                if let Ok(value) = HeaderValue::from_str(&rendered) {
                    headers.insert(HEADER_CREDENTIALS, value);
                }
            }
        }
        if let Some(git_user) = &self.git_user {
            if let Ok(value) = HeaderValue::from_str(&git_user.name) {
                headers.insert(HEADER_GIT_USER_NAME, value);
            }
            if let Ok(value) = HeaderValue::from_str(&git_user.email) {
                headers.insert(HEADER_GIT_USER_EMAIL, value);
            }
        }
        Ok(headers)
    }

    /// One JSON request under the retry policy. A >= 500 status counts as
    /// transient; every other status is returned to the caller.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        let url = self.url(path)?;
        let headers = self.headers().await?;
        retry_transient(&self.retry, &self.cancel, || {
            let mut builder = self
                .transport
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }
            async move {
                let response = builder
                    .send()
                    .await
                    .map_err(|err| classify_request_error(&err))?;
                let status = response.status();
                let text = response
                    .text()
                    .await
                    .map_err(|err| classify_request_error(&err))?;
                if is_retryable_status(status) {
                    return Err(Error::Transport(format!("HTTP {status}: {text}")));
                }
                Ok((status, text))
            }
        })
        .await
    }

    fn agent_error(&self, status: StatusCode, body: &str) -> Error {
        let message = serde_json::from_str::<AgentErrorBody>(body)
            .ok()
            .map(|parsed| {
                if parsed.message.is_empty() {
                    parsed.error
                } else {
                    parsed.message
                }
            })
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| body.trim().to_string());
        Error::Agent {
            status: status.as_u16(),
            message,
        }
    }

    fn expect_json(&self, status: StatusCode, text: &str) -> Result<Value> {
        if !status.is_success() {
            return Err(self.agent_error(status, text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(text)
            .map_err(|err| Error::Http(format!("malformed agent response: {err}")))
    }

    /// Open an SSE endpoint under the retry policy. 204 maps to the empty
    /// closed stream, never an error.
    async fn open_sse(&self, path: &str) -> Result<mpsc::Receiver<SseEvent>> {
        let url = self.url(path)?;
        let headers = self.headers().await?;
        let response = retry_transient(&self.retry, &self.cancel, || {
            let builder = self
                .transport
                .client
                .get(url.clone())
                .headers(headers.clone())
                .header(ACCEPT, "text/event-stream");
            async move {
                let response = builder
                    .send()
                    .await
                    .map_err(|err| classify_request_error(&err))?;
                if is_retryable_status(response.status()) {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::Transport(format!("HTTP {status}: {text}")));
                }
                Ok(response)
            }
        })
        .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(empty_stream()),
            status if status.is_success() => {
                Ok(spawn_sse_pump(response, self.cancel.child_token()))
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(self.agent_error(status, &text))
            }
        }
    }

    /// Shared reconcile-on-unavailable semantics for every operation: one
    /// reconciliation kick, one retry, activity recorded on success.
    async fn with_reconcile<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut result = op().await;
        if self.reconcile_enabled {
            if let Err(err) = &result {
                if err.is_sandbox_unavailable() {
                    info!(
                        "session {}: sandbox unavailable ({err}), reconciling",
                        self.session_id
                    );
                    metrics().record_reconciliation();
                    self.hooks.reconcile(&self.session_id).await?;
                    result = op().await;
                }
            }
        }
        if result.is_ok() && self.activity_enabled {
            self.hooks.record_activity(&self.session_id);
        }
        result
    }

    // ── chat ─────────────────────────────────────────────────────────────

    /// POST the messages (202 expected) and attach to the completion
    /// stream. The stream is a lazy finite sequence closed by `[DONE]`,
    /// EOF, or cancellation.
    pub async fn send_messages(&self, messages: Value) -> Result<mpsc::Receiver<SseEvent>> {
        let body = json!({ "messages": messages });
        self.with_reconcile(|| async {
            let (status, text) = self
                .request(Method::POST, "/chat", &[], Some(body.clone()))
                .await?;
            match status {
                StatusCode::ACCEPTED => {}
                status if !status.is_success() => return Err(self.agent_error(status, &text)),
                _ => {}
            }
            self.open_sse("/chat").await
        })
        .await
    }

    /// Attach to an in-progress completion stream. A 204 yields an empty
    /// closed sequence.
    pub async fn get_stream(&self) -> Result<mpsc::Receiver<SseEvent>> {
        self.with_reconcile(|| self.open_sse("/chat")).await
    }

    /// The recorded message list (`GET /chat` without the SSE accept
    /// header).
    pub async fn get_messages(&self) -> Result<Vec<Value>> {
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::GET, "/chat", &[], None).await?;
            let value = self.expect_json(status, &text)?;
            value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| Error::Http("malformed /chat response: missing messages".into()))
        })
        .await
    }

    pub async fn get_chat_status(&self) -> Result<ChatStatus> {
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::GET, "/chat/status", &[], None).await?;
            let value = self.expect_json(status, &text)?;
            serde_json::from_value(value)
                .map_err(|err| Error::Http(format!("malformed chat status: {err}")))
        })
        .await
    }

    /// Cancel the running completion; a 409 maps to
    /// [`Error::NoActiveCompletion`].
    pub async fn cancel_completion(&self) -> Result<()> {
        self.with_reconcile(|| async {
            let (status, text) = self
                .request(Method::POST, "/chat/cancel", &[], None)
                .await?;
            if status == StatusCode::CONFLICT {
                return Err(Error::NoActiveCompletion);
            }
            if !status.is_success() {
                return Err(self.agent_error(status, &text));
            }
            Ok(())
        })
        .await
    }

    // ── files ────────────────────────────────────────────────────────────

    pub async fn list_files(&self, path: &str, hidden: bool) -> Result<Value> {
        let query = [
            ("path", path.to_string()),
            ("hidden", hidden.to_string()),
        ];
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::GET, "/files", &query, None).await?;
            self.expect_json(status, &text)
        })
        .await
    }

    pub async fn read_file(&self, path: &str) -> Result<FileContent> {
        let query = [("path", path.to_string())];
        self.with_reconcile(|| async {
            let (status, text) = self
                .request(Method::GET, "/files/read", &query, None)
                .await?;
            let value = self.expect_json(status, &text)?;
            serde_json::from_value(value)
                .map_err(|err| Error::Http(format!("malformed file response: {err}")))
        })
        .await
    }

    pub async fn write_file(&self, request: &WriteFileRequest) -> Result<Value> {
        let body = serde_json::to_value(request)
            .map_err(|err| Error::Http(format!("failed to encode write request: {err}")))?;
        self.with_reconcile(|| async {
            let (status, text) = self
                .request(Method::POST, "/files/write", &[], Some(body.clone()))
                .await?;
            self.expect_json(status, &text)
        })
        .await
    }

    // ── diff & commits ───────────────────────────────────────────────────

    /// `GET /diff`. The response is one of three shapes (full diff,
    /// per-path diff, file summary with `format=files`) and is passed
    /// through unparsed.
    pub async fn get_diff(&self, path: Option<&str>, files_format: bool) -> Result<Value> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(path) = path {
            query.push(("path", path.to_string()));
        }
        if files_format {
            query.push(("format", "files".to_string()));
        }
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::GET, "/diff", &query, None).await?;
            self.expect_json(status, &text)
        })
        .await
    }

    /// The patch series the agent has ready on top of `parent`.
    pub async fn get_commits(&self, parent: &str) -> Result<CommitsResponse> {
        let query = [("parent", parent.to_string())];
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::GET, "/commits", &query, None).await?;
            let value = self.expect_json(status, &text)?;
            serde_json::from_value(value)
                .map_err(|err| Error::Http(format!("malformed commits response: {err}")))
        })
        .await
    }

    // ── services ─────────────────────────────────────────────────────────

    pub async fn list_services(&self) -> Result<Value> {
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::GET, "/services", &[], None).await?;
            self.expect_json(status, &text)
        })
        .await
    }

    pub async fn start_service(&self, service_id: &str) -> Result<()> {
        let path = format!("/services/{service_id}/start");
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::POST, &path, &[], None).await?;
            if !status.is_success() {
                return Err(self.agent_error(status, &text));
            }
            Ok(())
        })
        .await
    }

    pub async fn stop_service(&self, service_id: &str) -> Result<()> {
        let path = format!("/services/{service_id}/stop");
        self.with_reconcile(|| async {
            let (status, text) = self.request(Method::POST, &path, &[], None).await?;
            if !status.is_success() {
                return Err(self.agent_error(status, &text));
            }
            Ok(())
        })
        .await
    }

    /// SSE stream of a service's output.
    pub async fn service_output(&self, service_id: &str) -> Result<mpsc::Receiver<SseEvent>> {
        let path = format!("/services/{service_id}/output");
        self.with_reconcile(|| self.open_sse(&path)).await
    }
}
