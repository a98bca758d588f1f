use std::fmt;

/// Errors returned by control plane operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Invalid input: session id format, wrong project ownership, illegal
    /// state transition.
    Validation(String),
    /// Requested record not found in the store.
    NotFound(String),
    /// Provider reports no sandbox for the session.
    SandboxNotFound(String),
    /// Provider reports the sandbox exists but is not running.
    SandboxNotRunning(String),
    /// Provider reports the sandbox is already running.
    SandboxAlreadyRunning(String),
    /// Sandbox provider/runtime failure.
    Provider(String),
    /// Transient transport failure; retried with backoff.
    Transport(String),
    /// Transport retries exhausted; carries the final failure text.
    RetryExhausted { attempts: u32, last: String },
    /// Non-retryable HTTP failure (bad URL, malformed response body).
    Http(String),
    /// Agent-reported error: a non-2xx JSON response from the sandbox.
    Agent { status: u16, message: String },
    /// Cancel was requested with no completion in progress.
    NoActiveCompletion,
    /// Session initialization failed; the session carries the detail.
    Initialization(String),
    /// Git setup, patch apply, or base-commit failure.
    Workspace(String),
    /// Store read/write failure.
    Storage(String),
    /// Event broker failure.
    Broker(String),
    /// Missing or invalid static configuration.
    Config(String),
    /// The operation's context was cancelled.
    Cancelled,
    /// A bounded wait elapsed.
    Timeout(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "validation error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::SandboxNotFound(msg) => write!(f, "sandbox not found: {msg}"),
            Error::SandboxNotRunning(msg) => write!(f, "sandbox is not running: {msg}"),
            Error::SandboxAlreadyRunning(msg) => write!(f, "sandbox is already running: {msg}"),
            Error::Provider(msg) => write!(f, "provider error: {msg}"),
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::RetryExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts: {last}")
            }
            Error::Http(msg) => write!(f, "http error: {msg}"),
            Error::Agent { status, message } => write!(f, "agent error (HTTP {status}): {message}"),
            Error::NoActiveCompletion => write!(f, "no completion in progress"),
            Error::Initialization(msg) => write!(f, "initialization error: {msg}"),
            Error::Workspace(msg) => write!(f, "workspace error: {msg}"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::Broker(msg) => write!(f, "broker error: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Timeout(msg) => write!(f, "timed out: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether the sandbox should be reconciled before retrying the failed
    /// operation. Matches the provider sentinels and their substring
    /// equivalents in wrapped error text.
    pub fn is_sandbox_unavailable(&self) -> bool {
        match self {
            Error::SandboxNotFound(_) | Error::SandboxNotRunning(_) => true,
            Error::Provider(msg)
            | Error::Transport(msg)
            | Error::Http(msg)
            | Error::Agent { message: msg, .. } => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("sandbox not found")
                    || msg.contains("sandbox is not running")
                    || msg.contains("no such sandbox")
            }
            _ => false,
        }
    }

    /// Whether the transport retry loop should consume this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_variants_are_unavailable() {
        assert!(Error::SandboxNotFound("s1".into()).is_sandbox_unavailable());
        assert!(Error::SandboxNotRunning("s1".into()).is_sandbox_unavailable());
        assert!(!Error::NotFound("session 's1'".into()).is_sandbox_unavailable());
    }

    #[test]
    fn substring_match_in_wrapped_text() {
        let err = Error::Agent {
            status: 502,
            message: "upstream said: sandbox not found".into(),
        };
        assert!(err.is_sandbox_unavailable());

        let err = Error::Transport("connection reset by peer".into());
        assert!(!err.is_sandbox_unavailable());
        assert!(err.is_transient());
    }

    #[test]
    fn retry_exhausted_carries_cause() {
        let err = Error::RetryExhausted {
            attempts: 15,
            last: "unexpected EOF".into(),
        };
        let text = err.to_string();
        assert!(text.contains("15 attempts"));
        assert!(text.contains("unexpected EOF"));
    }
}
