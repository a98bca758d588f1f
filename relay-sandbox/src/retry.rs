//! Transport-level retry: exponential backoff over the transient-failure
//! classifier.
//!
//! Retried outcomes: EOF and friends, connection refused/reset, DNS lookup
//! failures, I/O timeouts, and HTTP status >= 500 (the caller maps those to
//! `Error::Transport` before retrying). Everything else returns
//! immediately. Backoff sleeps are interruptible by cancellation.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_core::metrics::metrics;
use relay_core::{Error, Result, RetrySettings};

/// Patterns in reqwest error text that mark a failure as transient. The
/// concrete strings come from hyper/h2 I/O errors surfaced through reqwest.
const TRANSIENT_PATTERNS: &[&str] = &[
    "unexpected eof",
    "end of file",
    "connection refused",
    "connection reset",
    "broken pipe",
    "dns error",
    "failed to lookup",
    "timed out",
    "incomplete message",
    "connection closed",
];

/// Classify a reqwest failure: transient transport trouble becomes
/// `Error::Transport` (retried), anything else `Error::Http` (returned).
pub fn classify_request_error(err: &reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() {
        return Error::Transport(err.to_string());
    }
    let text = full_error_text(err);
    let lower = text.to_ascii_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        Error::Transport(text)
    } else {
        Error::Http(text)
    }
}

/// reqwest's `Display` hides the source chain; fold it back in so the
/// substring classifier sees the underlying I/O error.
fn full_error_text(err: &reqwest::Error) -> String {
    use std::error::Error as _;
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Whether an HTTP status should be retried at the transport level.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
}

/// Run `op` under the backoff policy. Only transient errors are retried;
/// exhaustion returns `Error::RetryExhausted` wrapping the final failure
/// text. Cancellation terminates within one backoff window.
pub async fn retry_transient<T, F, Fut>(
    settings: &RetrySettings,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = settings.initial;
    let mut last: Option<Error> = None;

    for attempt in 1..=settings.max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                debug!(
                    "transient transport failure (attempt {attempt}/{}): {err}",
                    settings.max_attempts
                );
                metrics().record_transport_retry();
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
        if attempt == settings.max_attempts {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * settings.multiplier).min(settings.cap);
    }

    Err(Error::RetryExhausted {
        attempts: settings.max_attempts,
        last: last.map(|err| err.to_string()).unwrap_or_default(),
    })
}
