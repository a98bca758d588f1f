//! Control plane configuration.
//!
//! Loaded from `RELAY_*` environment variables with built-in defaults, but
//! passed by value into services so tests can build variants without
//! touching the process environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Exponential backoff settings for the sandbox transport.
#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            multiplier: 2,
            cap: Duration::from_secs(2),
            max_attempts: 15,
        }
    }
}

/// Git identity attached to sandbox requests when configured.
#[derive(Clone, Debug)]
pub struct GitUser {
    pub name: String,
    pub email: String,
}

#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Directory for the JSON state files; `None` keeps state in memory.
    pub state_dir: Option<PathBuf>,
    /// Dispatcher worker pool size.
    pub worker_count: usize,
    /// Inactivity window after which a session is suspended.
    pub idle_timeout: Duration,
    /// Idle monitor scan interval.
    pub idle_check_interval: Duration,
    /// Status poller period; the first check lands one period after the kick.
    pub status_poll_interval: Duration,
    /// Deadline for a reconciliation job's completion event.
    pub reconcile_wait: Duration,
    /// Window for polling the store while a session works through its
    /// intermediate states.
    pub ready_poll_window: Duration,
    /// Tick of that poll.
    pub ready_poll_tick: Duration,
    /// Graceful sandbox stop deadline.
    pub stop_timeout: Duration,
    /// Per-session `GetChatStatus` deadline during idle checks.
    pub chat_status_timeout: Duration,
    /// Deadline for broker publishes that wait on delivery.
    pub event_wait: Duration,
    pub retry: RetrySettings,
    pub git_user: Option<GitUser>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            worker_count: 4,
            idle_timeout: Duration::from_secs(1500),
            idle_check_interval: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(5),
            reconcile_wait: Duration::from_secs(120),
            ready_poll_window: Duration::from_secs(30),
            ready_poll_tick: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            chat_status_timeout: Duration::from_secs(3),
            event_wait: Duration::from_secs(5),
            retry: RetrySettings::default(),
            git_user: None,
        }
    }
}

impl ControlConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let git_user = match (env::var("RELAY_GIT_USER_NAME"), env::var("RELAY_GIT_USER_EMAIL")) {
            (Ok(name), Ok(email)) if !name.trim().is_empty() && !email.trim().is_empty() => {
                Some(GitUser {
                    name: name.trim().to_string(),
                    email: email.trim().to_string(),
                })
            }
            _ => None,
        };
        Self {
            state_dir: env::var("RELAY_STATE_DIR").ok().map(PathBuf::from),
            worker_count: env_usize("RELAY_WORKER_COUNT", defaults.worker_count),
            idle_timeout: env_secs("RELAY_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            idle_check_interval: env_secs(
                "RELAY_IDLE_CHECK_INTERVAL_SECS",
                defaults.idle_check_interval,
            ),
            status_poll_interval: env_secs(
                "RELAY_STATUS_POLL_INTERVAL_SECS",
                defaults.status_poll_interval,
            ),
            reconcile_wait: env_secs("RELAY_RECONCILE_WAIT_SECS", defaults.reconcile_wait),
            ready_poll_window: env_secs("RELAY_READY_POLL_SECS", defaults.ready_poll_window),
            ready_poll_tick: env_millis("RELAY_READY_POLL_TICK_MS", defaults.ready_poll_tick),
            stop_timeout: env_secs("RELAY_STOP_TIMEOUT_SECS", defaults.stop_timeout),
            chat_status_timeout: env_secs(
                "RELAY_CHAT_STATUS_TIMEOUT_SECS",
                defaults.chat_status_timeout,
            ),
            event_wait: env_secs("RELAY_EVENT_WAIT_SECS", defaults.event_wait),
            retry: RetrySettings {
                initial: env_millis("RELAY_RETRY_INITIAL_MS", defaults.retry.initial),
                multiplier: env_u32("RELAY_RETRY_MULTIPLIER", defaults.retry.multiplier),
                cap: env_millis("RELAY_RETRY_CAP_MS", defaults.retry.cap),
                max_attempts: env_u32("RELAY_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
            },
            git_user,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
