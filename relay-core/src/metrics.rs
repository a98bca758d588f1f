//! Process-local metrics counters.
//!
//! All counters use relaxed ordering; they are approximate counters read
//! periodically by whatever surface the embedder wires up, so strict
//! ordering isn't needed.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    /// Jobs claimed and run by the dispatcher since startup.
    pub jobs_dispatched: AtomicU64,
    /// Jobs that finished failed.
    pub jobs_failed: AtomicU64,
    /// Jobs re-queued via a retry-after return.
    pub jobs_retried: AtomicU64,
    /// Sandboxes created through the sandbox service.
    pub sandboxes_created: AtomicU64,
    /// Sandboxes removed through the sandbox service.
    pub sandboxes_removed: AtomicU64,
    /// Sessions stopped by the idle monitor.
    pub sessions_stopped_idle: AtomicU64,
    /// Transport attempts retried by the backoff loop.
    pub transport_retries: AtomicU64,
    /// Reconciliations kicked by the client wrapper.
    pub reconciliations: AtomicU64,
}

static METRICS: Metrics = Metrics::new();

/// Global metrics tracker.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_dispatched: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            sandboxes_created: AtomicU64::new(0),
            sandboxes_removed: AtomicU64::new(0),
            sessions_stopped_idle: AtomicU64::new(0),
            transport_retries: AtomicU64::new(0),
            reconciliations: AtomicU64::new(0),
        }
    }

    pub fn record_job_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_removed(&self) {
        self.sandboxes_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_stopped_idle(&self) {
        self.sessions_stopped_idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_retry(&self) {
        self.transport_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciliation(&self) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            sandboxes_created: self.sandboxes_created.load(Ordering::Relaxed),
            sandboxes_removed: self.sandboxes_removed.load(Ordering::Relaxed),
            sessions_stopped_idle: self.sessions_stopped_idle.load(Ordering::Relaxed),
            transport_retries: self.transport_retries.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_dispatched: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub sandboxes_created: u64,
    pub sandboxes_removed: u64,
    pub sessions_stopped_idle: u64,
    pub transport_retries: u64,
    pub reconciliations: u64,
}
