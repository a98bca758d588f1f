//! Worker pool pulling from the job queue with per-resource mutual
//! exclusion.
//!
//! The claim itself is the store's critical section; workers only loop,
//! run the registered handler for the claimed kind, and record the result.
//! Completion events are published after the final status is persisted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{EVENT_JOB_COMPLETED, Event, EventBroker, JobCompleted};
use crate::job::{JobKind, JobRecord, JobStatus};
use crate::metrics::metrics;
use crate::store::Store;

/// How long an idle worker sleeps between claim attempts when no kick
/// arrives.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Ambient context passed to handlers.
#[derive(Clone)]
pub struct JobContext {
    /// Fires when the dispatcher shuts down; handlers should return
    /// promptly (recording failure) once cancelled.
    pub cancel: CancellationToken,
}

/// What a handler reports back for a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Re-queue the job after the delay; used for explicit retries only.
    RetryAfter(Duration),
}

/// Per-kind handler invoked by dispatcher workers.
///
/// Handlers must be idempotent: after crash recovery a job may be re-run
/// and must converge. Any returned error marks the job failed with the
/// error text; errors are not auto-retried.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, job: &JobRecord) -> Result<JobOutcome>;
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    broker: Arc<dyn EventBroker>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    workers: usize,
    kick: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn EventBroker>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            broker,
            handlers: HashMap::new(),
            workers: workers.max(1),
            kick: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// The notifier the queue uses to wake idle workers.
    pub fn kick_handle(&self) -> Arc<Notify> {
        self.kick.clone()
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Spawn the worker pool. Workers run until the shutdown token fires.
    pub fn spawn(self) -> DispatcherHandle {
        let dispatcher = Arc::new(self);
        let handles = (0..dispatcher.workers)
            .map(|worker| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.worker_loop(worker).await })
            })
            .collect();
        DispatcherHandle {
            dispatcher,
            handles,
        }
    }

    async fn worker_loop(&self, worker: usize) {
        debug!("dispatch worker {worker} started");
        loop {
            if self.shutdown.is_cancelled() {
                debug!("dispatch worker {worker} stopping");
                return;
            }
            match self.store.claim_next_job().await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                    // Look for more work immediately; a finished job may
                    // have unblocked its resource key.
                    continue;
                }
                Ok(None) => {}
                Err(err) => error!("worker {worker}: claim failed: {err}"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.kick.notified() => {}
                _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
            }
        }
    }

    async fn run_job(&self, job: JobRecord) {
        metrics().record_job_dispatched();
        let Some(handler) = self.handlers.get(&job.kind) else {
            error!("no handler registered for {} job {}", job.kind, job.id);
            self.finish(&job, JobStatus::Failed, Some(format!("no handler for {}", job.kind)))
                .await;
            return;
        };

        debug!("running {} job {} for {}", job.kind, job.id, job.resource);
        let ctx = JobContext {
            cancel: self.shutdown.child_token(),
        };
        match handler.run(&ctx, &job).await {
            Ok(JobOutcome::Done) => {
                self.finish(&job, JobStatus::Succeeded, None).await;
            }
            Ok(JobOutcome::RetryAfter(delay)) => {
                info!(
                    "{} job {} asked to retry in {delay:?} (attempt {})",
                    job.kind,
                    job.id,
                    job.retries + 1
                );
                metrics().record_job_retried();
                let store = self.store.clone();
                let kick = self.kick.clone();
                let shutdown = self.shutdown.clone();
                let id = job.id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(err) = store.requeue_job(&id).await {
                        error!("failed to requeue job {id}: {err}");
                        return;
                    }
                    kick.notify_waiters();
                });
            }
            Err(err) => {
                warn!("{} job {} failed: {err}", job.kind, job.id);
                metrics().record_job_failed();
                self.finish(&job, JobStatus::Failed, Some(err.to_string()))
                    .await;
            }
        }
    }

    /// Persist the final status, then publish the completion event.
    async fn finish(&self, job: &JobRecord, status: JobStatus, error_text: Option<String>) {
        let finished = match self.store.finish_job(&job.id, status, error_text).await {
            Ok(finished) => finished,
            Err(err) => {
                error!("failed to record result of job {}: {err}", job.id);
                return;
            }
        };
        let data = match serde_json::to_value(JobCompleted::from_job(&finished)) {
            Ok(data) => data,
            Err(err) => {
                error!("failed to encode completion of job {}: {err}", job.id);
                return;
            }
        };
        if let Err(err) = self
            .broker
            .publish(&finished.project_id, Event::new(EVENT_JOB_COMPLETED, data))
            .await
        {
            warn!("failed to publish completion of job {}: {err}", job.id);
        }
        // A finished job may have unblocked a queued sibling on its key.
        self.kick.notify_waiters();
    }
}

pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn kick(&self) {
        self.dispatcher.kick.notify_waiters();
    }

    /// Cancel the shutdown token and wait for every worker to exit.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

// Handlers observing cancellation should surface it as a failure so the job
// record reflects the interrupted run.
impl JobContext {
    pub fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LocalBroker;
    use crate::job::{JobPayload, ResourceKey};
    use crate::queue::JobQueue;
    use crate::store::LocalStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recording {
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
        order: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl Recording {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
                order: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn run(&self, _ctx: &JobContext, job: &JobRecord) -> Result<JobOutcome> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.order.lock().unwrap().push(job.id.clone());
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(JobOutcome::Done)
        }
    }

    fn payload(resource: ResourceKey, allow_duplicates: bool) -> JobPayload {
        JobPayload {
            kind: JobKind::SessionInit,
            body: json!({}),
            resource,
            allow_duplicates,
        }
    }

    async fn wait_for_finished(store: &LocalStore, id: &str) -> JobRecord {
        for _ in 0..200 {
            if let Some(job) = store.get_job(id).await.unwrap() {
                if job.status.is_finished() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test]
    async fn same_key_jobs_never_overlap() {
        let store = Arc::new(LocalStore::in_memory());
        let broker = Arc::new(LocalBroker::new());
        let handler = Recording::new(Duration::from_millis(30));

        let mut dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            4,
            CancellationToken::new(),
        );
        dispatcher.register(JobKind::SessionInit, handler.clone());
        let kick = dispatcher.kick_handle();
        let queue = JobQueue::new(store.clone(), kick);
        let handle = dispatcher.spawn();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let outcome = queue
                .enqueue("p1", payload(ResourceKey::session("s1"), true))
                .await
                .unwrap();
            ids.push(outcome.job().id.clone());
        }
        for id in &ids {
            wait_for_finished(&store, id).await;
        }
        handle.shutdown().await;

        assert_eq!(handler.max_concurrent.load(Ordering::SeqCst), 1);
        let order = handler.order.lock().unwrap().clone();
        assert_eq!(order, ids, "same-key jobs ran out of enqueue order");
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let store = Arc::new(LocalStore::in_memory());
        let broker = Arc::new(LocalBroker::new());
        let handler = Recording::new(Duration::from_millis(50));

        let mut dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            4,
            CancellationToken::new(),
        );
        dispatcher.register(JobKind::SessionInit, handler.clone());
        let queue = JobQueue::new(store.clone(), dispatcher.kick_handle());
        let handle = dispatcher.spawn();

        let mut ids = Vec::new();
        for session in ["a", "b", "c"] {
            let outcome = queue
                .enqueue("p1", payload(ResourceKey::session(session), false))
                .await
                .unwrap();
            ids.push(outcome.job().id.clone());
        }
        for id in &ids {
            wait_for_finished(&store, id).await;
        }
        handle.shutdown().await;

        assert!(handler.max_concurrent.load(Ordering::SeqCst) > 1);
    }

    struct FailOnce {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FailOnce {
        async fn run(&self, _ctx: &JobContext, _job: &JobRecord) -> Result<JobOutcome> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Ok(JobOutcome::RetryAfter(Duration::from_millis(10)));
            }
            Ok(JobOutcome::Done)
        }
    }

    #[tokio::test]
    async fn retry_after_requeues_and_converges() {
        let store = Arc::new(LocalStore::in_memory());
        let broker = Arc::new(LocalBroker::new());
        let mut dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            1,
            CancellationToken::new(),
        );
        dispatcher.register(
            JobKind::SessionInit,
            Arc::new(FailOnce {
                failures_left: AtomicU32::new(2),
            }),
        );
        let queue = JobQueue::new(store.clone(), dispatcher.kick_handle());
        let handle = dispatcher.spawn();

        let outcome = queue
            .enqueue("p1", payload(ResourceKey::session("s1"), false))
            .await
            .unwrap();
        let finished = wait_for_finished(&store, &outcome.job().id).await;
        handle.shutdown().await;

        assert_eq!(finished.status, JobStatus::Succeeded);
        assert_eq!(finished.retries, 2);
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn run(&self, _ctx: &JobContext, _job: &JobRecord) -> Result<JobOutcome> {
            Err(Error::Workspace("patch apply failed".into()))
        }
    }

    #[tokio::test]
    async fn failure_records_error_and_publishes_completion() {
        let store = Arc::new(LocalStore::in_memory());
        let broker = Arc::new(LocalBroker::new());
        let mut rx = broker.subscribe("p1");

        let mut dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            1,
            CancellationToken::new(),
        );
        dispatcher.register(JobKind::SessionInit, Arc::new(AlwaysFails));
        let queue = JobQueue::new(store.clone(), dispatcher.kick_handle());
        let handle = dispatcher.spawn();

        let outcome = queue
            .enqueue("p1", payload(ResourceKey::session("s1"), false))
            .await
            .unwrap();
        let finished = wait_for_finished(&store, &outcome.job().id).await;
        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.error.as_deref().unwrap().contains("patch apply failed"));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EVENT_JOB_COMPLETED);
        let done: JobCompleted = serde_json::from_value(event.data).unwrap();
        assert_eq!(done.job_id, finished.id);
        assert_eq!(done.status, JobStatus::Failed);
        handle.shutdown().await;
    }
}
