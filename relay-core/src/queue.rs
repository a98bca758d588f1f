//! The durable lifecycle job queue.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::job::{JobPayload, JobRecord};
use crate::store::Store;

/// Outcome of an enqueue.
#[derive(Clone, Debug)]
pub enum EnqueueOutcome {
    /// A new job was persisted.
    Enqueued(JobRecord),
    /// `allow_duplicates` was off and the resource key already had a
    /// queued-or-running job of the same kind; enqueue is an idempotent
    /// no-op and the caller may wait on the existing job's completion.
    Coalesced(JobRecord),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &JobRecord {
        match self {
            EnqueueOutcome::Enqueued(job) | EnqueueOutcome::Coalesced(job) => job,
        }
    }
}

/// Accepts opaque payloads, persists them durably, and kicks the dispatcher.
///
/// Enqueue returns success once the job is durable. With
/// `allow_duplicates=true`, concurrent jobs against the same resource key
/// are still serialized by the dispatcher and run in enqueue order;
/// interleavings across the duplicates are the caller's concern.
pub struct JobQueue {
    store: Arc<dyn Store>,
    kick: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, kick: Arc<Notify>) -> Self {
        Self { store, kick }
    }

    pub async fn enqueue(&self, project_id: &str, payload: JobPayload) -> Result<EnqueueOutcome> {
        let record = JobRecord::new(project_id, payload);
        let (job, created) = self.store.enqueue_job(record).await?;
        if created {
            debug!("enqueued {} job {} for {}", job.kind, job.id, job.resource);
            self.kick.notify_waiters();
            Ok(EnqueueOutcome::Enqueued(job))
        } else {
            debug!(
                "coalesced {} enqueue for {} into job {}",
                job.kind, job.resource, job.id
            );
            Ok(EnqueueOutcome::Coalesced(job))
        }
    }
}
