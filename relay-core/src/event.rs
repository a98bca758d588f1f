//! Event broker contract and the in-process implementation.
//!
//! The broker is an external collaborator; the core only promises to
//! publish at most one event per session-status change, in the order the
//! changes were persisted (handlers persist first, then publish).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::job::{JobKind, JobRecord, JobStatus, ResourceKey, ResourceType};
use crate::session::SessionRecord;
use crate::store::Store;
use crate::util::now_ts;

pub const EVENT_SESSION_UPDATED: &str = "session-updated";
pub const EVENT_JOB_COMPLETED: &str = "job-completed";

/// Event published to a project's subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: u64,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            timestamp: now_ts(),
            data,
        }
    }
}

/// Payload of an [`EVENT_JOB_COMPLETED`] event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompleted {
    pub job_id: String,
    pub kind: JobKind,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobCompleted {
    pub fn from_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            resource_type: job.resource.resource_type,
            resource_id: job.resource.resource_id.clone(),
            status: job.status,
            error: job.error.clone(),
        }
    }
}

/// Publish per-project events and hand out subscriptions.
#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(&self, project_id: &str, event: Event) -> Result<()>;
    fn subscribe(&self, project_id: &str) -> broadcast::Receiver<Event>;
}

/// In-process broker over per-project broadcast channels.
pub struct LocalBroker {
    channels: DashMap<String, broadcast::Sender<Event>>,
    capacity: usize,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            capacity: 256,
        }
    }

    fn sender(&self, project_id: &str) -> broadcast::Sender<Event> {
        self.channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for LocalBroker {
    async fn publish(&self, project_id: &str, event: Event) -> Result<()> {
        // A send with no subscribers is not a failure.
        let _ = self.sender(project_id).send(event);
        Ok(())
    }

    fn subscribe(&self, project_id: &str) -> broadcast::Receiver<Event> {
        self.sender(project_id).subscribe()
    }
}

/// Publish the advisory `session-updated` event for a freshly persisted
/// session state. Carries the session status and the commit status; clients
/// treat it as unordered with respect to handler progress.
pub async fn publish_session_event(broker: &dyn EventBroker, session: &SessionRecord) {
    let data = json!({
        "sessionId": session.id,
        "status": session.status,
        "commitStatus": session.commit_status,
        "error": session.error_message,
        "commitError": session.commit_error,
    });
    if let Err(err) = broker
        .publish(&session.project_id, Event::new(EVENT_SESSION_UPDATED, data))
        .await
    {
        tracing::warn!("failed to publish session event for {}: {err}", session.id);
    }
}

/// Wait for the completion of the job currently scoped to `resource`.
///
/// Subscribes before consulting the store so a completion landing between
/// the two cannot be missed; a job that already finished resolves
/// immediately from the store.
pub async fn wait_for_job_completion(
    broker: &dyn EventBroker,
    store: &dyn Store,
    project_id: &str,
    resource: &ResourceKey,
    deadline: Duration,
) -> Result<(JobStatus, Option<String>)> {
    let mut rx = broker.subscribe(project_id);

    if let Some(job) = store.latest_job_for(resource).await? {
        if job.status.is_finished() {
            return Ok((job.status, job.error));
        }
    }

    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if event.event_type == EVENT_JOB_COMPLETED => {
                    if let Ok(done) = serde_json::from_value::<JobCompleted>(event.data.clone()) {
                        if done.resource_type == resource.resource_type
                            && done.resource_id == resource.resource_id
                        {
                            return Ok((done.status, done.error));
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("job wait lagged by {skipped} events; checking the store");
                    if let Some(job) = store.latest_job_for(resource).await? {
                        if job.status.is_finished() {
                            return Ok((job.status, job.error));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Broker("event stream closed".into()));
                }
            }
        }
    };

    match tokio::time::timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "no completion for {resource} within {deadline:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use crate::store::LocalStore;
    use serde_json::json;
    use std::sync::Arc;

    fn job(resource: ResourceKey) -> JobRecord {
        JobRecord::new(
            "p1",
            JobPayload {
                kind: JobKind::SessionInit,
                body: json!({}),
                resource,
                allow_duplicates: false,
            },
        )
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let broker = LocalBroker::new();
        let mut rx = broker.subscribe("p1");
        broker
            .publish("p1", Event::new("session-updated", json!({"sessionId": "s1"})))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "session-updated");
    }

    #[tokio::test]
    async fn wait_resolves_from_store_when_already_finished() {
        let broker = LocalBroker::new();
        let store = LocalStore::in_memory();
        let resource = ResourceKey::session("s1");
        let (record, _) = store.enqueue_job(job(resource.clone())).await.unwrap();
        store.claim_next_job().await.unwrap();
        store
            .finish_job(&record.id, JobStatus::Succeeded, None)
            .await
            .unwrap();

        let (status, error) = wait_for_job_completion(
            &broker,
            &store,
            "p1",
            &resource,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(status, JobStatus::Succeeded);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn wait_resolves_from_event() {
        let broker = Arc::new(LocalBroker::new());
        let store = Arc::new(LocalStore::in_memory());
        let resource = ResourceKey::session("s1");
        let (record, _) = store.enqueue_job(job(resource.clone())).await.unwrap();

        let publisher = {
            let broker = broker.clone();
            let store = store.clone();
            let id = record.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.claim_next_job().await.unwrap();
                let finished = store
                    .finish_job(&id, JobStatus::Failed, Some("boom".into()))
                    .await
                    .unwrap();
                let data = serde_json::to_value(JobCompleted::from_job(&finished)).unwrap();
                broker
                    .publish("p1", Event::new(EVENT_JOB_COMPLETED, data))
                    .await
                    .unwrap();
            })
        };

        let (status, error) = wait_for_job_completion(
            broker.as_ref(),
            store.as_ref(),
            "p1",
            &resource,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        publisher.await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn wait_times_out_without_completion() {
        let broker = LocalBroker::new();
        let store = LocalStore::in_memory();
        let resource = ResourceKey::session("s1");
        let result = wait_for_job_completion(
            &broker,
            &store,
            "p1",
            &resource,
            Duration::from_millis(30),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
