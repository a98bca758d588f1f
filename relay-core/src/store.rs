//! Store contract and the JSON-file implementation.
//!
//! The control plane expects atomic single-row updates; invariants spanning
//! rows are enforced by handler logic while the matching resource key is
//! held. [`LocalStore`] keeps every table behind one mutex and writes each
//! table to its own JSON file with a tmp+rename, which gives the claim path
//! its single-critical-section guarantee.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::job::{JobRecord, JobStatus, ResourceKey};
use crate::session::{SessionEvent, SessionRecord, SessionStatus};
use crate::util::now_ts;
use crate::workspace::WorkspaceRecord;

/// Single-row session update, validated inside the store's critical
/// section; returning an error aborts the write.
pub type SessionUpdate = Box<dyn FnOnce(&mut SessionRecord) -> Result<()> + Send>;
pub type WorkspaceUpdate = Box<dyn FnOnce(&mut WorkspaceRecord) -> Result<()> + Send>;

/// Transactional persistence of sessions, workspaces, and jobs.
#[async_trait]
pub trait Store: Send + Sync {
    // ── sessions ─────────────────────────────────────────────────────────
    async fn insert_session(&self, record: SessionRecord) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>>;
    /// Apply `update` to the session under the store lock and persist the
    /// result. The closure may reject the update by returning an error.
    async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<SessionRecord>;
    async fn sessions_with_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>>;
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    // ── workspaces ───────────────────────────────────────────────────────
    async fn insert_workspace(&self, record: WorkspaceRecord) -> Result<()>;
    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>>;
    async fn update_workspace(&self, id: &str, update: WorkspaceUpdate)
        -> Result<WorkspaceRecord>;

    // ── jobs ─────────────────────────────────────────────────────────────
    /// Persist a job, honoring its `allow_duplicates` flag: with the flag
    /// off, a queued-or-running job of the same kind and resource key is
    /// returned instead of inserting. The bool reports whether a new job
    /// was created. The check and the insert are one critical section.
    async fn enqueue_job(&self, record: JobRecord) -> Result<(JobRecord, bool)>;
    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;
    /// The queued-or-running job with the given resource key, if any.
    async fn active_job_for(&self, resource: &ResourceKey) -> Result<Option<JobRecord>>;
    /// The most recently enqueued job for the resource key, regardless of
    /// status.
    async fn latest_job_for(&self, resource: &ResourceKey) -> Result<Option<JobRecord>>;
    /// Atomically claim the oldest queued job whose resource key has no
    /// running job. The whole claim is one critical section: two dispatch
    /// workers can never claim jobs with the same key.
    async fn claim_next_job(&self) -> Result<Option<JobRecord>>;
    async fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<JobRecord>;
    /// Put a running job back at the tail of the queue (retry-after).
    async fn requeue_job(&self, id: &str) -> Result<JobRecord>;
}

/// Validate and apply a lifecycle event as one store update.
pub async fn transition_session(
    store: &dyn Store,
    id: &str,
    event: SessionEvent,
) -> Result<SessionRecord> {
    store
        .update_session(
            id,
            Box::new(move |session| {
                session.apply(event)?;
                Ok(())
            }),
        )
        .await
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    workspaces: HashMap<String, WorkspaceRecord>,
    jobs: HashMap<String, JobRecord>,
    next_seq: u64,
}

/// JSON-file-backed store. Each table lives in its own file under the state
/// directory (`sessions.json`, `workspaces.json`, `jobs.json`); writes go
/// through a tmp file and an atomic rename. With no directory configured
/// the store is memory-only, which is what the tests use.
pub struct LocalStore {
    inner: Mutex<Tables>,
    dir: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) a store rooted at `dir`, loading any existing
    /// table files.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .map_err(|err| Error::Storage(format!("failed to create {}: {err}", dir.display())))?;
        }
        let sessions: HashMap<String, SessionRecord> = load_table(&dir, "sessions.json")?;
        let workspaces: HashMap<String, WorkspaceRecord> = load_table(&dir, "workspaces.json")?;
        let mut jobs: HashMap<String, JobRecord> = load_table(&dir, "jobs.json")?;
        // Jobs a previous process left running were interrupted mid-handler;
        // re-queue them so the dispatcher re-runs them to convergence.
        let mut recovered = false;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Queued;
                job.claimed_at = None;
                recovered = true;
            }
        }
        let next_seq = jobs.values().map(|j| j.seq).max().map_or(1, |s| s + 1);
        let store = Self {
            inner: Mutex::new(Tables {
                sessions,
                workspaces,
                jobs,
                next_seq,
            }),
            dir: Some(dir),
        };
        if recovered {
            let tables = store.lock()?;
            store.save("jobs.json", &tables.jobs)?;
        }
        Ok(store)
    }

    /// A store with no backing files.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Tables {
                next_seq: 1,
                ..Tables::default()
            }),
            dir: None,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".into()))
    }

    fn save<V: serde::Serialize>(&self, name: &str, table: &HashMap<String, V>) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(table)
            .map_err(|err| Error::Storage(format!("failed to encode {name}: {err}")))?;
        let tmp = dir.join(format!("{name}.tmp"));
        let path = dir.join(name);
        fs::write(&tmp, body)
            .map_err(|err| Error::Storage(format!("failed to write {}: {err}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|err| Error::Storage(format!("failed to replace {}: {err}", path.display())))?;
        Ok(())
    }
}

fn load_table<V: serde::de::DeserializeOwned>(
    dir: &PathBuf,
    name: &str,
) -> Result<HashMap<String, V>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let body = fs::read(&path)
        .map_err(|err| Error::Storage(format!("failed to read {}: {err}", path.display())))?;
    serde_json::from_slice(&body)
        .map_err(|err| Error::Storage(format!("failed to decode {}: {err}", path.display())))
}

#[async_trait]
impl Store for LocalStore {
    async fn insert_session(&self, record: SessionRecord) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.sessions.contains_key(&record.id) {
            return Err(Error::Validation(format!(
                "session '{}' already exists",
                record.id
            )));
        }
        tables.sessions.insert(record.id.clone(), record);
        self.save("sessions.json", &tables.sessions)
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.lock()?.sessions.get(id).cloned())
    }

    async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<SessionRecord> {
        let mut tables = self.lock()?;
        let current = tables
            .sessions
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("session '{id}'")))?;
        let mut next = current.clone();
        update(&mut next)?;
        tables.sessions.insert(id.to_string(), next.clone());
        self.save("sessions.json", &tables.sessions)?;
        Ok(next)
    }

    async fn sessions_with_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.lock()?.sessions.values().cloned().collect())
    }

    async fn insert_workspace(&self, record: WorkspaceRecord) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.workspaces.contains_key(&record.id) {
            return Err(Error::Validation(format!(
                "workspace '{}' already exists",
                record.id
            )));
        }
        tables.workspaces.insert(record.id.clone(), record);
        self.save("workspaces.json", &tables.workspaces)
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        Ok(self.lock()?.workspaces.get(id).cloned())
    }

    async fn update_workspace(
        &self,
        id: &str,
        update: WorkspaceUpdate,
    ) -> Result<WorkspaceRecord> {
        let mut tables = self.lock()?;
        let current = tables
            .workspaces
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("workspace '{id}'")))?;
        let mut next = current.clone();
        update(&mut next)?;
        tables.workspaces.insert(id.to_string(), next.clone());
        self.save("workspaces.json", &tables.workspaces)?;
        Ok(next)
    }

    async fn enqueue_job(&self, mut record: JobRecord) -> Result<(JobRecord, bool)> {
        let mut tables = self.lock()?;
        if !record.allow_duplicates {
            let existing = tables
                .jobs
                .values()
                .filter(|j| {
                    j.kind == record.kind
                        && j.resource == record.resource
                        && matches!(j.status, JobStatus::Queued | JobStatus::Running)
                })
                .max_by_key(|j| j.seq)
                .cloned();
            if let Some(existing) = existing {
                return Ok((existing, false));
            }
        }
        record.seq = tables.next_seq;
        tables.next_seq += 1;
        tables.jobs.insert(record.id.clone(), record.clone());
        self.save("jobs.json", &tables.jobs)?;
        Ok((record, true))
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    async fn active_job_for(&self, resource: &ResourceKey) -> Result<Option<JobRecord>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|j| {
                j.resource == *resource
                    && matches!(j.status, JobStatus::Queued | JobStatus::Running)
            })
            .min_by_key(|j| j.seq)
            .cloned())
    }

    async fn latest_job_for(&self, resource: &ResourceKey) -> Result<Option<JobRecord>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|j| j.resource == *resource)
            .max_by_key(|j| j.seq)
            .cloned())
    }

    async fn claim_next_job(&self) -> Result<Option<JobRecord>> {
        let mut tables = self.lock()?;
        let running_keys: Vec<ResourceKey> = tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.resource.clone())
            .collect();
        let next_id = tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && !running_keys.contains(&j.resource))
            .min_by_key(|j| j.seq)
            .map(|j| j.id.clone());
        let Some(id) = next_id else {
            return Ok(None);
        };
        let claimed = match tables.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Running;
                job.claimed_at = Some(now_ts());
                job.clone()
            }
            None => return Ok(None),
        };
        self.save("jobs.json", &tables.jobs)?;
        Ok(Some(claimed))
    }

    async fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<JobRecord> {
        let mut tables = self.lock()?;
        let finished = match tables.jobs.get_mut(id) {
            Some(job) => {
                job.status = status;
                job.error = error;
                job.finished_at = Some(now_ts());
                job.clone()
            }
            None => return Err(Error::NotFound(format!("job '{id}'"))),
        };
        self.save("jobs.json", &tables.jobs)?;
        Ok(finished)
    }

    async fn requeue_job(&self, id: &str) -> Result<JobRecord> {
        let mut tables = self.lock()?;
        let seq = tables.next_seq;
        let requeued = match tables.jobs.get_mut(id) {
            Some(job) => {
                job.status = JobStatus::Queued;
                job.claimed_at = None;
                job.retries += 1;
                job.seq = seq;
                job.clone()
            }
            None => return Err(Error::NotFound(format!("job '{id}'"))),
        };
        tables.next_seq += 1;
        self.save("jobs.json", &tables.jobs)?;
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobPayload};
    use serde_json::json;

    fn payload(kind: JobKind, resource: ResourceKey, allow_duplicates: bool) -> JobPayload {
        JobPayload {
            kind,
            body: json!({}),
            resource,
            allow_duplicates,
        }
    }

    #[tokio::test]
    async fn session_insert_get_update() {
        let store = LocalStore::in_memory();
        store
            .insert_session(SessionRecord::new("s1", "p1", "w1", None))
            .await
            .unwrap();
        assert!(store
            .insert_session(SessionRecord::new("s1", "p1", "w1", None))
            .await
            .is_err());

        let updated = store
            .update_session(
                "s1",
                Box::new(|s| {
                    s.apply(SessionEvent::CloneBegin)?;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Cloning);

        // A rejected update leaves the record untouched.
        let err = store
            .update_session(
                "s1",
                Box::new(|s| {
                    s.apply(SessionEvent::BeginChat)?;
                    Ok(())
                }),
            )
            .await;
        assert!(err.is_err());
        let current = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(current.status, SessionStatus::Cloning);
    }

    #[tokio::test]
    async fn enqueue_coalesces_without_duplicates() {
        let store = LocalStore::in_memory();
        let (first, created) = store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionInit, ResourceKey::session("s1"), false),
            ))
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionInit, ResourceKey::session("s1"), false),
            ))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        // A different kind on the same key is not a duplicate.
        let (_, created) = store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionDelete, ResourceKey::session("s1"), false),
            ))
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn claim_serializes_per_resource_key() {
        let store = LocalStore::in_memory();
        for _ in 0..2 {
            store
                .enqueue_job(JobRecord::new(
                    "p1",
                    payload(JobKind::SessionCommit, ResourceKey::workspace("w1"), true),
                ))
                .await
                .unwrap();
        }
        store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionInit, ResourceKey::session("s1"), false),
            ))
            .await
            .unwrap();

        let first = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(first.resource, ResourceKey::workspace("w1"));

        // The second w1 job is blocked while the first runs; s1 is free.
        let second = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(second.resource, ResourceKey::session("s1"));
        assert!(store.claim_next_job().await.unwrap().is_none());

        store
            .finish_job(&first.id, JobStatus::Succeeded, None)
            .await
            .unwrap();
        let third = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(third.resource, ResourceKey::workspace("w1"));
    }

    #[tokio::test]
    async fn claim_order_follows_enqueue_order() {
        let store = LocalStore::in_memory();
        let mut ids = Vec::new();
        for session in ["a", "b", "c"] {
            let (job, _) = store
                .enqueue_job(JobRecord::new(
                    "p1",
                    payload(JobKind::SessionInit, ResourceKey::session(session), false),
                ))
                .await
                .unwrap();
            ids.push(job.id);
        }
        for expected in ids {
            let claimed = store.claim_next_job().await.unwrap().unwrap();
            assert_eq!(claimed.id, expected);
            store
                .finish_job(&claimed.id, JobStatus::Succeeded, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn requeue_moves_job_to_tail() {
        let store = LocalStore::in_memory();
        let (first, _) = store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionInit, ResourceKey::session("a"), false),
            ))
            .await
            .unwrap();
        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);

        let (second, _) = store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionInit, ResourceKey::session("b"), false),
            ))
            .await
            .unwrap();

        let requeued = store.requeue_job(&first.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.retries, 1);
        assert!(requeued.seq > second.seq);

        let next = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(next.id, second.id);
    }

    #[tokio::test]
    async fn reopen_requeues_interrupted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let claimed_id = {
            let store = LocalStore::open(dir.path()).unwrap();
            store
                .enqueue_job(JobRecord::new(
                    "p1",
                    payload(JobKind::SessionInit, ResourceKey::session("s1"), false),
                ))
                .await
                .unwrap();
            store.claim_next_job().await.unwrap().unwrap().id
        };
        // A new process sees the interrupted job as claimable again.
        let store = LocalStore::open(dir.path()).unwrap();
        let reclaimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed_id);
    }

    #[tokio::test]
    async fn tables_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store
                .insert_session(SessionRecord::new("s1", "p1", "w1", None))
                .await
                .unwrap();
            store
                .enqueue_job(JobRecord::new(
                    "p1",
                    payload(JobKind::SessionInit, ResourceKey::session("s1"), false),
                ))
                .await
                .unwrap();
        }
        let store = LocalStore::open(dir.path()).unwrap();
        assert!(store.get_session("s1").await.unwrap().is_some());
        let job = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(job.resource, ResourceKey::session("s1"));
        // Sequence numbering continues past the loaded records.
        let (new_job, _) = store
            .enqueue_job(JobRecord::new(
                "p1",
                payload(JobKind::SessionInit, ResourceKey::session("s2"), false),
            ))
            .await
            .unwrap();
        assert!(new_job.seq > job.seq);
    }
}
