//! The commit workflow (`session_commit` handler).
//!
//! Exports the agent's working-copy changes as a patch series rooted at a
//! known base and applies them to the workspace's real git directory. The
//! handler is fully idempotent and runs while the workspace resource key is
//! held, so nothing else mutates the workspace concurrently.

use serde_json::json;
use tracing::{debug, info, warn};

use relay_core::event::publish_session_event;
use relay_core::util::now_ts;
use relay_core::{CommitStatus, Error, JobContext, JobOutcome, Result};
use relay_sandbox::CommitsResponse;
use relay_sandbox::sse::drain;

use crate::handlers::{SessionCommitPayload, SessionHandlers};

/// Prompt the agent understands as "produce commits on top of this base".
fn commit_prompt(base: &str) -> String {
    format!("/relay-commit {base}")
}

impl SessionHandlers {
    pub(crate) async fn handle_commit(
        &self,
        ctx: &JobContext,
        payload: SessionCommitPayload,
    ) -> Result<JobOutcome> {
        let session_id = payload.session_id.as_str();
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(JobOutcome::Done);
        };

        match session.commit_status {
            // 1. A finished commit re-run is a no-op.
            CommitStatus::Completed => return Ok(JobOutcome::Done),
            // 2. Only pending or interrupted commits proceed.
            CommitStatus::Pending | CommitStatus::Committing => {}
            CommitStatus::None | CommitStatus::Failed => {
                debug!(
                    "commit for session {session_id} is {}; nothing to do",
                    session.commit_status
                );
                return Ok(JobOutcome::Done);
            }
        }

        let Some(recorded_base) = session.base_commit.clone() else {
            return Err(self
                .fail_commit(session_id, "commit has no base commit recorded")
                .await);
        };
        let Some(workspace_path) = session.workspace_path.clone() else {
            return Err(self
                .fail_commit(session_id, "session has no initialized workspace")
                .await);
        };

        // 3. The workspace may have advanced since the commit was
        // requested; anchor on its current HEAD and record the drift.
        let base = match self.git.head_commit(&workspace_path).await {
            Ok(head) => {
                if head != recorded_base {
                    info!(
                        "commit base for session {session_id} moved {recorded_base} -> {head}"
                    );
                    let refreshed = head.clone();
                    self.store
                        .update_session(
                            session_id,
                            Box::new(move |session| {
                                session.base_commit = Some(refreshed);
                                session.updated_at = now_ts();
                                Ok(())
                            }),
                        )
                        .await?;
                }
                head
            }
            Err(err) => {
                return Err(self
                    .fail_commit(session_id, &format!("failed to read workspace HEAD: {err}"))
                    .await);
            }
        };

        let client = match self.sandboxes.get_client(session_id).await {
            Ok(client) => client,
            Err(err) => {
                return Err(self
                    .fail_commit(session_id, &format!("sandbox unavailable: {err}"))
                    .await);
            }
        };

        // 4. Optimistic fast path: the agent may already have the commits.
        let mut commits: Option<CommitsResponse> = match client.get_commits(&base).await {
            Ok(response) if response.commit_count > 0 => Some(response),
            Ok(_) => None,
            Err(err) => {
                debug!("commit fast path for session {session_id} unavailable: {err}");
                None
            }
        };

        // 5. Prompt path: ask the agent to commit, drain its stream, then
        // re-fetch.
        if commits.is_none() {
            let updated = self
                .store
                .update_session(
                    session_id,
                    Box::new(|session| {
                        session.commit_status = CommitStatus::Committing;
                        session.updated_at = now_ts();
                        Ok(())
                    }),
                )
                .await?;
            publish_session_event(self.broker.as_ref(), &updated).await;

            let prompt = json!([{ "role": "user", "content": commit_prompt(&base) }]);
            let stream = match client.send_messages(prompt).await {
                Ok(stream) => stream,
                Err(err) => {
                    return Err(self
                        .fail_commit(session_id, &format!("commit prompt failed: {err}"))
                        .await);
                }
            };
            drain(stream, &ctx.cancel).await;
            ctx.ensure_live()?;

            // 6. The prompt must have produced commits.
            match client.get_commits(&base).await {
                Ok(response) if response.commit_count > 0 => commits = Some(response),
                Ok(_) => {
                    return Err(self
                        .fail_commit(session_id, "the agent produced no commits to apply")
                        .await);
                }
                Err(err) => {
                    return Err(self
                        .fail_commit(
                            session_id,
                            &format!("failed to fetch commits from the agent: {err}"),
                        )
                        .await);
                }
            }
        }

        let Some(commits) = commits else {
            // Unreachable by construction; kept as a guard against edits
            // above.
            return Err(self
                .fail_commit(session_id, "no commits available to apply")
                .await);
        };

        // 7. Apply the series to the real git directory.
        let applied = match self
            .git
            .apply_patches(&workspace_path, &commits.patches)
            .await
        {
            Ok(head) => head,
            Err(err) => {
                return Err(self
                    .fail_commit(session_id, &format!("patch apply failed: {err}"))
                    .await);
            }
        };
        {
            let head = applied.clone();
            self.store
                .update_workspace(
                    &session.workspace_id,
                    Box::new(move |workspace| {
                        workspace.current_commit = Some(head);
                        workspace.updated_at = now_ts();
                        Ok(())
                    }),
                )
                .await?;
        }

        // 8. Completed.
        let updated = self
            .store
            .update_session(
                session_id,
                Box::new(move |session| {
                    session.commit_status = CommitStatus::Completed;
                    session.applied_commit = Some(applied);
                    session.commit_error = None;
                    session.updated_at = now_ts();
                    Ok(())
                }),
            )
            .await?;
        publish_session_event(self.broker.as_ref(), &updated).await;
        info!(
            "commit for session {session_id} completed at {}",
            updated.applied_commit.as_deref().unwrap_or_default()
        );
        Ok(JobOutcome::Done)
    }

    /// Record the failure on the commit fields and surface it as the job's
    /// error.
    async fn fail_commit(&self, session_id: &str, message: &str) -> Error {
        warn!("commit for session {session_id} failed: {message}");
        let text = message.to_string();
        let result = self
            .store
            .update_session(
                session_id,
                Box::new(move |session| {
                    session.commit_status = CommitStatus::Failed;
                    session.commit_error = Some(text);
                    session.updated_at = now_ts();
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(updated) => publish_session_event(self.broker.as_ref(), &updated).await,
            Err(err) => warn!("commit for session {session_id}: failed to record error: {err}"),
        }
        Error::Workspace(message.to_string())
    }
}
