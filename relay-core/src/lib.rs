//! Core data model and job machinery for the relay control plane.
//!
//! This crate carries everything the sandbox and session layers agree on:
//! the persisted records (sessions, workspaces, jobs), the session lifecycle
//! state machine, the error taxonomy, the event broker contract, the store
//! contract with its JSON-file implementation, and the resource-keyed job
//! queue with its dispatcher.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod session;
pub mod store;
pub mod util;
pub mod workspace;

pub use config::{ControlConfig, GitUser, RetrySettings};
pub use dispatcher::{Dispatcher, DispatcherHandle, JobContext, JobHandler, JobOutcome};
pub use error::{Error, Result};
pub use event::{Event, EventBroker, JobCompleted, LocalBroker};
pub use job::{JobKind, JobPayload, JobRecord, JobStatus, ResourceKey, ResourceType};
pub use queue::{EnqueueOutcome, JobQueue};
pub use session::{CommitStatus, SessionEvent, SessionRecord, SessionStatus};
pub use store::{LocalStore, Store};
pub use workspace::{WorkspaceRecord, WorkspaceSource, WorkspaceStatus};
