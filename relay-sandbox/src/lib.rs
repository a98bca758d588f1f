//! Sandbox runtime layer of the relay control plane.
//!
//! Everything that touches a sandbox goes through here: the provider
//! contract, the in-process provider, the transport retry policy, SSE
//! framing, credential mapping, the session-bound client, and the sandbox
//! service that owns the provider and the last-activity map.

pub mod client;
pub mod credentials;
pub mod memory;
pub mod provider;
pub mod retry;
pub mod service;
pub mod sse;

pub use client::{ChatStatus, ClientHooks, CommitsResponse, FileContent, SessionClient};
pub use credentials::{CredentialKind, CredentialSource, EnvVarCredential, ProviderCredential};
pub use memory::MemorySandboxProvider;
pub use provider::{
    CreateSandboxOptions, ExecOutput, PublishedPort, SandboxHandle, SandboxProvider,
    SandboxStatus, SandboxTransport, StateEvent,
};
pub use service::{SandboxService, SessionInitializer, generate_secret};
