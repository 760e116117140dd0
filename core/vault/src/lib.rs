//! Vault engine for AgentVault.
//!
//! This crate provides:
//! - Engine configuration loaded from `avp.toml`
//! - The session authenticator and workspace-scoped sessions
//! - The vault engine protocol (discover, authenticate, store, retrieve,
//!   delete, list, rotate, close)
//! - A hash-chained audit log
//! - Import of plaintext credentials from `.env`, JSON and the environment
//!
//! # Architecture
//! Caller → [`Authenticator`] (issues a [`Session`]) → [`VaultEngine`]
//! (validates the session, routes to the backend, appends an audit entry) →
//! `SecretBackend`.

pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod import;
pub mod session;

pub use audit::{
    verify_chain, AuditAction, AuditEntry, AuditEvent, AuditLog, AuditOutcome, AuditSink,
    AuditSummary,
};
pub use auth::{Authenticator, LinkState};
pub use config::{AuditConfig, EngineConfig, SessionConfig, WorkspaceConfig};
pub use engine::VaultEngine;
pub use import::{from_environment, parse_env, parse_json, ImportCandidate, ImportReport};
pub use session::{Session, SessionId, SessionState};

pub use agentvault_common::{Error, ErrorKind, Result, SecretName, SensitiveBytes, WorkspaceName};
pub use agentvault_storage::{BackendConfig, BackendInfo, Credential, Labels, Secret};
